//! src/manager.rs
//!
//! Run manager.
//!
//! Owns the work source, the ordered result sink and exactly one engine,
//! chosen at construction:
//!
//! | Mode          | Rank       | Role          | Engine                          |
//! |---------------|------------|---------------|---------------------------------|
//! | `Serial`      | -          | `Serial`      | `SerialEngine`                  |
//! | `Concurrent`  | -          | `Concurrent`  | `ConcurrentEngine`              |
//! | `Distributed` | 0          | `Master`      | `DistributedController`         |
//! | `Distributed` | 1..size    | `Worker`      | `DistributedWorker`             |
//!
//! A worker never touches the source or the sink: its units come from the
//! master and its results go back to it.
//!
//! # State machine
//! `Created → Running → {Finished | Failed}`. Both end states are terminal;
//! a manager runs at most once.

use log::{error, info};
use std::sync::Arc;

use crate::analytic::{Analytic, Committer};
use crate::comm::{drive, Communicator};
use crate::config::{Mode, RunConfig};
use crate::device::AcceleratorPlatform;
use crate::distributed::{send_placement, DistributedController, DistributedWorker};
use crate::engine::{ConcurrentEngine, SerialEngine};
use crate::error::{AceError, AceResult};
use crate::sink::{OrderedSink, ResultSink};
use crate::source::{AnalyticSource, WorkSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Serial,
    Concurrent,
    Master,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Running,
    Finished,
    Failed,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub role: Role,
    /// Units committed (or, for a worker, executed).
    pub units: usize,
    /// Largest number of results parked out of order in the sink.
    pub peak_pending: usize,
    /// Largest number of units executing at once: pistons for a concurrent
    /// run, busy workers for a master, 1 otherwise.
    pub peak_in_flight: usize,
}

enum Engine<'a> {
    Serial(SerialEngine),
    Concurrent(ConcurrentEngine),
    Master(&'a dyn Communicator),
    Worker(&'a dyn Communicator),
}

pub struct Manager<'a> {
    analytic: Arc<dyn Analytic>,
    config: RunConfig,
    platform: &'a dyn AcceleratorPlatform,
    source: AnalyticSource,
    sink: OrderedSink,
    engine: Engine<'a>,
    state: RunState,
}

impl std::fmt::Debug for Manager<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<'a> Manager<'a> {
    /// Validates `config` and builds the engine for this process's role.
    ///
    /// `comm` is required in distributed mode and ignored otherwise. A
    /// concurrent run opens its pistons here, so device failures surface
    /// before anything runs.
    pub fn new(
        analytic: Arc<dyn Analytic>,
        committer: Box<dyn Committer>,
        config: RunConfig,
        platform: &'a dyn AcceleratorPlatform,
        comm: Option<&'a dyn Communicator>,
    ) -> AceResult<Self> {
        config.validate()?;
        let size = analytic.size();

        let engine = match config.mode {
            Mode::Serial => Engine::Serial(SerialEngine::new(analytic.clone())),
            Mode::Concurrent => Engine::Concurrent(ConcurrentEngine::new(
                analytic.clone(),
                platform,
                config.max_pistons,
                config.completion_timeout,
            )?),
            Mode::Distributed => {
                let comm = comm.ok_or_else(|| {
                    AceError::config("Distributed mode requires a group communicator")
                })?;
                if !comm.is_master() {
                    Engine::Worker(comm)
                } else if comm.size() < 2 && size > 0 {
                    return Err(AceError::config(format!(
                        "Distributed run of {} unit(s) needs at least one worker rank besides the master",
                        size
                    )));
                } else {
                    Engine::Master(comm)
                }
            }
        };

        Ok(Self {
            source: AnalyticSource::new(analytic.clone()),
            sink: OrderedSink::new(size, committer),
            analytic,
            config,
            platform,
            engine,
            state: RunState::Created,
        })
    }

    pub fn role(&self) -> Role {
        match self.engine {
            Engine::Serial(_) => Role::Serial,
            Engine::Concurrent(_) => Role::Concurrent,
            Engine::Master(_) => Role::Master,
            Engine::Worker(_) => Role::Worker,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Runs to completion or to the first fatal error.
    pub fn run(&mut self) -> AceResult<RunReport> {
        if self.state != RunState::Created {
            return Err(AceError::invalid_state(format!(
                "Manager cannot run from state {:?}",
                self.state
            )));
        }
        self.state = RunState::Running;
        let role = self.role();
        info!("{:?} run of {} unit(s) started", role, self.sink.size());

        match self.execute(role) {
            Ok(report) => {
                self.state = RunState::Finished;
                info!(
                    "{:?} run finished: {} unit(s), peak pending {}, peak in flight {}",
                    role, report.units, report.peak_pending, report.peak_in_flight
                );
                Ok(report)
            }
            Err(e) => {
                self.state = RunState::Failed;
                error!("{:?} run failed: {}", role, e);
                Err(e)
            }
        }
    }

    fn execute(&mut self, role: Role) -> AceResult<RunReport> {
        let (units, peak_in_flight) = match &mut self.engine {
            Engine::Serial(engine) => (Self::run_serial(engine, &mut self.source, &self.sink)?, 1),
            Engine::Concurrent(engine) => {
                let units = Self::run_concurrent(engine, &mut self.source, &self.sink)?;
                (units, engine.peak_in_flight())
            }
            Engine::Master(comm) => {
                Self::run_master(*comm, self.platform, &self.config, &mut self.source, &self.sink)?
            }
            Engine::Worker(comm) => {
                let executed = Self::run_worker(*comm, self.platform, &self.config, &self.analytic)?;
                return Ok(RunReport {
                    role,
                    units: executed,
                    peak_pending: 0,
                    peak_in_flight: 1,
                });
            }
        };

        if !self.sink.is_finished() {
            return Err(AceError::engine(format!(
                "Run ended with {} of {} result(s) committed",
                self.sink.next_expected(),
                self.sink.size()
            )));
        }
        Ok(RunReport {
            role,
            units,
            peak_pending: self.sink.peak_pending(),
            peak_in_flight,
        })
    }

    fn run_serial(
        engine: &mut SerialEngine,
        source: &mut AnalyticSource,
        sink: &OrderedSink,
    ) -> AceResult<usize> {
        while source.has_next() {
            let result = engine.execute(source.next()?)?;
            sink.submit(result)?;
        }
        Ok(engine.executed())
    }

    /// Keeps every idle piston busy while work remains and hands each
    /// completion to the sink as it arrives.
    fn run_concurrent(
        engine: &mut ConcurrentEngine,
        source: &mut AnalyticSource,
        sink: &OrderedSink,
    ) -> AceResult<usize> {
        let mut completed = 0;
        loop {
            while engine.has_idle() && source.has_next() {
                engine.dispatch(source.next()?)?;
            }
            if engine.in_flight() == 0 {
                break;
            }
            sink.submit(engine.wait()?)?;
            completed += 1;
        }
        Ok(completed)
    }

    fn run_master(
        comm: &dyn Communicator,
        platform: &dyn AcceleratorPlatform,
        config: &RunConfig,
        source: &mut AnalyticSource,
        sink: &OrderedSink,
    ) -> AceResult<(usize, usize)> {
        let mut controller = DistributedController::new(comm, source, sink, config.lookahead);

        let outcome = send_placement(comm, platform, config.use_accelerators)
            .and_then(|_| drive(comm, &mut controller, config.message_timeout));
        if let Err(e) = outcome {
            controller.abort();
            return Err(e);
        }

        let units = controller.workers().map(|(_, record)| record.assignments).sum();
        Ok((units, controller.peak_busy()))
    }

    fn run_worker(
        comm: &dyn Communicator,
        platform: &dyn AcceleratorPlatform,
        config: &RunConfig,
        analytic: &Arc<dyn Analytic>,
    ) -> AceResult<usize> {
        send_placement(comm, platform, config.use_accelerators)?;

        let mut worker =
            DistributedWorker::new(comm, analytic.clone(), platform, config.completion_timeout);
        // A worker may sit parked behind the lookahead window for as long as
        // the slowest in-flight unit takes, so it waits without a bound and
        // only stops on Terminate.
        drive(comm, &mut worker, None)?;
        Ok(worker.executed())
    }
}
