#![allow(dead_code)]

use ace_engine::comm::{Communicator, LocalComm};
use ace_engine::device::VirtualPlatform;
use ace_engine::{
    AceResult, Analytic, Manager, Payload, ResultUnit, RunConfig, RunReport, VecCommitter, WorkUnit,
};

use anyhow::{anyhow, bail, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Payload of unit `i` is `i`; the result is `i * i`.
pub struct Square {
    pub size: usize,
}

impl Analytic for Square {
    fn size(&self) -> usize {
        self.size
    }

    fn make_work(&self, index: usize) -> Result<Payload> {
        Payload::encode(&(index as u64))
    }

    fn execute(&self, work: &WorkUnit) -> Result<ResultUnit> {
        let value: u64 = work.payload.decode()?;
        ResultUnit::answer(work, &(value * value))
    }
}

/// Square with a per-unit delay, an optional failing unit, and a record of
/// how many units executed at the same time.
pub struct Latency {
    size: usize,
    delay: fn(usize) -> Duration,
    fail_on: Option<usize>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Latency {
    pub fn new(size: usize, delay: fn(usize) -> Duration) -> Self {
        Self {
            size,
            delay,
            fail_on: None,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(mut self, index: usize) -> Self {
        self.fail_on = Some(index);
        self
    }

    /// Most units observed executing at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Analytic for Latency {
    fn size(&self) -> usize {
        self.size
    }

    fn make_work(&self, index: usize) -> Result<Payload> {
        Payload::encode(&(index as u64))
    }

    fn execute(&self, work: &WorkUnit) -> Result<ResultUnit> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep((self.delay)(work.index));
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail_on == Some(work.index) {
            bail!("device fault on unit {}", work.index);
        }
        let value: u64 = work.payload.decode()?;
        ResultUnit::answer(work, &(value * value))
    }
}

pub fn squares(n: u64) -> Vec<u64> {
    (0..n).map(|i| i * i).collect()
}

/// Outcome of one in-process distributed run.
pub struct GroupRun {
    pub master: AceResult<RunReport>,
    pub workers: Vec<AceResult<RunReport>>,
    pub committed: VecCommitter,
}

/// Runs rank 0 as master on the calling thread and every other rank as a
/// worker on its own thread.
pub fn run_group(
    group: Vec<LocalComm>,
    analytic: Arc<dyn Analytic>,
    platform: &VirtualPlatform,
    config: RunConfig,
) -> Result<GroupRun> {
    let committed = VecCommitter::new();
    let mut ranks = group.into_iter();
    let master_comm = ranks.next().ok_or_else(|| anyhow!("empty group"))?;

    thread::scope(|scope| {
        let handles: Vec<_> = ranks
            .map(|comm| {
                let analytic = analytic.clone();
                let config = config.clone();
                scope.spawn(move || -> AceResult<RunReport> {
                    let comm: &dyn Communicator = &comm;
                    let mut manager = Manager::new(
                        analytic,
                        Box::new(VecCommitter::new()),
                        config,
                        platform,
                        Some(comm),
                    )?;
                    manager.run()
                })
            })
            .collect();

        let master_dyn: &dyn Communicator = &master_comm;
        let master = Manager::new(
            analytic.clone(),
            Box::new(committed.clone()),
            config.clone(),
            platform,
            Some(master_dyn),
        )
        .and_then(|mut manager| manager.run());

        let mut workers = Vec::new();
        for handle in handles {
            let report = handle
                .join()
                .map_err(|_| anyhow!("worker thread panicked"))?;
            workers.push(report);
        }
        Ok(GroupRun {
            master,
            workers,
            committed: committed.clone(),
        })
    })
}
