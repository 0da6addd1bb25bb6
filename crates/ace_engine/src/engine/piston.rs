//! src/engine/piston.rs
//!
//! A piston is one OS thread bound to one device context.
//!
//! The thread owns its kernel for life and receives units over a
//! bounded(1) channel. Each completion is reported over a completion channel
//! shared by every piston of the pool, so the owner waits on "any piston"
//! rather than on a specific one.
//!
//! The owner side (`Piston`) tracks the state machine:
//!
//! ```text
//!   Idle --execute--> Busy(index) --complete--> Holding(result) --result--> Idle
//!                         |
//!                         +--fault--> Faulted (terminal)
//! ```
//!
//! Calling `execute` while Busy or Holding is a logic error. Dropping a
//! Busy piston detaches its thread instead of joining it.

use anyhow::anyhow;
use crossbeam_channel::{bounded, Sender};
use log::{debug, trace};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::analytic::AcceleratedKernel;
use crate::block::{ResultUnit, WorkUnit};
use crate::device::DeviceContext;
use crate::error::{AceError, AceResult};

/// Report sent by a piston thread when a unit finishes.
pub(crate) struct Completion {
    pub(crate) piston: usize,
    pub(crate) index: usize,
    pub(crate) outcome: anyhow::Result<ResultUnit>,
}

#[derive(Debug)]
enum PistonState {
    Idle,
    Busy(usize),
    Holding(ResultUnit),
    Faulted,
}

pub(crate) struct Piston {
    id: usize,
    context: String,
    task_tx: Option<Sender<WorkUnit>>,
    handle: Option<thread::JoinHandle<()>>,
    state: PistonState,
}

impl Piston {
    /// Spawns the piston thread. The thread takes ownership of `kernel` and
    /// `context` and keeps them until the piston is dropped.
    pub(crate) fn spawn(
        id: usize,
        mut kernel: Box<dyn AcceleratedKernel>,
        context: DeviceContext,
        completion_tx: Sender<Completion>,
        shutdown: Arc<AtomicBool>,
    ) -> AceResult<Self> {
        let (task_tx, task_rx) = bounded::<WorkUnit>(1);
        let name = context.name.clone();

        let handle = thread::Builder::new()
            .name(format!("ace-piston-{}", id))
            .spawn(move || {
                let _context = context;
                for work in task_rx.iter() {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let index = work.index;
                    trace!("piston {} executing unit {}", id, index);

                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| kernel.execute(work)))
                        .unwrap_or_else(|_| Err(anyhow!("kernel panicked")));

                    if completion_tx
                        .send(Completion {
                            piston: id,
                            index,
                            outcome,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                debug!("piston {} stopped", id);
            })
            .map_err(|e| AceError::resource(format!("Failed to spawn piston thread {}: {}", id, e)))?;

        Ok(Self {
            id,
            context: name,
            task_tx: Some(task_tx),
            handle: Some(handle),
            state: PistonState::Idle,
        })
    }

    pub(crate) fn context(&self) -> &str {
        &self.context
    }

    /// Hands `work` to the piston thread.
    pub(crate) fn execute(&mut self, work: WorkUnit) -> AceResult<()> {
        match self.state {
            PistonState::Idle => {}
            PistonState::Busy(index) => {
                return Err(AceError::invalid_state(format!(
                    "Cannot execute on piston {} while it runs unit {}",
                    self.id, index
                )))
            }
            PistonState::Holding(ref result) => {
                return Err(AceError::invalid_state(format!(
                    "Cannot execute on piston {} that holds the uncollected result {}",
                    self.id, result.index
                )))
            }
            PistonState::Faulted => {
                return Err(AceError::invalid_state(format!(
                    "Cannot execute on faulted piston {}",
                    self.id
                )))
            }
        }

        let index = work.index;
        let tx = self
            .task_tx
            .as_ref()
            .ok_or_else(|| AceError::invalid_state(format!("Piston {} is shut down", self.id)))?;
        tx.send(work)
            .map_err(|_| AceError::communication(format!("Piston {} thread has exited", self.id)))?;
        self.state = PistonState::Busy(index);
        Ok(())
    }

    /// Records the result reported by the piston thread.
    pub(crate) fn complete(&mut self, result: ResultUnit) -> AceResult<()> {
        match self.state {
            PistonState::Busy(index) if index == result.index => {
                self.state = PistonState::Holding(result);
                Ok(())
            }
            PistonState::Busy(index) => Err(AceError::engine(format!(
                "Piston {} returned result index {} for work unit {}",
                self.id, result.index, index
            ))),
            _ => Err(AceError::invalid_state(format!(
                "Piston {} reported a completion it was not executing",
                self.id
            ))),
        }
    }

    /// Takes the held result, returning the piston to Idle.
    pub(crate) fn result(&mut self) -> AceResult<ResultUnit> {
        match std::mem::replace(&mut self.state, PistonState::Idle) {
            PistonState::Holding(result) => Ok(result),
            other => {
                self.state = other;
                Err(AceError::invalid_state(format!(
                    "Cannot get result from piston {} that contains none",
                    self.id
                )))
            }
        }
    }

    pub(crate) fn fault(&mut self) {
        self.state = PistonState::Faulted;
    }
}

impl Drop for Piston {
    fn drop(&mut self) {
        // Closing the task channel ends the thread's receive loop.
        self.task_tx.take();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let PistonState::Busy(index) = self.state {
            // The kernel may never return. The thread exits on its own once
            // it does, finding both channels closed.
            debug!("detaching piston {} still running unit {}", self.id, index);
            drop(handle);
        } else {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Payload;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    struct Echo;

    impl AcceleratedKernel for Echo {
        fn execute(&mut self, work: WorkUnit) -> anyhow::Result<ResultUnit> {
            std::thread::sleep(Duration::from_millis(20));
            Ok(ResultUnit::new(work.index, work.payload))
        }
    }

    fn context() -> DeviceContext {
        DeviceContext {
            platform: 0,
            device: 0,
            name: "test:0:0".into(),
        }
    }

    #[test]
    fn test_piston_state_machine() -> anyhow::Result<()> {
        let (tx, rx) = unbounded();
        let mut piston = Piston::spawn(0, Box::new(Echo), context(), tx, Arc::new(AtomicBool::new(false)))?;

        piston.execute(WorkUnit::new(7, Payload::new(vec![7])))?;
        // Busy: a second unit is refused.
        assert!(matches!(
            piston.execute(WorkUnit::new(8, Payload::default())),
            Err(AceError::InvalidState { .. })
        ));

        let completion = rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(completion.piston, 0);
        assert_eq!(completion.index, 7);
        piston.complete(completion.outcome?)?;

        // Holding: still refuses work until the result is collected.
        assert!(piston.execute(WorkUnit::new(8, Payload::default())).is_err());
        let result = piston.result()?;
        assert_eq!(result.payload.as_bytes(), &[7]);

        // Idle again; nothing to collect.
        assert!(piston.result().is_err());
        piston.execute(WorkUnit::new(8, Payload::default()))?;
        Ok(())
    }

    struct Slow;

    impl AcceleratedKernel for Slow {
        fn execute(&mut self, work: WorkUnit) -> anyhow::Result<ResultUnit> {
            std::thread::sleep(Duration::from_secs(3));
            Ok(ResultUnit::new(work.index, work.payload))
        }
    }

    #[test]
    fn test_drop_busy_piston_detaches() -> anyhow::Result<()> {
        let (tx, _rx) = unbounded();
        let mut piston = Piston::spawn(1, Box::new(Slow), context(), tx, Arc::new(AtomicBool::new(false)))?;
        piston.execute(WorkUnit::new(0, Payload::default()))?;

        let started = std::time::Instant::now();
        drop(piston);
        assert!(started.elapsed() < Duration::from_secs(1));
        Ok(())
    }

    struct Panicking;

    impl AcceleratedKernel for Panicking {
        fn execute(&mut self, _work: WorkUnit) -> anyhow::Result<ResultUnit> {
            panic!("driver crashed");
        }
    }

    #[test]
    fn test_kernel_panic_becomes_error() -> anyhow::Result<()> {
        let (tx, rx) = unbounded();
        let mut piston = Piston::spawn(
            3,
            Box::new(Panicking),
            context(),
            tx,
            Arc::new(AtomicBool::new(false)),
        )?;
        piston.execute(WorkUnit::new(0, Payload::default()))?;
        let completion = rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(completion.piston, 3);
        assert!(completion.outcome.is_err());
        Ok(())
    }
}
