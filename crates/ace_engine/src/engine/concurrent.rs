//! src/engine/concurrent.rs
//!
//! Accelerator piston pool.
//!
//! One piston thread per device context, created once and reused for the
//! whole run. The engine keeps a queue of idle pistons; the manager assigns
//! the next work unit whenever an idle piston exists and collects results as
//! pistons complete, in whatever order that happens. Ordering of the commits
//! is left entirely to the result sink.
//!
//! # Architecture
//!
//! ```text
//!   Manager ──dispatch──▶ idle queue ──▶ Piston 0 (ctx 0:0) ─┐
//!                                   └──▶ Piston 1 (ctx 0:1) ─┤ completions
//!   Manager ◀──────────────wait──────────────────────────────┘
//! ```
//!
//! # Failure policy
//! The first failed completion marks the engine failed. No further unit is
//! dispatched and the error is returned to the caller. Pistons still running
//! a unit when the engine is dropped are detached rather than joined, so a
//! device that never returns cannot hold up the caller.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::piston::{Completion, Piston};
use crate::analytic::{AcceleratedKernel, Analytic, HostKernel};
use crate::block::{ResultUnit, WorkUnit};
use crate::device::{devices, AcceleratorPlatform};
use crate::error::{AceError, AceResult};

pub struct ConcurrentEngine {
    pistons: Vec<Piston>,
    idle: VecDeque<usize>,
    completion_rx: Receiver<Completion>,
    shutdown: Arc<AtomicBool>,
    timeout: Option<Duration>,
    in_flight: usize,
    peak_in_flight: usize,
    failed: bool,
}

impl ConcurrentEngine {
    /// Opens one piston per usable enumerated device, at most `max_pistons`.
    ///
    /// `timeout` bounds the wait for any completion; `None` waits
    /// indefinitely.
    pub fn new(
        analytic: Arc<dyn Analytic>,
        platform: &dyn AcceleratorPlatform,
        max_pistons: Option<usize>,
        timeout: Option<Duration>,
    ) -> AceResult<Self> {
        Self::open(analytic, platform, &devices(platform), max_pistons, timeout)
    }

    /// Opens one piston per listed `(platform, device)` pair.
    ///
    /// A device whose context or kernel cannot be created is logged and
    /// skipped. Fails with `ResourceUnavailable` only if no piston at all
    /// could be started.
    pub fn on_devices(
        analytic: Arc<dyn Analytic>,
        platform: &dyn AcceleratorPlatform,
        targets: &[(usize, usize)],
        timeout: Option<Duration>,
    ) -> AceResult<Self> {
        Self::open(analytic, platform, targets, None, timeout)
    }

    fn open(
        analytic: Arc<dyn Analytic>,
        platform: &dyn AcceleratorPlatform,
        targets: &[(usize, usize)],
        max_pistons: Option<usize>,
        timeout: Option<Duration>,
    ) -> AceResult<Self> {
        let (completion_tx, completion_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut pistons = Vec::with_capacity(targets.len());
        let mut tried = 0;

        for &(p, d) in targets {
            // The cap counts opened pistons, not enumerated devices.
            if max_pistons.is_some_and(|max| pistons.len() >= max) {
                break;
            }
            tried += 1;
            let context = match platform.create_context(p, d) {
                Ok(context) => context,
                Err(e) => {
                    warn!("skipping device {}:{}: {}", p, d, e);
                    continue;
                }
            };

            let kernel: Box<dyn AcceleratedKernel> = match analytic.make_accelerated(&context) {
                Ok(Some(kernel)) => kernel,
                Ok(None) => Box::new(HostKernel::new(analytic.clone())),
                Err(e) => {
                    warn!("skipping device {}: kernel creation failed: {:#}", context.name, e);
                    continue;
                }
            };

            let id = pistons.len();
            pistons.push(Piston::spawn(
                id,
                kernel,
                context,
                completion_tx.clone(),
                shutdown.clone(),
            )?);
        }

        if pistons.is_empty() {
            return Err(AceError::resource(format!(
                "No accelerator execution context could be created ({} device(s) tried)",
                tried
            )));
        }

        info!(
            "piston pool ready: {}",
            pistons.iter().map(|p| p.context()).collect::<Vec<_>>().join(", ")
        );

        Ok(Self {
            idle: (0..pistons.len()).collect(),
            pistons,
            completion_rx,
            shutdown,
            timeout,
            in_flight: 0,
            peak_in_flight: 0,
            failed: false,
        })
    }

    /// Number of pistons in the pool.
    pub fn size(&self) -> usize {
        self.pistons.len()
    }

    pub fn has_idle(&self) -> bool {
        !self.failed && !self.idle.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Highest number of units executing at once since the engine started.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Assigns `work` to the next idle piston.
    pub fn dispatch(&mut self, work: WorkUnit) -> AceResult<()> {
        if self.failed {
            return Err(AceError::invalid_state(format!(
                "Cannot dispatch unit {} to a failed piston pool",
                work.index
            )));
        }
        let piston = self.idle.pop_front().ok_or_else(|| {
            AceError::invalid_state(format!(
                "No idle piston for unit {} ({} in flight)",
                work.index, self.in_flight
            ))
        })?;

        debug!("dispatching unit {} to piston {}", work.index, piston);
        if let Err(e) = self.pistons[piston].execute(work) {
            self.failed = true;
            return Err(e);
        }
        self.in_flight += 1;
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight);
        Ok(())
    }

    /// Waits for whichever piston completes next and collects its result.
    ///
    /// The piston goes back to the idle queue. A failed execution marks the
    /// pool failed and is returned as `EngineFailure`.
    pub fn wait(&mut self) -> AceResult<ResultUnit> {
        if self.in_flight == 0 {
            return Err(AceError::invalid_state(
                "Waiting on the piston pool with no unit in flight",
            ));
        }

        let received = match self.timeout {
            Some(timeout) => self.completion_rx.recv_timeout(timeout),
            None => self
                .completion_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        let completion = match received {
            Ok(completion) => completion,
            Err(RecvTimeoutError::Timeout) => {
                self.failed = true;
                return Err(AceError::engine(format!(
                    "No piston completed within {:?} ({} unit(s) in flight), possible hung device",
                    self.timeout.unwrap_or_default(),
                    self.in_flight
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.failed = true;
                return Err(AceError::communication(
                    "Piston completion channel disconnected - piston threads may have crashed",
                ));
            }
        };
        self.in_flight -= 1;

        let Completion {
            piston,
            index,
            outcome,
        } = completion;
        match outcome {
            Ok(result) => {
                let owner = &mut self.pistons[piston];
                if let Err(e) = owner.complete(result) {
                    owner.fault();
                    self.failed = true;
                    return Err(e);
                }
                let result = owner.result()?;
                self.idle.push_back(piston);
                Ok(result)
            }
            Err(e) => {
                let owner = &mut self.pistons[piston];
                owner.fault();
                self.failed = true;
                Err(AceError::engine_from(
                    format!(
                        "Piston {} ({}) failed executing unit {}",
                        piston,
                        owner.context(),
                        index
                    ),
                    e,
                ))
            }
        }
    }

    /// Dispatches one unit and waits for it. Only meaningful with no other
    /// unit in flight; used by single-device distributed workers.
    pub fn execute(&mut self, work: WorkUnit) -> AceResult<ResultUnit> {
        self.dispatch(work)?;
        self.wait()
    }
}

impl Drop for ConcurrentEngine {
    fn drop(&mut self) {
        // Idle pistons exit and are joined; busy ones are detached and
        // observe the flag once their unit returns.
        self.shutdown.store(true, Ordering::Relaxed);
        self.pistons.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Payload;
    use crate::device::VirtualPlatform;
    use anyhow::{bail, Result};
    use std::time::Instant;

    struct Double;

    impl Analytic for Double {
        fn size(&self) -> usize {
            8
        }

        fn make_work(&self, index: usize) -> Result<Payload> {
            Payload::encode(&index)
        }

        fn execute(&self, work: &WorkUnit) -> Result<ResultUnit> {
            let value: usize = work.payload.decode()?;
            if value == 5 {
                bail!("bad block");
            }
            ResultUnit::answer(work, &(value * 2))
        }
    }

    fn unit(analytic: &dyn Analytic, index: usize) -> Result<WorkUnit> {
        Ok(WorkUnit::new(index, analytic.make_work(index)?))
    }

    #[test]
    fn test_pool_size_follows_devices() -> Result<()> {
        let platform = VirtualPlatform::new(vec![2, 2]);
        let engine = ConcurrentEngine::new(Arc::new(Double), &platform, None, Some(Duration::from_secs(5)))?;
        assert_eq!(engine.size(), 4);

        let capped = ConcurrentEngine::new(Arc::new(Double), &platform, Some(3), Some(Duration::from_secs(5)))?;
        assert_eq!(capped.size(), 3);
        Ok(())
    }

    #[test]
    fn test_cap_counts_usable_devices() -> Result<()> {
        let platform = VirtualPlatform::with_devices(3).with_broken_device(0, 0);
        let engine = ConcurrentEngine::new(Arc::new(Double), &platform, Some(2), None)?;
        assert_eq!(engine.size(), 2);
        Ok(())
    }

    #[test]
    fn test_broken_device_skipped() -> Result<()> {
        let platform = VirtualPlatform::with_devices(2).with_broken_device(0, 0);
        let engine = ConcurrentEngine::new(Arc::new(Double), &platform, None, Some(Duration::from_secs(5)))?;
        assert_eq!(engine.size(), 1);
        Ok(())
    }

    #[test]
    fn test_no_device_is_resource_unavailable() {
        let platform = VirtualPlatform::with_devices(1).with_broken_device(0, 0);
        let result = ConcurrentEngine::new(Arc::new(Double), &platform, None, Some(Duration::from_secs(5)));
        assert!(matches!(result, Err(AceError::ResourceUnavailable { .. })));
    }

    #[test]
    fn test_dispatch_without_idle_piston_fails() -> Result<()> {
        let analytic = Arc::new(Double);
        let platform = VirtualPlatform::with_devices(1);
        let mut engine = ConcurrentEngine::new(analytic.clone(), &platform, None, Some(Duration::from_secs(5)))?;

        engine.dispatch(unit(analytic.as_ref(), 0)?)?;
        assert!(!engine.has_idle());
        assert!(matches!(
            engine.dispatch(unit(analytic.as_ref(), 1)?),
            Err(AceError::InvalidState { .. })
        ));

        let result = engine.wait()?;
        assert_eq!(result.payload.decode::<usize>()?, 0);
        assert!(engine.has_idle());
        Ok(())
    }

    #[test]
    fn test_failure_stops_dispatch() -> Result<()> {
        let analytic = Arc::new(Double);
        let platform = VirtualPlatform::with_devices(2);
        let mut engine = ConcurrentEngine::new(analytic.clone(), &platform, None, Some(Duration::from_secs(5)))?;

        let err = engine.execute(unit(analytic.as_ref(), 5)?).unwrap_err();
        assert!(matches!(err, AceError::EngineFailure { .. }));
        assert!(err.detail().contains("unit 5"));
        assert!(engine.is_failed());
        assert!(!engine.has_idle());
        assert!(engine.dispatch(unit(analytic.as_ref(), 6)?).is_err());
        Ok(())
    }

    /// Never returns within any reasonable stall bound.
    struct Hung;

    impl Analytic for Hung {
        fn size(&self) -> usize {
            1
        }

        fn make_work(&self, index: usize) -> Result<Payload> {
            Payload::encode(&index)
        }

        fn execute(&self, work: &WorkUnit) -> Result<ResultUnit> {
            std::thread::sleep(Duration::from_secs(3));
            ResultUnit::answer(work, &0usize)
        }
    }

    #[test]
    fn test_stalled_pool_drops_without_waiting_for_device() -> Result<()> {
        let analytic = Arc::new(Hung);
        let platform = VirtualPlatform::with_devices(1);
        let mut engine =
            ConcurrentEngine::new(analytic.clone(), &platform, None, Some(Duration::from_millis(100)))?;

        let started = Instant::now();
        let err = engine.execute(unit(analytic.as_ref(), 0)?).unwrap_err();
        assert!(matches!(err, AceError::EngineFailure { .. }));
        assert!(err.detail().contains("possible hung device"));

        drop(engine);
        assert!(started.elapsed() < Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn test_unbounded_wait_collects_result() -> Result<()> {
        let analytic = Arc::new(Double);
        let platform = VirtualPlatform::with_devices(1);
        let mut engine = ConcurrentEngine::new(analytic.clone(), &platform, None, None)?;
        let result = engine.execute(unit(analytic.as_ref(), 3)?)?;
        assert_eq!(result.payload.decode::<usize>()?, 6);
        Ok(())
    }

    #[test]
    fn test_wait_with_nothing_in_flight() -> Result<()> {
        let platform = VirtualPlatform::with_devices(1);
        let mut engine = ConcurrentEngine::new(Arc::new(Double), &platform, None, Some(Duration::from_secs(5)))?;
        assert!(matches!(engine.wait(), Err(AceError::InvalidState { .. })));
        Ok(())
    }
}
