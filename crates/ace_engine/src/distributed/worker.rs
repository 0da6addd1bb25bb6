//! src/distributed/worker.rs
//!
//! Worker side of the distributed run.
//!
//! A worker rank first waits for its single placement message. It then
//! builds a local engine for the assigned resource, announces readiness to
//! the master, and executes every `Assign` it receives, answering with
//! `Result` (or `Failed`). `Terminate` ends the loop.
//!
//! An accelerated placement whose device cannot be opened falls back to the
//! serial engine; the worker then announces `Ready(Capability::Serial)`.

use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::analytic::Analytic;
use crate::block::{ResultUnit, WorkUnit};
use crate::comm::{Communicator, MessageHandler};
use crate::device::AcceleratorPlatform;
use crate::engine::{ConcurrentEngine, SerialEngine};
use crate::error::{AceError, AceResult};
use crate::protocol::{self, Capability, Message, ResourceType, StartMessage};

const MASTER_RANK: usize = 0;

enum LocalEngine {
    Serial(SerialEngine),
    Accelerated(ConcurrentEngine),
}

impl LocalEngine {
    fn capability(&self) -> Capability {
        match self {
            LocalEngine::Serial(_) => Capability::Serial,
            LocalEngine::Accelerated(_) => Capability::Accelerated,
        }
    }

    fn execute(&mut self, work: WorkUnit) -> AceResult<ResultUnit> {
        match self {
            LocalEngine::Serial(engine) => engine.execute(work),
            LocalEngine::Accelerated(engine) => engine.execute(work),
        }
    }
}

pub struct DistributedWorker<'a> {
    comm: &'a dyn Communicator,
    analytic: Arc<dyn Analytic>,
    platform: &'a dyn AcceleratorPlatform,
    completion_timeout: Option<Duration>,
    engine: Option<LocalEngine>,
    executed: usize,
    terminated: bool,
}

impl<'a> DistributedWorker<'a> {
    pub fn new(
        comm: &'a dyn Communicator,
        analytic: Arc<dyn Analytic>,
        platform: &'a dyn AcceleratorPlatform,
        completion_timeout: Option<Duration>,
    ) -> Self {
        Self {
            comm,
            analytic,
            platform,
            completion_timeout,
            engine: None,
            executed: 0,
            terminated: false,
        }
    }

    /// Units executed so far.
    pub fn executed(&self) -> usize {
        self.executed
    }

    /// Resource the worker ended up on, once started.
    pub fn capability(&self) -> Option<Capability> {
        self.engine.as_ref().map(LocalEngine::capability)
    }

    fn start(&self, start: StartMessage) -> LocalEngine {
        let serial = || LocalEngine::Serial(SerialEngine::new(self.analytic.clone()));
        match start.resource {
            ResourceType::Serial => serial(),
            ResourceType::Accelerated => match ConcurrentEngine::on_devices(
                self.analytic.clone(),
                self.platform,
                &[(start.platform, start.device)],
                self.completion_timeout,
            ) {
                Ok(engine) => LocalEngine::Accelerated(engine),
                Err(e) => {
                    warn!(
                        "rank {} falls back to serial execution: {}",
                        self.comm.rank(),
                        e
                    );
                    serial()
                }
            },
        }
    }

    fn send(&self, message: &Message) -> AceResult<()> {
        self.comm.send(MASTER_RANK, protocol::encode(message)?)
    }
}

impl MessageHandler for DistributedWorker<'_> {
    fn local_data_received(&mut self, data: &[u8], from: usize) -> AceResult<()> {
        if self.engine.is_some() {
            return Err(AceError::protocol(format!(
                "Rank {} received a start message more than once (second from local rank {})",
                self.comm.rank(),
                from
            )));
        }
        let start: StartMessage = protocol::decode(data, from)?;
        let engine = self.start(start);
        let capability = engine.capability();
        self.engine = Some(engine);

        info!("rank {} started as {:?}", self.comm.rank(), capability);
        self.send(&Message::Ready(capability))
    }

    fn group_data_received(&mut self, data: &[u8], from: usize) -> AceResult<()> {
        if from != MASTER_RANK {
            return Err(AceError::protocol(format!(
                "Worker rank {} received a protocol message from rank {}",
                self.comm.rank(),
                from
            )));
        }
        let message: Message = protocol::decode(data, from)?;
        let engine = self.engine.as_mut().ok_or_else(|| {
            AceError::protocol("Received work distribution message before the start message")
        })?;

        match message {
            Message::Assign(work) => {
                let index = work.index;
                match engine.execute(work) {
                    Ok(result) => {
                        self.executed += 1;
                        self.send(&Message::Result(result))
                    }
                    Err(e) => {
                        let detail = e.to_string();
                        if let Err(send_err) = self.send(&Message::Failed { index, detail }) {
                            warn!("could not report failure of unit {}: {}", index, send_err);
                        }
                        Err(e)
                    }
                }
            }
            Message::Terminate => {
                info!(
                    "rank {} terminated after {} unit(s)",
                    self.comm.rank(),
                    self.executed
                );
                self.terminated = true;
                Ok(())
            }
            Message::Ready(_) | Message::Result(_) | Message::Failed { .. } => {
                Err(AceError::protocol(format!(
                    "Worker rank {} received a worker-bound message",
                    self.comm.rank()
                )))
            }
        }
    }

    fn is_done(&self) -> bool {
        self.terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Payload;
    use crate::comm::LocalGroup;
    use crate::device::VirtualPlatform;

    struct Negate;

    impl Analytic for Negate {
        fn size(&self) -> usize {
            2
        }

        fn make_work(&self, index: usize) -> anyhow::Result<Payload> {
            Payload::encode(&(index as i64))
        }

        fn execute(&self, work: &WorkUnit) -> anyhow::Result<ResultUnit> {
            let value: i64 = work.payload.decode()?;
            if value == 1 {
                anyhow::bail!("cannot negate one");
            }
            ResultUnit::answer(work, &-value)
        }
    }

    fn master_receives(comm: &dyn Communicator) -> Message {
        let envelope = comm
            .recv_timeout(Duration::from_secs(1))
            .unwrap()
            .expect("message to master");
        protocol::decode(&envelope.data, envelope.from).unwrap()
    }

    fn worker_on<'a>(
        comm: &'a dyn Communicator,
        platform: &'a dyn AcceleratorPlatform,
    ) -> DistributedWorker<'a> {
        DistributedWorker::new(comm, Arc::new(Negate), platform, Some(Duration::from_secs(5)))
    }

    fn start_frame(start: StartMessage) -> Vec<u8> {
        protocol::encode(&start).unwrap()
    }

    #[test]
    fn test_start_then_execute_then_terminate() -> anyhow::Result<()> {
        let group = LocalGroup::spawn(2);
        let platform = VirtualPlatform::with_devices(1);
        let mut worker = worker_on(&group[1], &platform);

        worker.local_data_received(&start_frame(StartMessage::accelerated(0, 0)), 0)?;
        assert_eq!(worker.capability(), Some(Capability::Accelerated));
        assert_eq!(master_receives(&group[0]), Message::Ready(Capability::Accelerated));

        let assign = Message::Assign(WorkUnit::new(0, Payload::encode(&0i64)?));
        worker.group_data_received(&protocol::encode(&assign)?, 0)?;
        match master_receives(&group[0]) {
            Message::Result(result) => assert_eq!(result.index, 0),
            other => panic!("expected Result, got {:?}", other),
        }

        worker.group_data_received(&protocol::encode(&Message::Terminate)?, 0)?;
        assert!(worker.is_done());
        assert_eq!(worker.executed(), 1);
        Ok(())
    }

    #[test]
    fn test_second_start_is_violation() -> anyhow::Result<()> {
        let group = LocalGroup::spawn(2);
        let platform = VirtualPlatform::default();
        let mut worker = worker_on(&group[1], &platform);

        worker.local_data_received(&start_frame(StartMessage::serial()), 0)?;
        let err = worker
            .local_data_received(&start_frame(StartMessage::serial()), 0)
            .unwrap_err();
        assert!(matches!(err, AceError::ProtocolViolation { .. }));
        Ok(())
    }

    #[test]
    fn test_broken_device_falls_back_to_serial() -> anyhow::Result<()> {
        let group = LocalGroup::spawn(2);
        let platform = VirtualPlatform::with_devices(1).with_broken_device(0, 0);
        let mut worker = worker_on(&group[1], &platform);

        worker.local_data_received(&start_frame(StartMessage::accelerated(0, 0)), 0)?;
        assert_eq!(worker.capability(), Some(Capability::Serial));
        assert_eq!(master_receives(&group[0]), Message::Ready(Capability::Serial));
        Ok(())
    }

    #[test]
    fn test_work_before_start_is_violation() -> anyhow::Result<()> {
        let group = LocalGroup::spawn(2);
        let platform = VirtualPlatform::default();
        let mut worker = worker_on(&group[1], &platform);

        let err = worker
            .group_data_received(&protocol::encode(&Message::Terminate)?, 0)
            .unwrap_err();
        assert!(matches!(err, AceError::ProtocolViolation { .. }));
        Ok(())
    }

    #[test]
    fn test_execution_failure_is_reported_to_master() -> anyhow::Result<()> {
        let group = LocalGroup::spawn(2);
        let platform = VirtualPlatform::default();
        let mut worker = worker_on(&group[1], &platform);
        worker.local_data_received(&start_frame(StartMessage::serial()), 0)?;
        master_receives(&group[0]);

        let assign = Message::Assign(WorkUnit::new(1, Payload::encode(&1i64)?));
        let err = worker
            .group_data_received(&protocol::encode(&assign)?, 0)
            .unwrap_err();
        assert!(matches!(err, AceError::EngineFailure { .. }));
        match master_receives(&group[0]) {
            Message::Failed { index, detail } => {
                assert_eq!(index, 1);
                assert!(detail.contains("cannot negate one"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        Ok(())
    }
}
