//! src/distributed/controller.rs
//!
//! Master side of the distributed run.
//!
//! The controller reacts to whichever worker message arrives next:
//! - `Ready(cap)`: the worker joins the ready queue.
//! - `Result(unit)`: the result goes to the sink unmodified and the worker
//!   joins the ready queue again.
//!
//! After each message the ready queue is served: while work remains, the
//! worker at the front gets `Assign`; once the source is exhausted every
//! ready worker gets `Terminate` instead. A worker is therefore only ever
//! terminated when it has nothing in flight.
//!
//! The controller does no reordering. Results reach the sink in completion
//! order and the sink commits them in index order.
//!
//! With a look-ahead window `w`, a unit with index `i` is only assigned
//! while `i < sink.next_expected() + w`; a ready worker that cannot be served
//! yet stays queued until the sink advances.
//!
//! All state here is touched from the single message handling path, so no
//! locking is needed.

use log::{debug, info, warn};
use std::collections::{BTreeMap, VecDeque};

use crate::comm::{Communicator, MessageHandler};
use crate::error::{AceError, AceResult};
use crate::protocol::{self, Capability, Message};
use crate::sink::{OrderedSink, ResultSink};
use crate::source::WorkSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// No readiness signal received yet.
    Unassigned,
    Ready,
    /// Executing the unit with this index.
    Busy(usize),
    Terminated,
}

/// Per-worker state kept by the master.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub capability: Option<Capability>,
    pub status: WorkerStatus,
    /// Units assigned to this worker so far.
    pub assignments: usize,
}

impl WorkerRecord {
    fn new() -> Self {
        Self {
            capability: None,
            status: WorkerStatus::Unassigned,
            assignments: 0,
        }
    }
}

pub struct DistributedController<'a> {
    comm: &'a dyn Communicator,
    source: &'a mut dyn WorkSource,
    sink: &'a OrderedSink,
    lookahead: Option<usize>,
    workers: BTreeMap<usize, WorkerRecord>,
    ready: VecDeque<usize>,
    busy: usize,
    peak_busy: usize,
    terminated: usize,
}

impl<'a> DistributedController<'a> {
    /// Every rank except the master (rank 0) is expected to report as a worker.
    pub fn new(
        comm: &'a dyn Communicator,
        source: &'a mut dyn WorkSource,
        sink: &'a OrderedSink,
        lookahead: Option<usize>,
    ) -> Self {
        let workers = (1..comm.size()).map(|rank| (rank, WorkerRecord::new())).collect();
        Self {
            comm,
            source,
            sink,
            lookahead,
            workers,
            ready: VecDeque::new(),
            busy: 0,
            peak_busy: 0,
            terminated: 0,
        }
    }

    pub fn worker(&self, rank: usize) -> Option<&WorkerRecord> {
        self.workers.get(&rank)
    }

    pub fn workers(&self) -> impl Iterator<Item = (&usize, &WorkerRecord)> {
        self.workers.iter()
    }

    /// Highest number of workers holding a unit at the same time.
    pub fn peak_busy(&self) -> usize {
        self.peak_busy
    }

    /// Every worker has been sent `Terminate`.
    pub fn is_distribution_complete(&self) -> bool {
        self.terminated == self.workers.len()
    }

    /// Best-effort `Terminate` to every worker not yet terminated, used when
    /// the run is abandoned.
    pub fn abort(&mut self) {
        for (rank, record) in self.workers.iter_mut() {
            if record.status == WorkerStatus::Terminated {
                continue;
            }
            if let Ok(frame) = protocol::encode(&Message::Terminate) {
                if let Err(e) = self.comm.send(*rank, frame) {
                    warn!("could not terminate rank {} during abort: {}", rank, e);
                }
            }
            record.status = WorkerStatus::Terminated;
        }
        self.terminated = self.workers.len();
        self.ready.clear();
    }

    fn record_mut(&mut self, rank: usize) -> AceResult<&mut WorkerRecord> {
        self.workers.get_mut(&rank).ok_or_else(|| {
            AceError::protocol(format!("Message from rank {} which is not a worker", rank))
        })
    }

    fn window_open(&self) -> bool {
        match self.lookahead {
            Some(window) => self.source.issued() < self.sink.next_expected() + window,
            None => true,
        }
    }

    /// Assigns or terminates queued workers for as long as possible.
    fn serve_ready(&mut self) -> AceResult<()> {
        while let Some(&rank) = self.ready.front() {
            if self.source.has_next() && !self.window_open() {
                debug!(
                    "look-ahead window full ({} issued, {} committed), {} worker(s) waiting",
                    self.source.issued(),
                    self.sink.next_expected(),
                    self.ready.len()
                );
                break;
            }
            self.ready.pop_front();
            if self.source.has_next() {
                self.assign(rank)?;
            } else {
                self.terminate(rank)?;
            }
        }
        Ok(())
    }

    fn assign(&mut self, rank: usize) -> AceResult<()> {
        let unit = self.source.next()?;
        let index = unit.index;
        self.comm.send(rank, protocol::encode(&Message::Assign(unit))?)?;

        let record = self.record_mut(rank)?;
        record.status = WorkerStatus::Busy(index);
        record.assignments += 1;
        self.busy += 1;
        self.peak_busy = self.peak_busy.max(self.busy);
        debug!("assigned unit {} to rank {}", index, rank);
        Ok(())
    }

    fn terminate(&mut self, rank: usize) -> AceResult<()> {
        self.comm.send(rank, protocol::encode(&Message::Terminate)?)?;
        let record = self.record_mut(rank)?;
        record.status = WorkerStatus::Terminated;
        let assignments = record.assignments;
        self.terminated += 1;
        info!("terminated rank {} after {} unit(s)", rank, assignments);
        Ok(())
    }
}

impl MessageHandler for DistributedController<'_> {
    fn group_data_received(&mut self, data: &[u8], from: usize) -> AceResult<()> {
        let message: Message = protocol::decode(data, from)?;
        let record = self.record_mut(from)?;

        match message {
            Message::Ready(capability) => {
                if record.status != WorkerStatus::Unassigned {
                    return Err(AceError::protocol(format!(
                        "Rank {} signalled readiness while {:?}",
                        from, record.status
                    )));
                }
                record.capability = Some(capability);
                record.status = WorkerStatus::Ready;
                info!("rank {} ready as {:?}", from, capability);
            }
            Message::Result(result) => {
                match record.status {
                    WorkerStatus::Busy(index) if index == result.index => {}
                    WorkerStatus::Busy(index) => {
                        return Err(AceError::protocol(format!(
                            "Rank {} returned result {} but was assigned unit {}",
                            from, result.index, index
                        )))
                    }
                    status => {
                        return Err(AceError::protocol(format!(
                            "Rank {} returned result {} while {:?}",
                            from, result.index, status
                        )))
                    }
                }
                record.status = WorkerStatus::Ready;
                self.busy -= 1;
                debug!("result {} received from rank {}", result.index, from);
                self.sink.submit(result)?;
            }
            Message::Failed { index, detail } => {
                return Err(AceError::engine(format!(
                    "Worker rank {} failed executing unit {}: {}",
                    from, index, detail
                )));
            }
            Message::Assign(_) | Message::Terminate => {
                return Err(AceError::protocol(format!(
                    "Rank {} sent a worker-bound message to the master",
                    from
                )));
            }
        }

        self.ready.push_back(from);
        self.serve_ready()
    }

    fn local_data_received(&mut self, _data: &[u8], from: usize) -> AceResult<()> {
        Err(AceError::protocol(format!(
            "Master received a start message from local rank {}",
            from
        )))
    }

    fn is_done(&self) -> bool {
        self.is_distribution_complete() && self.sink.is_finished()
    }
}
