//! src/sink.rs
//!
//! Result sink: accepts results in any arrival order and commits them
//! strictly in index order.
//!
//! # Algorithm
//! - If the submitted index equals `next_expected`, commit it, advance
//!   `next_expected`, then drain the pending buffer for as long as it holds
//!   the newly expected index.
//! - Otherwise park the result in the pending buffer, keyed by index.
//!
//! Every key in the pending buffer is strictly greater than `next_expected`;
//! the buffer never holds the index currently awaited.
//!
//! # Concurrency
//! `submit` takes `&self` and may be called from any thread. All mutation of
//! `next_expected`, the pending buffer and the committer happens under one
//! mutex. This is the only state shared by every producer in the system.

use log::{debug, trace};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::analytic::Committer;
use crate::block::ResultUnit;
use crate::error::{AceError, AceResult};

/// Consumer of results.
pub trait ResultSink: Send + Sync {
    fn submit(&self, result: ResultUnit) -> AceResult<()>;

    fn is_finished(&self) -> bool;
}

struct SinkState {
    next_expected: usize,
    pending: BTreeMap<usize, ResultUnit>,
    peak_pending: usize,
    committer: Box<dyn Committer>,
    failed: bool,
}

/// Ordering buffer in front of a `Committer`.
pub struct OrderedSink {
    size: usize,
    state: Mutex<SinkState>,
}

impl OrderedSink {
    /// Creates a sink expecting exactly `size` results (indices `0..size`).
    pub fn new(size: usize, committer: Box<dyn Committer>) -> Self {
        Self {
            size,
            state: Mutex::new(SinkState {
                next_expected: 0,
                pending: BTreeMap::new(),
                peak_pending: 0,
                committer,
                failed: false,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Index of the next result to be committed.
    pub fn next_expected(&self) -> usize {
        self.lock().map(|s| s.next_expected).unwrap_or(0)
    }

    /// Results currently parked in the pending buffer.
    pub fn pending_len(&self) -> usize {
        self.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    /// Largest pending buffer size observed so far.
    pub fn peak_pending(&self) -> usize {
        self.lock().map(|s| s.peak_pending).unwrap_or(0)
    }

    fn lock(&self) -> AceResult<MutexGuard<'_, SinkState>> {
        self.state
            .lock()
            .map_err(|_| AceError::invalid_state("Result sink lock poisoned by a panicking producer"))
    }

    fn commit(state: &mut SinkState, result: ResultUnit) -> AceResult<()> {
        let index = result.index;
        if let Err(e) = state.committer.commit(result) {
            state.failed = true;
            return Err(AceError::engine_from(
                format!("Failed to commit result {}", index),
                e,
            ));
        }
        trace!("committed result {}", index);
        state.next_expected += 1;
        Ok(())
    }
}

impl ResultSink for OrderedSink {
    fn submit(&self, result: ResultUnit) -> AceResult<()> {
        let mut state = self.lock()?;

        if state.failed {
            return Err(AceError::invalid_state(format!(
                "Result {} submitted after the sink failed to commit",
                result.index
            )));
        }
        if result.index >= self.size {
            return Err(AceError::protocol(format!(
                "Result index {} is out of range (run has {} units)",
                result.index, self.size
            )));
        }
        if result.index < state.next_expected {
            return Err(AceError::protocol(format!(
                "Result index {} was already committed",
                result.index
            )));
        }

        if result.index == state.next_expected {
            Self::commit(&mut state, result)?;
            loop {
                let next = state.next_expected;
                match state.pending.remove(&next) {
                    Some(parked) => Self::commit(&mut state, parked)?,
                    None => break,
                }
            }
            if state.next_expected == self.size {
                debug!("all {} results committed", self.size);
            }
        } else {
            if state.pending.contains_key(&result.index) {
                return Err(AceError::protocol(format!(
                    "Result index {} was submitted twice",
                    result.index
                )));
            }
            state.pending.insert(result.index, result);
            state.peak_pending = state.peak_pending.max(state.pending.len());
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.lock()
            .map(|s| s.next_expected == self.size)
            .unwrap_or(false)
    }
}
