//! src/source.rs
//!
//! Work source: produces work units on demand in strict ascending index order.
//!
//! Indices start at 0, are contiguous, never repeat and never skip. Once every
//! unit has been produced the source is exhausted for good.

use std::sync::Arc;

use crate::analytic::Analytic;
use crate::block::WorkUnit;
use crate::error::{AceError, AceResult};

/// Producer of work units.
pub trait WorkSource: Send {
    /// Total number of units this source will ever produce.
    fn size(&self) -> usize;

    /// Number of units produced so far (also the next index).
    fn issued(&self) -> usize;

    fn has_next(&self) -> bool {
        self.issued() < self.size()
    }

    /// Produces the next unit. Fails with `Exhausted` once `has_next()` is false.
    fn next(&mut self) -> AceResult<WorkUnit>;
}

/// Work source backed by `Analytic::make_work`.
pub struct AnalyticSource {
    analytic: Arc<dyn Analytic>,
    size: usize,
    next_index: usize,
}

impl AnalyticSource {
    /// The unit count is read once, at construction.
    pub fn new(analytic: Arc<dyn Analytic>) -> Self {
        let size = analytic.size();
        Self {
            analytic,
            size,
            next_index: 0,
        }
    }
}

impl WorkSource for AnalyticSource {
    fn size(&self) -> usize {
        self.size
    }

    fn issued(&self) -> usize {
        self.next_index
    }

    fn next(&mut self) -> AceResult<WorkUnit> {
        if !self.has_next() {
            return Err(AceError::exhausted(self.size));
        }
        let index = self.next_index;
        let payload = self
            .analytic
            .make_work(index)
            .map_err(|e| AceError::engine_from(format!("Failed to make work unit {}", index), e))?;
        self.next_index += 1;
        Ok(WorkUnit::new(index, payload))
    }
}
