//! src/analytic.rs
//!
//! Interfaces implemented by the computation being distributed.
//!
//! An analytic plays two separate roles, expressed as two traits so a single
//! user type may implement both or hand them to different objects:
//!
//! - `Analytic`: the input and kernel side. Knows how many units exist,
//!   builds the payload of unit `i`, and executes a unit on the host.
//!   Optionally builds an `AcceleratedKernel` bound to one device context.
//! - `Committer`: the output side. Receives results strictly in index order
//!   from the `OrderedSink`.
//!
//! User code reports failures with `anyhow::Result`; the engines wrap them
//! into `AceError::EngineFailure` with the unit index as context.

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::block::{Payload, ResultUnit, WorkUnit};
use crate::device::DeviceContext;

/// Input and kernel side of a computation.
///
/// Implementations must be `Send + Sync`: the same instance is shared by the
/// work source and by every piston thread of a concurrent run.
pub trait Analytic: Send + Sync {
    /// Total number of work units.
    fn size(&self) -> usize;

    /// Builds the payload of unit `index` (`0 <= index < size()`).
    fn make_work(&self, index: usize) -> Result<Payload>;

    /// Executes one unit on the calling thread.
    fn execute(&self, work: &WorkUnit) -> Result<ResultUnit>;

    /// Builds a kernel bound to `context`.
    ///
    /// Returning `Ok(None)` means the analytic has no accelerator kernel; the
    /// piston owning that context then runs the host `execute` instead.
    fn make_accelerated(&self, _context: &DeviceContext) -> Result<Option<Box<dyn AcceleratedKernel>>> {
        Ok(None)
    }
}

/// Kernel owned by exactly one piston thread for its whole life.
pub trait AcceleratedKernel: Send {
    fn execute(&mut self, work: WorkUnit) -> Result<ResultUnit>;
}

/// Host fallback used when an analytic provides no accelerator kernel.
pub(crate) struct HostKernel {
    analytic: Arc<dyn Analytic>,
}

impl HostKernel {
    pub(crate) fn new(analytic: Arc<dyn Analytic>) -> Self {
        Self { analytic }
    }
}

impl AcceleratedKernel for HostKernel {
    fn execute(&mut self, work: WorkUnit) -> Result<ResultUnit> {
        self.analytic.execute(&work)
    }
}

/// Output side of a computation.
pub trait Committer: Send {
    /// Called once per index, in ascending index order.
    fn commit(&mut self, result: ResultUnit) -> Result<()>;
}

impl<F> Committer for F
where
    F: FnMut(ResultUnit) -> Result<()> + Send,
{
    fn commit(&mut self, result: ResultUnit) -> Result<()> {
        self(result)
    }
}

// ================================================================================================
// Built-in committers
// ================================================================================================

/// Collects committed results in memory.
///
/// Cloning yields another handle on the same storage, so a caller can keep a
/// handle while the manager owns the committer.
#[derive(Clone, Default)]
pub struct VecCommitter {
    results: Arc<Mutex<Vec<ResultUnit>>>,
}

impl VecCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indices in commit order.
    pub fn indices(&self) -> Vec<usize> {
        self.results
            .lock()
            .map(|results| results.iter().map(|r| r.index).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.results.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes every committed payload, in commit order.
    pub fn decode_all<T: serde::de::DeserializeOwned>(&self) -> Result<Vec<T>> {
        let results = self
            .results
            .lock()
            .map_err(|_| anyhow!("Committed results lock poisoned"))?;
        results
            .iter()
            .map(|r| {
                r.payload
                    .decode()
                    .with_context(|| format!("Failed to decode result {}", r.index))
            })
            .collect()
    }
}

impl Committer for VecCommitter {
    fn commit(&mut self, result: ResultUnit) -> Result<()> {
        self.results
            .lock()
            .map_err(|_| anyhow!("Committed results lock poisoned"))?
            .push(result);
        Ok(())
    }
}

/// Writes each committed result as a record into a byte stream.
///
/// Record layout: index (u64 LE), payload length (u64 LE), payload bytes.
/// The stream is treated as an opaque storage device; no container header
/// or metadata is written.
pub struct StreamCommitter<W> {
    writer: W,
    records: usize,
}

impl<W: Write + Send> StreamCommitter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, records: 0 }
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Committer for StreamCommitter<W> {
    fn commit(&mut self, result: ResultUnit) -> Result<()> {
        let bytes = result.payload.as_bytes();
        self.writer
            .write_all(&(result.index as u64).to_le_bytes())
            .and_then(|_| self.writer.write_all(&(bytes.len() as u64).to_le_bytes()))
            .and_then(|_| self.writer.write_all(bytes))
            .with_context(|| format!("Failed to write result record {}", result.index))?;
        self.records += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_committer_shares_storage() -> Result<()> {
        let handle = VecCommitter::new();
        let mut committer = handle.clone();
        committer.commit(ResultUnit::new(0, Payload::encode(&5u8)?))?;
        committer.commit(ResultUnit::new(1, Payload::encode(&6u8)?))?;
        assert_eq!(handle.indices(), vec![0, 1]);
        assert_eq!(handle.decode_all::<u8>()?, vec![5, 6]);
        Ok(())
    }

    #[test]
    fn test_stream_committer_record_layout() -> Result<()> {
        let mut committer = StreamCommitter::new(Vec::new());
        committer.commit(ResultUnit::new(3, Payload::new(vec![0xAA, 0xBB])))?;
        assert_eq!(committer.records(), 1);

        let bytes = committer.into_inner();
        assert_eq!(bytes.len(), 8 + 8 + 2);
        assert_eq!(&bytes[0..8], &3u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &2u64.to_le_bytes());
        assert_eq!(&bytes[16..], &[0xAA, 0xBB]);
        Ok(())
    }

    #[test]
    fn test_closure_committer() -> Result<()> {
        let mut seen = Vec::new();
        {
            let mut committer = |r: ResultUnit| -> Result<()> {
                seen.push(r.index);
                Ok(())
            };
            committer.commit(ResultUnit::new(0, Payload::default()))?;
        }
        assert_eq!(seen, vec![0]);
        Ok(())
    }
}
