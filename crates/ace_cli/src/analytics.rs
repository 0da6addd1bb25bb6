//! Built-in analytics selectable by name.

use ace_engine::{AceError, AceResult, Analytic, Payload, ResultUnit, WorkUnit};
use anyhow::{bail, Result};
use std::sync::Arc;

pub const NAMES: &[&str] = &["square", "collatz"];

pub fn select(name: &str, units: usize) -> AceResult<Arc<dyn Analytic>> {
    match name {
        "square" => Ok(Arc::new(Square { units })),
        "collatz" => Ok(Arc::new(Collatz { units })),
        other => Err(AceError::config(format!(
            "Unknown analytic '{}' (available: {})",
            other,
            NAMES.join(", ")
        ))),
    }
}

/// Wraps `inner` so that unit `index` raises an execution fault.
pub fn failing_at(inner: Arc<dyn Analytic>, index: usize) -> Arc<dyn Analytic> {
    Arc::new(FailingAt { inner, index })
}

struct FailingAt {
    inner: Arc<dyn Analytic>,
    index: usize,
}

impl Analytic for FailingAt {
    fn size(&self) -> usize {
        self.inner.size()
    }

    fn make_work(&self, index: usize) -> Result<Payload> {
        self.inner.make_work(index)
    }

    fn execute(&self, work: &WorkUnit) -> Result<ResultUnit> {
        if work.index == self.index {
            bail!("injected fault on unit {}", work.index);
        }
        self.inner.execute(work)
    }
}

/// Unit `i` yields `i * i`.
pub struct Square {
    units: usize,
}

impl Analytic for Square {
    fn size(&self) -> usize {
        self.units
    }

    fn make_work(&self, index: usize) -> Result<Payload> {
        Payload::encode(&(index as u64))
    }

    fn execute(&self, work: &WorkUnit) -> Result<ResultUnit> {
        let value: u64 = work.payload.decode()?;
        ResultUnit::answer(work, &(value * value))
    }
}

/// Unit `i` yields the number of Collatz steps from `i + 1` down to 1.
pub struct Collatz {
    units: usize,
}

impl Analytic for Collatz {
    fn size(&self) -> usize {
        self.units
    }

    fn make_work(&self, index: usize) -> Result<Payload> {
        Payload::encode(&(index as u64 + 1))
    }

    fn execute(&self, work: &WorkUnit) -> Result<ResultUnit> {
        let mut n: u64 = work.payload.decode()?;
        let mut steps = 0u32;
        while n != 1 {
            n = if n % 2 == 0 {
                n / 2
            } else {
                match n.checked_mul(3).and_then(|m| m.checked_add(1)) {
                    Some(next) => next,
                    None => bail!("Collatz sequence of unit {} overflows u64", work.index),
                }
            };
            steps += 1;
        }
        ResultUnit::answer(work, &steps)
    }
}
