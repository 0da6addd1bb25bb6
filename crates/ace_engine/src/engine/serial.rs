//! src/engine/serial.rs
//!
//! Single-threaded engine.
//!
//! Blocks the calling thread for the duration of every unit. Meant for small
//! runs, hosts without accelerators, and as the local strategy of a serial
//! distributed worker.

use log::debug;
use std::sync::Arc;

use crate::analytic::Analytic;
use crate::block::{ResultUnit, WorkUnit};
use crate::error::{AceError, AceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SerialState {
    Idle,
    Executing,
}

pub struct SerialEngine {
    analytic: Arc<dyn Analytic>,
    state: SerialState,
    executed: usize,
}

impl SerialEngine {
    pub fn new(analytic: Arc<dyn Analytic>) -> Self {
        Self {
            analytic,
            state: SerialState::Idle,
            executed: 0,
        }
    }

    /// Units executed so far.
    pub fn executed(&self) -> usize {
        self.executed
    }

    /// Executes `unit` synchronously and returns its result.
    pub fn execute(&mut self, unit: WorkUnit) -> AceResult<ResultUnit> {
        if self.state == SerialState::Executing {
            return Err(AceError::invalid_state(
                "Serial engine re-entered while a unit is executing",
            ));
        }
        self.state = SerialState::Executing;
        let index = unit.index;
        debug!("serial engine executing unit {}", index);

        let outcome = self.analytic.execute(&unit);
        self.state = SerialState::Idle;

        let result = outcome
            .map_err(|e| AceError::engine_from(format!("Serial execution of unit {} failed", index), e))?;
        if result.index != index {
            return Err(AceError::engine(format!(
                "Kernel returned result index {} for work unit {}",
                result.index, index
            )));
        }
        self.executed += 1;
        Ok(result)
    }
}
