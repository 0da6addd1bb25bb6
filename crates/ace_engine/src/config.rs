//! src/config.rs
//!
//! Configuration for an analytic run.
//!
//! Example:
//! ```
//! use ace_engine::config::{Mode, RunConfig};
//! use std::time::Duration;
//!
//! let config = RunConfig::builder()
//!     .mode(Mode::Concurrent)
//!     .max_pistons(4)
//!     .completion_timeout(Duration::from_secs(600))
//!     .build();
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Notes
//! - `max_pistons`: caps the piston pool below the number of enumerated
//!   devices. `None` opens one piston per device.
//! - `lookahead`: bounds how far ahead of the oldest uncommitted index the
//!   distributed controller may hand out work, which bounds the result
//!   sink's pending buffer to `lookahead - 1` entries. `None` leaves it
//!   unbounded.
//! - `completion_timeout`, `message_timeout`: stall detection, off by
//!   default. A unit may legitimately run for a long time on an
//!   accelerator, so a run only fails on silence when a bound is set.

use std::time::Duration;

use crate::error::{AceError, AceResult};

/// Which engine a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// One unit at a time on the calling thread.
    #[default]
    Serial,
    /// A pool of device-bound piston threads in this process.
    Concurrent,
    /// A group of processes: rank 0 distributes, the others execute.
    Distributed,
}

impl std::str::FromStr for Mode {
    type Err = AceError;

    fn from_str(s: &str) -> AceResult<Self> {
        match s {
            "serial" => Ok(Mode::Serial),
            "concurrent" | "pool" => Ok(Mode::Concurrent),
            "distributed" | "mpi" => Ok(Mode::Distributed),
            other => Err(AceError::config(format!(
                "Unknown run mode '{}' (expected serial, concurrent or distributed)",
                other
            ))),
        }
    }
}

/// Configuration for a `Manager` run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: Mode,
    /// Upper bound on piston threads (None = one per device)
    pub max_pistons: Option<usize>,
    /// Whether startup placement hands accelerator devices to distributed
    /// workers. When false every worker is placed as serial.
    pub use_accelerators: bool,
    /// Maximum distance between an assigned index and the oldest
    /// uncommitted index (distributed only)
    pub lookahead: Option<usize>,
    /// Longest wait for any piston to complete before the run is declared
    /// stalled (None = wait indefinitely)
    pub completion_timeout: Option<Duration>,
    /// Longest wait for any protocol message on the master before the run
    /// is declared stalled (None = wait indefinitely). Workers never apply
    /// it, since a parked worker may legitimately wait for a long time.
    pub message_timeout: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Serial,
            max_pistons: None,
            use_accelerators: true,
            lookahead: None,
            completion_timeout: None,
            message_timeout: None,
        }
    }
}

impl RunConfig {
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Rejects configurations no run could start with.
    pub fn validate(&self) -> AceResult<()> {
        if self.max_pistons == Some(0) {
            return Err(AceError::config(
                "max_pistons must be > 0. Use Mode::Serial for single-threaded runs.",
            ));
        }
        if self.lookahead == Some(0) {
            return Err(AceError::config(
                "lookahead must be > 0, otherwise no unit could ever be assigned",
            ));
        }
        let zero = Some(Duration::ZERO);
        if self.completion_timeout == zero || self.message_timeout == zero {
            return Err(AceError::config("timeouts must be non-zero"));
        }
        Ok(())
    }
}

/// Builder for RunConfig with method chaining
#[derive(Default)]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Cap the number of piston threads
    pub fn max_pistons(mut self, pistons: usize) -> Self {
        self.config.max_pistons = Some(pistons);
        self
    }

    pub fn use_accelerators(mut self, enabled: bool) -> Self {
        self.config.use_accelerators = enabled;
        self
    }

    /// Bound the distributed look-ahead window.
    ///
    /// - Too low: fast workers idle while a slow worker holds the oldest index.
    /// - Too high: more results parked in memory waiting for their turn.
    pub fn lookahead(mut self, window: usize) -> Self {
        self.config.lookahead = Some(window);
        self
    }

    /// Enable stall detection on the piston pool.
    ///
    /// A run fails with `EngineFailure` when no piston completes within
    /// `timeout`. Set it well above the slowest expected unit.
    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.config.completion_timeout = Some(timeout);
        self
    }

    /// Enable stall detection on the distributed master.
    ///
    /// The master fails with `EngineFailure` when no worker message arrives
    /// within `timeout`.
    pub fn message_timeout(mut self, timeout: Duration) -> Self {
        self.config.message_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> RunConfig {
        self.config
    }
}
