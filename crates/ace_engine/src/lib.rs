//! src/lib.rs
//!
//! Execution engine for block-decomposed analytics.
//!
//! An `Analytic` splits its job into numbered work units. A `Manager` runs
//! them on one of three engines chosen by `RunConfig::mode`:
//! - serial: one unit at a time on the calling thread (`engine::SerialEngine`)
//! - concurrent: a pool of device-bound piston threads (`engine::ConcurrentEngine`)
//! - distributed: rank 0 hands units to worker ranks over a `comm::Communicator`
//!
//! Whatever order units complete in, the `OrderedSink` commits results in
//! strictly increasing index order.

pub mod analytic;
pub mod block;
pub mod comm;
pub mod config;
pub mod device;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod sink;
pub mod source;

pub use analytic::{AcceleratedKernel, Analytic, Committer, StreamCommitter, VecCommitter};
pub use block::{Payload, ResultUnit, WorkUnit};
pub use config::{Mode, RunConfig};
pub use error::{AceError, AceResult};
pub use manager::{Manager, Role, RunReport, RunState};
pub use sink::{OrderedSink, ResultSink};
pub use source::{AnalyticSource, WorkSource};
