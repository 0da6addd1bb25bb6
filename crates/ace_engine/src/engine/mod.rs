//! src/engine/mod.rs
//!
//! Execution engines.
//!
//! - `serial`: executes one unit at a time on the calling thread.
//! - `piston`: one device-bound worker thread, at most one unit in flight.
//! - `concurrent`: a fixed pool of pistons with an idle queue.
//!
//! The distributed engine lives in `crate::distributed`; it moves units to
//! other processes instead of executing them.

pub mod concurrent;
pub(crate) mod piston;
pub mod serial;

pub use concurrent::ConcurrentEngine;
pub use serial::SerialEngine;
