//! src/distributed/mod.rs
//!
//! Multi-process execution.
//!
//! - `placement`: startup, run once by local rank 0 of every node; gives each
//!   worker on the node exactly one device (or the serial resource).
//! - `controller`: the master (rank 0); hands work units to ready workers and
//!   forwards their results to the result sink.
//! - `worker`: every other rank; waits for its placement, then executes
//!   assigned units until told to terminate.
//!
//! ```text
//!   worker                          master
//!     │ ──────── Ready(cap) ─────────▶ │  source.next()
//!     │ ◀─────── Assign(unit) ──────── │
//!     │ ──────── Result(unit) ───────▶ │  sink.submit()
//!     │ ◀─────── Assign(unit) ──────── │
//!     │            ...                 │
//!     │ ──────── Result(unit) ───────▶ │  source exhausted
//!     │ ◀─────── Terminate ─────────── │
//! ```

pub mod controller;
pub mod placement;
pub mod worker;

pub use controller::{DistributedController, WorkerRecord, WorkerStatus};
pub use placement::{plan_placement, send_placement};
pub use worker::DistributedWorker;
