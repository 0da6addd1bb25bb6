//! src/protocol.rs
//!
//! Wire messages of the distributed run.
//!
//! Startup (node-local scope, once per worker):
//! - `StartMessage { resource, platform, device }` from the node's local
//!   rank 0 to each worker on the node.
//!
//! Work distribution (group scope):
//! - worker → master: `Ready(capability)`, `Result(unit)`, `Failed { .. }`
//! - master → worker: `Assign(unit)`, `Terminate`
//!
//! A `Result` doubles as the next readiness signal of that worker; `Ready`
//! is only sent once, right after startup.

use serde::{Deserialize, Serialize};

use crate::block::{ResultUnit, WorkUnit};
use crate::error::{AceError, AceResult};

/// Execution resource a worker is placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    Serial,
    Accelerated,
}

/// Device placement sent once to each worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMessage {
    pub resource: ResourceType,
    pub platform: usize,
    pub device: usize,
}

impl StartMessage {
    pub fn serial() -> Self {
        Self {
            resource: ResourceType::Serial,
            platform: 0,
            device: 0,
        }
    }

    pub fn accelerated(platform: usize, device: usize) -> Self {
        Self {
            resource: ResourceType::Accelerated,
            platform,
            device,
        }
    }
}

/// What a ready worker executes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    Serial,
    Accelerated,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Ready(Capability),
    Assign(WorkUnit),
    Result(ResultUnit),
    /// Execution of an assigned unit failed on the worker.
    Failed { index: usize, detail: String },
    Terminate,
}

pub fn encode<T: Serialize>(message: &T) -> AceResult<Vec<u8>> {
    serde_json::to_vec(message)
        .map_err(|e| AceError::communication(format!("Failed to encode protocol message: {}", e)))
}

/// Decodes a frame; an undecodable frame is a protocol violation.
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8], from: usize) -> AceResult<T> {
    serde_json::from_slice(data).map_err(|e| {
        AceError::protocol(format!(
            "Undecodable {} byte frame from rank {}: {}",
            data.len(),
            from,
            e
        ))
    })
}
