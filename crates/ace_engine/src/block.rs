//! src/block.rs
//!
//! Work and result blocks.
//!
//! A `WorkUnit` is one indexed piece of an analytic's input; executing it
//! yields a `ResultUnit` carrying the same index. Both wrap an opaque
//! `Payload` that the core moves between owners without ever interpreting.
//!
//! Neither block type implements `Clone`: each block has exactly one owner at
//! a time (work source, engine, piston, remote worker, result sink) and is
//! handed over by move at every transfer point.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Opaque, serializable block content.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Serializes any serde value into a payload.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value).context("Failed to encode block payload")?;
        Ok(Self(bytes))
    }

    /// Deserializes a payload previously built with `encode`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.0).with_context(|| {
            format!(
                "Failed to decode block payload of {} bytes as {}",
                self.0.len(),
                std::any::type_name::<T>()
            )
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Indexed input block.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub index: usize,
    pub payload: Payload,
}

impl WorkUnit {
    pub fn new(index: usize, payload: Payload) -> Self {
        Self { index, payload }
    }
}

/// Indexed output block, produced from the `WorkUnit` with the same index.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultUnit {
    pub index: usize,
    pub payload: Payload,
}

impl ResultUnit {
    pub fn new(index: usize, payload: Payload) -> Self {
        Self { index, payload }
    }

    /// Convenience for kernels: encode `value` as the result of `work`.
    pub fn answer<T: Serialize + ?Sized>(work: &WorkUnit, value: &T) -> Result<Self> {
        Ok(Self {
            index: work.index,
            payload: Payload::encode(value)?,
        })
    }
}
