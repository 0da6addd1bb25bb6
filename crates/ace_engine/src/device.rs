//! src/device.rs
//!
//! Accelerator enumeration.
//!
//! The core never talks to a device driver directly. It asks an
//! `AcceleratorPlatform` how many platforms and devices exist and to open an
//! execution context for one `(platform, device)` pair. Each opened
//! `DeviceContext` is handed to exactly one piston thread and owned by it
//! for the life of the run, since drivers generally expect a context to be
//! driven from a single thread.
//!
//! Two implementations ship with the crate:
//! - `NoAccelerator`: a host without any accelerator.
//! - `VirtualPlatform`: a configurable set of virtual devices, optionally
//!   with devices that refuse to open. Used for hosts without drivers and
//!   by the test-suite.

use std::collections::HashSet;

use crate::error::{AceError, AceResult};

/// Execution context bound to one device.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceContext {
    pub platform: usize,
    pub device: usize,
    pub name: String,
}

/// Accelerator enumeration collaborator.
pub trait AcceleratorPlatform: Send + Sync {
    fn platform_count(&self) -> usize;

    fn device_count(&self, platform: usize) -> usize;

    /// Opens a context on the given device. Failure is reported as
    /// `ResourceUnavailable` and concerns that device only.
    fn create_context(&self, platform: usize, device: usize) -> AceResult<DeviceContext>;
}

/// Lists every `(platform, device)` pair in platform-major order.
pub fn devices(platform: &dyn AcceleratorPlatform) -> Vec<(usize, usize)> {
    (0..platform.platform_count())
        .flat_map(|p| (0..platform.device_count(p)).map(move |d| (p, d)))
        .collect()
}

/// A host with no accelerator at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAccelerator;

impl AcceleratorPlatform for NoAccelerator {
    fn platform_count(&self) -> usize {
        0
    }

    fn device_count(&self, _platform: usize) -> usize {
        0
    }

    fn create_context(&self, platform: usize, device: usize) -> AceResult<DeviceContext> {
        Err(AceError::resource(format!(
            "No accelerator platform available (requested platform {} device {})",
            platform, device
        )))
    }
}

/// Virtual devices with a fixed layout.
///
/// # Example
/// ```
/// use ace_engine::device::{devices, VirtualPlatform};
///
/// // Two platforms: the first with two devices, the second with one.
/// let platform = VirtualPlatform::new(vec![2, 1]);
/// assert_eq!(devices(&platform), vec![(0, 0), (0, 1), (1, 0)]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct VirtualPlatform {
    devices_per_platform: Vec<usize>,
    broken: HashSet<(usize, usize)>,
}

impl VirtualPlatform {
    pub fn new(devices_per_platform: Vec<usize>) -> Self {
        Self {
            devices_per_platform,
            broken: HashSet::new(),
        }
    }

    /// One platform holding `count` devices.
    pub fn with_devices(count: usize) -> Self {
        Self::new(vec![count])
    }

    /// Marks a device whose context creation always fails.
    pub fn with_broken_device(mut self, platform: usize, device: usize) -> Self {
        self.broken.insert((platform, device));
        self
    }
}

impl AcceleratorPlatform for VirtualPlatform {
    fn platform_count(&self) -> usize {
        self.devices_per_platform.len()
    }

    fn device_count(&self, platform: usize) -> usize {
        self.devices_per_platform.get(platform).copied().unwrap_or(0)
    }

    fn create_context(&self, platform: usize, device: usize) -> AceResult<DeviceContext> {
        if device >= self.device_count(platform) {
            return Err(AceError::resource(format!(
                "Platform {} has no device {}",
                platform, device
            )));
        }
        if self.broken.contains(&(platform, device)) {
            return Err(AceError::resource(format!(
                "Failed to create execution context on platform {} device {}",
                platform, device
            )));
        }
        Ok(DeviceContext {
            platform,
            device,
            name: format!("virtual:{}:{}", platform, device),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_accelerator_is_empty() {
        assert!(devices(&NoAccelerator).is_empty());
        assert!(matches!(
            NoAccelerator.create_context(0, 0),
            Err(AceError::ResourceUnavailable { .. })
        ));
    }

    #[test]
    fn test_broken_device_fails_alone() {
        let platform = VirtualPlatform::with_devices(3).with_broken_device(0, 1);
        assert!(platform.create_context(0, 0).is_ok());
        assert!(platform.create_context(0, 1).is_err());
        assert_eq!(platform.create_context(0, 2).unwrap().name, "virtual:0:2");
    }

    #[test]
    fn test_out_of_range_device() {
        let platform = VirtualPlatform::new(vec![1]);
        assert!(platform.create_context(0, 1).is_err());
        assert!(platform.create_context(4, 0).is_err());
        assert_eq!(platform.device_count(4), 0);
    }
}
