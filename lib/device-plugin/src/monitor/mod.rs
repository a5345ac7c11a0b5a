// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Hardware monitoring capability.
//!
//! The monitoring library is a single init/shutdown session per process. It is
//! modelled as an explicitly passed [`Monitor`] handle whose owner (the binary)
//! initializes it once at startup and shuts it down once at exit; every plugin
//! server and health watcher borrows it through an `Arc<dyn Monitor>`.
//!
//! Event waits are blocking and not cancellable, so callers bound every
//! [`EventSubscription::wait`] with a timeout and check for cancellation
//! between waits.

use std::time::Duration;

use thiserror::Error;

use crate::device::PhysicalDevice;

pub mod mock;
#[cfg(all(feature = "nvml", target_os = "linux"))]
pub mod nvml;

pub use mock::MockMonitor;
#[cfg(all(feature = "nvml", target_os = "linux"))]
pub use nvml::NvmlMonitor;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MonitorError {
    /// The library or driver could not be loaded.
    #[error("monitoring capability unavailable: {0}")]
    Unavailable(String),

    /// The device or driver does not support the requested operation.
    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("monitoring call failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CriticalXid,
    /// Any other event type, carrying the raw event mask.
    Other(u64),
}

/// Code reported for a critical error whose Xid the hardware did not supply.
/// It is never ignored, so an unknown Xid always degrades the device.
pub const UNKNOWN_XID: u64 = u64::MAX;

/// A hardware-reported event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub kind: EventKind,
    /// Xid error code for critical errors, [`UNKNOWN_XID`] when the hardware
    /// reported none.
    pub code: u64,
    /// Physical device identity, `None` when the event applies to all devices.
    pub device: Option<String>,
}

impl HealthEvent {
    pub fn critical_xid(code: u64, device: impl Into<String>) -> Self {
        Self {
            kind: EventKind::CriticalXid,
            code,
            device: Some(device.into()),
        }
    }

    pub fn global_critical_xid(code: u64) -> Self {
        Self {
            kind: EventKind::CriticalXid,
            code,
            device: None,
        }
    }
}

pub trait Monitor: Send + Sync {
    fn device_count(&self) -> Result<u32, MonitorError>;

    fn device(&self, index: u32) -> Result<PhysicalDevice, MonitorError>;

    /// Open a new event subscription. Dropping it releases every registration.
    fn subscribe(&self) -> Result<Box<dyn EventSubscription + '_>, MonitorError>;
}

pub trait EventSubscription {
    /// Register interest in critical Xid errors for one physical device.
    ///
    /// Returns [`MonitorError::NotSupported`] when the device cannot report
    /// health events.
    fn register_critical_errors(&mut self, physical_id: &str) -> Result<(), MonitorError>;

    /// Block for at most `timeout` waiting for the next event.
    /// `Ok(None)` means the timeout elapsed.
    fn wait(&mut self, timeout: Duration) -> Result<Option<HealthEvent>, MonitorError>;
}
