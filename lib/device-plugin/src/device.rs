// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Physical and virtual device identities.
//!
//! A virtual device is identified by the structured pair
//! `(physical_id, slot)`. The kubelet only ever sees the rendered form
//! `"<physical_id>-<slot>"`; parsing splits on the *last* separator, and the
//! slot is always a decimal integer, so physical identities that contain `-`
//! (NVML UUIDs look like `GPU-8f3a...-...`) round-trip unambiguously.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub const ID_SEPARATOR: char = '-';

/// One hardware accelerator as reported by the monitoring capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalDevice {
    /// Stable identity, e.g. the NVML UUID.
    pub id: String,
    /// Total memory in MiB.
    pub memory_mib: u64,
    /// Ordinal within one inventory snapshot.
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualDeviceId {
    physical: Arc<str>,
    slot: u32,
}

impl VirtualDeviceId {
    pub fn new(physical: impl Into<Arc<str>>, slot: u32) -> Self {
        Self {
            physical: physical.into(),
            slot,
        }
    }

    pub fn physical_id(&self) -> &str {
        &self.physical
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl fmt::Display for VirtualDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.physical, ID_SEPARATOR, self.slot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed virtual device id: {0:?}")]
pub struct ParseVirtualDeviceIdError(String);

impl FromStr for VirtualDeviceId {
    type Err = ParseVirtualDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (physical, slot) = s
            .rsplit_once(ID_SEPARATOR)
            .ok_or_else(|| ParseVirtualDeviceIdError(s.to_string()))?;

        if physical.is_empty() || slot.is_empty() || !slot.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseVirtualDeviceIdError(s.to_string()));
        }

        let slot = slot
            .parse()
            .map_err(|_| ParseVirtualDeviceIdError(s.to_string()))?;
        Ok(Self::new(physical, slot))
    }
}

/// One advertised schedulable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDevice {
    pub id: VirtualDeviceId,
    pub health: Health,
}

impl VirtualDevice {
    pub fn new(id: VirtualDeviceId) -> Self {
        Self {
            id,
            health: Health::Healthy,
        }
    }

    pub fn physical_id(&self) -> &str {
        self.id.physical_id()
    }
}
