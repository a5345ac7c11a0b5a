// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Virtual device partitioning.
//!
//! [`partition`] is a pure function of the inventory and the policy: the same
//! inventory always yields the same identities in the same order, so ids
//! advertised before a list refresh stay resolvable afterwards.

use crate::config::{PartitionPolicy, MAX_CONTEXTS_PER_DEVICE};
use crate::device::{PhysicalDevice, VirtualDevice, VirtualDeviceId};
use crate::error::PartitionError;

/// Check `policy` against the inventory before any server is created.
///
/// Devices on one node are assumed homogeneous, so the memory-unit policy is
/// checked against the first device only.
pub fn validate(policy: &PartitionPolicy, devices: &[PhysicalDevice]) -> Result<(), PartitionError> {
    let sample = devices.first().ok_or(PartitionError::NoDevices)?;

    match *policy {
        PartitionPolicy::FixedCount(0) => Err(PartitionError::ZeroVirtualDevices),
        PartitionPolicy::FixedCount(n) if n > MAX_CONTEXTS_PER_DEVICE => {
            Err(PartitionError::TooManyVirtualDevices {
                requested: n,
                max: MAX_CONTEXTS_PER_DEVICE,
            })
        }
        PartitionPolicy::FixedCount(_) => Ok(()),
        PartitionPolicy::MemoryUnit(unit) => {
            if unit == 0 || sample.memory_mib % unit != 0 {
                return Err(PartitionError::InvalidMemoryUnit {
                    device: sample.id.clone(),
                    memory_mib: sample.memory_mib,
                    memory_unit_mib: unit,
                });
            }
            if sample.memory_mib / unit == 0 {
                return Err(PartitionError::ZeroVirtualDevices);
            }
            Ok(())
        }
    }
}

/// Number of virtual devices one physical device yields under `policy`.
/// Assumes `policy` passed [`validate`].
pub fn slots_for(policy: &PartitionPolicy, device: &PhysicalDevice) -> u32 {
    match *policy {
        PartitionPolicy::FixedCount(n) => n,
        PartitionPolicy::MemoryUnit(unit) => {
            u32::try_from(device.memory_mib / unit.max(1)).unwrap_or(u32::MAX)
        }
    }
}

/// Derive the virtual device set, all initially healthy.
pub fn partition(
    devices: &[PhysicalDevice],
    policy: &PartitionPolicy,
) -> Result<Vec<VirtualDevice>, PartitionError> {
    validate(policy, devices)?;

    let mut virtual_devices = Vec::new();
    for device in devices {
        let slots = slots_for(policy, device);
        tracing::info!(
            device = %device.id,
            memory_mib = device.memory_mib,
            slots,
            "Partitioning physical device"
        );
        let physical: std::sync::Arc<str> = device.id.as_str().into();
        virtual_devices.extend(
            (0..slots).map(|slot| VirtualDevice::new(VirtualDeviceId::new(physical.clone(), slot))),
        );
    }
    Ok(virtual_devices)
}
