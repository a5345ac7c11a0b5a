// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Physical device inventory, a stateless query layer over the [`Monitor`].

use crate::device::PhysicalDevice;
use crate::error::InventoryError;
use crate::monitor::Monitor;

pub struct Inventory<'a> {
    monitor: &'a dyn Monitor,
}

impl<'a> Inventory<'a> {
    pub fn new(monitor: &'a dyn Monitor) -> Self {
        Self { monitor }
    }

    pub fn count(&self) -> Result<u32, InventoryError> {
        self.monitor
            .device_count()
            .map_err(InventoryError::Unavailable)
    }

    /// All physical devices, ordered by index.
    pub fn list(&self) -> Result<Vec<PhysicalDevice>, InventoryError> {
        let count = self.count()?;
        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = self
                .monitor
                .device(index)
                .map_err(InventoryError::Unavailable)?;
            tracing::debug!(
                index,
                device = %device.id,
                memory_mib = device.memory_mib,
                "Found physical device"
            );
            devices.push(device);
        }
        Ok(devices)
    }
}
