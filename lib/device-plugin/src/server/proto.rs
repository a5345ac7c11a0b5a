// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Generated kubelet device plugin API (`v1beta1`).

#![allow(clippy::all)]

tonic::include_proto!("v1beta1");

pub const API_VERSION: &str = "v1beta1";

impl From<&crate::device::VirtualDevice> for Device {
    fn from(device: &crate::device::VirtualDevice) -> Self {
        Device {
            id: device.id.to_string(),
            health: device.health.as_str().to_string(),
            topology: None,
        }
    }
}
