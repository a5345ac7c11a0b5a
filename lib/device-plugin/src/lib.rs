// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Virtual GPU device plugin.
//!
//! Splits every physical GPU on a node into a fixed number of virtual devices
//! and advertises them to the kubelet through the device plugin API, so that
//! several pods can be scheduled onto one physical GPU.
//!
//! The crate is organized leaves first:
//!
//! - [`monitor`]: the hardware monitoring capability ([`monitor::Monitor`]),
//!   with an NVML backend and an in-memory mock.
//! - [`inventory`]: physical device queries.
//! - [`partition`]: virtual device derivation under a [`config::PartitionPolicy`].
//! - [`health`]: critical error event watcher producing health transitions.
//! - [`server`]: one registration/stream session against the kubelet.
//! - [`supervisor`]: owns the server lifecycle and restarts it on kubelet
//!   socket recreation or `SIGHUP`.
//! - [`plugin`]: wires everything together for the binary.

pub mod config;
pub mod device;
pub mod error;
pub mod health;
pub mod inventory;
pub mod logging;
pub mod monitor;
pub mod partition;
pub mod plugin;
pub mod server;
pub mod supervisor;

pub use config::{PartitionPolicy, PluginConfig};
pub use device::{Health, PhysicalDevice, VirtualDevice, VirtualDeviceId};
pub use error::PluginError;
pub use monitor::Monitor;
pub use plugin::{run, run_until};
pub use tokio_util::sync::CancellationToken;
