// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the device plugin.
//!
//! Each layer has its own error enum. The process level [`PluginError`]
//! decides how the binary exits:
//!
//! - [`InventoryError::Unavailable`] at startup: idle until terminated.
//! - [`PartitionError`] / [`ConfigError`]: exit non-zero before any server starts.
//! - [`ServerError::RegistrationFailed`]: recoverable, the supervisor retries on
//!   the next external trigger.
//! - [`PluginError::Fatal`]: an unexpected monitoring failure, exit non-zero.

use std::path::PathBuf;

use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::monitor::MonitorError;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("device inventory unavailable: {0}")]
    Unavailable(#[source] MonitorError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error(
        "device {device} has total memory {memory_mib} MiB which can not be divided by memory unit {memory_unit_mib} MiB"
    )]
    InvalidMemoryUnit {
        device: String,
        memory_mib: u64,
        memory_unit_mib: u64,
    },

    #[error("{requested} virtual devices per GPU exceeds the platform ceiling of {max}")]
    TooManyVirtualDevices { requested: u32, max: u32 },

    #[error("partitioning policy yields zero virtual devices per GPU")]
    ZeroVirtualDevices,

    #[error("no physical devices to partition")]
    NoDevices,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind plugin socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registration with kubelet at {socket} failed: {reason}")]
    RegistrationFailed { socket: PathBuf, reason: String },

    #[error("invalid server state transition: {0}")]
    InvalidState(&'static str),

    #[error("plugin endpoint did not come up: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Per-request allocation failure. Rejects one request, never the server.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocateError {
    #[error("unknown virtual device: {0}")]
    UnknownVirtualDevice(String),
}

impl From<AllocateError> for tonic::Status {
    fn from(err: AllocateError) -> Self {
        match err {
            AllocateError::UnknownVirtualDevice(_) => tonic::Status::not_found(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("failed to start watcher: {0}")]
    Watch(#[source] anyhow::Error),

    #[error("fatal: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl PluginError {
    /// The process waits instead of exiting for this error.
    pub fn is_idle_wait(&self) -> bool {
        matches!(self, PluginError::Inventory(InventoryError::Unavailable(_)))
    }
}
