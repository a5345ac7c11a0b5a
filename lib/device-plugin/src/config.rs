// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device plugin configuration.
//!
//! Configuration sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at `/etc/vgpu-device-plugin/config.toml`
//! 3. TOML file from the `VGPU_CONFIG_PATH` environment variable
//! 4. Environment variables prefixed with `VGPU_`, sections split by `__`
//!    (e.g. `VGPU_PARTITION__MEMORY_UNIT_MIB=4096`)
//! 5. Programmatic overrides merged by the caller (command line flags)
//!
//! Example:
//! ```toml
//! resource_name = "k8s.amazonaws.com/vgpu"
//!
//! [partition]
//! policy = "memory-unit"
//! memory_unit_mib = 4096
//!
//! [health]
//! enabled = true
//! ignored_xids = [31, 43, 45]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// Maximum number of concurrent hardware contexts a single GPU supports.
/// Bounds the fixed-count partitioning policy.
pub const MAX_CONTEXTS_PER_DEVICE: u32 = 48;

/// Xid codes caused by the application rather than the hardware.
/// See <https://docs.nvidia.com/deploy/xid-errors/index.html>.
pub const DEFAULT_IGNORED_XIDS: [u64; 3] = [31, 43, 45];

pub const DEFAULT_DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";
pub const DEFAULT_KUBELET_SOCKET: &str = "kubelet.sock";

const SYSTEM_CONFIG_PATH: &str = "/etc/vgpu-device-plugin/config.toml";
const CONFIG_PATH_ENV: &str = "VGPU_CONFIG_PATH";
const ENV_PREFIX: &str = "VGPU_";

/// Environment variables sharing the prefix that are not configuration keys.
const NON_CONFIG_ENV: [&str; 6] = [
    "config_path",
    "log",
    "logging_config_path",
    "logging_jsonl",
    "log_use_local_tz",
    "disable_ansi_logging",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// How a physical device's capacity is split into virtual devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPolicy {
    /// Every physical device yields exactly this many virtual devices.
    FixedCount(u32),
    /// Every physical device yields `memory / unit` virtual devices, unit in MiB.
    MemoryUnit(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    FixedCount,
    MemoryUnit,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PartitionConfig {
    pub policy: PolicyKind,

    /// GPU memory per virtual device, in MiB.
    #[validate(range(min = 1))]
    pub memory_unit_mib: u64,

    /// Virtual devices per physical GPU for the fixed-count policy.
    /// The platform ceiling is checked by the partitioner.
    #[validate(range(min = 1))]
    pub virtual_devices_per_gpu: u32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::MemoryUnit,
            memory_unit_mib: 1024,
            virtual_devices_per_gpu: 8,
        }
    }
}

impl PartitionConfig {
    pub fn policy(&self) -> PartitionPolicy {
        match self.policy {
            PolicyKind::FixedCount => PartitionPolicy::FixedCount(self.virtual_devices_per_gpu),
            PolicyKind::MemoryUnit => PartitionPolicy::MemoryUnit(self.memory_unit_mib),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,

    /// Upper bound on one blocking event wait; cancellation is observed between waits.
    #[validate(range(min = 1, max = 60000))]
    pub poll_timeout_ms: u64,

    pub ignored_xids: Vec<u64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_timeout_ms: 5000,
            ignored_xids: DEFAULT_IGNORED_XIDS.to_vec(),
        }
    }
}

impl HealthConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MpsConfig {
    pub enabled: bool,
    pub pipe_directory: PathBuf,
}

impl Default for MpsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pipe_directory: PathBuf::from("/tmp/nvidia-mps"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PluginConfig {
    /// Directory in which the kubelet and all plugins create their sockets.
    pub device_plugin_path: PathBuf,

    /// File name of the kubelet registration socket inside `device_plugin_path`.
    #[validate(length(min = 1))]
    pub kubelet_socket: String,

    /// File name of this plugin's socket inside `device_plugin_path`.
    #[validate(length(min = 1))]
    pub plugin_socket: String,

    #[validate(length(min = 1))]
    pub resource_name: String,

    #[validate(range(min = 100, max = 60000))]
    pub register_timeout_ms: u64,

    #[validate(nested)]
    pub partition: PartitionConfig,

    #[validate(nested)]
    pub health: HealthConfig,

    #[validate(nested)]
    pub mps: MpsConfig,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            device_plugin_path: PathBuf::from(DEFAULT_DEVICE_PLUGIN_PATH),
            kubelet_socket: DEFAULT_KUBELET_SOCKET.to_string(),
            plugin_socket: "vgpu.sock".to_string(),
            resource_name: "k8s.amazonaws.com/vgpu".to_string(),
            register_timeout_ms: 5000,
            partition: PartitionConfig::default(),
            health: HealthConfig::default(),
            mps: MpsConfig::default(),
        }
    }
}

impl PluginConfig {
    /// Create a Figment with defaults, config files and environment merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(PluginConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&NON_CONFIG_ENV).split("__"))
    }

    /// Load configuration from the default figment (files and env).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn plugin_socket_path(&self) -> PathBuf {
        self.device_plugin_path.join(&self.plugin_socket)
    }

    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.device_plugin_path.join(&self.kubelet_socket)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }
}

fn env_is_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "on" | "yes"))
        .unwrap_or(false)
}

/// `VGPU_LOGGING_JSONL=1` switches log output to JSON lines.
pub fn jsonl_logging_enabled() -> bool {
    env_is_truthy("VGPU_LOGGING_JSONL")
}

pub fn disable_ansi_logging() -> bool {
    env_is_truthy("VGPU_DISABLE_ANSI_LOGGING")
}

pub fn use_local_timezone() -> bool {
    env_is_truthy("VGPU_LOG_USE_LOCAL_TZ")
}
