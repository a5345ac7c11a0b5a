// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use figment::providers::{Format, Toml};

use vgpu_device_plugin::config::{PluginConfig, PolicyKind};
use vgpu_device_plugin::{logging, PluginError};

#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    MemoryUnit,
    FixedCount,
}

impl From<Policy> for PolicyKind {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::MemoryUnit => PolicyKind::MemoryUnit,
            Policy::FixedCount => PolicyKind::FixedCount,
        }
    }
}

/// Kubernetes device plugin advertising shareable virtual GPUs.
///
/// Flags override the configuration file and `VGPU_*` environment variables.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Additional TOML configuration file
    #[arg(long, env = "VGPU_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// GPU memory per virtual GPU, in MiB
    #[arg(long)]
    memory_per_virtual_gpu: Option<u64>,

    /// Virtual GPUs per physical GPU for the fixed-count policy
    #[arg(long)]
    virtual_gpus_per_device: Option<u32>,

    /// How physical GPUs are split into virtual GPUs
    #[arg(long, value_enum)]
    policy: Option<Policy>,

    /// Enable MPS environment in allocated containers
    #[arg(long)]
    mps: bool,

    /// Enable health checking of the physical GPUs
    #[arg(long)]
    health_check: bool,

    /// Directory holding the kubelet and plugin sockets
    #[arg(long)]
    device_plugin_path: Option<PathBuf>,

    /// Extended resource name advertised to the kubelet
    #[arg(long)]
    resource_name: Option<String>,
}

impl Args {
    fn load_config(&self) -> Result<PluginConfig, PluginError> {
        let mut figment = PluginConfig::figment();
        if let Some(path) = &self.config {
            figment = figment.merge(Toml::file(path));
        }
        if let Some(unit) = self.memory_per_virtual_gpu {
            figment = figment.merge(("partition.memory_unit_mib", unit));
        }
        if let Some(count) = self.virtual_gpus_per_device {
            figment = figment.merge(("partition.virtual_devices_per_gpu", count));
        }
        if let Some(policy) = self.policy {
            figment = figment.merge(("partition.policy", PolicyKind::from(policy)));
        }
        if self.mps {
            figment = figment.merge(("mps.enabled", true));
        }
        if self.health_check {
            figment = figment.merge(("health.enabled", true));
        }
        if let Some(path) = &self.device_plugin_path {
            figment = figment.merge(("device_plugin_path", path));
        }
        if let Some(name) = &self.resource_name {
            figment = figment.merge(("resource_name", name));
        }
        Ok(PluginConfig::extract_from(figment)?)
    }
}

fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start the tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(app(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", anyhow::Error::new(e));
            ExitCode::FAILURE
        }
    }
}

async fn app(args: Args) -> Result<(), PluginError> {
    let config = args.load_config()?;
    tracing::debug!(?config, "Loaded configuration");

    let Some(monitor) = init_monitor() else {
        return vgpu_device_plugin::plugin::idle_until_terminated().await;
    };

    let result = vgpu_device_plugin::run(config, monitor.clone()).await;
    shutdown_monitor(monitor);

    match result {
        Err(e) if e.is_idle_wait() => {
            tracing::error!("{e}");
            vgpu_device_plugin::plugin::idle_until_terminated().await
        }
        other => other,
    }
}

#[cfg(all(feature = "nvml", target_os = "linux"))]
type Session = vgpu_device_plugin::monitor::NvmlMonitor;

#[cfg(all(feature = "nvml", target_os = "linux"))]
fn init_monitor() -> Option<Arc<Session>> {
    tracing::info!("Loading NVML");
    match Session::init() {
        Ok(monitor) => Some(Arc::new(monitor)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize NVML");
            tracing::error!("If this is a GPU node, did you set the docker default runtime to `nvidia`?");
            None
        }
    }
}

#[cfg(all(feature = "nvml", target_os = "linux"))]
fn shutdown_monitor(monitor: Arc<Session>) {
    match Arc::try_unwrap(monitor) {
        Ok(session) => {
            if let Err(e) = session.shutdown() {
                tracing::warn!(error = %e, "NVML shutdown failed");
            }
        }
        Err(_) => tracing::warn!("NVML session still in use at exit, skipping shutdown"),
    }
}

#[cfg(not(all(feature = "nvml", target_os = "linux")))]
fn init_monitor() -> Option<Arc<dyn vgpu_device_plugin::Monitor>> {
    tracing::error!("Built without NVML support, no GPUs can be discovered");
    None
}

#[cfg(not(all(feature = "nvml", target_os = "linux")))]
fn shutdown_monitor(_monitor: Arc<dyn vgpu_device_plugin::Monitor>) {}
