// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process level wiring: inventory, partitioning, watchers and the supervisor.

use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::PluginConfig;
use crate::error::PluginError;
use crate::inventory::Inventory;
use crate::monitor::Monitor;
use crate::partition;
use crate::server::{FaultHandler, PluginServer};
use crate::supervisor::{
    spawn_signal_watcher, wait_for_termination, watch_socket_dir, ServerFactory, Supervisor,
    SupervisorEvent,
};

/// Creates a [`PluginServer`] over a freshly queried and partitioned
/// inventory every time the supervisor (re)starts.
pub struct VgpuServerFactory {
    config: Arc<PluginConfig>,
    monitor: Arc<dyn Monitor>,
    on_fault: FaultHandler,
}

impl VgpuServerFactory {
    pub fn new(config: Arc<PluginConfig>, monitor: Arc<dyn Monitor>, on_fault: FaultHandler) -> Self {
        Self {
            config,
            monitor,
            on_fault,
        }
    }
}

impl ServerFactory for VgpuServerFactory {
    type Server = PluginServer;

    fn create(&mut self) -> anyhow::Result<PluginServer> {
        let physical = Inventory::new(self.monitor.as_ref()).list()?;
        let devices = partition::partition(&physical, &self.config.partition.policy())?;
        tracing::debug!(
            physical = physical.len(),
            virtual_devices = devices.len(),
            "Partitioned devices"
        );
        Ok(
            PluginServer::new(self.config.clone(), self.monitor.clone(), devices)
                .with_fault_handler(self.on_fault.clone()),
        )
    }
}

/// Run the device plugin until a termination signal.
pub async fn run(config: PluginConfig, monitor: Arc<dyn Monitor>) -> Result<(), PluginError> {
    run_until(config, monitor, CancellationToken::new()).await
}

/// Run the device plugin until a termination signal or until `shutdown` is
/// cancelled. Both end the process the same way.
pub async fn run_until(
    config: PluginConfig,
    monitor: Arc<dyn Monitor>,
    shutdown: CancellationToken,
) -> Result<(), PluginError> {
    let config = Arc::new(config);

    let physical = Inventory::new(monitor.as_ref()).list()?;
    if physical.is_empty() {
        tracing::warn!("No GPUs found on this node, waiting for a termination signal");
        return idle(shutdown).await;
    }

    let policy = config.partition.policy();
    partition::validate(&policy, &physical)?;
    tracing::info!(
        gpus = physical.len(),
        ?policy,
        virtual_devices_per_gpu = partition::slots_for(&policy, &physical[0]),
        resource = %config.resource_name,
        "Starting vGPU device plugin"
    );

    let (tx, rx) = mpsc::unbounded_channel();

    let _fs_watcher = watch_socket_dir(&config.device_plugin_path, &config.kubelet_socket, tx.clone())
        .with_context(|| {
            format!(
                "failed to watch {}",
                config.device_plugin_path.display()
            )
        })
        .map_err(PluginError::Watch)?;

    let watchers = CancellationToken::new();
    let signals = spawn_signal_watcher(tx.clone(), watchers.clone())
        .context("failed to install signal handlers")
        .map_err(PluginError::Watch)?;

    let shutdown_tx = tx.clone();
    let shutdown_watch = watchers.clone();
    let shutdown_task = tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = shutdown_tx.send(SupervisorEvent::Terminate("shutdown requested".into()));
            }
            _ = shutdown_watch.cancelled() => {}
        }
    });

    let on_fault: FaultHandler = Arc::new(move |instance, error| {
        let _ = tx.send(SupervisorEvent::Fault { instance, error });
    });
    let factory = VgpuServerFactory::new(config, monitor, on_fault);

    let result = Supervisor::new(factory).run(rx).await;

    watchers.cancel();
    if let Err(e) = signals.await {
        tracing::warn!(error = %e, "Signal watcher task failed");
    }
    if let Err(e) = shutdown_task.await {
        tracing::warn!(error = %e, "Shutdown relay task failed");
    }

    result.map_err(PluginError::Fatal)
}

async fn idle(shutdown: CancellationToken) -> Result<(), PluginError> {
    tokio::select! {
        signal = wait_for_termination() => {
            let signal = signal
                .context("failed to install signal handlers")
                .map_err(PluginError::Watch)?;
            tracing::info!(signal, "Received termination signal, exiting");
        }
        _ = shutdown.cancelled() => {
            tracing::info!("Shutdown requested, exiting");
        }
    }
    Ok(())
}

/// Block until terminated. Used when the monitoring capability is not
/// available at all, so the process stays a stable unit for the kubelet.
pub async fn idle_until_terminated() -> Result<(), PluginError> {
    idle(CancellationToken::new()).await
}
