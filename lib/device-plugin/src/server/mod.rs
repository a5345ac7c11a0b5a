// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Plugin protocol server.
//!
//! A [`PluginServer`] is one registration/stream session against the kubelet:
//!
//! ```text
//! Created -> Registering -> Serving -> Stopping -> Stopped
//!                 |                                  ^
//!                 +---------- (serve failed) --------+
//! ```
//!
//! The server owns its virtual device health table. When health checking is
//! enabled, a [`HealthWatcher`] runs alongside it and every transition it
//! reports is applied to the table, which resends the full list on every open
//! `ListAndWatch` stream.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::config::PluginConfig;
use crate::device::VirtualDevice;
use crate::error::ServerError;
use crate::health::HealthWatcher;
use crate::monitor::Monitor;

mod allocate;
pub mod proto;
mod registration;
mod service;
mod table;

pub use allocate::{
    container_grant, preferred_allocation, MPS_PIPE_DIRECTORY_ENV, MPS_THREAD_PERCENTAGE_ENV,
    VISIBLE_DEVICES_ENV,
};
pub use registration::{connect_unix, register};
pub use table::{DeviceTable, Snapshot};

use proto::{device_plugin_server::DevicePluginServer, RegisterRequest, API_VERSION};
use service::{plugin_options, DevicePluginService};

/// Called with the failing instance's id and the cause when a background
/// task of a serving instance fails in a way the instance can not recover from.
pub type FaultHandler = Arc<dyn Fn(u64, anyhow::Error) + Send + Sync>;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Registering,
    Serving,
    Stopping,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Created => "created",
            ServerState::Registering => "registering",
            ServerState::Serving => "serving",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub struct PluginServer {
    id: u64,
    config: Arc<PluginConfig>,
    monitor: Arc<dyn Monitor>,
    table: Arc<DeviceTable>,
    state: ServerState,
    cancel: CancellationToken,
    grpc: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
    health: Option<JoinHandle<()>>,
    on_fault: Option<FaultHandler>,
}

impl PluginServer {
    pub fn new(
        config: Arc<PluginConfig>,
        monitor: Arc<dyn Monitor>,
        devices: Vec<VirtualDevice>,
    ) -> Self {
        Self {
            id: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            config,
            monitor,
            table: Arc::new(DeviceTable::new(devices)),
            state: ServerState::Created,
            cancel: CancellationToken::new(),
            grpc: None,
            health: None,
            on_fault: None,
        }
    }

    /// Install the handler invoked when the health watcher fails.
    pub fn with_fault_handler(mut self, handler: FaultHandler) -> Self {
        self.on_fault = Some(handler);
        self
    }

    /// Process-unique instance id, carried by every fault this instance raises.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn socket_path(&self) -> PathBuf {
        self.config.plugin_socket_path()
    }

    /// Current device list as advertised.
    pub fn devices(&self) -> Snapshot {
        self.table.snapshot()
    }

    /// Bind the local endpoint, register with the kubelet and start serving.
    ///
    /// Registration is attempted exactly once. On failure the local endpoint
    /// is torn down and the socket file removed before the error is returned,
    /// and the instance moves to `Stopped`.
    pub async fn serve(&mut self) -> Result<(), ServerError> {
        if self.state != ServerState::Created {
            return Err(ServerError::InvalidState("serve called twice"));
        }
        self.state = ServerState::Registering;

        match self.start().await {
            Ok(()) => {
                self.state = ServerState::Serving;
                tracing::info!(
                    socket = %self.socket_path().display(),
                    resource = %self.config.resource_name,
                    devices = self.table.len(),
                    "Registered device plugin with kubelet"
                );
                self.spawn_health_watcher();
                Ok(())
            }
            Err(e) => {
                self.shutdown().await;
                Err(e)
            }
        }
    }

    async fn start(&mut self) -> Result<(), ServerError> {
        let socket = self.socket_path();
        remove_socket(&socket);

        let listener = UnixListener::bind(&socket).map_err(|source| ServerError::Bind {
            path: socket.clone(),
            source,
        })?;
        tracing::debug!(socket = %socket.display(), "Plugin endpoint bound");

        let service = DevicePluginService::new(self.table.clone(), self.config.mps.clone());
        let cancel = self.cancel.clone();
        self.grpc = Some(tokio::spawn(async move {
            Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    cancel.cancelled().await
                })
                .await
        }));

        // The kubelet dials back as soon as it accepts the registration.
        connect_unix(&socket, self.config.register_timeout()).await?;

        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: self.config.plugin_socket.clone(),
            resource_name: self.config.resource_name.clone(),
            options: Some(plugin_options()),
        };
        register(
            &self.config.kubelet_socket_path(),
            request,
            self.config.register_timeout(),
        )
        .await
    }

    fn spawn_health_watcher(&mut self) {
        if !self.config.health.enabled {
            tracing::info!("Health checking disabled, all devices stay healthy");
            return;
        }

        let ids = self.table.snapshot().into_iter().map(|d| d.id).collect();
        let watcher = HealthWatcher::new(self.monitor.clone(), ids, &self.config.health);
        let (handle, mut transitions) = watcher.spawn(self.cancel.clone());

        let table = self.table.clone();
        let on_fault = self.on_fault.clone();
        let instance = self.id;
        self.health = Some(tokio::spawn(async move {
            while let Some(transition) = transitions.recv().await {
                let changed = table.apply(&transition);
                tracing::info!(
                    reason = %transition.reason,
                    health = %transition.health,
                    changed,
                    "Resending device list"
                );
            }

            let fault = match handle.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => anyhow::Error::new(e).context("health watcher failed"),
                Err(e) => anyhow::Error::new(e).context("health watcher panicked"),
            };
            tracing::error!(instance, "Health monitoring stopped: {fault:#}");
            if let Some(on_fault) = on_fault {
                on_fault(instance, fault);
            }
        }));
    }

    /// Stop serving. Returns once the health watcher released its
    /// subscriptions, every stream ended and the socket file is gone.
    /// Calling it again is a no-op.
    pub async fn stop(&mut self) {
        match self.state {
            ServerState::Stopped => return,
            ServerState::Created => {
                self.state = ServerState::Stopped;
                return;
            }
            _ => {}
        }
        self.state = ServerState::Stopping;
        tracing::debug!(socket = %self.socket_path().display(), "Stopping plugin server");
        self.shutdown().await;
        tracing::info!(socket = %self.socket_path().display(), "Plugin server stopped");
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();

        if let Some(health) = self.health.take() {
            if let Err(e) = health.await {
                tracing::warn!(error = %e, "Health relay task failed");
            }
        }

        // Streams end here, which lets the graceful shutdown complete.
        self.table.close();

        if let Some(grpc) = self.grpc.take() {
            match grpc.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "gRPC server exited with error"),
                Err(e) => tracing::warn!(error = %e, "gRPC server task failed"),
            }
        }

        remove_socket(&self.socket_path());
        self.state = ServerState::Stopped;
    }
}

impl Drop for PluginServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.table.close();
    }
}

fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(socket = %path.display(), "Removed socket file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(socket = %path.display(), error = %e, "Failed to remove socket file"),
    }
}
