// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities for plugin integration tests
//!
//! Provides a fake kubelet: a `Registration` gRPC server on `kubelet.sock`
//! inside a temporary device plugin directory, recording every request.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status};

use vgpu_device_plugin::config::{HealthConfig, PluginConfig};
use vgpu_device_plugin::server::connect_unix;
use vgpu_device_plugin::server::proto::{
    device_plugin_client::DevicePluginClient,
    registration_server::{Registration, RegistrationServer},
    Empty, RegisterRequest,
};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("vgpu_device_plugin=debug")
            .with_test_writer()
            .try_init();
    });
}

#[derive(Clone, Default)]
struct RecordingRegistration {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for RecordingRegistration {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        self.requests.lock().push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

/// A kubelet registration endpoint living in a temporary directory.
pub struct FakeKubelet {
    dir: TempDir,
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
    server: Option<(CancellationToken, JoinHandle<()>)>,
}

impl FakeKubelet {
    pub async fn start() -> Self {
        init_tracing();
        let mut kubelet = Self {
            dir: tempfile::tempdir().expect("temp dir"),
            requests: Arc::new(Mutex::new(Vec::new())),
            server: None,
        };
        kubelet.bind();
        kubelet
    }

    /// Directory only, no kubelet listening.
    pub fn absent() -> Self {
        init_tracing();
        Self {
            dir: tempfile::tempdir().expect("temp dir"),
            requests: Arc::new(Mutex::new(Vec::new())),
            server: None,
        }
    }

    fn bind(&mut self) {
        let socket = self.socket_path();
        let listener = UnixListener::bind(&socket).expect("bind kubelet socket");
        let service = RecordingRegistration {
            requests: self.requests.clone(),
        };
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let handle = tokio::spawn(async move {
            let _ = Server::builder()
                .add_service(RegistrationServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    shutdown.cancelled().await
                })
                .await;
        });
        self.server = Some((cancel, handle));
    }

    /// Simulate a kubelet restart: the socket disappears and is created again.
    pub async fn restart(&mut self) {
        self.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.bind();
    }

    pub async fn shutdown(&mut self) {
        if let Some((cancel, handle)) = self.server.take() {
            cancel.cancel();
            let _ = handle.await;
        }
        let _ = std::fs::remove_file(self.socket_path());
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir.path().join("kubelet.sock")
    }

    pub fn plugin_socket_path(&self) -> PathBuf {
        self.dir.path().join("vgpu.sock")
    }

    pub fn requests(&self) -> Vec<RegisterRequest> {
        self.requests.lock().clone()
    }

    /// Wait until at least `count` registrations arrived.
    pub async fn wait_for_registrations(&self, count: usize) -> Vec<RegisterRequest> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let requests = self.requests();
            if requests.len() >= count {
                return requests;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {count} registrations, got {}",
                requests.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Plugin configuration pointing at this directory, health checking on
    /// with a short poll timeout.
    pub fn config(&self) -> PluginConfig {
        PluginConfig {
            device_plugin_path: self.dir.path().to_path_buf(),
            register_timeout_ms: 2000,
            health: HealthConfig {
                enabled: true,
                poll_timeout_ms: 10,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Dial the plugin the way the kubelet does after registration.
    pub async fn plugin_client(&self) -> DevicePluginClient<Channel> {
        let channel = connect_unix(&self.plugin_socket_path(), Duration::from_secs(2))
            .await
            .expect("connect to plugin socket");
        DevicePluginClient::new(channel)
    }
}

/// Health per device id from one `ListAndWatch` response.
pub fn health_by_id(
    response: &vgpu_device_plugin::server::proto::ListAndWatchResponse,
) -> Vec<(String, String)> {
    response
        .devices
        .iter()
        .map(|d| (d.id.clone(), d.health.clone()))
        .collect()
}
