// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Server lifecycle supervisor.
//!
//! The supervisor is the single control path deciding which plugin server is
//! current. Watchers only send [`SupervisorEvent`]s over a channel; the
//! supervisor reacts to them one at a time:
//!
//! ```text
//! Idle -> Starting -> Running -> Restarting -> Starting -> ...
//!           |
//!           +-> Idle (serve failed, retried on the next trigger)
//! any -> Stopping -> Stopped
//! ```
//!
//! A replacement server is only created after the previous one has been fully
//! stopped, so at most one server is ever registered.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ServerError;
use crate::server::PluginServer;

mod watchers;

pub use watchers::{spawn_signal_watcher, wait_for_termination, watch_socket_dir};

#[derive(Debug)]
pub enum SupervisorEvent {
    /// The kubelet (re)created its registration socket.
    SocketCreated(PathBuf),
    /// The filesystem watcher reported an error. Logged only.
    WatchError(String),
    /// Reload signal.
    Reload,
    /// Termination signal, carrying its name.
    Terminate(String),
    /// A serving instance failed beyond recovery. Faults from an instance
    /// that is no longer current are ignored.
    Fault { instance: u64, error: anyhow::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Restarting => "restarting",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A server instance whose lifecycle the supervisor drives.
#[async_trait]
pub trait ManagedServer: Send {
    /// Identity matched against [`SupervisorEvent::Fault`].
    fn id(&self) -> u64;

    async fn serve(&mut self) -> Result<(), ServerError>;

    /// Must be idempotent and must not return before the instance released
    /// everything it holds.
    async fn stop(&mut self);
}

#[async_trait]
impl ManagedServer for PluginServer {
    fn id(&self) -> u64 {
        PluginServer::id(self)
    }

    async fn serve(&mut self) -> Result<(), ServerError> {
        PluginServer::serve(self).await
    }

    async fn stop(&mut self) {
        PluginServer::stop(self).await
    }
}

/// Builds a fresh server instance on every (re)start.
pub trait ServerFactory: Send {
    type Server: ManagedServer;

    /// An error here is fatal to the supervisor.
    fn create(&mut self) -> anyhow::Result<Self::Server>;
}

pub struct Supervisor<F: ServerFactory> {
    factory: F,
    current: Option<F::Server>,
    state: SupervisorState,
    restart_pending: bool,
}

impl<F: ServerFactory> Supervisor<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            current: None,
            state: SupervisorState::Idle,
            restart_pending: true,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Run the reconciliation loop until a termination event, a fault, or
    /// every event sender is gone. The current server is stopped before
    /// returning in every case.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
    ) -> anyhow::Result<()> {
        loop {
            if self.restart_pending {
                if let Err(e) = self.restart().await {
                    self.shutdown().await;
                    return Err(e);
                }
            }

            let Some(event) = events.recv().await else {
                tracing::info!("Event channel closed, shutting down");
                self.shutdown().await;
                return Ok(());
            };

            match event {
                SupervisorEvent::SocketCreated(path) => {
                    tracing::info!(socket = %path.display(), "Kubelet socket created, restarting");
                    self.restart_pending = true;
                }
                SupervisorEvent::WatchError(e) => {
                    tracing::warn!(error = %e, "Filesystem watcher error");
                }
                SupervisorEvent::Reload => {
                    tracing::info!("Received SIGHUP, restarting");
                    self.restart_pending = true;
                }
                SupervisorEvent::Terminate(signal) => {
                    tracing::info!(%signal, "Received termination signal, shutting down");
                    self.shutdown().await;
                    return Ok(());
                }
                SupervisorEvent::Fault { instance, error } => {
                    if self.current.as_ref().map(|s| s.id()) != Some(instance) {
                        tracing::debug!(instance, "Ignoring fault from a stopped server: {error:#}");
                        continue;
                    }
                    tracing::error!(instance, "Plugin server failed: {error:#}");
                    self.shutdown().await;
                    return Err(error);
                }
            }
        }
    }

    async fn restart(&mut self) -> anyhow::Result<()> {
        if let Some(mut old) = self.current.take() {
            self.set_state(SupervisorState::Restarting);
            old.stop().await;
        }

        self.set_state(SupervisorState::Starting);
        let mut server = self.factory.create()?;

        match server.serve().await {
            Ok(()) => {
                self.current = Some(server);
                self.restart_pending = false;
                self.set_state(SupervisorState::Running);
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not start device plugin, retrying on the next kubelet restart or SIGHUP");
                if matches!(e, ServerError::RegistrationFailed { .. }) {
                    tracing::error!(
                        "Could not contact the kubelet. Did you enable the device plugin feature gate?"
                    );
                }
                server.stop().await;
                self.set_state(SupervisorState::Idle);
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.set_state(SupervisorState::Stopping);
        if let Some(mut server) = self.current.take() {
            server.stop().await;
        }
        self.set_state(SupervisorState::Stopped);
    }

    fn set_state(&mut self, state: SupervisorState) {
        tracing::debug!(from = %self.state, to = %state, "Supervisor state");
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<String>>,
        live: AtomicUsize,
        max_live: AtomicUsize,
    }

    impl Journal {
        fn log(&self, entry: String) {
            self.entries.lock().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.entries.lock().clone()
        }
    }

    struct FakeServer {
        id: usize,
        fail: bool,
        serving: bool,
        journal: Arc<Journal>,
    }

    #[async_trait]
    impl ManagedServer for FakeServer {
        fn id(&self) -> u64 {
            self.id as u64
        }

        async fn serve(&mut self) -> Result<(), ServerError> {
            if self.fail {
                self.journal.log(format!("serve-failed {}", self.id));
                return Err(ServerError::RegistrationFailed {
                    socket: PathBuf::from("/tmp/kubelet.sock"),
                    reason: "unavailable".into(),
                });
            }
            let live = self.journal.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.journal.max_live.fetch_max(live, Ordering::SeqCst);
            self.serving = true;
            self.journal.log(format!("serve {}", self.id));
            Ok(())
        }

        async fn stop(&mut self) {
            if self.serving {
                self.serving = false;
                self.journal.live.fetch_sub(1, Ordering::SeqCst);
                self.journal.log(format!("stop {}", self.id));
            }
        }
    }

    struct FakeFactory {
        created: usize,
        failures: Vec<bool>,
        journal: Arc<Journal>,
    }

    impl FakeFactory {
        fn new(failures: Vec<bool>) -> (Self, Arc<Journal>) {
            let journal = Arc::new(Journal::default());
            (
                Self {
                    created: 0,
                    failures,
                    journal: journal.clone(),
                },
                journal,
            )
        }
    }

    impl ServerFactory for FakeFactory {
        type Server = FakeServer;

        fn create(&mut self) -> anyhow::Result<FakeServer> {
            let id = self.created;
            self.created += 1;
            Ok(FakeServer {
                id,
                fail: self.failures.get(id).copied().unwrap_or(false),
                serving: false,
                journal: self.journal.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_restart_stops_before_creating() {
        let (factory, journal) = FakeFactory::new(vec![]);
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(SupervisorEvent::SocketCreated("/dp/kubelet.sock".into()))
            .unwrap();
        tx.send(SupervisorEvent::Reload).unwrap();
        tx.send(SupervisorEvent::Terminate("SIGTERM".into())).unwrap();

        Supervisor::new(factory).run(rx).await.unwrap();

        assert_eq!(
            journal.entries(),
            vec!["serve 0", "stop 0", "serve 1", "stop 1", "serve 2", "stop 2"]
        );
        assert_eq!(journal.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(journal.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_serve_retries_on_next_event_only() {
        let (factory, journal) = FakeFactory::new(vec![true, false]);
        let (tx, rx) = mpsc::unbounded_channel();

        // A watch error is not a trigger but the loop still re-checks the
        // pending restart after every event.
        tx.send(SupervisorEvent::WatchError("overflow".into()))
            .unwrap();
        tx.send(SupervisorEvent::Terminate("SIGINT".into())).unwrap();

        Supervisor::new(factory).run(rx).await.unwrap();
        assert_eq!(journal.entries(), vec!["serve-failed 0", "serve 1", "stop 1"]);
    }

    #[tokio::test]
    async fn test_fault_stops_and_returns_error() {
        let (factory, journal) = FakeFactory::new(vec![]);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(SupervisorEvent::Fault {
            instance: 0,
            error: anyhow::anyhow!("nvml gone"),
        })
        .unwrap();

        let err = Supervisor::new(factory).run(rx).await.unwrap_err();
        assert!(err.to_string().contains("nvml gone"));
        assert_eq!(journal.entries(), vec!["serve 0", "stop 0"]);
    }

    #[tokio::test]
    async fn test_fault_from_replaced_server_is_ignored() {
        let (factory, journal) = FakeFactory::new(vec![]);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(SupervisorEvent::Reload).unwrap();
        // Queued by server 0 before the reload replaced it.
        tx.send(SupervisorEvent::Fault {
            instance: 0,
            error: anyhow::anyhow!("stale"),
        })
        .unwrap();
        tx.send(SupervisorEvent::Terminate("SIGTERM".into())).unwrap();

        Supervisor::new(factory).run(rx).await.unwrap();
        assert_eq!(
            journal.entries(),
            vec!["serve 0", "stop 0", "serve 1", "stop 1"]
        );
    }

    #[tokio::test]
    async fn test_closed_channel_shuts_down() {
        let (factory, journal) = FakeFactory::new(vec![]);
        let (tx, rx) = mpsc::unbounded_channel::<SupervisorEvent>();
        drop(tx);

        Supervisor::new(factory).run(rx).await.unwrap();
        assert_eq!(journal.entries(), vec!["serve 0", "stop 0"]);
    }

    struct BrokenFactory;

    impl ServerFactory for BrokenFactory {
        type Server = FakeServer;

        fn create(&mut self) -> anyhow::Result<FakeServer> {
            anyhow::bail!("inventory changed")
        }
    }

    #[tokio::test]
    async fn test_factory_error_is_fatal() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let err = Supervisor::new(BrokenFactory).run(rx).await.unwrap_err();
        assert!(err.to_string().contains("inventory changed"));
    }
}
