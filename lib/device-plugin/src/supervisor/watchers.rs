// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Event sources feeding the supervisor.

use std::ffi::OsString;
use std::path::Path;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::SupervisorEvent;

/// Watch `dir` for the creation of `socket_name`.
///
/// Events stop when the returned watcher is dropped.
pub fn watch_socket_dir(
    dir: &Path,
    socket_name: &str,
    tx: mpsc::UnboundedSender<SupervisorEvent>,
) -> notify::Result<RecommendedWatcher> {
    let target = dir.join(socket_name);
    let name = OsString::from(socket_name);

    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        let event = match res {
            Ok(event) => {
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(name.as_os_str()));
                if !(ours && event.kind.is_create()) {
                    return;
                }
                SupervisorEvent::SocketCreated(target.clone())
            }
            Err(e) => SupervisorEvent::WatchError(e.to_string()),
        };
        let _ = tx.send(event);
    })?;

    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    tracing::debug!(dir = %dir.display(), socket = socket_name, "Watching for kubelet socket");
    Ok(watcher)
}

/// Forward SIGHUP as a reload and SIGINT, SIGTERM and SIGQUIT as a
/// termination. The task ends after the first termination or on `cancel`.
pub fn spawn_signal_watcher(
    tx: mpsc::UnboundedSender<SupervisorEvent>,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                Some(()) = hangup.recv() => SupervisorEvent::Reload,
                Some(()) = interrupt.recv() => SupervisorEvent::Terminate("SIGINT".into()),
                Some(()) = terminate.recv() => SupervisorEvent::Terminate("SIGTERM".into()),
                Some(()) = quit.recv() => SupervisorEvent::Terminate("SIGQUIT".into()),
            };

            let last = matches!(event, SupervisorEvent::Terminate(_));
            if tx.send(event).is_err() || last {
                return;
            }
        }
    }))
}

/// Block until a termination signal arrives and return its name.
pub async fn wait_for_termination() -> std::io::Result<&'static str> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}
