// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Critical error watcher.
//!
//! The hardware reports errors per physical device, so the watcher subscribes
//! once per distinct physical identity and fans every event out to all
//! virtual devices carved from that device. One event produces one
//! [`HealthTransition`] covering every affected virtual device.
//!
//! Health only degrades: there is no path back to `Healthy` within one
//! watcher lifetime. Recovery happens by recreating the plugin server.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::device::{Health, VirtualDeviceId};
use crate::monitor::{EventKind, Monitor, MonitorError, UNKNOWN_XID};

/// A batch of virtual devices moving to a new health state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub devices: Vec<VirtualDeviceId>,
    pub health: Health,
    pub reason: String,
}

impl HealthTransition {
    fn unhealthy(devices: Vec<VirtualDeviceId>, reason: impl Into<String>) -> Self {
        Self {
            devices,
            health: Health::Unhealthy,
            reason: reason.into(),
        }
    }
}

pub struct HealthWatcher {
    monitor: Arc<dyn Monitor>,
    devices: Vec<VirtualDeviceId>,
    poll_timeout: Duration,
    ignored_xids: HashSet<u64>,
}

impl HealthWatcher {
    pub fn new(monitor: Arc<dyn Monitor>, devices: Vec<VirtualDeviceId>, config: &HealthConfig) -> Self {
        Self {
            monitor,
            devices,
            poll_timeout: config.poll_timeout(),
            ignored_xids: config
                .ignored_xids
                .iter()
                .copied()
                .filter(|&xid| xid != UNKNOWN_XID)
                .collect(),
        }
    }

    /// Run the watcher on the blocking pool.
    ///
    /// The returned handle resolves once the watcher observed `cancel` and
    /// released its subscription, or failed.
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> (
        JoinHandle<Result<(), MonitorError>>,
        mpsc::UnboundedReceiver<HealthTransition>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::task::spawn_blocking(move || self.run(&cancel, &tx));
        (handle, rx)
    }

    /// Blocking watch loop. Returns `Ok` on cancellation or when the receiver
    /// is gone. A failed wait ends the loop with that error.
    pub fn run(
        &self,
        cancel: &CancellationToken,
        tx: &mpsc::UnboundedSender<HealthTransition>,
    ) -> Result<(), MonitorError> {
        let mut by_physical: BTreeMap<&str, Vec<VirtualDeviceId>> = BTreeMap::new();
        for id in &self.devices {
            by_physical
                .entry(id.physical_id())
                .or_default()
                .push(id.clone());
        }

        let mut subscription = self.monitor.subscribe()?;

        for (physical_id, virtual_ids) in &by_physical {
            match subscription.register_critical_errors(physical_id) {
                Ok(()) => {
                    tracing::debug!(device = %physical_id, "Registered for critical Xid events");
                }
                Err(MonitorError::NotSupported(reason)) => {
                    tracing::warn!(
                        device = %physical_id,
                        %reason,
                        "Device is too old to support health checking, marking it unhealthy"
                    );
                    let transition = HealthTransition::unhealthy(
                        virtual_ids.clone(),
                        format!("health checking not supported on {physical_id}"),
                    );
                    if tx.send(transition).is_err() {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }

        while !cancel.is_cancelled() {
            let event = match subscription.wait(self.poll_timeout) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                // The subscription is released on return.
                Err(e) => return Err(e),
            };

            if event.kind != EventKind::CriticalXid {
                continue;
            }

            // Application errors, the GPU should still be healthy
            if self.ignored_xids.contains(&event.code) {
                tracing::debug!(xid = event.code, device = ?event.device, "Ignoring application Xid");
                continue;
            }

            let transition = match event.device.as_deref() {
                None => {
                    tracing::warn!(xid = event.code, "XidCriticalError on all devices, marking every device unhealthy");
                    HealthTransition::unhealthy(
                        self.devices.clone(),
                        format!("Xid {} on all devices", event.code),
                    )
                }
                Some(physical_id) => match by_physical.get(physical_id) {
                    Some(virtual_ids) => {
                        tracing::warn!(
                            xid = event.code,
                            device = %physical_id,
                            virtual_devices = virtual_ids.len(),
                            "XidCriticalError, the device will go unhealthy"
                        );
                        HealthTransition::unhealthy(
                            virtual_ids.clone(),
                            format!("Xid {} on {physical_id}", event.code),
                        )
                    }
                    None => {
                        tracing::debug!(xid = event.code, device = %physical_id, "Event for untracked device");
                        continue;
                    }
                },
            };

            if tx.send(transition).is_err() {
                break;
            }
        }

        // Dropping the subscription releases every registration.
        drop(subscription);
        tracing::debug!("Health watcher stopped");
        Ok(())
    }
}
