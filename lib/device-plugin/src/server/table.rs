// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Virtual device health table owned by one plugin server.
//!
//! Every subscriber receives the full device list at subscription time and
//! then exactly one full snapshot per applied [`HealthTransition`], in apply
//! order. Snapshots are queued per subscriber and never coalesced.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::device::{Health, VirtualDevice, VirtualDeviceId};
use crate::error::AllocateError;
use crate::health::HealthTransition;

pub type Snapshot = Vec<VirtualDevice>;

pub struct DeviceTable {
    inner: Mutex<TableInner>,
}

struct TableInner {
    devices: Vec<VirtualDevice>,
    /// Rendered id -> position in `devices`
    index: HashMap<String, usize>,
    subscribers: Vec<mpsc::UnboundedSender<Snapshot>>,
    closed: bool,
}

impl DeviceTable {
    pub fn new(devices: Vec<VirtualDevice>) -> Self {
        let index = devices
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.to_string(), i))
            .collect();
        Self {
            inner: Mutex::new(TableInner {
                devices,
                index,
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().devices.clone()
    }

    /// Subscribe to snapshots. The first item is the current list.
    /// The stream ends when the table is closed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Snapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if !inner.closed && tx.send(inner.devices.clone()).is_ok() {
            inner.subscribers.push(tx);
        }
        rx
    }

    /// Apply one transition and publish one snapshot. Unhealthy devices never
    /// return to healthy. Returns the number of devices whose health changed.
    pub fn apply(&self, transition: &HealthTransition) -> usize {
        let mut inner = self.inner.lock();
        if inner.closed {
            return 0;
        }

        let mut changed = 0;
        for id in &transition.devices {
            let Some(&pos) = inner.index.get(&id.to_string()) else {
                continue;
            };
            let device = &mut inner.devices[pos];
            if device.health == Health::Unhealthy || device.health == transition.health {
                continue;
            }
            device.health = transition.health;
            changed += 1;
        }

        let snapshot = inner.devices.clone();
        inner
            .subscribers
            .retain(|tx| tx.send(snapshot.clone()).is_ok());
        changed
    }

    /// Resolve a rendered id from the kubelet to an advertised virtual device.
    pub fn resolve(&self, id: &str) -> Result<VirtualDeviceId, AllocateError> {
        let inner = self.inner.lock();
        inner
            .index
            .get(id)
            .map(|&pos| inner.devices[pos].id.clone())
            .ok_or_else(|| AllocateError::UnknownVirtualDevice(id.to_string()))
    }

    /// Number of advertised virtual devices carved from `physical_id`.
    pub fn slots_on(&self, physical_id: &str) -> usize {
        self.inner
            .lock()
            .devices
            .iter()
            .filter(|d| d.physical_id() == physical_id)
            .count()
    }

    /// End every subscriber stream. Later subscriptions end immediately.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: u32) -> DeviceTable {
        let mut devices = Vec::new();
        for gpu in ["gpu0", "gpu1"] {
            for slot in 0..n {
                devices.push(VirtualDevice::new(VirtualDeviceId::new(gpu, slot)));
            }
        }
        DeviceTable::new(devices)
    }

    fn unhealthy(ids: &[&str]) -> HealthTransition {
        HealthTransition {
            devices: ids.iter().map(|s| s.parse().unwrap()).collect(),
            health: Health::Unhealthy,
            reason: "test".into(),
        }
    }

    #[test]
    fn test_initial_snapshot_then_one_per_transition() {
        let table = table(2);
        let mut rx = table.subscribe();

        let initial = rx.try_recv().unwrap();
        assert_eq!(initial.len(), 4);
        assert!(initial.iter().all(|d| d.health == Health::Healthy));

        assert_eq!(table.apply(&unhealthy(&["gpu0-0", "gpu0-1"])), 2);
        let second = rx.try_recv().unwrap();
        let bad: Vec<String> = second
            .iter()
            .filter(|d| d.health == Health::Unhealthy)
            .map(|d| d.id.to_string())
            .collect();
        assert_eq!(bad, vec!["gpu0-0", "gpu0-1"]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unhealthy_is_sticky() {
        let table = table(1);
        let mut rx = table.subscribe();
        let _ = rx.try_recv();

        table.apply(&unhealthy(&["gpu1-0"]));
        let healthy_again = HealthTransition {
            devices: vec!["gpu1-0".parse().unwrap()],
            health: Health::Healthy,
            reason: "test".into(),
        };
        assert_eq!(table.apply(&healthy_again), 0);

        // Still one snapshot per transition, even when nothing changed.
        let _ = rx.try_recv().unwrap();
        let last = rx.try_recv().unwrap();
        let dev = last.iter().find(|d| d.id.to_string() == "gpu1-0").unwrap();
        assert_eq!(dev.health, Health::Unhealthy);
    }

    #[test]
    fn test_resolve_unknown() {
        let table = table(1);
        assert_eq!(table.resolve("gpu0-0").unwrap().physical_id(), "gpu0");
        assert_eq!(
            table.resolve("gpu0-7").unwrap_err(),
            AllocateError::UnknownVirtualDevice("gpu0-7".into())
        );
        assert_eq!(table.slots_on("gpu1"), 1);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let table = table(1);
        let mut rx = table.subscribe();
        assert!(rx.recv().await.is_some());
        table.close();
        assert!(rx.recv().await.is_none());

        let mut late = table.subscribe();
        assert!(late.recv().await.is_none());
    }
}
