// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory [`Monitor`] for tests and local development.
//!
//! Events pushed with [`MockMonitor::push_event`] are delivered to the next
//! subscription that waits, and only if that subscription registered the
//! event's device (global events are always delivered), mirroring NVML.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{EventSubscription, HealthEvent, Monitor, MonitorError};
use crate::device::PhysicalDevice;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Clone, Default)]
pub struct MockMonitor {
    inner: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    devices: Mutex<Vec<PhysicalDevice>>,
    unsupported: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    wait_failure: Mutex<Option<String>>,
    events: Mutex<VecDeque<HealthEvent>>,
    registrations: Mutex<Vec<String>>,
    unavailable: AtomicBool,
    open_subscriptions: AtomicUsize,
}

impl std::fmt::Debug for MockMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockMonitor")
            .field("devices", &self.inner.devices.lock().len())
            .field("open_subscriptions", &self.open_subscriptions())
            .finish()
    }
}

impl MockMonitor {
    pub fn new(devices: Vec<PhysicalDevice>) -> Self {
        let monitor = Self::default();
        *monitor.inner.devices.lock() = devices;
        monitor
    }

    /// `count` devices named `gpu0..gpuN` with the same memory size.
    pub fn uniform(count: u32, memory_mib: u64) -> Self {
        Self::new(
            (0..count)
                .map(|index| PhysicalDevice {
                    id: format!("gpu{index}"),
                    memory_mib,
                    index,
                })
                .collect(),
        )
    }

    pub fn set_devices(&self, devices: Vec<PhysicalDevice>) {
        *self.inner.devices.lock() = devices;
    }

    /// Every call fails with [`MonitorError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Event registration for `id` returns [`MonitorError::NotSupported`].
    pub fn mark_unsupported(&self, id: impl Into<String>) {
        self.inner.unsupported.lock().insert(id.into());
    }

    /// Event registration for `id` fails with [`MonitorError::Other`].
    pub fn fail_registration(&self, id: impl Into<String>) {
        self.inner.failing.lock().insert(id.into());
    }

    /// Every event wait fails with [`MonitorError::Other`] carrying `reason`.
    pub fn fail_waits(&self, reason: impl Into<String>) {
        *self.inner.wait_failure.lock() = Some(reason.into());
    }

    pub fn push_event(&self, event: HealthEvent) {
        self.inner.events.lock().push_back(event);
    }

    pub fn pending_events(&self) -> usize {
        self.inner.events.lock().len()
    }

    pub fn open_subscriptions(&self) -> usize {
        self.inner.open_subscriptions.load(Ordering::SeqCst)
    }

    /// Devices registered across all subscriptions, in registration order.
    pub fn registrations(&self) -> Vec<String> {
        self.inner.registrations.lock().clone()
    }

    fn check_available(&self) -> Result<(), MonitorError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(MonitorError::Unavailable("mock monitor unavailable".into()));
        }
        Ok(())
    }
}

impl Monitor for MockMonitor {
    fn device_count(&self) -> Result<u32, MonitorError> {
        self.check_available()?;
        Ok(self.inner.devices.lock().len() as u32)
    }

    fn device(&self, index: u32) -> Result<PhysicalDevice, MonitorError> {
        self.check_available()?;
        self.inner
            .devices
            .lock()
            .get(index as usize)
            .cloned()
            .ok_or_else(|| MonitorError::Other(format!("no device at index {index}")))
    }

    fn subscribe(&self) -> Result<Box<dyn EventSubscription + '_>, MonitorError> {
        self.check_available()?;
        self.inner.open_subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSubscription {
            state: Arc::clone(&self.inner),
            registered: HashSet::new(),
        }))
    }
}

struct MockSubscription {
    state: Arc<MockState>,
    registered: HashSet<String>,
}

impl EventSubscription for MockSubscription {
    fn register_critical_errors(&mut self, physical_id: &str) -> Result<(), MonitorError> {
        if self.state.unsupported.lock().contains(physical_id) {
            return Err(MonitorError::NotSupported(format!(
                "{physical_id} does not report critical Xid events"
            )));
        }
        if self.state.failing.lock().contains(physical_id) {
            return Err(MonitorError::Other(format!(
                "registration failed for {physical_id}"
            )));
        }
        self.registered.insert(physical_id.to_string());
        self.state.registrations.lock().push(physical_id.to_string());
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<Option<HealthEvent>, MonitorError> {
        if let Some(reason) = self.state.wait_failure.lock().clone() {
            return Err(MonitorError::Other(reason));
        }

        let deadline = Instant::now() + timeout;
        loop {
            while let Some(event) = self.state.events.lock().pop_front() {
                match &event.device {
                    Some(id) if !self.registered.contains(id) => continue,
                    _ => return Ok(Some(event)),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

impl Drop for MockSubscription {
    fn drop(&mut self) {
        self.state.open_subscriptions.fetch_sub(1, Ordering::SeqCst);
    }
}
