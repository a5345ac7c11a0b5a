// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! NVML backed [`Monitor`].

use std::time::Duration;

use nvml_wrapper::bitmasks::event::EventTypes;
use nvml_wrapper::enums::event::XidError;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{EventSet, Nvml};

use super::{EventKind, EventSubscription, HealthEvent, Monitor, MonitorError, UNKNOWN_XID};
use crate::device::PhysicalDevice;

const MIB: u64 = 1024 * 1024;

fn other(err: NvmlError) -> MonitorError {
    match err {
        NvmlError::NotSupported => MonitorError::NotSupported(err.to_string()),
        _ => MonitorError::Other(err.to_string()),
    }
}

/// Process-wide NVML session.
pub struct NvmlMonitor {
    nvml: Nvml,
}

impl std::fmt::Debug for NvmlMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmlMonitor").finish_non_exhaustive()
    }
}

impl NvmlMonitor {
    pub fn init() -> Result<Self, MonitorError> {
        let nvml = Nvml::init().map_err(|e| MonitorError::Unavailable(e.to_string()))?;
        Ok(Self { nvml })
    }

    /// Tear down the NVML session. Must only be called once every subscription is gone.
    pub fn shutdown(self) -> Result<(), MonitorError> {
        self.nvml.shutdown().map_err(other)
    }
}

impl Monitor for NvmlMonitor {
    fn device_count(&self) -> Result<u32, MonitorError> {
        self.nvml.device_count().map_err(other)
    }

    fn device(&self, index: u32) -> Result<PhysicalDevice, MonitorError> {
        let device = self.nvml.device_by_index(index).map_err(other)?;
        let id = device.uuid().map_err(other)?;
        let memory = device.memory_info().map_err(other)?;

        Ok(PhysicalDevice {
            id,
            memory_mib: memory.total / MIB,
            index,
        })
    }

    fn subscribe(&self) -> Result<Box<dyn EventSubscription + '_>, MonitorError> {
        let set = self.nvml.create_event_set().map_err(other)?;
        Ok(Box::new(NvmlSubscription {
            nvml: &self.nvml,
            set: Some(set),
            registered: Vec::new(),
        }))
    }
}

struct NvmlSubscription<'nvml> {
    nvml: &'nvml Nvml,
    set: Option<EventSet<'nvml>>,
    registered: Vec<String>,
}

impl<'nvml> NvmlSubscription<'nvml> {
    fn register(&mut self, physical_id: &str) -> Result<(), MonitorError> {
        let device = self.nvml.device_by_uuid(physical_id.to_string()).map_err(other)?;
        let set = match self.set.take() {
            Some(set) => set,
            None => self.nvml.create_event_set().map_err(other)?,
        };

        match device.register_events(EventTypes::CRITICAL_XID_ERROR, set) {
            Ok(set) => {
                self.set = Some(set);
                Ok(())
            }
            // NVML frees the set on failure
            Err(e) => Err(other(e.error)),
        }
    }
}

impl EventSubscription for NvmlSubscription<'_> {
    fn register_critical_errors(&mut self, physical_id: &str) -> Result<(), MonitorError> {
        let device = self.nvml.device_by_uuid(physical_id.to_string()).map_err(other)?;
        match device.supported_event_types() {
            Ok(types) if types.contains(EventTypes::CRITICAL_XID_ERROR) => {}
            Ok(_) | Err(NvmlError::NotSupported) => {
                return Err(MonitorError::NotSupported(format!(
                    "{physical_id} does not report critical Xid events"
                )));
            }
            Err(e) => return Err(other(e)),
        }

        match self.register(physical_id) {
            Ok(()) => {
                self.registered.push(physical_id.to_string());
                Ok(())
            }
            Err(e @ MonitorError::NotSupported(_)) => {
                // The failed call released the set, restore the earlier registrations.
                let previous = std::mem::take(&mut self.registered);
                for id in &previous {
                    self.register(id)?;
                }
                self.registered = previous;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn wait(&mut self, timeout: Duration) -> Result<Option<HealthEvent>, MonitorError> {
        let Some(set) = self.set.as_ref() else {
            // Nothing registered, behave like an idle wait.
            std::thread::sleep(timeout);
            return Ok(None);
        };

        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        match set.wait(timeout_ms) {
            Ok(data) => {
                let kind = if data.event_type.contains(EventTypes::CRITICAL_XID_ERROR) {
                    EventKind::CriticalXid
                } else {
                    EventKind::Other(data.event_type.bits())
                };
                // Global events carry no device handle, so the uuid lookup fails.
                let device = data.device.uuid().ok().filter(|uuid| !uuid.is_empty());
                let code = match data.event_data {
                    Some(XidError::Value(xid)) => xid,
                    Some(XidError::Unknown) | None => UNKNOWN_XID,
                };
                Ok(Some(HealthEvent {
                    kind,
                    code,
                    device,
                }))
            }
            Err(NvmlError::Timeout) => Ok(None),
            Err(e) => Err(other(e)),
        }
    }
}
