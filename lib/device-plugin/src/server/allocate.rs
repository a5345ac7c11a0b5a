// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Allocation grants and preferred allocation.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::MpsConfig;
use crate::device::VirtualDeviceId;
use crate::error::AllocateError;

use super::proto::{ContainerAllocateResponse, Mount};
use super::table::DeviceTable;

pub const VISIBLE_DEVICES_ENV: &str = "NVIDIA_VISIBLE_DEVICES";
pub const MPS_PIPE_DIRECTORY_ENV: &str = "CUDA_MPS_PIPE_DIRECTORY";
pub const MPS_THREAD_PERCENTAGE_ENV: &str = "CUDA_MPS_ACTIVE_THREAD_PERCENTAGE";

/// Build the grant for one container.
///
/// Fails on the first id that is not currently advertised; nothing is
/// allocated in that case.
pub fn container_grant(
    table: &DeviceTable,
    requested: &[String],
    mps: &MpsConfig,
) -> Result<ContainerAllocateResponse, AllocateError> {
    let resolved = requested
        .iter()
        .map(|id| table.resolve(id))
        .collect::<Result<Vec<_>, _>>()?;

    let mut physical: Vec<&str> = Vec::new();
    for id in &resolved {
        if !physical.contains(&id.physical_id()) {
            physical.push(id.physical_id());
        }
    }

    let mut response = ContainerAllocateResponse::default();
    response
        .envs
        .insert(VISIBLE_DEVICES_ENV.to_string(), physical.join(","));

    if mps.enabled {
        let slots: usize = physical.iter().map(|p| table.slots_on(p)).sum();
        let percentage = (100 * resolved.len()).checked_div(slots).unwrap_or(100).clamp(1, 100);
        let pipe_directory = mps.pipe_directory.to_string_lossy().into_owned();

        response
            .envs
            .insert(MPS_THREAD_PERCENTAGE_ENV.to_string(), percentage.to_string());
        response
            .envs
            .insert(MPS_PIPE_DIRECTORY_ENV.to_string(), pipe_directory.clone());
        response.mounts.push(Mount {
            container_path: pipe_directory.clone(),
            host_path: pipe_directory,
            read_only: false,
        });
    }

    Ok(response)
}

/// Pick `size` devices out of `available`, packing onto as few physical
/// devices as possible.
///
/// `must_include` ids come first. Remaining picks prefer physical devices the
/// selection already touches, then the physical device with the most
/// available slots. Ties break on identity so the answer is deterministic.
/// Ids that do not parse as virtual device ids are ignored.
pub fn preferred_allocation(
    available: &[String],
    must_include: &[String],
    size: usize,
) -> Vec<String> {
    let mut selected: Vec<String> = Vec::with_capacity(size);
    let mut seen: HashSet<&str> = HashSet::new();
    let mut used: HashMap<String, usize> = HashMap::new();

    for id in must_include {
        if selected.len() >= size {
            break;
        }
        if seen.insert(id.as_str()) {
            if let Ok(parsed) = id.parse::<VirtualDeviceId>() {
                *used.entry(parsed.physical_id().to_string()).or_default() += 1;
            }
            selected.push(id.clone());
        }
    }

    let mut pools: BTreeMap<String, Vec<VirtualDeviceId>> = BTreeMap::new();
    for id in available {
        if seen.contains(id.as_str()) {
            continue;
        }
        if let Ok(parsed) = id.parse::<VirtualDeviceId>() {
            pools
                .entry(parsed.physical_id().to_string())
                .or_default()
                .push(parsed);
        }
    }
    for pool in pools.values_mut() {
        pool.sort();
    }

    let mut order: Vec<(&String, &Vec<VirtualDeviceId>)> = pools.iter().collect();
    order.sort_by(|(a_id, a_pool), (b_id, b_pool)| {
        let a_used = used.get(*a_id).copied().unwrap_or(0);
        let b_used = used.get(*b_id).copied().unwrap_or(0);
        b_used
            .cmp(&a_used)
            .then(b_pool.len().cmp(&a_pool.len()))
            .then(a_id.cmp(b_id))
    });

    for (_, pool) in order {
        for id in pool {
            if selected.len() >= size {
                return selected;
            }
            selected.push(id.to_string());
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::device::VirtualDevice;

    fn table() -> DeviceTable {
        let mut devices = Vec::new();
        for gpu in ["GPU-aaaa-1", "GPU-bbbb-2"] {
            for slot in 0..4 {
                devices.push(VirtualDevice::new(VirtualDeviceId::new(gpu, slot)));
            }
        }
        DeviceTable::new(devices)
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_grant_visible_devices() {
        let table = table();
        let grant = container_grant(
            &table,
            &ids(&["GPU-bbbb-2-1", "GPU-aaaa-1-0", "GPU-bbbb-2-3"]),
            &MpsConfig::default(),
        )
        .unwrap();
        assert_eq!(grant.envs[VISIBLE_DEVICES_ENV], "GPU-bbbb-2,GPU-aaaa-1");
        assert!(grant.mounts.is_empty());
        assert!(!grant.envs.contains_key(MPS_THREAD_PERCENTAGE_ENV));
    }

    #[test]
    fn test_grant_unknown_device() {
        let table = table();
        let err = container_grant(&table, &ids(&["GPU-aaaa-1-0", "GPU-cccc-3-0"]), &MpsConfig::default())
            .unwrap_err();
        assert_eq!(err, AllocateError::UnknownVirtualDevice("GPU-cccc-3-0".into()));
    }

    #[test]
    fn test_grant_with_mps() {
        let table = table();
        let mps = MpsConfig {
            enabled: true,
            pipe_directory: PathBuf::from("/tmp/nvidia-mps"),
        };
        let grant = container_grant(&table, &ids(&["GPU-aaaa-1-0"]), &mps).unwrap();
        assert_eq!(grant.envs[MPS_THREAD_PERCENTAGE_ENV], "25");
        assert_eq!(grant.envs[MPS_PIPE_DIRECTORY_ENV], "/tmp/nvidia-mps");
        assert_eq!(grant.mounts.len(), 1);
        assert_eq!(grant.mounts[0].host_path, "/tmp/nvidia-mps");
    }

    #[test]
    fn test_preferred_packs_one_device() {
        let available = ids(&[
            "GPU-aaaa-1-0",
            "GPU-bbbb-2-0",
            "GPU-bbbb-2-1",
            "GPU-bbbb-2-2",
            "GPU-aaaa-1-1",
        ]);
        let picked = preferred_allocation(&available, &[], 3);
        assert_eq!(picked, ids(&["GPU-bbbb-2-0", "GPU-bbbb-2-1", "GPU-bbbb-2-2"]));
    }

    #[test]
    fn test_preferred_follows_must_include() {
        let available = ids(&[
            "GPU-aaaa-1-0",
            "GPU-aaaa-1-1",
            "GPU-bbbb-2-0",
            "GPU-bbbb-2-1",
            "GPU-bbbb-2-2",
        ]);
        let picked = preferred_allocation(&available, &ids(&["GPU-aaaa-1-0"]), 2);
        assert_eq!(picked, ids(&["GPU-aaaa-1-0", "GPU-aaaa-1-1"]));
    }

    #[test]
    fn test_preferred_spills_over() {
        let available = ids(&["GPU-aaaa-1-0", "GPU-bbbb-2-0", "GPU-bbbb-2-1"]);
        let picked = preferred_allocation(&available, &[], 3);
        assert_eq!(picked.len(), 3);
        assert_eq!(&picked[..2], &ids(&["GPU-bbbb-2-0", "GPU-bbbb-2-1"])[..]);
    }
}
