// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End to end restart behavior driven through `run_until`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{health_by_id, FakeKubelet};
use futures::StreamExt;
use vgpu_device_plugin::monitor::{HealthEvent, MockMonitor};
use vgpu_device_plugin::server::proto::Empty;
use vgpu_device_plugin::{run_until, CancellationToken, PhysicalDevice};

#[tokio::test]
async fn test_kubelet_restart_reregisters_with_fresh_health() {
    let mut kubelet = FakeKubelet::start().await;
    let monitor = MockMonitor::uniform(1, 4096);
    let shutdown = CancellationToken::new();

    let plugin = tokio::spawn(run_until(
        kubelet.config(),
        Arc::new(monitor.clone()),
        shutdown.clone(),
    ));
    kubelet.wait_for_registrations(1).await;

    {
        let mut client = kubelet.plugin_client().await;
        let mut stream = client.list_and_watch(Empty {}).await.unwrap().into_inner();
        let initial = stream.next().await.unwrap().unwrap();
        assert_eq!(initial.devices.len(), 4);

        monitor.push_event(HealthEvent::critical_xid(79, "gpu0"));
        let degraded = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(health_by_id(&degraded).iter().all(|(_, h)| h == "Unhealthy"));
    }

    kubelet.restart().await;
    let requests = kubelet.wait_for_registrations(2).await;
    assert_eq!(requests[0], requests[1]);

    let mut client = kubelet.plugin_client().await;
    let mut stream = client.list_and_watch(Empty {}).await.unwrap().into_inner();
    let fresh = stream.next().await.unwrap().unwrap();
    assert_eq!(
        health_by_id(&fresh),
        vec![
            ("gpu0-0".to_string(), "Healthy".to_string()),
            ("gpu0-1".to_string(), "Healthy".to_string()),
            ("gpu0-2".to_string(), "Healthy".to_string()),
            ("gpu0-3".to_string(), "Healthy".to_string()),
        ]
    );
    drop(stream);
    drop(client);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), plugin)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!kubelet.plugin_socket_path().exists());
    assert_eq!(monitor.open_subscriptions(), 0);
}

#[tokio::test]
async fn test_retry_after_kubelet_appears() {
    let mut kubelet = FakeKubelet::absent();
    let monitor = MockMonitor::uniform(1, 2048);
    let shutdown = CancellationToken::new();

    let plugin = tokio::spawn(run_until(
        kubelet.config(),
        Arc::new(monitor.clone()),
        shutdown.clone(),
    ));

    // First attempt fails, nothing is retried until the socket shows up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(kubelet.requests().is_empty());
    assert!(!kubelet.plugin_socket_path().exists());

    kubelet.restart().await;
    kubelet.wait_for_registrations(1).await;
    assert!(kubelet.plugin_socket_path().exists());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), plugin)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_watcher_fault_stops_the_plugin() {
    let kubelet = FakeKubelet::start().await;
    let monitor = MockMonitor::uniform(1, 2048);
    monitor.fail_registration("gpu0");

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        run_until(kubelet.config(), Arc::new(monitor.clone()), CancellationToken::new()),
    )
    .await
    .unwrap();

    let err = result.unwrap_err();
    assert!(matches!(err, vgpu_device_plugin::PluginError::Fatal(_)));
    assert!(!kubelet.plugin_socket_path().exists());
    assert_eq!(monitor.open_subscriptions(), 0);
}

#[tokio::test]
async fn test_lost_gpu_stops_the_plugin() {
    let kubelet = FakeKubelet::start().await;
    let monitor = MockMonitor::uniform(1, 2048);
    monitor.fail_waits("GPU is lost");

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        run_until(kubelet.config(), Arc::new(monitor.clone()), CancellationToken::new()),
    )
    .await
    .unwrap();

    let err = result.unwrap_err();
    assert!(matches!(err, vgpu_device_plugin::PluginError::Fatal(_)));
    assert!(format!("{:#}", anyhow::Error::new(err)).contains("GPU is lost"));
    assert_eq!(kubelet.requests().len(), 1);
    assert!(!kubelet.plugin_socket_path().exists());
    assert_eq!(monitor.open_subscriptions(), 0);
}

#[tokio::test]
async fn test_restart_picks_up_inventory_changes() {
    let mut kubelet = FakeKubelet::start().await;
    let monitor = MockMonitor::uniform(1, 4096);
    let shutdown = CancellationToken::new();

    let plugin = tokio::spawn(run_until(
        kubelet.config(),
        Arc::new(monitor.clone()),
        shutdown.clone(),
    ));
    kubelet.wait_for_registrations(1).await;

    monitor.set_devices(
        (0..2)
            .map(|index| PhysicalDevice {
                id: format!("gpu{index}"),
                memory_mib: 4096,
                index,
            })
            .collect(),
    );
    kubelet.restart().await;
    kubelet.wait_for_registrations(2).await;

    let mut client = kubelet.plugin_client().await;
    let mut stream = client.list_and_watch(Empty {}).await.unwrap().into_inner();
    let listed = stream.next().await.unwrap().unwrap();
    assert_eq!(listed.devices.len(), 8);
    assert!(listed.devices.iter().any(|d| d.id == "gpu1-3"));
    drop(stream);
    drop(client);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), plugin)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
