mod common;

use std::sync::Arc;
use std::time::Duration;

use warden_core::{HealthStatus, PluginEventKind, PluginStatus};
use warden_plugins::HealthOptions;

use common::{FixedProbe, Harness, Scripted, quiet_options};

#[tokio::test]
async fn unhealthy_probe_does_not_deactivate_by_default() {
    let manager = Harness::new(Arc::new(Scripted::default()))
        .probe(Arc::new(FixedProbe::unhealthy()))
        .build();
    manager.load("scripted").await.unwrap();

    for _ in 0..3 {
        assert_eq!(manager.run_health_cycle().await, 1);
    }

    let listed = manager.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, PluginStatus::Active);

    let health = manager.inspect("scripted").await.unwrap().health.unwrap();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.check_count, 3);
    assert_eq!(health.error_count, 3);
}

#[tokio::test]
async fn background_monitor_records_snapshots() {
    let mut options = quiet_options();
    options.health = HealthOptions {
        enabled: true,
        interval: Duration::from_millis(20),
        probe_timeout: Duration::from_millis(500),
        unhealthy_threshold: None,
    };
    let manager = Harness::new(Arc::new(Scripted::default()))
        .probe(Arc::new(FixedProbe::unhealthy()))
        .options(options)
        .build();
    manager.load("scripted").await.unwrap();
    manager.start().await;
    manager.start().await;
    assert!(manager.is_monitoring().await);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let record = manager.inspect("scripted").await.unwrap();
    assert_eq!(record.status, PluginStatus::Active);
    let health = record.health.unwrap();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(health.check_count >= 2);

    manager.stop().await;
    assert!(!manager.is_monitoring().await);
    assert!(manager.list().await.is_empty());
}

#[tokio::test]
async fn stalled_probe_times_out_as_unhealthy() {
    let mut options = quiet_options();
    options.health.probe_timeout = Duration::from_millis(50);
    let manager = Harness::new(Arc::new(Scripted::default()))
        .probe(Arc::new(FixedProbe::stalled(Duration::from_secs(5))))
        .options(options)
        .build();
    manager.load("scripted").await.unwrap();

    let started = std::time::Instant::now();
    manager.run_health_cycle().await;
    assert!(started.elapsed() < Duration::from_secs(1));

    let health = manager.inspect("scripted").await.unwrap().health.unwrap();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(health.message.contains("timed out"));
    assert_eq!(health.error_count, 1);
}

#[tokio::test]
async fn threshold_moves_plugin_to_error() {
    let mut options = quiet_options();
    options.health.unhealthy_threshold = Some(2);
    let manager = Harness::new(Arc::new(Scripted::default()))
        .probe(Arc::new(FixedProbe::unhealthy()))
        .options(options)
        .build();
    manager.load("scripted").await.unwrap();
    let mut events = manager.subscribe();

    manager.run_health_cycle().await;
    assert_eq!(manager.inspect("scripted").await.unwrap().status, PluginStatus::Active);

    manager.run_health_cycle().await;
    let record = manager.inspect("scripted").await.unwrap();
    assert_eq!(record.status, PluginStatus::Error);
    assert!(record.error.unwrap().contains("consecutive unhealthy"));

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert_eq!(
        kinds,
        vec![
            PluginEventKind::HealthUnhealthy,
            PluginEventKind::HealthUnhealthy,
            PluginEventKind::Failed,
        ]
    );

    // Error plugins are still probed and still listed.
    assert_eq!(manager.run_health_cycle().await, 1);
    assert_eq!(manager.list().await.len(), 1);
}

#[tokio::test]
async fn plugin_without_probe_gets_status_snapshot() {
    let manager = Harness::new(Arc::new(Scripted::default())).build();
    manager.load("scripted").await.unwrap();
    manager.run_health_cycle().await;

    let health = manager.inspect("scripted").await.unwrap().health.unwrap();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.check_count, 1);
    assert_eq!(health.error_count, 0);
}
