mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use warden_core::{Limit, PluginError, PluginStatus, ResourceLimits};
use warden_sandbox::{ApiAllowlist, ResourceSandbox};

use common::{CAPABILITY, Harness, Scripted};

fn sandbox(limits: ResourceLimits) -> ResourceSandbox {
    ResourceSandbox::new(limits, ApiAllowlist::default())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrency_gate_rejects_second_call() {
    let plugin = Arc::new(Scripted::slow(Duration::from_millis(200)));
    let limits = ResourceLimits {
        max_concurrency: Limit::Max(1),
        ..ResourceLimits::unlimited()
    };
    let manager = Arc::new(Harness::new(plugin.clone()).sandbox(sandbox(limits)).build());
    manager.load("scripted").await.unwrap();

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.execute("scripted", CAPABILITY, json!({"n": 1})).await }
    });
    while plugin.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = Instant::now();
    let second = manager.execute("scripted", CAPABILITY, json!({"n": 2})).await;
    assert!(started.elapsed() < Duration::from_millis(150));
    assert!(matches!(
        second,
        Err(PluginError::ConcurrencyLimitExceeded { limit: 1, .. })
    ));
    assert_eq!(first.await.unwrap().unwrap(), json!({"n": 1}));
    assert_eq!(plugin.calls(), 1);

    // Rejection is terminal for that call only.
    let record = manager.inspect("scripted").await.unwrap();
    assert_eq!(record.status, PluginStatus::Active);
    assert_eq!(record.usage.invocation_count, 1);
    manager.execute("scripted", CAPABILITY, json!({})).await.unwrap();
}

#[tokio::test]
async fn slow_capability_times_out() {
    let plugin = Arc::new(Scripted::slow(Duration::from_secs(5)));
    let limits = ResourceLimits {
        max_execution_time_ms: Limit::Max(100),
        ..ResourceLimits::unlimited()
    };
    let manager = Harness::new(plugin.clone()).sandbox(sandbox(limits)).build();
    manager.load("scripted").await.unwrap();

    let started = Instant::now();
    let err = manager
        .execute("scripted", CAPABILITY, json!({}))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, PluginError::ExecutionTimeout { .. }), "{err}");
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(1_000), "took {elapsed:?}");
    assert_eq!(plugin.completed(), 0);

    let record = manager.inspect("scripted").await.unwrap();
    assert_eq!(record.status, PluginStatus::Active);
    assert_eq!(record.usage.invocation_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_releases_concurrency_slot() {
    let plugin = Arc::new(Scripted::slow(Duration::from_secs(5)));
    let limits = ResourceLimits {
        max_concurrency: Limit::Max(1),
        ..ResourceLimits::unlimited()
    };
    let manager = Arc::new(Harness::new(plugin.clone()).sandbox(sandbox(limits)).build());
    manager.load("scripted").await.unwrap();

    let cancel = CancellationToken::new();
    let call = tokio::spawn({
        let manager = manager.clone();
        let cancel = cancel.clone();
        async move {
            manager
                .execute_with_cancel("scripted", CAPABILITY, json!({}), &cancel)
                .await
        }
    });
    while plugin.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(manager.sandbox().unwrap().in_flight("scripted"), 1);

    cancel.cancel();
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, PluginError::Cancelled { .. }));
    assert_eq!(manager.sandbox().unwrap().in_flight("scripted"), 0);

    // The slot is free again: the next call runs instead of being rejected.
    let next = tokio::time::timeout(
        Duration::from_millis(50),
        manager.execute("scripted", CAPABILITY, json!({})),
    )
    .await;
    assert!(next.is_err(), "second call should be running, not rejected");
}

#[tokio::test]
async fn zero_execution_time_disables_invocations() {
    let plugin = Arc::new(Scripted::default());
    let limits = ResourceLimits {
        max_execution_time_ms: Limit::Max(0),
        ..ResourceLimits::unlimited()
    };
    let manager = Harness::new(plugin.clone()).sandbox(sandbox(limits)).build();
    manager.load("scripted").await.unwrap();

    let err = manager
        .execute("scripted", CAPABILITY, json!({}))
        .await
        .unwrap_err();
    assert!(err.is_sandbox_violation());
    assert_eq!(plugin.calls(), 0);
}

#[tokio::test]
async fn unload_releases_sandbox_state() {
    let limits = ResourceLimits {
        max_concurrency: Limit::Max(2),
        ..ResourceLimits::unlimited()
    };
    let manager = Harness::new(Arc::new(Scripted::default()))
        .sandbox(sandbox(limits))
        .build();
    manager.load("scripted").await.unwrap();
    manager.execute("scripted", CAPABILITY, json!({})).await.unwrap();

    manager.unload("scripted").await.unwrap();
    let sandbox = manager.sandbox().unwrap();
    assert_eq!(sandbox.in_flight("scripted"), 0);
    assert_eq!(sandbox.usage("scripted"), Default::default());
}

#[tokio::test]
async fn sandboxed_panic_releases_concurrency_slot() {
    let plugin = Arc::new(Scripted::panicking());
    let limits = ResourceLimits {
        max_concurrency: Limit::Max(1),
        ..ResourceLimits::unlimited()
    };
    let manager = Harness::new(plugin.clone()).sandbox(sandbox(limits)).build();
    manager.load("scripted").await.unwrap();

    for _ in 0..2 {
        let err = manager
            .execute("scripted", CAPABILITY, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ExecutionFailed { .. }), "got {err}");
    }
    assert_eq!(plugin.calls(), 2);
    assert_eq!(manager.sandbox().unwrap().in_flight("scripted"), 0);
    assert_eq!(
        manager.inspect("scripted").await.unwrap().status,
        PluginStatus::Active
    );
}
