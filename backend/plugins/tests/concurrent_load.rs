mod common;

use std::sync::Arc;

use futures::future::join_all;
use proptest::prelude::*;
use warden_core::{PluginError, PluginStatus};

use common::{Harness, Scripted};

fn runtime(workers: usize) -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn concurrent_loads_admit_exactly_one(
        id in "[a-z][a-z0-9-]{0,15}",
        contenders in 2usize..8,
        workers in 1usize..4,
    ) {
        let rt = runtime(workers);
        let (successes, already_loaded, listed) = rt.block_on(async {
            let manager = Arc::new(
                Harness::new(Arc::new(Scripted::default()))
                    .ids([id.clone()])
                    .build(),
            );
            let tasks: Vec<_> = (0..contenders)
                .map(|_| {
                    let manager = manager.clone();
                    let id = id.clone();
                    tokio::spawn(async move { manager.load(&id).await })
                })
                .collect();

            let mut successes = 0;
            let mut already_loaded = 0;
            for outcome in join_all(tasks).await {
                match outcome.unwrap() {
                    Ok(record) => {
                        assert_eq!(record.status, PluginStatus::Active);
                        successes += 1;
                    }
                    Err(PluginError::AlreadyLoaded(other)) => {
                        assert_eq!(other, id);
                        already_loaded += 1;
                    }
                    Err(e) => panic!("unexpected load error: {e}"),
                }
            }
            (successes, already_loaded, manager.list().await.len())
        });

        prop_assert_eq!(successes, 1);
        prop_assert_eq!(already_loaded, contenders - 1);
        prop_assert_eq!(listed, 1);
    }

    #[test]
    fn load_unload_cycles_leave_table_empty(
        rounds in 1usize..6,
        workers in 1usize..4,
    ) {
        let rt = runtime(workers);
        let plugin = Arc::new(Scripted::default());
        let remaining = rt.block_on(async {
            let manager = Harness::new(plugin.clone()).build();
            for _ in 0..rounds {
                manager.load("scripted").await.unwrap();
                manager.unload("scripted").await.unwrap();
            }
            manager.list().await.len()
        });

        prop_assert_eq!(remaining, 0);
        prop_assert_eq!(plugin.cleanups(), rounds);
    }
}
