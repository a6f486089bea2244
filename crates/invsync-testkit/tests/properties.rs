//! Engine-level properties over generated catalogs.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;

use invsync::{RunOptions, RunStatus, SyncStrategy};
use invsync_remote::MemorySource;
use invsync_testkit::fixtures::TestEngine;
use invsync_testkit::generators::item_batch;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_second_full_run_writes_nothing(batch in item_batch(30)) {
        let source = Arc::new(MemorySource::new());
        let keys: BTreeSet<_> = batch.iter().map(|r| r.key.clone()).collect();
        for record in batch {
            source.put(record);
        }

        let (first, second) = runtime().block_on(async {
            let t = TestEngine::with_catalog(source);
            let first = t.engine.run_sync(SyncStrategy::Full, RunOptions::default()).await;
            let second = t.engine.run_sync(SyncStrategy::Full, RunOptions::default()).await;
            (first, second)
        });

        prop_assert_eq!(first.status, RunStatus::Succeeded);
        prop_assert_eq!(first.counts.written, keys.len() as u64);
        prop_assert_eq!(second.status, RunStatus::Succeeded);
        prop_assert_eq!(second.counts.fetched, keys.len() as u64);
        prop_assert_eq!(second.counts.written, 0);
    }
}
