use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::{StoreConfig, StoreConfigBuilder};

mod store_tests;

/// Builder for a store in `dir` whose lock name is unique to this test run.
/// Primitives are not persisted, so the first instance opened unlinks the
/// segment when it goes away.
fn test_config(dir: &Path, tag: &str) -> StoreConfigBuilder {
    static LOCK_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);
    let lock_name = format!(
        "syncstore_test_{}_{}_{}",
        tag,
        std::process::id(),
        LOCK_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    StoreConfig::builder()
        .file_path(dir.join(format!("{}.bin", tag)))
        .lock_name(lock_name)
        .timeout(Duration::from_secs(10))
        .persist_primitives(false)
}
