pub mod models;
pub mod persist;
pub mod reconcile;
pub mod views;

use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::tools::run_blocking;

pub use models::{GlucoseEntry, KeyStamp, Treatment, TreatmentKey};
pub use persist::{Artifact, ArtifactSink, FsArtifacts};
pub use reconcile::ReconciliationStore;
pub use views::{DerivedView, ViewKind};

/// The store is written from both the transport handler and the
/// file-triggered reconcile action. Async code goes through [`with_store`].
pub type SharedStore = Arc<Mutex<ReconciliationStore>>;

/// Runs `job` against the store on the blocking pool, since ingestion may
/// write artifacts to disk.
pub async fn with_store<T, F>(store: &SharedStore, job: F) -> Result<T>
where
    F: FnOnce(&mut ReconciliationStore) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    run_blocking(move || {
        let mut guard = match store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        job(&mut guard)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread::{self, ThreadId};

    /// Records which thread each write ran on; optionally refuses them.
    #[derive(Default)]
    struct ThreadSink {
        threads: Mutex<Vec<ThreadId>>,
        refuse: bool,
    }

    impl ArtifactSink for ThreadSink {
        fn write(&self, _artifact: Artifact, _body: &[u8], _newest_ms: i64) -> Result<()> {
            self.threads.lock().unwrap().push(thread::current().id());
            if self.refuse {
                anyhow::bail!("disk full");
            }
            Ok(())
        }
    }

    fn glucose(now_ms: i64) -> Vec<serde_json::Value> {
        vec![json!({"mills": now_ms - 60_000, "mgdl": 120, "direction": "Flat"})]
    }

    #[tokio::test]
    async fn artifact_writes_leave_the_calling_thread() {
        let sink = Arc::new(ThreadSink::default());
        let store: SharedStore = Arc::new(Mutex::new(ReconciliationStore::new(sink.clone())));
        let now_ms = 1_700_000_000_000;

        let window = with_store(&store, move |store| store.ingest_glucose(&glucose(now_ms), now_ms))
            .await
            .unwrap();

        assert_eq!(window, 1);
        let threads = sink.threads.lock().unwrap();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], thread::current().id());
        assert_eq!(store.lock().unwrap().glucose_len(), 1);
    }

    #[tokio::test]
    async fn write_failures_reach_the_caller() {
        let sink = Arc::new(ThreadSink {
            refuse: true,
            ..ThreadSink::default()
        });
        let store: SharedStore = Arc::new(Mutex::new(ReconciliationStore::new(sink)));
        let now_ms = 1_700_000_000_000;

        let result =
            with_store(&store, move |store| store.ingest_glucose(&glucose(now_ms), now_ms)).await;

        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("disk full"));
    }
}
