use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::local::persistence::{
    run_against_copy, ListenSequence, PrimaryStateListener, TransactionMode, TransactionOperation,
};
use crate::firestore::local::schema::LocalDatabase;
use crate::firestore::local::settings::{MemoryGarbageCollector, MemoryPersistenceSettings};
use crate::firestore::local::{
    EagerReferenceDelegate, LruParams, LruReferenceDelegate, Persistence, ReferenceDelegate,
};

/// Persistence that keeps the storage image in process memory.
///
/// It is always the primary client and loses everything when dropped.
pub struct MemoryPersistence {
    database: Mutex<LocalDatabase>,
    sequence: StdMutex<ListenSequence>,
    reference_delegate: Arc<dyn ReferenceDelegate>,
    settings: MemoryPersistenceSettings,
    started: AtomicBool,
}

impl MemoryPersistence {
    pub fn new(settings: MemoryPersistenceSettings) -> Self {
        let reference_delegate: Arc<dyn ReferenceDelegate> = match settings.garbage_collector() {
            MemoryGarbageCollector::Eager => Arc::new(EagerReferenceDelegate::new()),
            MemoryGarbageCollector::Lru(_) => Arc::new(LruReferenceDelegate::new()),
        };
        Self {
            database: Mutex::new(LocalDatabase::default()),
            sequence: StdMutex::new(ListenSequence::default()),
            reference_delegate,
            settings,
            started: AtomicBool::new(false),
        }
    }

    pub fn with_eager_gc() -> Self {
        Self::new(MemoryPersistenceSettings::new(MemoryGarbageCollector::Eager))
    }

    pub fn with_lru_gc(params: LruParams) -> Self {
        Self::new(MemoryPersistenceSettings::new(MemoryGarbageCollector::Lru(params)))
    }

    /// LRU tuning when the LRU delegate is in use.
    pub fn lru_params(&self) -> Option<LruParams> {
        match self.settings.garbage_collector() {
            MemoryGarbageCollector::Eager => None,
            MemoryGarbageCollector::Lru(params) => Some(params),
        }
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::with_eager_gc()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn start(&self) -> FirestoreResult<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self, delete_data: bool) -> FirestoreResult<()> {
        self.started.store(false, Ordering::SeqCst);
        if delete_data {
            *self.database.lock().await = LocalDatabase::default();
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn is_primary(&self) -> bool {
        true
    }

    fn set_primary_state_listener(&self, listener: PrimaryStateListener) {
        listener(true);
    }

    async fn set_network_enabled(&self, _enabled: bool) -> FirestoreResult<()> {
        Ok(())
    }

    async fn set_in_foreground(&self, _in_foreground: bool) -> FirestoreResult<()> {
        Ok(())
    }

    fn reference_delegate(&self) -> Arc<dyn ReferenceDelegate> {
        Arc::clone(&self.reference_delegate)
    }

    async fn run_transaction_dyn(
        &self,
        action: &str,
        mode: TransactionMode,
        operation: &mut TransactionOperation<'_>,
    ) -> FirestoreResult<()> {
        if !self.is_started() {
            return Err(failed_precondition(format!(
                "Cannot run '{action}': persistence is not started"
            )));
        }
        log::debug!("Starting transaction: {action} ({mode:?})");

        let mut database = self.database.lock().await;
        let sequence_number = self
            .sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next(database.target_global.highest_listen_sequence_number);
        if let Some(committed) = run_against_copy(
            &database,
            mode,
            sequence_number,
            self.reference_delegate.as_ref(),
            operation,
        )? {
            *database = committed;
            database.mark_clean();
        }
        Ok(())
    }
}

impl Debug for MemoryPersistence {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPersistence")
            .field("settings", &self.settings)
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::aborted;
    use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
    use crate::firestore::value::MapValue;

    fn document(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(5),
            MapValue::empty(),
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transactions_require_start() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::default());
        let err = persistence
            .run_transaction("noop", TransactionMode::ReadOnly, |_| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_operations_leave_no_trace() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::with_lru_gc(LruParams::default()));
        persistence.start().await.unwrap();
        let cache = persistence.remote_document_cache();

        let result: FirestoreResult<()> = persistence
            .run_transaction("fail", TransactionMode::ReadWrite, |txn| {
                cache.add_entry(txn, &document("c/a"), SnapshotVersion::from_micros(5))?;
                Err(aborted("simulated"))
            })
            .await;
        assert!(result.unwrap_err().is_transient());

        let size = persistence
            .run_transaction("size", TransactionMode::ReadOnly, |txn| Ok(cache.get_size(txn)))
            .await
            .unwrap();
        assert_eq!(size, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sequence_numbers_increase_per_transaction() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::default());
        persistence.start().await.unwrap();
        let first = persistence
            .run_transaction("a", TransactionMode::ReadWrite, |txn| Ok(txn.current_sequence_number()))
            .await
            .unwrap();
        let second = persistence
            .run_transaction("b", TransactionMode::ReadOnly, |txn| Ok(txn.current_sequence_number()))
            .await
            .unwrap();
        assert!(second > first);
        assert!(persistence.is_primary());
    }
}
