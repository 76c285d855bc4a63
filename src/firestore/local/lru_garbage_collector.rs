use std::collections::BTreeSet;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use crate::firestore::core::TargetId;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::{
    ListenSequenceNumber, PersistenceTransaction, INVALID_SEQUENCE_NUMBER,
};
use crate::firestore::local::scheduler::{DelayedOperation, Scheduler, TimerId};
use crate::firestore::local::{LocalStore, LruParams, ReferenceDelegate, TargetCache};
use crate::firestore::logger::LOGGER;

/// Delay before the first collection after start-up.
pub const INITIAL_GC_DELAY: Duration = Duration::from_secs(60);
/// Delay between two collections.
pub const REGULAR_GC_DELAY: Duration = Duration::from_secs(5 * 60);

/// Outcome of one collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    pub fn did_not_run() -> Self {
        Self::default()
    }
}

/// Removes the least recently used targets and orphaned documents once the cache grows
/// beyond the configured threshold.
#[derive(Clone)]
pub struct LruGarbageCollector {
    params: LruParams,
    reference_delegate: Arc<dyn ReferenceDelegate>,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams, reference_delegate: Arc<dyn ReferenceDelegate>) -> Self {
        Self {
            params,
            reference_delegate,
        }
    }

    pub fn params(&self) -> LruParams {
        self.params
    }

    /// Number of sequence numbers making up `percentile` percent of the population.
    pub fn calculate_target_count(&self, txn: &PersistenceTransaction<'_>, percentile: u32) -> usize {
        let Some(lru) = self.reference_delegate.as_lru() else {
            return 0;
        };
        let count = lru.sequence_number_count(txn);
        (count * percentile as usize) / 100
    }

    /// The `n`-th smallest sequence number among targets and orphaned documents.
    pub fn nth_sequence_number(&self, txn: &PersistenceTransaction<'_>, n: usize) -> ListenSequenceNumber {
        let Some(lru) = self.reference_delegate.as_lru() else {
            return INVALID_SEQUENCE_NUMBER;
        };
        if n == 0 {
            return INVALID_SEQUENCE_NUMBER;
        }
        let mut sequence_numbers = lru.target_sequence_numbers(txn);
        sequence_numbers.extend(
            lru.orphaned_documents(txn)
                .into_iter()
                .map(|(_, sequence_number)| sequence_number),
        );
        sequence_numbers.sort_unstable();
        sequence_numbers
            .get(n - 1)
            .or_else(|| sequence_numbers.last())
            .copied()
            .unwrap_or(INVALID_SEQUENCE_NUMBER)
    }

    /// Runs a pass if the cache is larger than the configured threshold.
    ///
    /// Targets listed in `active_target_ids` are never removed.
    pub fn collect(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<LruResults> {
        if self.params.is_disabled() {
            LOGGER.debug("Garbage collection skipped; disabled");
            return Ok(LruResults::did_not_run());
        }
        let Some(lru) = self.reference_delegate.as_lru() else {
            LOGGER.debug("Garbage collection skipped; eager reference delegate in use");
            return Ok(LruResults::did_not_run());
        };

        let cache_size = lru.byte_size(txn);
        if cache_size < self.params.cache_size_collection_threshold() {
            LOGGER.debug(format!(
                "Garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold()
            ));
            return Ok(LruResults::did_not_run());
        }
        self.run_garbage_collection(txn, active_target_ids)
    }

    fn run_garbage_collection(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<LruResults> {
        let mut sequence_numbers_to_collect =
            self.calculate_target_count(txn, self.params.percentile_to_collect());
        let maximum = self.params.maximum_sequence_numbers_to_collect();
        if sequence_numbers_to_collect > maximum {
            LOGGER.debug(format!(
                "Capping garbage collection to {maximum} from {sequence_numbers_to_collect}"
            ));
            sequence_numbers_to_collect = maximum;
        }

        let upper_bound = self.nth_sequence_number(txn, sequence_numbers_to_collect);
        let targets_removed = TargetCache::new(Arc::clone(&self.reference_delegate))
            .remove_targets(txn, upper_bound, active_target_ids);
        let documents_removed = match self.reference_delegate.as_lru() {
            Some(lru) => lru.remove_orphaned_documents(txn, upper_bound)?,
            None => 0,
        };

        LOGGER.debug(format!(
            "LRU garbage collection: collected {sequence_numbers_to_collect} sequence numbers \
             up to {upper_bound}, removed {targets_removed} targets and {documents_removed} documents"
        ));
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: sequence_numbers_to_collect,
            targets_removed,
            documents_removed,
        })
    }
}

impl Debug for LruGarbageCollector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruGarbageCollector")
            .field("params", &self.params)
            .finish()
    }
}

/// Periodically runs [`LocalStore::collect_garbage`] on a [`Scheduler`].
#[derive(Clone)]
pub struct LruScheduler {
    inner: Arc<LruSchedulerInner>,
}

struct LruSchedulerInner {
    garbage_collector: LruGarbageCollector,
    local_store: Arc<LocalStore>,
    scheduler: Scheduler,
    pending: StdMutex<Option<DelayedOperation>>,
}

impl LruScheduler {
    pub fn new(
        garbage_collector: LruGarbageCollector,
        local_store: Arc<LocalStore>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            inner: Arc::new(LruSchedulerInner {
                garbage_collector,
                local_store,
                scheduler,
                pending: StdMutex::new(None),
            }),
        }
    }

    pub fn start(&self) {
        if self.inner.garbage_collector.params().is_disabled() {
            return;
        }
        self.schedule(INITIAL_GC_DELAY);
    }

    pub fn stop(&self) {
        if let Some(operation) = self.lock_pending().take() {
            operation.cancel();
        }
    }

    pub fn is_started(&self) -> bool {
        self.lock_pending().is_some()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<DelayedOperation>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self, delay: Duration) {
        let this = self.clone();
        let scheduled = self.inner.scheduler.enqueue_after_delay(
            TimerId::LruGarbageCollection,
            delay,
            move || async move {
                match this
                    .inner
                    .local_store
                    .collect_garbage(&this.inner.garbage_collector)
                    .await
                {
                    Ok(results) => LOGGER.debug(format!("LRU garbage collection finished: {results:?}")),
                    Err(err) if err.is_primary_lease_lost() => {
                        LOGGER.debug("Ignoring primary lease loss during garbage collection")
                    }
                    Err(err) => LOGGER.warn(format!("Garbage collection failed: {err}")),
                }
                this.schedule(REGULAR_GC_DELAY);
            },
        );
        match scheduled {
            Ok(operation) => *self.lock_pending() = Some(operation),
            Err(err) => LOGGER.debug(format!("Not scheduling garbage collection: {err}")),
        }
    }
}

impl Debug for LruScheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruScheduler")
            .field("garbage_collector", &self.inner.garbage_collector)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Query, TargetData, TargetPurpose};
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::schema::LocalDatabase;
    use crate::firestore::local::settings::MINIMUM_CACHE_SIZE_BYTES;
    use crate::firestore::local::{EagerReferenceDelegate, LruReferenceDelegate, RemoteDocumentCache};
    use crate::firestore::model::{DocumentKey, DocumentKeySet, MutableDocument, ResourcePath, SnapshotVersion};
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn add_document(txn: &mut PersistenceTransaction<'_>, path: &str) {
        let document = MutableDocument::new_found_document(
            key(path),
            SnapshotVersion::from_micros(1),
            MapValue::empty(),
        );
        RemoteDocumentCache::new()
            .add_entry(txn, &document, SnapshotVersion::from_micros(1))
            .unwrap();
    }

    fn add_target(
        txn: &mut PersistenceTransaction<'_>,
        target_cache: &TargetCache,
        collection: &str,
        keys: &[&str],
    ) -> TargetData {
        let target_id = target_cache.allocate_target_id(txn);
        let target = Query::new(ResourcePath::from_string(collection).unwrap()).to_target();
        let data = TargetData::new(target, target_id, TargetPurpose::Listen, txn.current_sequence_number());
        target_cache.add_target_data(txn, &data);
        let keys: DocumentKeySet = keys.iter().map(|path| key(path)).collect();
        target_cache.add_matching_keys(txn, &keys, target_id).unwrap();
        data
    }

    fn lru_collector(percentile: u32) -> (LruGarbageCollector, Arc<dyn ReferenceDelegate>) {
        let delegate: Arc<dyn ReferenceDelegate> = Arc::new(LruReferenceDelegate::new());
        let params = LruParams::new(MINIMUM_CACHE_SIZE_BYTES, percentile, 1_000).unwrap();
        (LruGarbageCollector::new(params, Arc::clone(&delegate)), delegate)
    }

    #[test]
    fn disabled_collector_does_not_run() {
        let delegate: Arc<dyn ReferenceDelegate> = Arc::new(LruReferenceDelegate::new());
        let collector = LruGarbageCollector::new(LruParams::disabled(), delegate);
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWritePrimary, 1);
        let results = collector.collect(&mut txn, &BTreeSet::new()).unwrap();
        assert!(!results.did_run);
    }

    #[test]
    fn small_cache_is_not_collected() {
        let (collector, _) = lru_collector(100);
        let mut database = LocalDatabase::default();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWritePrimary, 1);
        add_document(&mut txn, "c/a");
        assert!(!collector.collect(&mut txn, &BTreeSet::new()).unwrap().did_run);
    }

    #[test]
    fn eager_delegate_never_collects() {
        let collector = LruGarbageCollector::new(LruParams::default(), Arc::new(EagerReferenceDelegate::new()));
        let mut database = LocalDatabase::default();
        database.remote_document_size = i64::MAX;
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWritePrimary, 1);
        assert!(!collector.collect(&mut txn, &BTreeSet::new()).unwrap().did_run);
    }

    #[test]
    fn nth_sequence_number_spans_targets_and_orphans() {
        let (collector, delegate) = lru_collector(50);
        let target_cache = TargetCache::new(delegate);
        let mut database = LocalDatabase::default();
        {
            let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 3);
            add_target(&mut txn, &target_cache, "c", &[]);
        }
        database.document_sequence_numbers.insert(key("c/orphan"), 1);
        database.document_sequence_numbers.insert(key("c/other"), 5);

        let txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadOnly, 6);
        assert_eq!(collector.calculate_target_count(&txn, 100), 3);
        assert_eq!(collector.nth_sequence_number(&txn, 0), INVALID_SEQUENCE_NUMBER);
        assert_eq!(collector.nth_sequence_number(&txn, 1), 1);
        assert_eq!(collector.nth_sequence_number(&txn, 2), 3);
        assert_eq!(collector.nth_sequence_number(&txn, 3), 5);
    }

    #[test]
    fn collects_inactive_targets_then_their_documents() {
        let (collector, delegate) = lru_collector(100);
        let target_cache = TargetCache::new(Arc::clone(&delegate));
        let mut database = LocalDatabase::default();
        database.remote_document_size = 0;
        let (kept, _) = {
            let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWrite, 2);
            add_document(&mut txn, "c/a");
            add_document(&mut txn, "d/b");
            let released = add_target(&mut txn, &target_cache, "c", &["c/a"]);
            let kept = add_target(&mut txn, &target_cache, "d", &["d/b"]);
            (kept, released)
        };
        // Pretend the cache is above the threshold.
        database.remote_document_size = i64::MAX / 2;

        let active: BTreeSet<TargetId> = [kept.target_id].into_iter().collect();
        let mut txn = PersistenceTransaction::new(&mut database, TransactionMode::ReadWritePrimary, 3);
        let results = collector.collect(&mut txn, &active).unwrap();
        assert!(results.did_run);
        assert_eq!(results.sequence_numbers_collected, 2);
        assert_eq!(results.targets_removed, 1);
        assert_eq!(results.documents_removed, 1);
        assert!(database.remote_documents.contains_key(&key("d/b")));
        assert!(!database.remote_documents.contains_key(&key("c/a")));
    }
}
