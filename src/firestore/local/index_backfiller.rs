use std::collections::BTreeSet;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::local_documents_view::LocalDocumentsResult;
use crate::firestore::local::local_store::Components;
use crate::firestore::local::persistence::{PersistenceTransaction, TransactionMode};
use crate::firestore::local::scheduler::{DelayedOperation, Scheduler, TimerId};
use crate::firestore::local::{IndexBackfillerSettings, LocalStore};
use crate::firestore::logger::LOGGER;
use crate::firestore::model::IndexOffset;

/// Writes index entries for documents that were cached before their index existed.
///
/// Each run processes a bounded number of documents, visiting the least recently updated
/// collection groups first.
#[derive(Clone)]
pub struct IndexBackfiller {
    local_store: Arc<LocalStore>,
    settings: IndexBackfillerSettings,
}

impl IndexBackfiller {
    pub fn new(local_store: Arc<LocalStore>, settings: IndexBackfillerSettings) -> Self {
        Self {
            local_store,
            settings,
        }
    }

    pub fn settings(&self) -> &IndexBackfillerSettings {
        &self.settings
    }

    /// Runs one pass and returns how many documents were indexed.
    pub async fn backfill(&self) -> FirestoreResult<usize> {
        let max_documents = self.settings.max_documents_to_process();
        self.local_store
            .run_exclusive("Backfill indexes", TransactionMode::ReadWritePrimary, |txn, components| {
                write_index_entries(txn, components, max_documents)
            })
            .await
    }
}

fn write_index_entries(
    txn: &mut PersistenceTransaction<'_>,
    components: &Components,
    max_documents: usize,
) -> FirestoreResult<usize> {
    let mut processed_groups = BTreeSet::new();
    let mut processed = 0;
    while processed < max_documents {
        let Some(collection_group) = components.index_manager.get_next_collection_group_to_update(txn)
        else {
            break;
        };
        if !processed_groups.insert(collection_group.clone()) {
            break;
        }
        log::debug!("Processing collection group {collection_group}");
        // Overlays come in whole batches, so a group may overshoot what was left.
        processed +=
            write_entries_for_collection_group(txn, components, &collection_group, max_documents - processed)?;
    }
    Ok(processed)
}

fn write_entries_for_collection_group(
    txn: &mut PersistenceTransaction<'_>,
    components: &Components,
    collection_group: &str,
    limit: usize,
) -> FirestoreResult<usize> {
    let existing_offset = components
        .index_manager
        .get_min_offset_from_collection_group(txn, collection_group);
    let next = components
        .local_documents
        .get_next_documents(txn, collection_group, &existing_offset, limit)?;
    components
        .index_manager
        .update_index_entries(txn, &next.documents);

    let new_offset = new_offset(&existing_offset, &next);
    log::debug!("Updating offset of {collection_group} to {new_offset:?}");
    components
        .index_manager
        .update_collection_group(txn, collection_group, new_offset);
    Ok(next.documents.len())
}

/// The largest offset among the processed documents, never moving backwards.
fn new_offset(existing: &IndexOffset, result: &LocalDocumentsResult) -> IndexOffset {
    let max = result
        .documents
        .values()
        .map(IndexOffset::from_document)
        .fold(existing.clone(), |max, offset| if offset > max { offset } else { max });
    IndexOffset::new(
        max.read_time,
        max.document_key,
        result.batch_id.max(existing.largest_batch_id),
    )
}

impl Debug for IndexBackfiller {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexBackfiller")
            .field("settings", &self.settings)
            .finish()
    }
}

/// Runs the backfiller periodically on a [`Scheduler`].
#[derive(Clone)]
pub struct IndexBackfillerScheduler {
    inner: Arc<BackfillerSchedulerInner>,
}

struct BackfillerSchedulerInner {
    backfiller: IndexBackfiller,
    scheduler: Scheduler,
    pending: StdMutex<Option<DelayedOperation>>,
}

impl IndexBackfillerScheduler {
    pub fn new(backfiller: IndexBackfiller, scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(BackfillerSchedulerInner {
                backfiller,
                scheduler,
                pending: StdMutex::new(None),
            }),
        }
    }

    pub fn start(&self) {
        self.schedule(self.inner.backfiller.settings.initial_delay());
    }

    pub fn stop(&self) {
        if let Some(operation) = self.lock_pending().take() {
            operation.cancel();
        }
    }

    pub fn is_started(&self) -> bool {
        self.lock_pending().is_some()
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<DelayedOperation>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self, delay: Duration) {
        let this = self.clone();
        let scheduled = self
            .inner
            .scheduler
            .enqueue_after_delay(TimerId::IndexBackfill, delay, move || async move {
                match this.inner.backfiller.backfill().await {
                    Ok(processed) => LOGGER.debug(format!("Documents written to indexes: {processed}")),
                    Err(err) if err.is_primary_lease_lost() => {
                        LOGGER.debug("Ignoring primary lease loss during index backfill")
                    }
                    Err(err) => LOGGER.warn(format!("Index backfill failed: {err}")),
                }
                this.schedule(this.inner.backfiller.settings.regular_delay());
            });
        match scheduled {
            Ok(operation) => *self.lock_pending() = Some(operation),
            Err(err) => LOGGER.debug(format!("Not scheduling index backfill: {err}")),
        }
    }
}

impl Debug for IndexBackfillerScheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexBackfillerScheduler")
            .field("backfiller", &self.inner.backfiller)
            .field("started", &self.is_started())
            .finish()
    }
}
