use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::core::User;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::schema::LocalDatabase;
use crate::firestore::local::{
    BundleCache, DocumentOverlayCache, IndexManager, MutationQueue, ReferenceDelegate,
    RemoteDocumentCache, TargetCache,
};
use crate::firestore::model::DocumentKeySet;

/// Logical clock value stamped on every transaction, used by LRU garbage collection.
pub type ListenSequenceNumber = i64;

pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Invoked with `true` when this process becomes primary and `false` when it loses the lease.
pub type PrimaryStateListener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, and only allowed while this process holds the primary lease.
    ReadWritePrimary,
}

impl TransactionMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, TransactionMode::ReadOnly)
    }

    pub fn requires_primary(&self) -> bool {
        matches!(self, TransactionMode::ReadWritePrimary)
    }
}

/// Scoped access to the storage image. Every cache operation takes one of these.
///
/// Changes made through the transaction become visible to other transactions only after the
/// operation that received it returns successfully.
pub struct PersistenceTransaction<'a> {
    pub(crate) database: &'a mut LocalDatabase,
    mode: TransactionMode,
    current_sequence_number: ListenSequenceNumber,
    /// Documents that may have lost their last reference in this transaction.
    pub(crate) orphaned_documents: DocumentKeySet,
}

impl<'a> PersistenceTransaction<'a> {
    pub(crate) fn new(
        database: &'a mut LocalDatabase,
        mode: TransactionMode,
        current_sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            database,
            mode,
            current_sequence_number,
            orphaned_documents: DocumentKeySet::new(),
        }
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.current_sequence_number
    }
}

impl Debug for PersistenceTransaction<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceTransaction")
            .field("mode", &self.mode)
            .field("current_sequence_number", &self.current_sequence_number)
            .finish()
    }
}

pub type TransactionOperation<'o> =
    dyn FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<()> + Send + 'o;

/// Storage backend of the local store.
///
/// Implementations hand out component handles and run operations atomically. The durable
/// implementation also decides which of several processes sharing the same directory is
/// allowed to run primary-only transactions.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Opens the storage and, for multi-process backends, joins the lease protocol.
    async fn start(&self) -> FirestoreResult<()>;

    /// Releases every resource. With `delete_data` the stored image is removed as well.
    async fn shutdown(&self, delete_data: bool) -> FirestoreResult<()>;

    fn is_started(&self) -> bool;

    fn is_primary(&self) -> bool;

    /// Registers the listener and invokes it once with the current state.
    fn set_primary_state_listener(&self, listener: PrimaryStateListener);

    async fn set_network_enabled(&self, enabled: bool) -> FirestoreResult<()>;

    async fn set_in_foreground(&self, in_foreground: bool) -> FirestoreResult<()>;

    fn reference_delegate(&self) -> Arc<dyn ReferenceDelegate>;

    fn index_manager(&self, user: &User) -> IndexManager {
        IndexManager::new(user)
    }

    fn mutation_queue(&self, user: &User, index_manager: IndexManager) -> MutationQueue {
        MutationQueue::new(user, index_manager, self.reference_delegate())
    }

    fn document_overlay_cache(&self, user: &User) -> DocumentOverlayCache {
        DocumentOverlayCache::new(user)
    }

    fn remote_document_cache(&self) -> RemoteDocumentCache {
        RemoteDocumentCache::new()
    }

    fn target_cache(&self) -> TargetCache {
        TargetCache::new(self.reference_delegate())
    }

    fn bundle_cache(&self) -> BundleCache {
        BundleCache::new()
    }

    /// Ids of the processes currently sharing this storage, this one included. Backends
    /// without multi-process support report none.
    async fn get_active_clients(&self) -> FirestoreResult<Vec<String>> {
        Ok(Vec::new())
    }

    /// Object-safe transaction entry point. Prefer [`run_transaction`](dyn Persistence::run_transaction).
    async fn run_transaction_dyn(
        &self,
        action: &str,
        mode: TransactionMode,
        operation: &mut TransactionOperation<'_>,
    ) -> FirestoreResult<()>;
}

impl dyn Persistence {
    /// Runs `operation` in a transaction of the given mode and returns its result.
    pub async fn run_transaction<T, F>(
        &self,
        action: &str,
        mode: TransactionMode,
        mut operation: F,
    ) -> FirestoreResult<T>
    where
        T: Send,
        F: FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<T> + Send,
    {
        let mut output = None;
        self.run_transaction_dyn(action, mode, &mut |txn: &mut PersistenceTransaction<'_>| {
            output = Some(operation(txn)?);
            Ok(())
        })
        .await?;
        output.ok_or_else(|| internal_error(format!("Transaction '{action}' produced no result")))
    }
}

/// Issues sequence numbers that never go backwards, even across restarts.
#[derive(Debug, Default)]
pub(crate) struct ListenSequence {
    last_issued: ListenSequenceNumber,
}

impl ListenSequence {
    pub(crate) fn next(&mut self, persisted_highest: ListenSequenceNumber) -> ListenSequenceNumber {
        self.last_issued = self.last_issued.max(persisted_highest) + 1;
        self.last_issued
    }
}

/// Runs `operation` against a private copy of `image` and returns the copy to commit.
///
/// The copy shares every table with `image` until the operation writes to it. Read-only
/// transactions and failed operations return `None`, leaving `image` untouched.
pub(crate) fn run_against_copy(
    image: &LocalDatabase,
    mode: TransactionMode,
    sequence_number: ListenSequenceNumber,
    reference_delegate: &dyn ReferenceDelegate,
    operation: &mut TransactionOperation<'_>,
) -> FirestoreResult<Option<LocalDatabase>> {
    let mut working = image.clone();
    {
        let mut txn = PersistenceTransaction::new(&mut working, mode, sequence_number);
        operation(&mut txn)?;
        reference_delegate.on_transaction_committed(&mut txn)?;
    }
    if mode.is_read_only() {
        return Ok(None);
    }
    let global = &mut working.target_global;
    global.highest_listen_sequence_number =
        global.highest_listen_sequence_number.max(sequence_number);
    Ok(Some(working))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_never_regress() {
        let mut sequence = ListenSequence::default();
        assert_eq!(sequence.next(0), 1);
        assert_eq!(sequence.next(0), 2);
        assert_eq!(sequence.next(10), 11);
        assert_eq!(sequence.next(3), 12);
    }

    #[test]
    fn modes() {
        assert!(TransactionMode::ReadOnly.is_read_only());
        assert!(TransactionMode::ReadWritePrimary.requires_primary());
        assert!(!TransactionMode::ReadWrite.requires_primary());
    }
}
