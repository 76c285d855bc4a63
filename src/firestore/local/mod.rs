pub mod bundle_cache;
pub mod document_overlay_cache;
pub mod file_persistence;
pub mod index_backfiller;
pub mod index_manager;
pub mod local_documents_view;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod memory_persistence;
pub mod mutation_queue;
pub mod persistence;
pub mod primary_lease;
pub mod query_engine;
pub mod reference_delegate;
pub mod reference_set;
pub mod remote_document_cache;
pub mod scheduler;
pub mod schema;
pub mod settings;
pub(crate) mod sqlite_store;
pub mod target_cache;

#[doc(inline)]
pub use bundle_cache::{BundleCache, BundleMetadata, BundledDocument, NamedQuery};
#[doc(inline)]
pub use document_overlay_cache::DocumentOverlayCache;
#[doc(inline)]
pub use file_persistence::FilePersistence;
#[doc(inline)]
pub use index_backfiller::{IndexBackfiller, IndexBackfillerScheduler};
#[doc(inline)]
pub use index_manager::{IndexManager, IndexType};
#[doc(inline)]
pub use local_documents_view::{LocalDocumentsResult, LocalDocumentsView};
#[doc(inline)]
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
#[doc(inline)]
pub use lru_garbage_collector::{LruGarbageCollector, LruResults, LruScheduler};
#[doc(inline)]
pub use memory_persistence::MemoryPersistence;
#[doc(inline)]
pub use mutation_queue::MutationQueue;
#[doc(inline)]
pub use persistence::{
    ListenSequenceNumber, Persistence, PersistenceTransaction, PrimaryStateListener, TransactionMode,
};
#[doc(inline)]
pub use primary_lease::{Clock, ManualClock, SystemClock};
#[doc(inline)]
pub use query_engine::{IndexAutoCreation, QueryContext, QueryEngine};
#[doc(inline)]
pub use reference_delegate::{EagerReferenceDelegate, LruReferenceDelegate, ReferenceDelegate};
#[doc(inline)]
pub use reference_set::ReferenceSet;
#[doc(inline)]
pub use remote_document_cache::RemoteDocumentCache;
#[doc(inline)]
pub use scheduler::{DelayedOperation, Scheduler, TimerId};
#[doc(inline)]
pub use settings::{
    FilePersistenceSettings, IndexBackfillerSettings, LruParams, MemoryGarbageCollector,
    MemoryPersistenceSettings,
};
#[doc(inline)]
pub use target_cache::TargetCache;
