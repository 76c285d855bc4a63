pub mod core;
pub mod error;
pub mod local;
pub mod logger;
pub mod model;
pub mod remote;
pub mod value;

pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use local::{
    FilePersistence, FilePersistenceSettings, LocalStore, LruParams, MemoryPersistence,
    MemoryPersistenceSettings, Persistence,
};
