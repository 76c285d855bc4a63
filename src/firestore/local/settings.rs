//! Configuration for the persistence backends and background tasks.
//!
//! Every settings type has a `Default` matching the documented defaults and validates
//! values at construction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Default cache size threshold above which LRU collection runs (40 MB).
pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
/// Smallest accepted cache size threshold (1 MB).
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
pub const DEFAULT_COLLECTION_PERCENTILE: u32 = 10;
pub const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1_000;

pub const DEFAULT_MAX_DOCUMENTS_TO_PROCESS: usize = 50;
pub const DEFAULT_BACKFILL_INITIAL_DELAY: Duration = Duration::from_secs(15);
pub const DEFAULT_BACKFILL_REGULAR_DELAY: Duration = Duration::from_secs(60);

/// Tuning of the LRU garbage collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    cache_size_collection_threshold: i64,
    percentile_to_collect: u32,
    maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    /// Cache size value that turns collection off.
    pub const COLLECTION_DISABLED: i64 = -1;

    pub fn new(
        cache_size_collection_threshold: i64,
        percentile_to_collect: u32,
        maximum_sequence_numbers_to_collect: usize,
    ) -> FirestoreResult<Self> {
        validate_cache_size(cache_size_collection_threshold)?;
        if percentile_to_collect > 100 {
            return Err(invalid_argument(format!(
                "percentile_to_collect must be between 0 and 100, got {percentile_to_collect}"
            )));
        }
        Ok(Self {
            cache_size_collection_threshold,
            percentile_to_collect,
            maximum_sequence_numbers_to_collect,
        })
    }

    /// Default percentages with a custom size threshold.
    pub fn with_cache_size(cache_size: i64) -> FirestoreResult<Self> {
        Self::new(
            cache_size,
            DEFAULT_COLLECTION_PERCENTILE,
            DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        )
    }

    pub fn disabled() -> Self {
        Self {
            cache_size_collection_threshold: Self::COLLECTION_DISABLED,
            ..Self::default()
        }
    }

    pub fn cache_size_collection_threshold(&self) -> i64 {
        self.cache_size_collection_threshold
    }

    pub fn percentile_to_collect(&self) -> u32 {
        self.percentile_to_collect
    }

    pub fn maximum_sequence_numbers_to_collect(&self) -> usize {
        self.maximum_sequence_numbers_to_collect
    }

    pub fn is_disabled(&self) -> bool {
        self.cache_size_collection_threshold == Self::COLLECTION_DISABLED
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: DEFAULT_COLLECTION_PERCENTILE,
            maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        }
    }
}

fn validate_cache_size(value: i64) -> FirestoreResult<()> {
    if value != LruParams::COLLECTION_DISABLED && value < MINIMUM_CACHE_SIZE_BYTES {
        return Err(invalid_argument(format!(
            "cache size must be at least {MINIMUM_CACHE_SIZE_BYTES} bytes or disabled, got {value}"
        )));
    }
    Ok(())
}

/// How the in-memory persistence reclaims documents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MemoryGarbageCollector {
    /// Delete documents as soon as nothing references them.
    #[default]
    Eager,
    /// Keep documents until an LRU pass collects them.
    Lru(LruParams),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryPersistenceSettings {
    garbage_collector: MemoryGarbageCollector,
}

impl MemoryPersistenceSettings {
    pub fn new(garbage_collector: MemoryGarbageCollector) -> Self {
        Self { garbage_collector }
    }

    pub fn garbage_collector(&self) -> MemoryGarbageCollector {
        self.garbage_collector
    }
}

/// Settings of the durable, directory-backed persistence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilePersistenceSettings {
    directory: PathBuf,
    allow_tab_synchronization: bool,
    lru_params: LruParams,
}

impl FilePersistenceSettings {
    pub fn new(directory: impl Into<PathBuf>) -> FirestoreResult<Self> {
        let directory = directory.into();
        if directory.as_os_str().is_empty() {
            return Err(invalid_argument("persistence directory must not be empty"));
        }
        Ok(Self {
            directory,
            allow_tab_synchronization: false,
            lru_params: LruParams::default(),
        })
    }

    /// Lets other processes share the storage while this one is primary.
    pub fn with_allow_tab_synchronization(mut self, allow: bool) -> Self {
        self.allow_tab_synchronization = allow;
        self
    }

    pub fn with_lru_params(mut self, lru_params: LruParams) -> Self {
        self.lru_params = lru_params;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn allow_tab_synchronization(&self) -> bool {
        self.allow_tab_synchronization
    }

    pub fn lru_params(&self) -> LruParams {
        self.lru_params
    }
}

/// Settings of the periodic index backfiller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexBackfillerSettings {
    max_documents_to_process: usize,
    initial_delay: Duration,
    regular_delay: Duration,
}

impl IndexBackfillerSettings {
    pub fn new(
        max_documents_to_process: usize,
        initial_delay: Duration,
        regular_delay: Duration,
    ) -> FirestoreResult<Self> {
        if max_documents_to_process == 0 {
            return Err(invalid_argument("max_documents_to_process must be greater than zero"));
        }
        Ok(Self {
            max_documents_to_process,
            initial_delay,
            regular_delay,
        })
    }

    pub fn max_documents_to_process(&self) -> usize {
        self.max_documents_to_process
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn regular_delay(&self) -> Duration {
        self.regular_delay
    }
}

impl Default for IndexBackfillerSettings {
    fn default() -> Self {
        Self {
            max_documents_to_process: DEFAULT_MAX_DOCUMENTS_TO_PROCESS,
            initial_delay: DEFAULT_BACKFILL_INITIAL_DELAY,
            regular_delay: DEFAULT_BACKFILL_REGULAR_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_defaults() {
        let params = LruParams::default();
        assert_eq!(params.cache_size_collection_threshold(), 40 * 1024 * 1024);
        assert_eq!(params.percentile_to_collect(), 10);
        assert_eq!(params.maximum_sequence_numbers_to_collect(), 1_000);
        assert!(LruParams::disabled().is_disabled());
    }

    #[test]
    fn lru_params_validate_cache_size() {
        assert!(LruParams::with_cache_size(MINIMUM_CACHE_SIZE_BYTES).is_ok());
        assert!(LruParams::with_cache_size(LruParams::COLLECTION_DISABLED).is_ok());
        let err = LruParams::with_cache_size(1024).unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(LruParams::new(DEFAULT_CACHE_SIZE_BYTES, 101, 10).is_err());
    }

    #[test]
    fn file_settings_builder() {
        let settings = FilePersistenceSettings::new("/tmp/store")
            .unwrap()
            .with_allow_tab_synchronization(true);
        assert!(settings.allow_tab_synchronization());
        assert_eq!(settings.lru_params(), LruParams::default());
        assert!(FilePersistenceSettings::new("").is_err());
    }

    #[test]
    fn backfiller_defaults() {
        let settings = IndexBackfillerSettings::default();
        assert_eq!(settings.max_documents_to_process(), 50);
        assert_eq!(settings.initial_delay(), Duration::from_secs(15));
        assert_eq!(settings.regular_delay(), Duration::from_secs(60));
        assert!(IndexBackfillerSettings::new(0, Duration::ZERO, Duration::ZERO).is_err());
    }
}
