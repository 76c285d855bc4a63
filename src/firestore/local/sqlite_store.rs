//! SQLite backing store of the durable persistence.
//!
//! Every object store is a table of `(key, value)` rows holding JSON. Keys are JSON arrays so
//! nested maps flatten into composite keys (`[user, batch_id]`, `[target_id, path]`). The
//! store keeps the last committed image in memory and writes back only the rows a
//! transaction touched.
//!
//! Other connections on the same file bump a per-section generation counter with every
//! write, so a cached section is reloaded only when someone else changed it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::firestore::core::{TargetData, TargetId};
use crate::firestore::error::{
    aborted, data_loss, failed_precondition, internal_error, unavailable, FirestoreError,
    FirestoreResult,
};
use crate::firestore::local::bundle_cache::{BundleMetadata, NamedQuery};
use crate::firestore::local::primary_lease::PrimaryLeaseRecord;
use crate::firestore::local::schema::{
    IndexEntry, LocalDatabase, MutationQueueMetadata, MutationQueueRecord, Table, TargetGlobal,
};
use crate::firestore::local::ListenSequenceNumber;
use crate::firestore::logger::LOGGER;
use crate::firestore::model::{BatchId, DocumentKey, MutationBatch, ResourcePath};

/// Version written to `PRAGMA user_version` once every migration step has run.
pub(crate) const SCHEMA_VERSION: i32 = 4;

const BUSY_TIMEOUT_MS: u64 = 5_000;

const GLOBALS: &str = "globals";
const MUTATION_QUEUES: &str = "mutation_queues";
const MUTATION_BATCHES: &str = "mutation_batches";
const DOCUMENT_MUTATIONS: &str = "document_mutations";
const OVERLAYS: &str = "overlays";
const REMOTE_DOCUMENTS: &str = "remote_documents";
const TARGETS: &str = "targets";
const TARGET_DOCUMENTS: &str = "target_documents";
const DOCUMENT_SEQUENCE_NUMBERS: &str = "document_sequence_numbers";
const FIELD_INDEXES: &str = "field_indexes";
const INDEX_STATES: &str = "index_states";
const INDEX_ENTRIES: &str = "index_entries";
const COLLECTION_PARENTS: &str = "collection_parents";
const CLIENT_METADATA: &str = "client_metadata";
const BUNDLES: &str = "bundles";
const NAMED_QUERIES: &str = "named_queries";

/// Sections of the image, each reloaded as a unit. The mutation queue section spans the
/// queue, batch and document index stores.
const SECTIONS: [&str; 14] = [
    GLOBALS,
    MUTATION_QUEUES,
    OVERLAYS,
    REMOTE_DOCUMENTS,
    TARGETS,
    TARGET_DOCUMENTS,
    DOCUMENT_SEQUENCE_NUMBERS,
    FIELD_INDEXES,
    INDEX_STATES,
    INDEX_ENTRIES,
    COLLECTION_PARENTS,
    CLIENT_METADATA,
    BUNDLES,
    NAMED_QUERIES,
];

const LAST_BATCH_ID: &str = "last_batch_id";
const REMOTE_DOCUMENT_SIZE: &str = "remote_document_size";
const TARGET_GLOBAL: &str = "target_global";
const PRIMARY_LEASE: &str = "primary_lease";

/// Open database file plus the image of its last committed state.
pub(crate) struct SqliteStore {
    connection: Connection,
    image: LocalDatabase,
    generations: BTreeMap<String, i64>,
}

impl SqliteStore {
    /// Opens or creates the database at `path` and brings its schema up to date.
    pub(crate) fn open(path: &Path) -> FirestoreResult<Self> {
        let mut connection = Connection::open(path).map_err(sql_error)?;
        connection
            .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
            .map_err(sql_error)?;
        apply_pragmas(&connection)?;
        migrate(&mut connection)?;

        let mut store = Self {
            connection,
            image: LocalDatabase::default(),
            generations: BTreeMap::new(),
        };
        store.run(false, |_| Ok(((), None)))?;
        Ok(store)
    }

    /// Runs `operation` against the current image inside one SQLite transaction.
    ///
    /// Write transactions take the database lock up front. When `operation` returns a new
    /// image its changed rows are written and the image replaces the cached one once the
    /// transaction committed.
    pub(crate) fn run<T>(
        &mut self,
        write: bool,
        operation: impl FnOnce(&LocalDatabase) -> FirestoreResult<(T, Option<LocalDatabase>)>,
    ) -> FirestoreResult<T> {
        let behavior = if write {
            TransactionBehavior::Immediate
        } else {
            TransactionBehavior::Deferred
        };
        let transaction = self
            .connection
            .transaction_with_behavior(behavior)
            .map_err(sql_error)?;

        let stored = read_generations(&transaction)?;
        for section in SECTIONS {
            let current = stored.get(section).copied().unwrap_or(0);
            if self.generations.get(section).copied() != Some(current) {
                load_section(&transaction, &mut self.image, section)?;
                self.generations.insert(section.to_string(), current);
            }
        }
        self.image.mark_clean();

        let (result, committed) = operation(&self.image)?;
        let Some(mut committed) = committed else {
            return Ok(result);
        };
        if !write {
            return Err(internal_error("Read-only transaction produced a new image"));
        }

        let mut writer = RowWriter::new(&transaction);
        writer.write_changes(&self.image, &committed)?;
        let touched = writer.finish()?;
        transaction.commit().map_err(sql_error)?;

        for section in touched {
            let generation = stored.get(section).copied().unwrap_or(0) + 1;
            self.generations.insert(section.to_string(), generation);
        }
        committed.mark_clean();
        self.image = committed;
        Ok(result)
    }

    /// Closes the connection, reporting errors that a plain drop would swallow.
    pub(crate) fn close(self) -> FirestoreResult<()> {
        self.connection.close().map_err(|(_, err)| sql_error(err))
    }
}

fn apply_pragmas(connection: &Connection) -> FirestoreResult<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .map_err(sql_error)?;
    connection
        .pragma_update(None, "synchronous", "FULL")
        .map_err(sql_error)?;
    Ok(())
}

fn migrate(connection: &mut Connection) -> FirestoreResult<()> {
    let transaction = connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(sql_error)?;
    let version: i32 = transaction
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(sql_error)?;
    if version > SCHEMA_VERSION {
        return Err(failed_precondition(format!(
            "Local store was written by a newer schema version ({version} > {SCHEMA_VERSION})"
        )));
    }
    if version == SCHEMA_VERSION {
        return Ok(());
    }
    LOGGER.debug(format!(
        "Upgrading local store schema from version {version} to {SCHEMA_VERSION}"
    ));
    create_or_upgrade(&transaction, version, SCHEMA_VERSION)?;
    transaction
        .pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(sql_error)?;
    transaction.commit().map_err(sql_error)
}

/// Runs the migration steps that take a store from version `from` to version `to`.
pub(crate) fn create_or_upgrade(connection: &Connection, from: i32, to: i32) -> FirestoreResult<()> {
    if from < 1 && to >= 1 {
        create_object_stores(
            connection,
            &[
                GLOBALS,
                MUTATION_QUEUES,
                MUTATION_BATCHES,
                DOCUMENT_MUTATIONS,
                OVERLAYS,
                REMOTE_DOCUMENTS,
                TARGETS,
                TARGET_DOCUMENTS,
                DOCUMENT_SEQUENCE_NUMBERS,
                FIELD_INDEXES,
                INDEX_STATES,
                INDEX_ENTRIES,
                COLLECTION_PARENTS,
                CLIENT_METADATA,
            ],
        )?;
        connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS store_generations (
                    section TEXT PRIMARY KEY NOT NULL,
                    generation INTEGER NOT NULL
                ) WITHOUT ROWID;",
            )
            .map_err(sql_error)?;
    }
    if from < 2 && to >= 2 {
        remove_acknowledged_batches(connection)?;
    }
    if from < 3 && to >= 3 {
        backfill_sequence_numbers(connection)?;
        rebuild_collection_parents(connection)?;
    }
    if from < 4 && to >= 4 {
        create_object_stores(connection, &[BUNDLES, NAMED_QUERIES])?;
    }
    Ok(())
}

fn create_object_stores(connection: &Connection, stores: &[&str]) -> FirestoreResult<()> {
    for store in stores {
        connection
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {store} (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL
                ) WITHOUT ROWID;"
            ))
            .map_err(sql_error)?;
    }
    Ok(())
}

/// Drops batches the backend already acknowledged. They were only kept until their overlays
/// were recomputed and hold no information a restart needs.
fn remove_acknowledged_batches(connection: &Connection) -> FirestoreResult<()> {
    let acknowledged: BTreeMap<String, BatchId> =
        read_rows::<(String,), MutationQueueMetadata>(connection, MUTATION_QUEUES)?
            .into_iter()
            .map(|((user,), metadata)| (user, metadata.last_acknowledged_batch_id))
            .collect();
    let mut document_mutations: BTreeMap<(String, DocumentKey), BTreeSet<BatchId>> =
        read_rows::<(String, DocumentKey), BTreeSet<BatchId>>(connection, DOCUMENT_MUTATIONS)?
            .into_iter()
            .collect();

    let mut writer = RowWriter::new(connection);
    for ((user, batch_id), batch) in
        read_rows::<(String, BatchId), MutationBatch>(connection, MUTATION_BATCHES)?
    {
        if acknowledged.get(&user).map_or(true, |last| batch_id > *last) {
            continue;
        }
        let user_key = to_value(&user)?;
        writer.delete(MUTATION_QUEUES, MUTATION_BATCHES, &row_key(&[user_key.clone()], &batch_id)?)?;
        for key in batch.keys() {
            let index_key = (user.clone(), key);
            let Some(ids) = document_mutations.get_mut(&index_key) else {
                continue;
            };
            ids.remove(&batch_id);
            let row = row_key(&[user_key.clone()], &index_key.1)?;
            if ids.is_empty() {
                document_mutations.remove(&index_key);
                writer.delete(MUTATION_QUEUES, DOCUMENT_MUTATIONS, &row)?;
            } else {
                writer.put(MUTATION_QUEUES, DOCUMENT_MUTATIONS, &row, &*ids)?;
            }
        }
    }
    writer.finish()?;
    Ok(())
}

/// Gives every cached document a sequence number so LRU collection can consider it.
fn backfill_sequence_numbers(connection: &Connection) -> FirestoreResult<()> {
    let mut globals = read_globals(connection)?;
    let highest = global::<TargetGlobal>(&mut globals, TARGET_GLOBAL)?
        .unwrap_or_default()
        .highest_listen_sequence_number;
    let existing: BTreeSet<DocumentKey> =
        read_rows::<(DocumentKey,), ListenSequenceNumber>(connection, DOCUMENT_SEQUENCE_NUMBERS)?
            .into_iter()
            .map(|((key,), _)| key)
            .collect();

    let mut writer = RowWriter::new(connection);
    for ((key,), _) in read_rows::<(DocumentKey,), Value>(connection, REMOTE_DOCUMENTS)? {
        if !existing.contains(&key) {
            writer.put(
                DOCUMENT_SEQUENCE_NUMBERS,
                DOCUMENT_SEQUENCE_NUMBERS,
                &row_key(&[], &key)?,
                &highest,
            )?;
        }
    }
    writer.finish()?;
    Ok(())
}

/// Records the parent of every collection that holds a cached or locally written document.
fn rebuild_collection_parents(connection: &Connection) -> FirestoreResult<()> {
    let before: BTreeMap<String, BTreeSet<ResourcePath>> =
        read_rows::<(String,), BTreeSet<ResourcePath>>(connection, COLLECTION_PARENTS)?
            .into_iter()
            .map(|((collection_id,), parents)| (collection_id, parents))
            .collect();
    let mut parents = before.clone();

    let remote = read_rows::<(DocumentKey,), Value>(connection, REMOTE_DOCUMENTS)?
        .into_iter()
        .map(|((key,), _)| key);
    let local = read_rows::<(String, DocumentKey), Value>(connection, DOCUMENT_MUTATIONS)?
        .into_iter()
        .map(|((_, key), _)| key);
    for key in remote.chain(local) {
        let collection = key.collection_path();
        if let Some(collection_id) = collection.last_segment() {
            parents
                .entry(collection_id.to_string())
                .or_default()
                .insert(collection.without_last());
        }
    }

    let mut writer = RowWriter::new(connection);
    for (collection_id, paths) in &parents {
        if before.get(collection_id) != Some(paths) {
            writer.put(
                COLLECTION_PARENTS,
                COLLECTION_PARENTS,
                &row_key(&[], collection_id)?,
                paths,
            )?;
        }
    }
    writer.finish()?;
    Ok(())
}

/// Maps SQLite failures onto the error codes callers retry on.
pub(crate) fn sql_error(err: rusqlite::Error) -> FirestoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                return aborted(format!("Local store is busy: {err}"));
            }
            ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt => {
                return data_loss(format!("Local store is corrupt: {err}"));
            }
            ErrorCode::CannotOpen | ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                return unavailable(format!("Local store cannot be opened: {err}"));
            }
            ErrorCode::DiskFull | ErrorCode::SystemIoFailure => {
                return aborted(format!("Failed to write local store: {err}"));
            }
            _ => {}
        }
    }
    internal_error(format!("Local store failed: {err}"))
}

fn corrupt(store: &str, err: serde_json::Error) -> FirestoreError {
    data_loss(format!("Local store is corrupt: undecodable row in {store}: {err}"))
}

fn to_value(value: &impl Serialize) -> FirestoreResult<Value> {
    serde_json::to_value(value)
        .map_err(|err| internal_error(format!("Failed to encode local store row: {err}")))
}

/// Encodes a composite row key: the prefix followed by `key`.
fn row_key(prefix: &[Value], key: &impl Serialize) -> FirestoreResult<String> {
    let mut parts = prefix.to_vec();
    parts.push(to_value(key)?);
    Ok(Value::Array(parts).to_string())
}

fn read_rows<K: DeserializeOwned, V: DeserializeOwned>(
    connection: &Connection,
    store: &str,
) -> FirestoreResult<Vec<(K, V)>> {
    let mut statement = connection
        .prepare_cached(&format!("SELECT key, value FROM {store}"))
        .map_err(sql_error)?;
    let rows = statement
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(sql_error)?;
    let mut decoded = Vec::new();
    for row in rows {
        let (key, value) = row.map_err(sql_error)?;
        let key = serde_json::from_str(&key).map_err(|err| corrupt(store, err))?;
        let value = serde_json::from_str(&value).map_err(|err| corrupt(store, err))?;
        decoded.push((key, value));
    }
    Ok(decoded)
}

fn read_generations(connection: &Connection) -> FirestoreResult<BTreeMap<String, i64>> {
    let mut statement = connection
        .prepare_cached("SELECT section, generation FROM store_generations")
        .map_err(sql_error)?;
    let rows = statement
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(sql_error)?;
    let generations = rows.collect::<Result<BTreeMap<_, _>, _>>().map_err(sql_error);
    generations
}

fn read_globals(connection: &Connection) -> FirestoreResult<BTreeMap<String, Value>> {
    Ok(read_rows::<(String,), Value>(connection, GLOBALS)?
        .into_iter()
        .map(|((name,), value)| (name, value))
        .collect())
}

fn global<T: DeserializeOwned>(
    globals: &mut BTreeMap<String, Value>,
    name: &str,
) -> FirestoreResult<Option<T>> {
    globals
        .remove(name)
        .map(|value| serde_json::from_value(value).map_err(|err| corrupt(GLOBALS, err)))
        .transpose()
}

fn group<A: Ord, B: Ord, V>(rows: Vec<((A, B), V)>) -> BTreeMap<A, BTreeMap<B, V>> {
    let mut grouped: BTreeMap<A, BTreeMap<B, V>> = BTreeMap::new();
    for ((outer, inner), value) in rows {
        grouped.entry(outer).or_default().insert(inner, value);
    }
    grouped
}

fn flat<K: Ord, V>(rows: Vec<((K,), V)>) -> Table<K, V> {
    rows.into_iter().map(|((key,), value)| (key, value)).collect()
}

fn nest<A: Ord, B: Ord, V>(rows: Vec<((A, B), V)>) -> Table<A, Table<B, V>> {
    group(rows)
        .into_iter()
        .map(|(outer, rows)| (outer, Table::from(rows)))
        .collect()
}

fn nest3<A: Ord, B: Ord, C: Ord, V>(
    rows: Vec<((A, B, C), V)>,
) -> Table<A, Table<B, Table<C, V>>> {
    let pairs = rows
        .into_iter()
        .map(|((a, b, c), value)| ((a, (b, c)), value))
        .collect();
    group(pairs)
        .into_iter()
        .map(|(outer, rows)| (outer, nest(rows.into_iter().collect())))
        .collect()
}

fn load_section(
    connection: &Connection,
    image: &mut LocalDatabase,
    section: &str,
) -> FirestoreResult<()> {
    match section {
        GLOBALS => {
            let mut globals = read_globals(connection)?;
            image.last_batch_id = global(&mut globals, LAST_BATCH_ID)?.unwrap_or_default();
            image.remote_document_size =
                global(&mut globals, REMOTE_DOCUMENT_SIZE)?.unwrap_or_default();
            image.target_global = global(&mut globals, TARGET_GLOBAL)?.unwrap_or_default();
            image.primary_lease =
                global::<Option<PrimaryLeaseRecord>>(&mut globals, PRIMARY_LEASE)?.flatten();
        }
        MUTATION_QUEUES => image.mutation_queues = load_mutation_queues(connection)?,
        OVERLAYS => image.overlays = nest(read_rows(connection, OVERLAYS)?),
        REMOTE_DOCUMENTS => image.remote_documents = flat(read_rows(connection, REMOTE_DOCUMENTS)?),
        TARGETS => image.targets = flat(read_rows::<(TargetId,), TargetData>(connection, TARGETS)?),
        TARGET_DOCUMENTS => {
            image.target_documents = nest(read_rows(connection, TARGET_DOCUMENTS)?);
        }
        DOCUMENT_SEQUENCE_NUMBERS => {
            image.document_sequence_numbers =
                flat(read_rows(connection, DOCUMENT_SEQUENCE_NUMBERS)?);
        }
        FIELD_INDEXES => image.field_indexes = flat(read_rows(connection, FIELD_INDEXES)?),
        INDEX_STATES => image.index_states = nest(read_rows(connection, INDEX_STATES)?),
        INDEX_ENTRIES => {
            image.index_entries =
                nest3(read_rows::<(String, i32, DocumentKey), Vec<IndexEntry>>(connection, INDEX_ENTRIES)?);
        }
        COLLECTION_PARENTS => {
            image.collection_parents = flat(read_rows(connection, COLLECTION_PARENTS)?);
        }
        CLIENT_METADATA => image.client_metadata = flat(read_rows(connection, CLIENT_METADATA)?),
        BUNDLES => {
            image.bundles = flat(read_rows::<(String,), BundleMetadata>(connection, BUNDLES)?);
        }
        NAMED_QUERIES => {
            image.named_queries = flat(read_rows::<(String,), NamedQuery>(connection, NAMED_QUERIES)?);
        }
        _ => return Err(internal_error(format!("Unknown local store section {section}"))),
    }
    Ok(())
}

fn load_mutation_queues(connection: &Connection) -> FirestoreResult<Table<String, MutationQueueRecord>> {
    let mut queues: BTreeMap<String, MutationQueueRecord> = BTreeMap::new();
    for ((user,), metadata) in read_rows::<(String,), MutationQueueMetadata>(connection, MUTATION_QUEUES)? {
        queues.entry(user).or_default().metadata = metadata;
    }
    for (user, batches) in
        group(read_rows::<(String, BatchId), MutationBatch>(connection, MUTATION_BATCHES)?)
    {
        queues.entry(user).or_default().batches = Table::from(batches);
    }
    for (user, keys) in group(read_rows::<(String, DocumentKey), BTreeSet<BatchId>>(
        connection,
        DOCUMENT_MUTATIONS,
    )?) {
        queues.entry(user).or_default().document_mutations = Table::from(keys);
    }
    Ok(Table::from(queues))
}

/// Keys that differ between two versions of a table.
fn changed_keys<K: Ord + Clone, V: Clone + PartialEq>(
    old: Option<&Table<K, V>>,
    new: Option<&Table<K, V>>,
) -> BTreeSet<K> {
    match (old, new) {
        (None, None) => BTreeSet::new(),
        (Some(table), None) | (None, Some(table)) => table.keys().cloned().collect(),
        (Some(old), Some(new)) => {
            if new.shares_rows_with(old) {
                return BTreeSet::new();
            }
            if let Some(dirty) = new.dirty_keys() {
                return dirty.clone();
            }
            old.keys()
                .chain(new.keys())
                .filter(|key| old.get(*key) != new.get(*key))
                .cloned()
                .collect()
        }
    }
}

/// Writes rows inside an open transaction and remembers which sections it touched.
struct RowWriter<'c> {
    connection: &'c Connection,
    touched: BTreeSet<&'static str>,
}

impl<'c> RowWriter<'c> {
    fn new(connection: &'c Connection) -> Self {
        Self {
            connection,
            touched: BTreeSet::new(),
        }
    }

    fn put(
        &mut self,
        section: &'static str,
        store: &str,
        key: &str,
        value: &impl Serialize,
    ) -> FirestoreResult<()> {
        let value = serde_json::to_string(value)
            .map_err(|err| internal_error(format!("Failed to encode local store row: {err}")))?;
        self.connection
            .prepare_cached(&format!(
                "INSERT OR REPLACE INTO {store} (key, value) VALUES (?1, ?2)"
            ))
            .and_then(|mut statement| statement.execute(params![key, value]))
            .map_err(sql_error)?;
        self.touched.insert(section);
        Ok(())
    }

    fn delete(&mut self, section: &'static str, store: &str, key: &str) -> FirestoreResult<()> {
        self.connection
            .prepare_cached(&format!("DELETE FROM {store} WHERE key = ?1"))
            .and_then(|mut statement| statement.execute(params![key]))
            .map_err(sql_error)?;
        self.touched.insert(section);
        Ok(())
    }

    /// Brings the rows under `prefix` in line with `new`.
    fn sync_rows<K, V>(
        &mut self,
        section: &'static str,
        store: &str,
        prefix: &[Value],
        old: Option<&Table<K, V>>,
        new: Option<&Table<K, V>>,
    ) -> FirestoreResult<()>
    where
        K: Ord + Clone + Serialize,
        V: Clone + PartialEq + Serialize,
    {
        for key in changed_keys(old, new) {
            let row = row_key(prefix, &key)?;
            match new.and_then(|table| table.get(&key)) {
                Some(value) => self.put(section, store, &row, value)?,
                None => self.delete(section, store, &row)?,
            }
        }
        Ok(())
    }

    fn sync_nested<A, B, V>(
        &mut self,
        section: &'static str,
        store: &str,
        old: &Table<A, Table<B, V>>,
        new: &Table<A, Table<B, V>>,
    ) -> FirestoreResult<()>
    where
        A: Ord + Clone + Serialize,
        B: Ord + Clone + Serialize,
        V: Clone + PartialEq + Serialize,
    {
        for outer in changed_keys(Some(old), Some(new)) {
            let prefix = [to_value(&outer)?];
            self.sync_rows(section, store, &prefix, old.get(&outer), new.get(&outer))?;
        }
        Ok(())
    }

    fn sync_global<T: PartialEq + Serialize>(&mut self, name: &str, old: &T, new: &T) -> FirestoreResult<()> {
        if old != new {
            self.put(GLOBALS, GLOBALS, &row_key(&[], &name)?, new)?;
        }
        Ok(())
    }

    fn write_changes(&mut self, old: &LocalDatabase, new: &LocalDatabase) -> FirestoreResult<()> {
        self.sync_global(LAST_BATCH_ID, &old.last_batch_id, &new.last_batch_id)?;
        self.sync_global(
            REMOTE_DOCUMENT_SIZE,
            &old.remote_document_size,
            &new.remote_document_size,
        )?;
        self.sync_global(TARGET_GLOBAL, &old.target_global, &new.target_global)?;
        self.sync_global(PRIMARY_LEASE, &old.primary_lease, &new.primary_lease)?;

        for user in changed_keys(Some(&old.mutation_queues), Some(&new.mutation_queues)) {
            let old_queue = old.mutation_queues.get(&user);
            let new_queue = new.mutation_queues.get(&user);
            let prefix = [to_value(&user)?];
            let metadata_row = row_key(&[], &user)?;
            match new_queue {
                Some(queue) if old_queue.map(|old| &old.metadata) != Some(&queue.metadata) => {
                    self.put(MUTATION_QUEUES, MUTATION_QUEUES, &metadata_row, &queue.metadata)?;
                }
                Some(_) => {}
                None => self.delete(MUTATION_QUEUES, MUTATION_QUEUES, &metadata_row)?,
            }
            self.sync_rows(
                MUTATION_QUEUES,
                MUTATION_BATCHES,
                &prefix,
                old_queue.map(|queue| &queue.batches),
                new_queue.map(|queue| &queue.batches),
            )?;
            self.sync_rows(
                MUTATION_QUEUES,
                DOCUMENT_MUTATIONS,
                &prefix,
                old_queue.map(|queue| &queue.document_mutations),
                new_queue.map(|queue| &queue.document_mutations),
            )?;
        }

        self.sync_nested(OVERLAYS, OVERLAYS, &old.overlays, &new.overlays)?;
        self.sync_rows(
            REMOTE_DOCUMENTS,
            REMOTE_DOCUMENTS,
            &[],
            Some(&old.remote_documents),
            Some(&new.remote_documents),
        )?;
        self.sync_rows(TARGETS, TARGETS, &[], Some(&old.targets), Some(&new.targets))?;
        self.sync_nested(
            TARGET_DOCUMENTS,
            TARGET_DOCUMENTS,
            &old.target_documents,
            &new.target_documents,
        )?;
        self.sync_rows(
            DOCUMENT_SEQUENCE_NUMBERS,
            DOCUMENT_SEQUENCE_NUMBERS,
            &[],
            Some(&old.document_sequence_numbers),
            Some(&new.document_sequence_numbers),
        )?;
        self.sync_rows(
            FIELD_INDEXES,
            FIELD_INDEXES,
            &[],
            Some(&old.field_indexes),
            Some(&new.field_indexes),
        )?;
        self.sync_nested(INDEX_STATES, INDEX_STATES, &old.index_states, &new.index_states)?;
        for user in changed_keys(Some(&old.index_entries), Some(&new.index_entries)) {
            let empty = Table::default();
            let old_indexes = old.index_entries.get(&user).unwrap_or(&empty);
            let new_indexes = new.index_entries.get(&user).unwrap_or(&empty);
            let user_key = to_value(&user)?;
            for index_id in changed_keys(Some(old_indexes), Some(new_indexes)) {
                let prefix = [user_key.clone(), to_value(&index_id)?];
                self.sync_rows(
                    INDEX_ENTRIES,
                    INDEX_ENTRIES,
                    &prefix,
                    old_indexes.get(&index_id),
                    new_indexes.get(&index_id),
                )?;
            }
        }
        self.sync_rows(
            COLLECTION_PARENTS,
            COLLECTION_PARENTS,
            &[],
            Some(&old.collection_parents),
            Some(&new.collection_parents),
        )?;
        self.sync_rows(
            CLIENT_METADATA,
            CLIENT_METADATA,
            &[],
            Some(&old.client_metadata),
            Some(&new.client_metadata),
        )?;
        self.sync_rows(BUNDLES, BUNDLES, &[], Some(&old.bundles), Some(&new.bundles))?;
        self.sync_rows(
            NAMED_QUERIES,
            NAMED_QUERIES,
            &[],
            Some(&old.named_queries),
            Some(&new.named_queries),
        )?;
        Ok(())
    }

    /// Bumps the generation of every touched section so other connections reload it.
    fn finish(self) -> FirestoreResult<BTreeSet<&'static str>> {
        for section in &self.touched {
            self.connection
                .prepare_cached(
                    "INSERT INTO store_generations (section, generation) VALUES (?1, 1)
                     ON CONFLICT(section) DO UPDATE SET generation = generation + 1",
                )
                .and_then(|mut statement| statement.execute(params![section]))
                .map_err(sql_error)?;
        }
        Ok(self.touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::schema::RemoteDocumentRecord;
    use crate::firestore::model::{Mutation, MutableDocument, SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_FILE: AtomicUsize = AtomicUsize::new(0);

    fn temp_file(name: &str) -> PathBuf {
        let id = NEXT_FILE.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "firestore-sqlite-{name}-{}-{id}",
            std::process::id()
        ));
        fs::remove_dir_all(&dir).ok();
        fs::create_dir_all(&dir).unwrap();
        dir.join("store.sqlite")
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn record(path: &str, version: i64) -> RemoteDocumentRecord {
        RemoteDocumentRecord {
            document: MutableDocument::new_found_document(
                key(path),
                SnapshotVersion::from_micros(version),
                MapValue::empty(),
            ),
            size: 10,
        }
    }

    fn batch(batch_id: BatchId, path: &str) -> MutationBatch {
        MutationBatch::new(
            batch_id,
            Timestamp::new(1, 0),
            Vec::new(),
            vec![Mutation::delete(key(path))],
        )
    }

    fn write(store: &mut SqliteStore, change: impl FnOnce(&mut LocalDatabase)) {
        store
            .run(true, |image| {
                let mut next = image.clone();
                change(&mut next);
                Ok(((), Some(next)))
            })
            .unwrap();
    }

    fn count_rows(path: &Path, store: &str) -> i64 {
        let connection = Connection::open(path).unwrap();
        connection
            .query_row(&format!("SELECT COUNT(*) FROM {store}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn committed_rows_survive_reopening() {
        let path = temp_file("reopen");
        let mut store = SqliteStore::open(&path).unwrap();
        write(&mut store, |image| {
            image.remote_documents.insert(key("rooms/a"), record("rooms/a", 3));
            image.remote_document_size = 10;
            image.target_documents.entry_or_default(2).insert(key("rooms/a"), ());
            let queue = image.mutation_queues.entry_or_default("alice".to_string());
            queue.batches.insert(1, batch(1, "rooms/b"));
            queue
                .document_mutations
                .insert(key("rooms/b"), BTreeSet::from([1]));
            image.last_batch_id = 1;
        });
        store.close().unwrap();

        let store = SqliteStore::open(&path).unwrap();
        let image = &store.image;
        assert_eq!(image.remote_documents.get(&key("rooms/a")), Some(&record("rooms/a", 3)));
        assert_eq!(image.remote_document_size, 10);
        assert!(image.target_documents[&2].contains_key(&key("rooms/a")));
        assert_eq!(image.last_batch_id, 1);
        let queue = &image.mutation_queues["alice"];
        assert_eq!(queue.batches.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(queue.document_mutations[&key("rooms/b")], BTreeSet::from([1]));
    }

    #[test]
    fn removed_entries_delete_their_rows() {
        let path = temp_file("remove");
        let mut store = SqliteStore::open(&path).unwrap();
        write(&mut store, |image| {
            image.remote_documents.insert(key("rooms/a"), record("rooms/a", 1));
            image.remote_documents.insert(key("rooms/b"), record("rooms/b", 1));
            image.target_documents.entry_or_default(2).insert(key("rooms/a"), ());
        });
        assert_eq!(count_rows(&path, REMOTE_DOCUMENTS), 2);

        write(&mut store, |image| {
            image.remote_documents.remove(&key("rooms/a"));
            image.target_documents.remove(&2);
        });
        assert_eq!(count_rows(&path, REMOTE_DOCUMENTS), 1);
        assert_eq!(count_rows(&path, TARGET_DOCUMENTS), 0);
    }

    #[test]
    fn recreated_inner_tables_drop_stale_rows() {
        let path = temp_file("recreate");
        let mut store = SqliteStore::open(&path).unwrap();
        write(&mut store, |image| {
            let keys = image.target_documents.entry_or_default(2);
            keys.insert(key("rooms/a"), ());
            keys.insert(key("rooms/b"), ());
        });

        write(&mut store, |image| {
            image.target_documents.remove(&2);
            image.target_documents.entry_or_default(2).insert(key("rooms/c"), ());
        });
        store.close().unwrap();

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.image.target_documents[&2].keys().cloned().collect::<Vec<_>>(),
            vec![key("rooms/c")]
        );
    }

    #[test]
    fn failed_operations_write_nothing() {
        let path = temp_file("failed");
        let mut store = SqliteStore::open(&path).unwrap();
        write(&mut store, |image| {
            image.remote_documents.insert(key("rooms/a"), record("rooms/a", 1));
        });

        let result: FirestoreResult<()> = store.run(true, |_| Err(aborted("boom")));
        assert!(result.is_err());
        let untouched = store
            .run(false, |image| Ok((image.remote_documents.len(), None)))
            .unwrap();
        assert_eq!(untouched, 1);
        assert_eq!(count_rows(&path, REMOTE_DOCUMENTS), 1);
    }

    #[test]
    fn other_connections_see_committed_writes() {
        let path = temp_file("shared");
        let mut first = SqliteStore::open(&path).unwrap();
        let mut second = SqliteStore::open(&path).unwrap();

        write(&mut first, |image| {
            image.remote_documents.insert(key("rooms/a"), record("rooms/a", 1));
        });
        let seen = second
            .run(false, |image| Ok((image.remote_documents.contains_key(&key("rooms/a")), None)))
            .unwrap();
        assert!(seen);

        write(&mut second, |image| {
            image.remote_documents.remove(&key("rooms/a"));
        });
        let seen = first
            .run(false, |image| Ok((image.remote_documents.len(), None)))
            .unwrap();
        assert_eq!(seen, 0);
    }

    #[test]
    fn empty_file_opens_as_a_fresh_store() {
        let path = temp_file("empty");
        fs::write(&path, b"").unwrap();
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.image.remote_documents.is_empty());
    }

    #[test]
    fn torn_file_is_data_loss() {
        let path = temp_file("torn");
        let mut bytes = b"SQLite format 3\0".to_vec();
        bytes.extend(std::iter::repeat(0xFF).take(84));
        fs::write(&path, bytes).unwrap();
        let err = SqliteStore::open(&path).err().unwrap();
        assert_eq!(err.code_str(), "firestore/data-loss");
    }

    #[test]
    fn newer_schema_is_refused() {
        let path = temp_file("newer");
        SqliteStore::open(&path).unwrap().close().unwrap();
        Connection::open(&path)
            .unwrap()
            .pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        let err = SqliteStore::open(&path).err().unwrap();
        assert!(err.is_failed_precondition());
    }

    #[test]
    fn upgrading_cleans_up_version_one_stores() {
        let path = temp_file("upgrade");
        {
            let connection = Connection::open(&path).unwrap();
            create_or_upgrade(&connection, 0, 1).unwrap();
            connection.pragma_update(None, "user_version", 1).unwrap();

            let user = Value::from("alice");
            let mut writer = RowWriter::new(&connection);
            let metadata = MutationQueueMetadata {
                last_acknowledged_batch_id: 1,
                last_stream_token: Vec::new(),
            };
            writer
                .put(MUTATION_QUEUES, MUTATION_QUEUES, &row_key(&[], &"alice").unwrap(), &metadata)
                .unwrap();
            for batch_id in [1, 2] {
                writer
                    .put(
                        MUTATION_QUEUES,
                        MUTATION_BATCHES,
                        &row_key(&[user.clone()], &batch_id).unwrap(),
                        &batch(batch_id, "rooms/a"),
                    )
                    .unwrap();
            }
            writer
                .put(
                    MUTATION_QUEUES,
                    DOCUMENT_MUTATIONS,
                    &row_key(&[user.clone()], &key("rooms/a")).unwrap(),
                    &BTreeSet::from([1, 2]),
                )
                .unwrap();
            writer
                .put(
                    REMOTE_DOCUMENTS,
                    REMOTE_DOCUMENTS,
                    &row_key(&[], &key("halls/b")).unwrap(),
                    &record("halls/b", 1),
                )
                .unwrap();
            let target_global = TargetGlobal {
                highest_listen_sequence_number: 7,
                ..TargetGlobal::default()
            };
            writer
                .put(GLOBALS, GLOBALS, &row_key(&[], &TARGET_GLOBAL).unwrap(), &target_global)
                .unwrap();
            writer.finish().unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let queue = &store.image.mutation_queues["alice"];
        assert_eq!(queue.batches.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(queue.document_mutations[&key("rooms/a")], BTreeSet::from([2]));
        assert_eq!(store.image.document_sequence_numbers.get(&key("halls/b")), Some(&7));
        assert!(store.image.collection_parents["halls"].contains(&ResourcePath::root()));
        assert!(store.image.collection_parents["rooms"].contains(&ResourcePath::root()));
        assert_eq!(count_rows(&path, BUNDLES), 0);
    }
}
