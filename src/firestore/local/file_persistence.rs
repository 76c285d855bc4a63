use std::fmt::{self, Debug, Formatter};
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_lock::Mutex;
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::firestore::error::{
    aborted, failed_precondition, primary_lease_lost, unavailable, FirestoreResult,
};
use crate::firestore::local::persistence::{
    run_against_copy, ListenSequence, PrimaryStateListener, TransactionMode, TransactionOperation,
};
use crate::firestore::local::primary_lease::{
    self, Clock, LeaseParticipant, SystemClock, CLIENT_METADATA_REFRESH_INTERVAL_MS,
    MAX_CLIENT_AGE_MS,
};
use crate::firestore::local::scheduler::{DelayedOperation, Scheduler, TimerId};
use crate::firestore::local::schema::LocalDatabase;
use crate::firestore::local::settings::FilePersistenceSettings;
use crate::firestore::local::sqlite_store::SqliteStore;
use crate::firestore::local::{LruParams, LruReferenceDelegate, Persistence, ReferenceDelegate};
use crate::firestore::logger::LOGGER;
use crate::platform::runtime::{run_blocking, spawn_detached};

const STORE_FILE: &str = "store.sqlite";
/// Files SQLite keeps next to the store in WAL mode.
const STORE_SIDE_FILES: [&str; 2] = ["-wal", "-shm"];
const ZOMBIE_PREFIX: &str = "zombie_";
const CLIENT_ID_LENGTH: usize = 20;

/// Durable persistence keeping its object stores in a SQLite database inside a directory.
///
/// Several processes may open the same directory. SQLite isolates their transactions and a
/// primary lease recorded in the store decides which process may run primary-only
/// transactions. Documents are always reclaimed through LRU collection.
pub struct FilePersistence {
    inner: Arc<FileInner>,
}

struct FileInner {
    settings: FilePersistenceSettings,
    clock: Arc<dyn Clock>,
    client_id: String,
    reference_delegate: Arc<dyn ReferenceDelegate>,
    /// Serializes transactions of this process; SQLite isolates processes.
    gate: Mutex<()>,
    store: StdMutex<Option<SqliteStore>>,
    sequence: StdMutex<ListenSequence>,
    state: StdMutex<ClientState>,
    primary_listener: StdMutex<Option<PrimaryStateListener>>,
    scheduler: Scheduler,
    refresher: StdMutex<Option<DelayedOperation>>,
}

#[derive(Debug)]
struct ClientState {
    started: bool,
    is_primary: bool,
    network_enabled: bool,
    in_foreground: bool,
    last_garbage_collection_ms: Option<i64>,
}

impl FilePersistence {
    pub fn new(settings: FilePersistenceSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Uses `clock` for lease and metadata timestamps.
    pub fn with_clock(settings: FilePersistenceSettings, clock: Arc<dyn Clock>) -> Self {
        let client_id = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CLIENT_ID_LENGTH)
            .map(char::from)
            .collect();
        Self {
            inner: Arc::new(FileInner {
                settings,
                clock,
                client_id,
                reference_delegate: Arc::new(LruReferenceDelegate::new()),
                gate: Mutex::new(()),
                store: StdMutex::new(None),
                sequence: StdMutex::new(ListenSequence::default()),
                state: StdMutex::new(ClientState {
                    started: false,
                    is_primary: false,
                    network_enabled: true,
                    in_foreground: true,
                    last_garbage_collection_ms: None,
                }),
                primary_listener: StdMutex::new(None),
                scheduler: Scheduler::new(),
                refresher: StdMutex::new(None),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn directory(&self) -> &Path {
        self.inner.settings.directory()
    }

    pub fn lru_params(&self) -> LruParams {
        self.inner.settings.lru_params()
    }

    /// Scheduler running the lease refresher. Other background tasks may share it.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Writes the zombie marker as if the process had died.
    pub fn mark_zombied(&self) -> FirestoreResult<()> {
        self.inner.write_zombie_marker()
    }
}

impl FileInner {
    fn path(&self, name: &str) -> PathBuf {
        self.settings.directory().join(name)
    }

    fn zombie_path(&self, client_id: &str) -> PathBuf {
        self.path(&format!("{ZOMBIE_PREFIX}{client_id}"))
    }

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_client_zombied(&self, client_id: &str) -> bool {
        client_id != self.client_id && self.zombie_path(client_id).exists()
    }

    fn participant(&self) -> (i64, bool, bool) {
        let state = self.lock_state();
        (self.clock.now_millis(), state.network_enabled, state.in_foreground)
    }

    fn write_zombie_marker(&self) -> FirestoreResult<()> {
        File::create(self.zombie_path(&self.client_id))
            .map(|_| ())
            .map_err(|err| aborted(format!("Failed to write zombie marker: {err}")))
    }

    fn remove_zombie_marker(&self, client_id: &str) {
        if let Err(err) = fs::remove_file(self.zombie_path(client_id)) {
            if err.kind() != ErrorKind::NotFound {
                LOGGER.debug(format!("Failed to remove zombie marker of {client_id}: {err}"));
            }
        }
    }

    /// Runs `work` against the open store, off the async executor where possible.
    fn with_store<T>(
        &self,
        work: impl FnOnce(&mut SqliteStore) -> FirestoreResult<T>,
    ) -> FirestoreResult<T> {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        match store.as_mut() {
            Some(store) => run_blocking(|| work(store)),
            None => Err(failed_precondition("Local store is not open")),
        }
    }

    fn close_store(&self) {
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(store) = store {
            if let Err(err) = run_blocking(|| store.close()) {
                LOGGER.debug(format!("Failed to close local store: {err}"));
            }
        }
    }

    fn delete_store_files(&self) -> FirestoreResult<()> {
        let main = self.path(STORE_FILE);
        let side = STORE_SIDE_FILES
            .iter()
            .map(|suffix| self.path(&format!("{STORE_FILE}{suffix}")));
        for path in std::iter::once(main).chain(side) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(aborted(format!(
                        "Failed to delete {}: {err}",
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Records the primary state and notifies the listener when it changed.
    fn set_primary(&self, is_primary: bool) {
        let changed = {
            let mut state = self.lock_state();
            let changed = state.is_primary != is_primary;
            state.is_primary = is_primary;
            changed
        };
        if !changed {
            return;
        }
        let listener = self
            .primary_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            spawn_detached(async move { listener(is_primary) });
        }
    }

    /// Writes this client's metadata and acquires, extends or gives up the lease.
    async fn update_client_metadata_and_try_become_primary(&self) -> FirestoreResult<()> {
        let _gate = self.gate.lock().await;
        let (now_ms, network_enabled, in_foreground) = self.participant();
        let participant = LeaseParticipant {
            client_id: &self.client_id,
            now_ms,
            network_enabled,
            in_foreground,
            allow_tab_synchronization: self.settings.allow_tab_synchronization(),
        };
        let is_zombied = |client_id: &str| self.is_client_zombied(client_id);

        let can_act_as_primary = self.with_store(|store| {
            store.run(true, |image| {
                let mut database = image.clone();
                primary_lease::write_client_metadata(&mut database, &participant);
                let can_act_as_primary =
                    match primary_lease::can_act_as_primary(&database, &participant, &is_zombied) {
                        Ok(eligible) => eligible,
                        Err(err) => {
                            LOGGER.debug(format!("Staying secondary: {}", err.message()));
                            false
                        }
                    };
                if can_act_as_primary {
                    primary_lease::acquire_or_extend_lease(&mut database, &participant);
                    self.garbage_collect_client_state(&mut database, now_ms);
                } else if primary_lease::release_lease_if_held(&mut database, &self.client_id) {
                    LOGGER.debug(format!("Client {} released the primary lease", self.client_id));
                }
                Ok((can_act_as_primary, Some(database)))
            })
        })?;
        self.set_primary(can_act_as_primary);
        Ok(())
    }

    /// Removes metadata and zombie markers of clients that have been gone for a long time.
    fn garbage_collect_client_state(&self, database: &mut LocalDatabase, now_ms: i64) {
        let mut state = self.lock_state();
        let due = state
            .last_garbage_collection_ms
            .map_or(true, |last| now_ms - last > MAX_CLIENT_AGE_MS);
        if !due {
            return;
        }
        state.last_garbage_collection_ms = Some(now_ms);
        drop(state);
        for client_id in primary_lease::remove_inactive_clients(database, now_ms) {
            LOGGER.debug(format!("Removing metadata of inactive client {client_id}"));
            self.remove_zombie_marker(&client_id);
        }
    }

    fn cancel_refresher(&self) {
        if let Some(operation) = self
            .refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            operation.cancel();
        }
    }
}

fn schedule_refresh(inner: &Arc<FileInner>) {
    let weak: Weak<FileInner> = Arc::downgrade(inner);
    let scheduled = inner.scheduler.enqueue_after_delay(
        TimerId::ClientMetadataRefresh,
        Duration::from_millis(CLIENT_METADATA_REFRESH_INTERVAL_MS),
        move || async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.lock_state().started {
                return;
            }
            if let Err(err) = inner.update_client_metadata_and_try_become_primary().await {
                LOGGER.debug(format!("Failed to refresh client metadata: {err}"));
            }
            schedule_refresh(&inner);
        },
    );
    match scheduled {
        Ok(operation) => {
            *inner
                .refresher
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(operation);
        }
        Err(err) => LOGGER.debug(format!("Not scheduling client metadata refresh: {err}")),
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn start(&self) -> FirestoreResult<()> {
        let inner = &self.inner;
        fs::create_dir_all(inner.settings.directory()).map_err(|err| {
            unavailable(format!(
                "Persistence directory {} is not usable: {err}",
                inner.settings.directory().display()
            ))
        })?;
        let store = run_blocking(|| SqliteStore::open(&inner.path(STORE_FILE)))?;
        *inner.store.lock().unwrap_or_else(PoisonError::into_inner) = Some(store);

        inner.lock_state().started = true;
        inner.update_client_metadata_and_try_become_primary().await?;
        if !self.is_primary() && !inner.settings.allow_tab_synchronization() {
            LOGGER.warn(format!(
                "Client {} started as secondary; another client holds the primary lease",
                inner.client_id
            ));
        }
        schedule_refresh(inner);
        Ok(())
    }

    async fn shutdown(&self, delete_data: bool) -> FirestoreResult<()> {
        let inner = &self.inner;
        if !inner.lock_state().started {
            return Ok(());
        }
        inner.write_zombie_marker()?;
        inner.cancel_refresher();
        inner.scheduler.shutdown();

        {
            let _gate = inner.gate.lock().await;
            inner.with_store(|store| {
                store.run(true, |image| {
                    let mut database = image.clone();
                    primary_lease::release_lease_if_held(&mut database, &inner.client_id);
                    database.client_metadata.remove(&inner.client_id);
                    Ok(((), Some(database)))
                })
            })?;
            inner.close_store();
            if delete_data {
                inner.delete_store_files()?;
            }
        }

        inner.remove_zombie_marker(&inner.client_id);
        {
            let mut state = inner.lock_state();
            state.started = false;
            state.is_primary = false;
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.inner.lock_state().started
    }

    fn is_primary(&self) -> bool {
        self.inner.lock_state().is_primary
    }

    fn set_primary_state_listener(&self, listener: PrimaryStateListener) {
        *self
            .inner
            .primary_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&listener));
        listener(self.is_primary());
    }

    async fn set_network_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        let changed = {
            let mut state = self.inner.lock_state();
            let changed = state.network_enabled != enabled;
            state.network_enabled = enabled;
            changed && state.started
        };
        if changed {
            self.inner.update_client_metadata_and_try_become_primary().await?;
        }
        Ok(())
    }

    async fn set_in_foreground(&self, in_foreground: bool) -> FirestoreResult<()> {
        let changed = {
            let mut state = self.inner.lock_state();
            let changed = state.in_foreground != in_foreground;
            state.in_foreground = in_foreground;
            changed && state.started
        };
        if changed {
            self.inner.update_client_metadata_and_try_become_primary().await?;
        }
        Ok(())
    }

    fn reference_delegate(&self) -> Arc<dyn ReferenceDelegate> {
        Arc::clone(&self.inner.reference_delegate)
    }

    async fn run_transaction_dyn(
        &self,
        action: &str,
        mode: TransactionMode,
        operation: &mut TransactionOperation<'_>,
    ) -> FirestoreResult<()> {
        let inner = &self.inner;
        if !inner.lock_state().started {
            return Err(failed_precondition(format!(
                "Cannot run '{action}': persistence is not started"
            )));
        }
        log::debug!("Starting transaction: {action} ({mode:?})");

        let _gate = inner.gate.lock().await;
        let (now_ms, network_enabled, in_foreground) = inner.participant();
        let participant = LeaseParticipant {
            client_id: &inner.client_id,
            now_ms,
            network_enabled,
            in_foreground,
            allow_tab_synchronization: inner.settings.allow_tab_synchronization(),
        };
        let is_zombied = |client_id: &str| inner.is_client_zombied(client_id);

        let outcome = inner.with_store(|store| {
            store.run(!mode.is_read_only(), |database| {
                if mode.requires_primary() {
                    if !primary_lease::holds_lease(database, &inner.client_id) {
                        let eligible =
                            primary_lease::can_act_as_primary(database, &participant, &is_zombied)
                                .unwrap_or(false);
                        if !eligible {
                            LOGGER.error(format!(
                                "Failed to obtain primary lease for action '{action}'"
                            ));
                            return Err(primary_lease_lost());
                        }
                    }
                } else {
                    primary_lease::verify_allow_tab_synchronization(
                        database,
                        &participant,
                        &is_zombied,
                    )?;
                }

                let sequence_number = inner
                    .sequence
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .next(database.target_global.highest_listen_sequence_number);
                let committed = run_against_copy(
                    database,
                    mode,
                    sequence_number,
                    inner.reference_delegate.as_ref(),
                    operation,
                )?;
                let committed = committed.map(|mut committed: LocalDatabase| {
                    if mode.requires_primary() {
                        primary_lease::acquire_or_extend_lease(&mut committed, &participant);
                    }
                    committed
                });
                Ok(((), committed))
            })
        });
        match outcome {
            Err(err) if err.is_primary_lease_lost() => {
                inner.set_primary(false);
                Err(err)
            }
            Err(err) => Err(err),
            Ok(()) => {
                if mode.requires_primary() {
                    inner.set_primary(true);
                }
                Ok(())
            }
        }
    }

    async fn get_active_clients(&self) -> FirestoreResult<Vec<String>> {
        let inner = &self.inner;
        let _gate = inner.gate.lock().await;
        let now_ms = inner.clock.now_millis();
        let is_zombied = |client_id: &str| inner.is_client_zombied(client_id);
        inner.with_store(|store| {
            store.run(false, |database| {
                let clients = primary_lease::active_clients(database, now_ms, &is_zombied)
                    .map(|client| client.client_id.clone())
                    .collect();
                Ok((clients, None))
            })
        })
    }
}

impl Drop for FilePersistence {
    fn drop(&mut self) {
        let started = self.inner.lock_state().started;
        if !started {
            return;
        }
        // Abrupt termination: tell the other clients not to wait for the lease to expire.
        if let Err(err) = self.inner.write_zombie_marker() {
            LOGGER.warn(format!("Failed to mark client as zombied: {err}"));
        }
        self.inner.cancel_refresher();
        self.inner.scheduler.shutdown();
    }
}

impl Debug for FilePersistence {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePersistence")
            .field("directory", &self.inner.settings.directory())
            .field("client_id", &self.inner.client_id)
            .field("state", &*self.inner.lock_state())
            .finish()
    }
}
