use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{primary_lease_exclusive, FirestoreResult};
use crate::firestore::local::schema::LocalDatabase;
use crate::firestore::logger::LOGGER;

/// A lease older than this no longer blocks other processes.
pub const MAX_PRIMARY_ELIGIBLE_AGE_MS: i64 = 5_000;

/// Client metadata older than this is considered abandoned and garbage collected.
pub const MAX_CLIENT_AGE_MS: i64 = 30 * 60 * 1_000;

pub const CLIENT_METADATA_REFRESH_INTERVAL_MS: u64 = 4_000;

/// The single record naming the process allowed to run primary-only transactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryLeaseRecord {
    pub owner_id: String,
    pub lease_timestamp_ms: i64,
    pub allow_tab_synchronization: bool,
}

/// Liveness record written by every process sharing the storage directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadataRecord {
    pub client_id: String,
    pub update_time_ms: i64,
    pub network_enabled: bool,
    pub in_foreground: bool,
}

/// Wall clock used for lease timestamps.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Used to simulate lease expiry.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// The local process as seen by the lease algorithm.
#[derive(Clone, Debug)]
pub(crate) struct LeaseParticipant<'a> {
    pub client_id: &'a str,
    pub now_ms: i64,
    pub network_enabled: bool,
    pub in_foreground: bool,
    pub allow_tab_synchronization: bool,
}

/// True when `updated_ms` lies within `max_age_ms` before `now_ms`.
///
/// Timestamps in the future are rejected: they indicate clock skew between processes.
pub(crate) fn is_within_age(updated_ms: i64, max_age_ms: i64, now_ms: i64) -> bool {
    if updated_ms < now_ms - max_age_ms {
        false
    } else if updated_ms > now_ms {
        LOGGER.error(format!(
            "Detected an update time that is in the future: {updated_ms} > {now_ms}"
        ));
        false
    } else {
        true
    }
}

fn current_valid_lease<'d>(
    database: &'d LocalDatabase,
    participant: &LeaseParticipant<'_>,
    is_zombied: &dyn Fn(&str) -> bool,
) -> Option<&'d PrimaryLeaseRecord> {
    database.primary_lease.as_ref().filter(|lease| {
        is_within_age(
            lease.lease_timestamp_ms,
            MAX_PRIMARY_ELIGIBLE_AGE_MS,
            participant.now_ms,
        ) && !is_zombied(&lease.owner_id)
    })
}

/// Whether this process holds the lease record, regardless of its age.
pub(crate) fn holds_lease(database: &LocalDatabase, client_id: &str) -> bool {
    database
        .primary_lease
        .as_ref()
        .is_some_and(|lease| lease.owner_id == client_id)
}

/// Decides whether the participant may hold the lease.
///
/// Fails with the exclusive-lease error when a live process that opted out of tab
/// synchronization holds it.
pub(crate) fn can_act_as_primary(
    database: &LocalDatabase,
    participant: &LeaseParticipant<'_>,
    is_zombied: &dyn Fn(&str) -> bool,
) -> FirestoreResult<bool> {
    if let Some(lease) = current_valid_lease(database, participant, is_zombied) {
        if lease.owner_id == participant.client_id {
            if participant.network_enabled {
                return Ok(true);
            }
        } else if !lease.allow_tab_synchronization {
            return Err(primary_lease_exclusive());
        } else {
            return Ok(false);
        }
    }

    if participant.network_enabled && participant.in_foreground {
        return Ok(true);
    }

    // Yield to an active client with a better network state, or better visibility.
    let better_client_exists = active_clients(database, participant.now_ms, is_zombied)
        .filter(|client| client.client_id != participant.client_id)
        .any(|client| {
            let better_network = !participant.network_enabled && client.network_enabled;
            let better_visibility = !participant.in_foreground && client.in_foreground;
            let same_network = participant.network_enabled == client.network_enabled;
            better_network || (better_visibility && same_network)
        });
    Ok(!better_client_exists)
}

/// Fails when another live process holds the lease and either side opted out of sharing.
pub(crate) fn verify_allow_tab_synchronization(
    database: &LocalDatabase,
    participant: &LeaseParticipant<'_>,
    is_zombied: &dyn Fn(&str) -> bool,
) -> FirestoreResult<()> {
    if let Some(lease) = current_valid_lease(database, participant, is_zombied) {
        if lease.owner_id != participant.client_id
            && (!participant.allow_tab_synchronization || !lease.allow_tab_synchronization)
        {
            return Err(primary_lease_exclusive());
        }
    }
    Ok(())
}

pub(crate) fn acquire_or_extend_lease(database: &mut LocalDatabase, participant: &LeaseParticipant<'_>) {
    database.primary_lease = Some(PrimaryLeaseRecord {
        owner_id: participant.client_id.to_string(),
        lease_timestamp_ms: participant.now_ms,
        allow_tab_synchronization: participant.allow_tab_synchronization,
    });
}

/// Removes the lease if this process holds it. Returns whether anything was removed.
pub(crate) fn release_lease_if_held(database: &mut LocalDatabase, client_id: &str) -> bool {
    if holds_lease(database, client_id) {
        database.primary_lease = None;
        true
    } else {
        false
    }
}

pub(crate) fn write_client_metadata(database: &mut LocalDatabase, participant: &LeaseParticipant<'_>) {
    database.client_metadata.insert(
        participant.client_id.to_string(),
        ClientMetadataRecord {
            client_id: participant.client_id.to_string(),
            update_time_ms: participant.now_ms,
            network_enabled: participant.network_enabled,
            in_foreground: participant.in_foreground,
        },
    );
}

pub(crate) fn active_clients<'d>(
    database: &'d LocalDatabase,
    now_ms: i64,
    is_zombied: &'d dyn Fn(&str) -> bool,
) -> impl Iterator<Item = &'d ClientMetadataRecord> + 'd {
    database.client_metadata.values().filter(move |client| {
        is_within_age(client.update_time_ms, MAX_CLIENT_AGE_MS, now_ms)
            && !is_zombied(&client.client_id)
    })
}

/// Drops metadata of clients that have not been seen for `MAX_CLIENT_AGE_MS` and returns
/// their ids so the caller can clean up their zombie markers.
pub(crate) fn remove_inactive_clients(database: &mut LocalDatabase, now_ms: i64) -> Vec<String> {
    let inactive: Vec<String> = database
        .client_metadata
        .values()
        .filter(|client| client.update_time_ms < now_ms - MAX_CLIENT_AGE_MS)
        .map(|client| client.client_id.clone())
        .collect();
    for client_id in &inactive {
        database.client_metadata.remove(client_id);
    }
    inactive
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(client_id: &str, now_ms: i64) -> LeaseParticipant<'_> {
        LeaseParticipant {
            client_id,
            now_ms,
            network_enabled: true,
            in_foreground: true,
            allow_tab_synchronization: false,
        }
    }

    fn no_zombies(_: &str) -> bool {
        false
    }

    #[test]
    fn future_timestamps_are_not_within_age() {
        assert!(is_within_age(1_000, 5_000, 1_000));
        assert!(!is_within_age(2_000, 5_000, 1_000));
        assert!(!is_within_age(0, 500, 1_000));
    }

    #[test]
    fn exclusive_lease_blocks_other_clients() {
        let mut database = LocalDatabase::default();
        acquire_or_extend_lease(&mut database, &participant("a", 10_000));

        let err = can_act_as_primary(&database, &participant("b", 11_000), &no_zombies).unwrap_err();
        assert!(err.is_failed_precondition());
        assert!(verify_allow_tab_synchronization(&database, &participant("b", 11_000), &no_zombies)
            .is_err());

        // Expired leases no longer count.
        assert!(can_act_as_primary(&database, &participant("b", 20_000), &no_zombies).unwrap());
    }

    #[test]
    fn zombied_owner_releases_lease() {
        let mut database = LocalDatabase::default();
        acquire_or_extend_lease(&mut database, &participant("a", 10_000));
        let zombied = |id: &str| id == "a";
        assert!(can_act_as_primary(&database, &participant("b", 10_500), &zombied).unwrap());
    }

    #[test]
    fn cooperative_lease_is_not_eligible() {
        let mut database = LocalDatabase::default();
        let mut owner = participant("a", 10_000);
        owner.allow_tab_synchronization = true;
        acquire_or_extend_lease(&mut database, &owner);
        let mut other = participant("b", 10_100);
        other.allow_tab_synchronization = true;
        assert!(!can_act_as_primary(&database, &other, &no_zombies).unwrap());
        assert!(verify_allow_tab_synchronization(&database, &other, &no_zombies).is_ok());
    }

    #[test]
    fn background_client_yields_to_foreground_client() {
        let mut database = LocalDatabase::default();
        write_client_metadata(&mut database, &participant("a", 10_000));
        let mut background = participant("b", 10_000);
        background.in_foreground = false;
        assert!(!can_act_as_primary(&database, &background, &no_zombies).unwrap());

        let mut offline = participant("a", 10_000);
        offline.network_enabled = false;
        let mut database = LocalDatabase::default();
        write_client_metadata(&mut database, &participant("c", 10_000));
        assert!(!can_act_as_primary(&database, &offline, &no_zombies).unwrap());
    }

    #[test]
    fn inactive_clients_are_removed() {
        let mut database = LocalDatabase::default();
        write_client_metadata(&mut database, &participant("old", 0));
        write_client_metadata(&mut database, &participant("new", MAX_CLIENT_AGE_MS));
        let removed = remove_inactive_clients(&mut database, MAX_CLIENT_AGE_MS + 1);
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(database.client_metadata.contains_key("new"));
    }
}
