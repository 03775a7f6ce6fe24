use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    time::Duration,
};
use tracing::{debug, error, info, warn};

use super::allocation::{Allocation, now_secs};
use super::store::{
    RegistryCounters, RegistryError, STATE_FILE_VERSION, StateSnapshot, StateStore, StoredAllocation,
};
use crate::config::{LimitsTable, RegistrySettings};
use crate::shared_types::{ClientId, Purpose};

// -----------------------------------------------------------------------------
// ----- ClientIdRegistry ------------------------------------------------------

/// Hands out collision-free client ids per purpose and remembers them across
/// restarts. Every method takes the single state lock, so the registry can be
/// shared between async tasks and plain threads alike.
#[derive(Debug)]
pub struct ClientIdRegistry {
    limits: LimitsTable,
    stale_after: Duration,
    state: Mutex<RegistryState>,
    store: Option<StateStore>,
}

#[derive(Debug, Default)]
struct RegistryState {
    allocations: BTreeMap<ClientId, Allocation>,
    counters: RegistryCounters,
    // Bumped on every mutation; the store drops snapshots older than disk.
    generation: u64,
    last_saved_at: Option<f64>,
    last_save_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub inactive_removed: usize,
    pub stale_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurposeUsage {
    pub allocated: usize,
    pub active: usize,
    pub range_size: usize,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub by_purpose: BTreeMap<Purpose, PurposeUsage>,
    pub total_allocated: usize,
    pub total_active: usize,
    pub counters: RegistryCounters,
    pub state_file: Option<PathBuf>,
    pub last_saved_at: Option<f64>,
    pub last_save_error: Option<String>,
}

// -----------------------------------------------------------------------------
// ----- ClientIdRegistry: Static ----------------------------------------------

impl ClientIdRegistry {
    /// Loads the snapshot named by `settings.state_file` (if any). A missing
    /// or unreadable file starts the registry empty; stale entries are purged
    /// before anyone can see them.
    pub fn new(limits: LimitsTable, settings: &RegistrySettings) -> Self {
        let store = settings.state_file.clone().map(StateStore::new);
        let registry = Self {
            limits,
            stale_after: settings.stale_after,
            state: Mutex::new(RegistryState::default()),
            store,
        };
        registry.load();
        registry
    }

    pub fn in_memory(limits: LimitsTable, stale_after: Duration) -> Self {
        Self::new(
            limits,
            &RegistrySettings {
                state_file: None,
                stale_after,
            },
        )
    }

    pub fn limits(&self) -> &LimitsTable {
        &self.limits
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }
}

// -----------------------------------------------------------------------------
// ----- ClientIdRegistry: Public ----------------------------------------------

impl ClientIdRegistry {
    /// Reserves an id in `purpose`'s range. `preferred` wins when it is free
    /// and in range; otherwise the lowest free id is returned. `None` means
    /// the range is exhausted, which is a capacity signal rather than an error.
    pub fn allocate(
        &self,
        purpose: Purpose,
        owner: &str,
        preferred: Option<ClientId>,
    ) -> Option<ClientId> {
        let limit = self.limits.get(purpose);
        let now = now_secs();

        let (picked, pending) = {
            let mut state = self.state.lock();
            self.reclaim_stale_locked(&mut state, now);

            let taken: BTreeSet<ClientId> = state.allocations.keys().copied().collect();
            let preferred = preferred.filter(|id| {
                let ok = limit.contains(*id);
                if !ok {
                    debug!(client_id = id, %purpose, "preferred id outside purpose range; ignoring");
                }
                ok
            });

            let picked = match preferred {
                Some(id) if !taken.contains(&id) => Some(id),
                _ => limit.ids().find(|id| !taken.contains(id)),
            };

            match picked {
                Some(id) => {
                    state
                        .allocations
                        .insert(id, Allocation::new(id, purpose, owner, now));
                    state.counters.total_allocations += 1;
                }
                None => state.counters.exhausted += 1,
            }

            (picked, self.snapshot_locked(&mut state, now))
        };

        self.persist(pending);

        match picked {
            Some(id) => debug!(client_id = id, %purpose, owner, "allocated client id"),
            None => warn!(%purpose, owner, "client id range exhausted"),
        }
        picked
    }

    /// Releases `id`. Returns `false` when nothing was allocated under it.
    pub fn deallocate(&self, id: ClientId, owner: &str) -> bool {
        let now = now_secs();
        let (removed, pending) = {
            let mut state = self.state.lock();
            let Some(removed) = state.allocations.remove(&id) else {
                return false;
            };
            state.counters.total_deallocations += 1;
            (removed, self.snapshot_locked(&mut state, now))
        };

        self.persist(pending);

        if removed.allocated_by != owner {
            warn!(
                client_id = id,
                owner,
                allocated_by = %removed.allocated_by,
                "client id released by a different owner"
            );
        }
        debug!(client_id = id, purpose = %removed.purpose, owner, "deallocated client id");
        true
    }

    pub fn touch(&self, id: ClientId) -> bool {
        self.mutate(id, |alloc, now| {
            alloc.last_seen = now;
            alloc.use_count += 1;
        })
    }

    pub fn mark_inactive(&self, id: ClientId) -> bool {
        self.mutate(id, |alloc, _| alloc.active = false)
    }

    pub fn get(&self, id: ClientId) -> Option<Allocation> {
        self.state.lock().allocations.get(&id).cloned()
    }

    pub fn list_by_purpose(&self, purpose: Purpose) -> Vec<Allocation> {
        self.state
            .lock()
            .allocations
            .values()
            .filter(|a| a.purpose == purpose)
            .cloned()
            .collect()
    }

    /// Reclaims inactive allocations unseen for longer than the stale
    /// threshold. Runs implicitly on every allocate and on load.
    pub fn reclaim_stale(&self) -> usize {
        let now = now_secs();
        let (reclaimed, pending) = {
            let mut state = self.state.lock();
            let reclaimed = self.reclaim_stale_locked(&mut state, now);
            if reclaimed == 0 {
                return 0;
            }
            (reclaimed, self.snapshot_locked(&mut state, now))
        };

        self.persist(pending);
        reclaimed
    }

    /// Drops every inactive allocation, plus any allocation unseen for longer
    /// than the stale threshold whether or not it is still marked active.
    pub fn force_cleanup(&self) -> CleanupReport {
        let now = now_secs();
        let (report, pending) = {
            let mut state = self.state.lock();
            let mut report = CleanupReport::default();

            let stale_after = self.stale_after;
            state.allocations.retain(|_, alloc| {
                if !alloc.active {
                    report.inactive_removed += 1;
                    return false;
                }
                if alloc.age_since_seen(now) > stale_after {
                    report.stale_removed += 1;
                    return false;
                }
                true
            });

            let removed = (report.inactive_removed + report.stale_removed) as u64;
            state.counters.stale_reclaimed += removed;
            (report, self.snapshot_locked(&mut state, now))
        };

        self.persist(pending);
        info!(
            inactive_removed = report.inactive_removed,
            stale_removed = report.stale_removed,
            "forced client id cleanup"
        );
        report
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();

        let mut by_purpose: BTreeMap<Purpose, PurposeUsage> = self
            .limits
            .iter()
            .map(|(purpose, limit)| {
                let usage = PurposeUsage {
                    range_size: limit.capacity(),
                    max_concurrent: limit.max_concurrent,
                    ..Default::default()
                };
                (purpose, usage)
            })
            .collect();

        for alloc in state.allocations.values() {
            let usage = by_purpose.entry(alloc.purpose).or_default();
            usage.allocated += 1;
            if alloc.active {
                usage.active += 1;
            }
        }

        RegistryStats {
            total_allocated: state.allocations.len(),
            total_active: state.allocations.values().filter(|a| a.active).count(),
            by_purpose,
            counters: state.counters,
            state_file: self.store.as_ref().map(|s| s.path().to_path_buf()),
            last_saved_at: state.last_saved_at,
            last_save_error: state.last_save_error.clone(),
        }
    }

    /// Writes the current state to disk now, surfacing any IO failure.
    pub fn save(&self) -> Result<(), RegistryError> {
        let store = self.store.as_ref().ok_or(RegistryError::NoStateFile)?;
        let now = now_secs();
        let (generation, bytes) = {
            let mut state = self.state.lock();
            self.encode_locked(&mut state, now)
                .map_err(|source| RegistryError::Json { source })?
        };

        if let Err(e) = store.write(generation, &bytes) {
            self.record_save(Err(e.to_string()));
            return Err(e);
        }
        self.record_save(Ok(now));
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- ClientIdRegistry: Private ---------------------------------------------

impl ClientIdRegistry {
    fn mutate(&self, id: ClientId, f: impl FnOnce(&mut Allocation, f64)) -> bool {
        let now = now_secs();
        let pending = {
            let mut state = self.state.lock();
            let Some(alloc) = state.allocations.get_mut(&id) else {
                return false;
            };
            f(alloc, now);
            self.snapshot_locked(&mut state, now)
        };

        self.persist(pending);
        true
    }

    fn reclaim_stale_locked(&self, state: &mut RegistryState, now: f64) -> usize {
        let stale_after = self.stale_after;
        let before = state.allocations.len();

        state.allocations.retain(|id, alloc| {
            let stale = alloc.is_stale(now, stale_after);
            if stale {
                info!(
                    client_id = id,
                    purpose = %alloc.purpose,
                    allocated_by = %alloc.allocated_by,
                    "reclaiming stale client id"
                );
            }
            !stale
        });

        let reclaimed = before - state.allocations.len();
        state.counters.stale_reclaimed += reclaimed as u64;
        reclaimed
    }

    /// Serialises the state under the lock; the caller writes it after
    /// releasing the lock. `None` when there is no store.
    fn snapshot_locked(&self, state: &mut RegistryState, now: f64) -> Option<(u64, Vec<u8>)> {
        self.store.as_ref()?;

        match self.encode_locked(state, now) {
            Ok(pending) => Some(pending),
            Err(e) => {
                error!("failed to serialise client id registry: {e}");
                state.last_save_error = Some(e.to_string());
                None
            }
        }
    }

    fn encode_locked(
        &self,
        state: &mut RegistryState,
        now: f64,
    ) -> Result<(u64, Vec<u8>), serde_json::Error> {
        state.generation += 1;
        let snapshot = StateSnapshot {
            version: STATE_FILE_VERSION,
            allocations: state
                .allocations
                .iter()
                .map(|(id, alloc)| (id.to_string(), alloc))
                .collect(),
            stats: &state.counters,
            saved_at: now,
        };

        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        Ok((state.generation, bytes))
    }

    /// Failures are logged; in-memory state stays authoritative.
    fn persist(&self, pending: Option<(u64, Vec<u8>)>) {
        let (Some(store), Some((generation, bytes))) = (self.store.as_ref(), pending) else {
            return;
        };

        let now = now_secs();
        match store.write(generation, &bytes) {
            Ok(_) => self.record_save(Ok(now)),
            Err(e) => {
                error!("failed to persist client id registry: {e}");
                self.record_save(Err(e.to_string()));
            }
        }
    }

    fn record_save(&self, outcome: Result<f64, String>) {
        let mut state = self.state.lock();
        match outcome {
            Ok(at) => {
                state.last_saved_at = Some(at);
                state.last_save_error = None;
            }
            Err(e) => state.last_save_error = Some(e),
        }
    }

    fn load(&self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };

        let file = match store.load() {
            Ok(Some(file)) => file,
            Ok(None) => {
                info!(path = ?store.path(), "no client id snapshot yet; starting empty");
                return;
            }
            Err(e) => {
                error!(path = ?store.path(), "ignoring unreadable client id snapshot: {e}");
                return;
            }
        };

        if let Some(version) = file.version.filter(|v| *v > STATE_FILE_VERSION) {
            warn!(version, "client id snapshot written by a newer version; loading known fields");
        }

        let now = now_secs();
        let mut state = self.state.lock();
        state.counters = file.stats;

        for (key, stored) in file.allocations {
            let Some(alloc) = self.restore(&key, stored, now) else {
                continue;
            };
            if state.allocations.insert(alloc.client_id, alloc).is_some() {
                warn!(key = %key, "duplicate client id in snapshot; keeping the last entry");
            }
        }

        let reclaimed = self.reclaim_stale_locked(&mut state, now);
        info!(
            allocations = state.allocations.len(),
            reclaimed,
            path = ?store.path(),
            "loaded client id snapshot"
        );
    }

    fn restore(&self, key: &str, stored: StoredAllocation, now: f64) -> Option<Allocation> {
        let Some(id) = stored.id.or_else(|| key.parse().ok()) else {
            warn!(key, "dropping snapshot entry without a usable id");
            return None;
        };

        // Entries predating purpose tags fall back to whichever range owns the id.
        let purpose = match stored.purpose.as_deref().map(str::parse::<Purpose>) {
            Some(Ok(purpose)) => purpose,
            Some(Err(e)) => {
                warn!(client_id = id, "dropping snapshot entry: {e}");
                return None;
            }
            None => self.limits.purpose_of(id)?,
        };

        if !self.limits.get(purpose).contains(id) {
            warn!(client_id = id, %purpose, "dropping snapshot entry outside its purpose range");
            return None;
        }

        let allocated_at = stored.allocated_at.unwrap_or(now);
        Some(Allocation {
            client_id: id,
            purpose,
            allocated_at,
            allocated_by: stored.allocated_by.unwrap_or_else(|| "unknown".to_string()),
            last_seen: stored.last_seen.unwrap_or(allocated_at),
            // Whoever held it belonged to a previous process. It ages out
            // through stale reclamation unless released first.
            active: false,
            use_count: stored.use_count,
        })
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PurposeLimit;
    use std::sync::Arc;

    const HOUR: Duration = Duration::from_secs(3600);

    fn registry() -> ClientIdRegistry {
        ClientIdRegistry::in_memory(LimitsTable::default(), HOUR)
    }

    fn backdate(registry: &ClientIdRegistry, id: ClientId, by: Duration) {
        let mut state = registry.state.lock();
        let alloc = state.allocations.get_mut(&id).unwrap();
        alloc.last_seen -= by.as_secs_f64();
    }

    #[test]
    fn allocates_lowest_free_id_in_range() {
        let reg = registry();
        assert_eq!(reg.allocate(Purpose::Api, "a", None), Some(1));
        assert_eq!(reg.allocate(Purpose::Api, "a", None), Some(2));
        assert_eq!(reg.allocate(Purpose::Backfill, "b", None), Some(11));

        let alloc = reg.get(2).unwrap();
        assert_eq!(alloc.purpose, Purpose::Api);
        assert_eq!(alloc.allocated_by, "a");
        assert!(alloc.active);
    }

    #[test]
    fn honours_free_preferred_id() {
        let reg = registry();
        assert_eq!(reg.allocate(Purpose::Api, "a", Some(7)), Some(7));
        assert_eq!(reg.allocate(Purpose::Api, "a", None), Some(1));
    }

    #[test]
    fn taken_preferred_id_falls_back_to_lowest_free() {
        let reg = registry();
        assert_eq!(reg.allocate(Purpose::Api, "other", Some(5)), Some(5));
        assert_eq!(reg.allocate(Purpose::Api, "me", Some(5)), Some(1));
    }

    #[test]
    fn preferred_id_outside_range_is_ignored() {
        let reg = registry();
        assert_eq!(reg.allocate(Purpose::Backfill, "b", Some(3)), Some(11));
    }

    #[test]
    fn exhaustion_is_signalled_not_raised() {
        let reg = registry();
        for _ in 0..10 {
            assert!(reg.allocate(Purpose::Reserved, "r", None).is_some());
        }
        assert_eq!(reg.allocate(Purpose::Reserved, "r", None), None);
        assert_eq!(reg.stats().counters.exhausted, 1);
    }

    #[test]
    fn deallocate_makes_id_reusable() {
        let reg = registry();
        let id = reg.allocate(Purpose::Api, "a", None).unwrap();

        assert!(reg.deallocate(id, "a"));
        assert!(reg.get(id).is_none());
        assert!(!reg.deallocate(id, "a"));
        assert_eq!(reg.allocate(Purpose::Api, "b", None), Some(id));
    }

    #[test]
    fn touch_updates_last_seen_and_use_count() {
        let reg = registry();
        let id = reg.allocate(Purpose::Api, "a", None).unwrap();
        backdate(&reg, id, Duration::from_secs(60));
        let before = reg.get(id).unwrap().last_seen;

        assert!(reg.touch(id));
        let after = reg.get(id).unwrap();
        assert!(after.last_seen > before);
        assert_eq!(after.use_count, 1);
        assert!(!reg.touch(999));
    }

    #[test]
    fn reclaims_only_inactive_and_old() {
        let reg = registry();
        let old_inactive = reg.allocate(Purpose::Api, "a", None).unwrap();
        let old_active = reg.allocate(Purpose::Api, "a", None).unwrap();
        let recent_inactive = reg.allocate(Purpose::Api, "a", None).unwrap();

        assert!(reg.mark_inactive(old_inactive));
        assert!(reg.mark_inactive(recent_inactive));
        backdate(&reg, old_inactive, HOUR * 2);
        backdate(&reg, old_active, HOUR * 2);

        assert_eq!(reg.reclaim_stale(), 1);
        assert!(reg.get(old_inactive).is_none());
        assert!(reg.get(old_active).is_some());
        assert!(reg.get(recent_inactive).is_some());
    }

    #[test]
    fn allocate_reclaims_stale_ids_first() {
        let reg = registry();
        let id = reg.allocate(Purpose::Reserved, "crashed", None).unwrap();
        reg.mark_inactive(id);
        backdate(&reg, id, HOUR * 2);

        assert_eq!(reg.allocate(Purpose::Reserved, "fresh", None), Some(id));
        assert_eq!(reg.get(id).unwrap().allocated_by, "fresh");
    }

    #[test]
    fn force_cleanup_ignores_active_flag_for_old_entries() {
        let reg = registry();
        let inactive = reg.allocate(Purpose::Api, "a", None).unwrap();
        let old_active = reg.allocate(Purpose::Api, "a", None).unwrap();
        let fresh = reg.allocate(Purpose::Api, "a", None).unwrap();

        reg.mark_inactive(inactive);
        backdate(&reg, old_active, HOUR * 2);

        let report = reg.force_cleanup();
        assert_eq!(
            report,
            CleanupReport {
                inactive_removed: 1,
                stale_removed: 1
            }
        );
        assert_eq!(
            reg.list_by_purpose(Purpose::Api)
                .into_iter()
                .map(|a| a.client_id)
                .collect::<Vec<_>>(),
            vec![fresh]
        );
    }

    #[test]
    fn stats_cover_every_purpose() {
        let reg = registry();
        reg.allocate(Purpose::Api, "a", None);
        reg.allocate(Purpose::Api, "a", None);
        let id = reg.allocate(Purpose::Test, "t", None).unwrap();
        reg.mark_inactive(id);

        let stats = reg.stats();
        assert_eq!(stats.by_purpose.len(), Purpose::ALL.len());
        assert_eq!(stats.by_purpose[&Purpose::Api].allocated, 2);
        assert_eq!(stats.by_purpose[&Purpose::Test].active, 0);
        assert_eq!(stats.total_allocated, 3);
        assert_eq!(stats.total_active, 2);
        assert_eq!(stats.state_file, None);
    }

    #[test]
    fn concurrent_threads_never_share_an_id() {
        let limits = LimitsTable::new([
            (Purpose::Api, PurposeLimit::new(1, 100, 50)),
            (Purpose::Backfill, PurposeLimit::new(101, 110, 1)),
            (Purpose::Interactive, PurposeLimit::new(111, 120, 1)),
            (Purpose::Test, PurposeLimit::new(121, 130, 1)),
            (Purpose::Reserved, PurposeLimit::new(131, 140, 1)),
        ])
        .unwrap();
        let reg = Arc::new(ClientIdRegistry::in_memory(limits, HOUR));

        let handles: Vec<_> = (0..10)
            .map(|worker| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    let owner = format!("worker-{worker}");
                    (0..5)
                        .map(|_| reg.allocate(Purpose::Api, &owner, None).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = BTreeSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!((1..=100).contains(&id));
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RegistrySettings {
            state_file: Some(dir.path().join("client_ids.json")),
            stale_after: HOUR,
        };

        let reg = ClientIdRegistry::new(LimitsTable::default(), &settings);
        reg.allocate(Purpose::Api, "api-worker", None);
        reg.allocate(Purpose::Backfill, "backfill", Some(15));
        let inactive = reg.allocate(Purpose::Interactive, "cli", None).unwrap();
        reg.mark_inactive(inactive);
        reg.touch(1);
        reg.save().unwrap();

        let reloaded = ClientIdRegistry::new(LimitsTable::default(), &settings);
        let key = |a: &Allocation| {
            (a.client_id, a.purpose, a.allocated_by.clone(), a.last_seen, a.use_count)
        };
        for purpose in Purpose::ALL {
            let mut before: Vec<_> = reg.list_by_purpose(purpose).iter().map(key).collect();
            let mut after: Vec<_> = reloaded.list_by_purpose(purpose).iter().map(key).collect();
            before.sort_by_key(|k| k.0);
            after.sort_by_key(|k| k.0);
            assert_eq!(before, after);
        }
        assert_eq!(reloaded.stats().total_active, 0);
        assert_eq!(reloaded.stats().counters.total_allocations, 3);
        assert!(reloaded.stats().last_saved_at.is_none());
    }

    #[test]
    fn load_purges_stale_and_invalid_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client_ids.json");
        let now = now_secs();
        let raw = serde_json::json!({
            "allocations": {
                "1": { "id": 1, "purpose": "api", "last_seen": now, "active": true },
                "2": { "id": 2, "purpose": "api", "last_seen": now - 7200.0, "active": false },
                "3": { "id": 3, "purpose": "backfill", "last_seen": now },
                "4": { "id": 4, "purpose": "scanner", "last_seen": now },
                "12": { "last_seen": now, "allocated_by": "legacy" }
            },
            "stats": { "total_allocations": 9 },
            "saved_at": now
        });
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        let settings = RegistrySettings {
            state_file: Some(path),
            stale_after: HOUR,
        };
        let reg = ClientIdRegistry::new(LimitsTable::default(), &settings);

        assert!(reg.get(1).is_some());
        assert!(reg.get(2).is_none(), "stale entry must be purged on load");
        assert!(reg.get(3).is_none(), "id outside its purpose range");
        assert!(reg.get(4).is_none(), "unknown purpose");

        let legacy = reg.get(12).unwrap();
        assert_eq!(legacy.purpose, Purpose::Backfill);
        assert_eq!(legacy.allocated_by, "legacy");
        assert_eq!(reg.stats().counters.total_allocations, 9);
    }

    #[test]
    fn ids_left_by_a_crashed_process_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client_ids.json");
        let now = now_secs();
        let day_ago = now - 24.0 * 3600.0;

        let allocations: serde_json::Map<String, serde_json::Value> = (41..=50)
            .map(|id: ClientId| {
                let last_seen = if id == 50 { now } else { day_ago };
                let entry = serde_json::json!({
                    "id": id,
                    "purpose": "reserved",
                    "allocated_by": "crashed",
                    "last_seen": last_seen,
                    "active": true
                });
                (id.to_string(), entry)
            })
            .collect();
        let raw = serde_json::json!({ "allocations": allocations, "saved_at": day_ago });
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        let settings = RegistrySettings {
            state_file: Some(path),
            stale_after: HOUR,
        };
        let reg = ClientIdRegistry::new(LimitsTable::default(), &settings);

        // Only the recently seen entry survives, and it waits out the threshold.
        assert_eq!(reg.stats().total_allocated, 1);
        assert!(!reg.get(50).unwrap().active);
        assert_eq!(reg.allocate(Purpose::Reserved, "fresh", None), Some(41));

        backdate(&reg, 50, 2 * HOUR);
        assert_eq!(reg.allocate(Purpose::Reserved, "fresh", Some(50)), Some(50));
        assert_eq!(reg.get(50).unwrap().allocated_by, "fresh");
    }

    #[test]
    fn failed_save_is_surfaced_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client_ids.json");
        let settings = RegistrySettings {
            state_file: Some(path.clone()),
            stale_after: HOUR,
        };

        let reg = ClientIdRegistry::new(LimitsTable::default(), &settings);
        reg.allocate(Purpose::Api, "a", None);
        assert!(reg.stats().last_save_error.is_none());

        // A directory where the file should be makes the final rename fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let err = reg.save().unwrap_err();
        assert!(matches!(err, RegistryError::Io { .. }));
        assert!(reg.stats().last_save_error.is_some());
    }

    #[test]
    fn corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client_ids.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let settings = RegistrySettings {
            state_file: Some(path),
            stale_after: HOUR,
        };
        let reg = ClientIdRegistry::new(LimitsTable::default(), &settings);
        assert_eq!(reg.stats().total_allocated, 0);
        assert_eq!(reg.allocate(Purpose::Api, "a", None), Some(1));
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
