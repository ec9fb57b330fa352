//! Resource registry and release orchestration
//!
//! The tracker owns every registered payload. Consumers refer to resources by
//! id and go through [`ResourceTracker::touch`], [`ResourceTracker::acquire`],
//! [`ResourceTracker::read`] and [`ResourceTracker::write`]. Releases run the
//! pipeline snapshot, reaper, registry removal, event.
//!
//! Lock order is registry mutex, then per-resource lock. The registry mutex is
//! never held while waiting on a per-resource lock.

pub mod events;

pub use events::{
    ReleaseCause, ReleaseEvent, ReleaseKind, ReleaseLog, ReleaseStats, TypeReleaseStats,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::config::{ScoringWeights, SnapshotConfig, TrackerConfig};
use crate::error::{Result, WardenError};
use crate::eviction::prioritizer::{Explanation, ReleasePrioritizer};
use crate::eviction::reaper::{ReleaseMode, ReleaseOutcome, ReleaseTarget, ResourceReaper, contain};
use crate::eviction::snapshot::{RestoreTarget, SnapshotInfo, SnapshotStore, Snapshotable};
use crate::lock::LockManager;
use crate::resource::{Payload, PayloadSlot, ResourceHandle, TypeCatalog, parse_id};
use crate::sync;

type Listener = Arc<dyn Fn(&ReleaseEvent) + Send + Sync>;

struct Entry {
    type_name: String,
    size_bytes: u64,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    users: Arc<AtomicUsize>,
    slot: PayloadSlot,
    /// Claimed by a release in progress; no new users are admitted
    releasing: bool,
}

/// Registry view of one resource taken for the release pipeline
struct Candidate {
    handle: ResourceHandle,
    slot: PayloadSlot,
    users: Arc<AtomicUsize>,
}

/// Registry totals for one resource type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeUsage {
    pub count: usize,
    pub bytes: u64,
}

/// Registry totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub count: usize,
    pub total_bytes: u64,
    pub active: usize,
    pub by_type: BTreeMap<String, TypeUsage>,
}

/// Marks a resource as in use until dropped.
///
/// In-use resources are never released by pressure or expiry sweeps.
#[must_use = "the resource stops being in use as soon as the guard is dropped"]
#[derive(Debug)]
pub struct UsageGuard {
    id: String,
    users: Arc<AtomicUsize>,
}

impl UsageGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        self.users.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared components the tracker orchestrates
pub struct TrackerParts {
    pub locks: Arc<LockManager>,
    pub snapshots: Arc<SnapshotStore>,
    pub reaper: Arc<ResourceReaper>,
    pub prioritizer: ReleasePrioritizer,
}

pub struct ResourceTracker {
    catalog: Arc<TypeCatalog>,
    config: TrackerConfig,
    locks: Arc<LockManager>,
    snapshots: Arc<SnapshotStore>,
    reaper: Arc<ResourceReaper>,
    prioritizer: ReleasePrioritizer,
    registry: Mutex<HashMap<String, Entry>>,
    pressure_gate: Mutex<()>,
    log: Mutex<ReleaseLog>,
    listeners: RwLock<Vec<Listener>>,
}

impl ResourceTracker {
    /// Tracker with default configuration and its own lock manager,
    /// snapshot store and reaper
    pub fn new(catalog: TypeCatalog) -> Self {
        let config = TrackerConfig::default();
        let locks = Arc::new(LockManager::new());
        let parts = TrackerParts {
            snapshots: Arc::new(SnapshotStore::with_config(
                Arc::clone(&locks),
                SnapshotConfig::default(),
            )),
            reaper: Arc::new(ResourceReaper::new(
                Arc::clone(&locks),
                config.release_lock_timeout(),
            )),
            prioritizer: ReleasePrioritizer::with_weights(ScoringWeights::default()),
            locks,
        };
        Self::with_parts(Arc::new(catalog), config, parts)
    }

    pub fn with_parts(catalog: Arc<TypeCatalog>, config: TrackerConfig, parts: TrackerParts) -> Self {
        let log = ReleaseLog::new(config.event_history);
        Self {
            catalog,
            config,
            locks: parts.locks,
            snapshots: parts.snapshots,
            reaper: parts.reaper,
            prioritizer: parts.prioritizer,
            registry: Mutex::new(HashMap::new()),
            pressure_gate: Mutex::new(()),
            log: Mutex::new(log),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn reaper(&self) -> &Arc<ResourceReaper> {
        &self.reaper
    }

    pub fn prioritizer(&self) -> &ReleasePrioritizer {
        &self.prioritizer
    }

    /// Take ownership of `payload` under `id`.
    ///
    /// `id` must look like `<type_name>:<instance>` and `type_name` must be in
    /// the catalog.
    pub fn register<P: Payload>(
        &self,
        id: &str,
        payload: P,
        type_name: &str,
        size_bytes: u64,
    ) -> Result<()> {
        self.register_boxed(id, Box::new(payload), type_name, size_bytes)
    }

    /// [`ResourceTracker::register`] for an already boxed payload
    pub fn register_boxed(
        &self,
        id: &str,
        payload: Box<dyn Payload>,
        type_name: &str,
        size_bytes: u64,
    ) -> Result<()> {
        let (prefix, _) = parse_id(id)?;
        if prefix != type_name {
            return Err(WardenError::InvalidId(format!(
                "{id} does not start with type {type_name}"
            )));
        }
        self.catalog.require(type_name)?;

        let now = Utc::now();
        {
            let mut registry = sync::lock(&self.registry, "registry");
            if registry.contains_key(id) {
                return Err(WardenError::Duplicate(id.to_string()));
            }
            registry.insert(
                id.to_string(),
                Entry {
                    type_name: type_name.to_string(),
                    size_bytes,
                    created_at: now,
                    last_accessed_at: now,
                    users: Arc::new(AtomicUsize::new(0)),
                    slot: PayloadSlot::new(payload),
                    releasing: false,
                },
            );
        }

        tracing::debug!(resource = id, type_name, size_bytes, "resource registered");
        Ok(())
    }

    /// Refresh the last-access time
    pub fn touch(&self, id: &str) -> Result<()> {
        let mut registry = sync::lock(&self.registry, "registry");
        let entry = registry
            .get_mut(id)
            .ok_or_else(|| WardenError::NotFound(id.to_string()))?;
        entry.last_accessed_at = Utc::now();
        Ok(())
    }

    /// Touch the resource and mark it in use for the guard's lifetime.
    ///
    /// Fails with `AlreadyLocked` while the resource is being released.
    pub fn acquire(&self, id: &str) -> Result<UsageGuard> {
        let mut registry = sync::lock(&self.registry, "registry");
        let entry = usable_entry(&mut registry, id)?;
        entry.last_accessed_at = Utc::now();
        entry.users.fetch_add(1, Ordering::AcqRel);
        Ok(UsageGuard {
            id: id.to_string(),
            users: Arc::clone(&entry.users),
        })
    }

    /// Run `f` on the payload under a shared lock.
    ///
    /// Fails with `AlreadyLocked` if the lock cannot be taken within `timeout`
    /// or the resource is being released.
    pub fn read<R>(
        &self,
        id: &str,
        timeout: Duration,
        f: impl FnOnce(&dyn Payload) -> R,
    ) -> Result<R> {
        let slot = self.touch_slot(id)?;
        let _guard = self
            .locks
            .lock_read(id, timeout)?
            .ok_or_else(|| WardenError::AlreadyLocked(id.to_string()))?;
        slot.with(f)
            .ok_or_else(|| WardenError::NotFound(id.to_string()))
    }

    /// Run `f` on the payload under an exclusive lock
    pub fn write<R>(
        &self,
        id: &str,
        timeout: Duration,
        f: impl FnOnce(&mut dyn Payload) -> R,
    ) -> Result<R> {
        let slot = self.touch_slot(id)?;
        let _guard = self
            .locks
            .lock_write(id, timeout)?
            .ok_or_else(|| WardenError::AlreadyLocked(id.to_string()))?;
        slot.with_mut(f)
            .ok_or_else(|| WardenError::NotFound(id.to_string()))
    }

    fn touch_slot(&self, id: &str) -> Result<PayloadSlot> {
        let mut registry = sync::lock(&self.registry, "registry");
        let entry = usable_entry(&mut registry, id)?;
        entry.last_accessed_at = Utc::now();
        Ok(entry.slot.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        sync::lock(&self.registry, "registry").contains_key(id)
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.registry, "registry").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handle(&self, id: &str) -> Option<ResourceHandle> {
        self.candidate(id).map(|candidate| candidate.handle)
    }

    /// Every registered resource, ordered by id
    pub fn handles(&self) -> Vec<ResourceHandle> {
        self.candidates()
            .into_iter()
            .map(|candidate| candidate.handle)
            .collect()
    }

    pub fn stats(&self) -> TrackerStats {
        let registry = sync::lock(&self.registry, "registry");
        let mut stats = TrackerStats::default();
        for entry in registry.values() {
            stats.count += 1;
            stats.total_bytes += entry.size_bytes;
            if entry.users.load(Ordering::Acquire) > 0 {
                stats.active += 1;
            }
            let usage = stats.by_type.entry(entry.type_name.clone()).or_default();
            usage.count += 1;
            usage.bytes += entry.size_bytes;
        }
        stats
    }

    /// Why `id` sits where it does in the current release order
    pub fn explain(&self, id: &str) -> Option<Explanation> {
        self.prioritizer.explain(id, &self.handles(), &self.catalog)
    }

    /// Release one resource now.
    ///
    /// Returns `Ok(false)` if `id` is unknown or already released. Fails with
    /// `AlreadyLocked` while the resource is locked or in use, and with
    /// `ReleaseHandlerFailure` if its handler fails; the resource then stays
    /// registered.
    pub fn release(&self, id: &str) -> Result<bool> {
        let Some(candidate) = self.candidate(id) else {
            return Ok(false);
        };
        if !candidate.handle.is_releasable() {
            return Err(WardenError::AlreadyLocked(id.to_string()));
        }

        match self.release_one(&candidate, ReleaseMode::Full, ReleaseCause::Explicit) {
            ReleaseOutcome::Removed { .. } | ReleaseOutcome::Shrunk { .. } => Ok(true),
            ReleaseOutcome::AlreadyReleased => Ok(false),
            ReleaseOutcome::Aborted => Err(WardenError::AlreadyLocked(id.to_string())),
            ReleaseOutcome::Failed { message } => Err(WardenError::ReleaseHandlerFailure {
                id: id.to_string(),
                type_name: candidate.handle.type_name,
                message,
            }),
        }
    }

    /// Release idle, unlocked resources in priority order until at least
    /// `needed_bytes` are freed or nothing releasable is left.
    ///
    /// Under moderate pressure incrementally releasable resources are shrunk
    /// first. Returns how many resources were released or shrunk. Concurrent
    /// calls run one after another.
    pub fn release_by_pressure(&self, needed_bytes: u64) -> usize {
        if needed_bytes == 0 {
            return 0;
        }
        let _gate = sync::lock(&self.pressure_gate, "pressure gate");
        let started = Instant::now();
        let now = Utc::now();

        let all = self.candidates();
        let tracked_bytes: u64 = all.iter().map(|c| c.handle.size_bytes).sum();
        let moderate =
            needed_bytes as f64 <= self.config.incremental_pressure_ratio * tracked_bytes as f64;

        let releasable: Vec<ResourceHandle> = all
            .iter()
            .filter(|c| c.handle.is_releasable())
            .map(|c| c.handle.clone())
            .collect();
        let order = self.prioritizer.rank_at(&releasable, &self.catalog, now);

        let mut freed = 0u64;
        let mut released: HashSet<String> = HashSet::new();
        let mut shrunk: Vec<String> = Vec::new();

        for id in &order {
            if freed >= needed_bytes {
                break;
            }
            let Some(candidate) = self.candidate(id) else {
                continue;
            };
            if !candidate.handle.is_releasable() {
                continue;
            }
            let incremental = moderate
                && self
                    .catalog
                    .get(&candidate.handle.type_name)
                    .is_some_and(|d| d.incrementally_releasable);
            let mode = if incremental {
                ReleaseMode::Incremental {
                    fraction: self.config.incremental_fraction,
                }
            } else {
                ReleaseMode::Full
            };

            let outcome = self.release_one(&candidate, mode, ReleaseCause::Pressure);
            if let ReleaseOutcome::Shrunk { .. } = outcome {
                shrunk.push(id.clone());
            }
            if outcome.is_success() {
                freed += outcome.freed_bytes();
                released.insert(id.clone());
            }
        }

        // Shrinking was not enough: fully release what was only shrunk
        if freed < needed_bytes && !shrunk.is_empty() {
            tracing::debug!(
                needed_bytes,
                freed,
                "incremental pass fell short, releasing shrunk resources"
            );
            for id in &shrunk {
                if freed >= needed_bytes {
                    break;
                }
                let Some(candidate) = self.candidate(id) else {
                    continue;
                };
                if !candidate.handle.is_releasable() {
                    continue;
                }
                let outcome = self.release_one(&candidate, ReleaseMode::Full, ReleaseCause::Pressure);
                if outcome.is_success() {
                    freed += outcome.freed_bytes();
                    released.insert(id.clone());
                }
            }
        }

        let count = released.len();
        tracing::info!(
            needed_bytes,
            freed,
            count,
            moderate,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pressure release finished"
        );
        if freed < needed_bytes {
            tracing::warn!(needed_bytes, freed, "pressure target not met, nothing left to release");
        }
        count
    }

    /// Release every idle, unlocked resource past its type's retain time
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    /// [`ResourceTracker::sweep_expired`] evaluated at `now`
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Candidate> = self
            .candidates()
            .into_iter()
            .filter(|c| c.handle.is_releasable())
            .filter(|c| {
                self.catalog
                    .get(&c.handle.type_name)
                    .is_some_and(|d| c.handle.is_expired(d, now))
            })
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let count = expired
            .iter()
            .filter(|c| {
                self.release_one(c, ReleaseMode::Full, ReleaseCause::Expired)
                    .is_success()
            })
            .count();
        tracing::debug!(candidates = expired.len(), count, "expiry sweep finished");
        count
    }

    /// Restore `id` from its snapshot, in place or by registering it again
    pub fn rollback(&self, id: &str) -> bool {
        let restored = self.snapshots.rollback(id, self);
        sync::lock(&self.log, "release log").record_rollback(restored);
        restored
    }

    /// Call `listener` after every successful release
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&ReleaseEvent) + Send + Sync + 'static,
    {
        sync::write(&self.listeners, "release listeners").push(Arc::new(listener));
    }

    /// Up to `limit` most recent release events, newest first
    pub fn recent_events(&self, limit: usize) -> Vec<ReleaseEvent> {
        sync::lock(&self.log, "release log").recent(limit)
    }

    pub fn release_stats(&self) -> ReleaseStats {
        sync::lock(&self.log, "release log").stats()
    }

    /// Compaction hook: trim registry capacity and drop idle lock state.
    ///
    /// Returns the number of lock entries collected.
    pub fn compact(&self) -> usize {
        sync::lock(&self.registry, "registry").shrink_to_fit();
        self.locks.collect_idle()
    }

    fn candidate(&self, id: &str) -> Option<Candidate> {
        let candidate = {
            let registry = sync::lock(&self.registry, "registry");
            registry.get(id).map(|entry| to_candidate(id, entry))?
        };
        Some(self.with_lock_state(candidate))
    }

    fn candidates(&self) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = {
            let registry = sync::lock(&self.registry, "registry");
            registry
                .iter()
                .map(|(id, entry)| to_candidate(id, entry))
                .collect()
        };
        candidates.sort_by(|a, b| a.handle.id.cmp(&b.handle.id));
        candidates
            .into_iter()
            .map(|candidate| self.with_lock_state(candidate))
            .collect()
    }

    fn with_lock_state(&self, mut candidate: Candidate) -> Candidate {
        candidate.handle.locked = self.locks.is_locked(&candidate.handle.id);
        candidate
    }

    /// Snapshot, reap, then update the registry and emit an event
    fn release_one(
        &self,
        candidate: &Candidate,
        mode: ReleaseMode,
        cause: ReleaseCause,
    ) -> ReleaseOutcome {
        let started = Instant::now();
        let handle = &candidate.handle;
        let Some(descriptor) = self.catalog.get(&handle.type_name) else {
            return ReleaseOutcome::Failed {
                message: format!("type {} missing from catalog", handle.type_name),
            };
        };

        if let Err(outcome) = self.claim(candidate) {
            return outcome;
        }

        let pending = self.snapshots.capture(handle, &candidate.slot, descriptor);
        let outcome = self.reaper.release(
            &ReleaseTarget {
                id: &handle.id,
                type_name: &handle.type_name,
                size_bytes: handle.size_bytes,
                slot: &candidate.slot,
                users: Some(candidate.users.as_ref()),
            },
            mode,
        );

        // Backups of releases that did not go through are dropped, leaving
        // any older snapshot in place
        let snapshot_taken = match pending {
            Some(pending) if outcome.is_success() => {
                self.snapshots.commit(pending);
                true
            }
            _ => false,
        };

        let kind = match outcome {
            ReleaseOutcome::Removed { .. } => {
                {
                    let mut registry = sync::lock(&self.registry, "registry");
                    if registry
                        .get(&handle.id)
                        .is_some_and(|entry| entry.slot.same_slot(&candidate.slot))
                    {
                        registry.remove(&handle.id);
                    }
                }
                self.locks.forget(&handle.id);
                ReleaseKind::Full
            }
            ReleaseOutcome::Shrunk { freed_bytes } => {
                let mut registry = sync::lock(&self.registry, "registry");
                if let Some(entry) = claimed_entry(&mut registry, candidate) {
                    entry.size_bytes = entry.size_bytes.saturating_sub(freed_bytes);
                    entry.releasing = false;
                }
                ReleaseKind::Incremental
            }
            ReleaseOutcome::Failed { .. } => {
                self.unclaim(candidate);
                sync::lock(&self.log, "release log").record_failure();
                return outcome;
            }
            ReleaseOutcome::AlreadyReleased | ReleaseOutcome::Aborted => {
                self.unclaim(candidate);
                return outcome;
            }
        };

        let event = ReleaseEvent {
            resource_id: handle.id.clone(),
            type_name: handle.type_name.clone(),
            freed_bytes: outcome.freed_bytes(),
            kind,
            cause,
            snapshot_taken,
            released_at: Utc::now(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        sync::lock(&self.log, "release log").record(event.clone());
        self.notify(&event);
        outcome
    }

    /// Mark the entry as being released so no new users get in.
    ///
    /// Refused while the resource is in use or already claimed by another
    /// release.
    fn claim(&self, candidate: &Candidate) -> std::result::Result<(), ReleaseOutcome> {
        let id = candidate.handle.id.as_str();
        let mut registry = sync::lock(&self.registry, "registry");
        let Some(entry) = claimed_entry(&mut registry, candidate) else {
            return Err(ReleaseOutcome::AlreadyReleased);
        };
        if entry.releasing || entry.users.load(Ordering::Acquire) > 0 {
            tracing::debug!(resource = id, "release aborted: resource is in use");
            return Err(ReleaseOutcome::Aborted);
        }
        entry.releasing = true;
        Ok(())
    }

    fn unclaim(&self, candidate: &Candidate) {
        let mut registry = sync::lock(&self.registry, "registry");
        if let Some(entry) = claimed_entry(&mut registry, candidate) {
            entry.releasing = false;
        }
    }

    fn notify(&self, event: &ReleaseEvent) {
        let listeners = sync::read(&self.listeners, "release listeners").clone();
        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::error!(resource = %event.resource_id, "release listener panicked");
            }
        }
    }
}

fn to_candidate(id: &str, entry: &Entry) -> Candidate {
    Candidate {
        handle: ResourceHandle {
            id: id.to_string(),
            type_name: entry.type_name.clone(),
            size_bytes: entry.size_bytes,
            created_at: entry.created_at,
            last_accessed_at: entry.last_accessed_at,
            active: entry.users.load(Ordering::Acquire) > 0,
            locked: false,
        },
        slot: entry.slot.clone(),
        users: Arc::clone(&entry.users),
    }
}

/// Entry a consumer may use: registered and not being released
fn usable_entry<'a>(registry: &'a mut HashMap<String, Entry>, id: &str) -> Result<&'a mut Entry> {
    let entry = registry
        .get_mut(id)
        .ok_or_else(|| WardenError::NotFound(id.to_string()))?;
    if entry.releasing {
        return Err(WardenError::AlreadyLocked(id.to_string()));
    }
    Ok(entry)
}

/// The registry entry `candidate` was taken from, if it is still registered
fn claimed_entry<'a>(
    registry: &'a mut HashMap<String, Entry>,
    candidate: &Candidate,
) -> Option<&'a mut Entry> {
    registry
        .get_mut(&candidate.handle.id)
        .filter(|entry| entry.slot.same_slot(&candidate.slot))
}

impl RestoreTarget for ResourceTracker {
    fn restore_in_place(
        &self,
        snapshot: &SnapshotInfo,
        backup: &dyn Payload,
        handler: &dyn Snapshotable,
    ) -> Result<bool> {
        let id = snapshot.resource_id.as_str();
        let slot = {
            let registry = sync::lock(&self.registry, "registry");
            match registry.get(id) {
                Some(entry) => entry.slot.clone(),
                None => return Ok(false),
            }
        };

        let _guard = self
            .locks
            .lock_write(id, self.config.release_lock_timeout())?
            .ok_or_else(|| WardenError::AlreadyLocked(id.to_string()))?;

        match slot.with_mut(|current| contain(|| handler.restore(id, current, backup))) {
            Some(Ok(())) => {}
            Some(Err(message)) => {
                return Err(WardenError::SnapshotUnavailable(format!("{id}: {message}")));
            }
            None => {
                let copy = contain(|| handler.backup(id, backup))
                    .map_err(|message| WardenError::SnapshotUnavailable(format!("{id}: {message}")))?;
                slot.replace(copy);
            }
        }

        let mut registry = sync::lock(&self.registry, "registry");
        if let Some(entry) = registry.get_mut(id) {
            entry.size_bytes = snapshot.size_bytes;
            entry.last_accessed_at = Utc::now();
        }
        Ok(true)
    }

    fn reinstate(&self, snapshot: &SnapshotInfo, payload: Box<dyn Payload>) -> Result<()> {
        self.register_boxed(
            &snapshot.resource_id,
            payload,
            &snapshot.type_name,
            snapshot.size_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::reaper::{HandlerError, RollingBufferHandler};
    use crate::eviction::snapshot::StructuralCopy;
    use crate::resource::{Opaque, RollingBuffer};
    use std::sync::mpsc;
    use crate::testing::{FailingReleaser, sample_catalog};
    use chrono::TimeDelta;

    const MB: u64 = 1_000_000;
    const SHORT: Duration = Duration::from_millis(50);

    fn tracker() -> ResourceTracker {
        ResourceTracker::new(sample_catalog())
    }

    mod registry {
        use super::*;

        #[test]
        fn test_register_and_stats() {
            let tracker = tracker();
            tracker.register("render_cache:a", vec![0u8; 4], "render_cache", 40).unwrap();
            tracker.register("render_cache:b", vec![0u8; 4], "render_cache", 60).unwrap();
            tracker.register("temp_buffers:t", 7u32, "temp_buffers", 5).unwrap();

            let stats = tracker.stats();
            assert_eq!(stats.count, 3);
            assert_eq!(stats.total_bytes, 105);
            assert_eq!(stats.by_type["render_cache"], TypeUsage { count: 2, bytes: 100 });
            assert_eq!(stats.by_type["temp_buffers"], TypeUsage { count: 1, bytes: 5 });
        }

        #[test]
        fn test_register_validation() {
            let tracker = tracker();
            assert!(matches!(
                tracker.register("no_separator", 1u8, "render_cache", 1),
                Err(WardenError::InvalidId(_))
            ));
            assert!(matches!(
                tracker.register("temp_buffers:x", 1u8, "render_cache", 1),
                Err(WardenError::InvalidId(_))
            ));
            assert!(matches!(
                tracker.register("ghost:x", 1u8, "ghost", 1),
                Err(WardenError::UnknownType(_))
            ));

            tracker.register("render_cache:x", 1u8, "render_cache", 1).unwrap();
            assert!(matches!(
                tracker.register("render_cache:x", 2u8, "render_cache", 1),
                Err(WardenError::Duplicate(_))
            ));
        }

        #[test]
        fn test_touch() {
            let tracker = tracker();
            tracker.register("render_cache:x", 1u8, "render_cache", 1).unwrap();
            let before = tracker.handle("render_cache:x").unwrap().last_accessed_at;

            std::thread::sleep(Duration::from_millis(5));
            tracker.touch("render_cache:x").unwrap();
            assert!(tracker.handle("render_cache:x").unwrap().last_accessed_at > before);

            assert!(matches!(
                tracker.touch("render_cache:missing"),
                Err(WardenError::NotFound(_))
            ));
        }

        #[test]
        fn test_usage_guard_marks_active() {
            let tracker = tracker();
            tracker.register("render_cache:x", 1u8, "render_cache", 1).unwrap();

            let guard = tracker.acquire("render_cache:x").unwrap();
            assert_eq!(guard.id(), "render_cache:x");
            assert!(tracker.handle("render_cache:x").unwrap().active);
            assert_eq!(tracker.stats().active, 1);

            drop(guard);
            assert!(!tracker.handle("render_cache:x").unwrap().active);
        }

        #[test]
        fn test_read_and_write() {
            let tracker = tracker();
            tracker.register("render_cache:x", vec![1u8], "render_cache", 1).unwrap();

            tracker
                .write("render_cache:x", SHORT, |p| {
                    p.downcast_mut::<Vec<u8>>().unwrap().push(2)
                })
                .unwrap();
            let len = tracker
                .read("render_cache:x", SHORT, |p| {
                    p.downcast_ref::<Vec<u8>>().unwrap().len()
                })
                .unwrap();
            assert_eq!(len, 2);
            assert!(!tracker.locks().is_locked("render_cache:x"));
        }

        #[test]
        fn test_write_blocked_by_reader() {
            let tracker = Arc::new(tracker());
            tracker.register("render_cache:x", 1u8, "render_cache", 1).unwrap();

            let (held_tx, held_rx) = std::sync::mpsc::channel();
            let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
            let reader = {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    tracker
                        .read("render_cache:x", SHORT, |_| {
                            held_tx.send(()).unwrap();
                            done_rx.recv().unwrap();
                        })
                        .unwrap();
                })
            };
            held_rx.recv().unwrap();

            assert!(matches!(
                tracker.write("render_cache:x", SHORT, |_| ()),
                Err(WardenError::AlreadyLocked(_))
            ));
            done_tx.send(()).unwrap();
            reader.join().unwrap();
        }
    }

    mod release {
        use super::*;

        #[test]
        fn test_release_removes_and_records() {
            let tracker = tracker();
            tracker.register("model_shards:s", vec![0u8; 8], "model_shards", 8).unwrap();

            assert!(tracker.release("model_shards:s").unwrap());
            assert!(!tracker.contains("model_shards:s"));
            assert!(!tracker.release("model_shards:s").unwrap());

            let events = tracker.recent_events(10);
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].cause, ReleaseCause::Explicit);
            assert_eq!(events[0].freed_bytes, 8);
            assert!(!events[0].snapshot_taken);
            assert!(tracker.locks().is_empty());
        }

        #[test]
        fn test_release_unknown_is_false() {
            assert!(!tracker().release("render_cache:nope").unwrap());
        }

        #[test]
        fn test_release_in_use_or_locked_fails() {
            let tracker = tracker();
            tracker.register("render_cache:x", 1u8, "render_cache", 1).unwrap();

            let guard = tracker.acquire("render_cache:x").unwrap();
            assert!(matches!(
                tracker.release("render_cache:x"),
                Err(WardenError::AlreadyLocked(_))
            ));
            drop(guard);

            let lock = tracker.locks().lock_read("render_cache:x", SHORT).unwrap();
            assert!(matches!(
                tracker.release("render_cache:x"),
                Err(WardenError::AlreadyLocked(_))
            ));
            drop(lock);
            assert!(tracker.release("render_cache:x").unwrap());
        }

        #[test]
        fn test_handler_failure_keeps_resource() {
            let tracker = tracker();
            tracker
                .reaper()
                .register_handler("render_cache", Arc::new(FailingReleaser));
            tracker.register("render_cache:x", 1u8, "render_cache", 1).unwrap();

            assert!(matches!(
                tracker.release("render_cache:x"),
                Err(WardenError::ReleaseHandlerFailure { .. })
            ));
            assert!(tracker.contains("render_cache:x"));
            assert!(!tracker.snapshots().has("render_cache:x"));
            assert_eq!(tracker.release_stats().failed_count, 1);
        }

        #[test]
        fn test_failed_release_can_be_used_again() {
            let tracker = tracker();
            tracker
                .reaper()
                .register_handler("render_cache", Arc::new(FailingReleaser));
            tracker.register("render_cache:x", 1u8, "render_cache", 1).unwrap();

            assert!(tracker.release("render_cache:x").is_err());
            let _usage = tracker.acquire("render_cache:x").unwrap();
            tracker.read("render_cache:x", SHORT, |_| ()).unwrap();
        }

        #[test]
        fn test_failed_release_keeps_older_snapshot() {
            let tracker = tracker();
            tracker.register("render_cache:f", vec![1u8, 2], "render_cache", 2).unwrap();
            assert!(tracker.release("render_cache:f").unwrap());
            assert!(tracker.rollback("render_cache:f"));
            let taken_at = tracker.snapshots().info("render_cache:f").unwrap().taken_at;

            tracker
                .write("render_cache:f", SHORT, |p| {
                    p.downcast_mut::<Vec<u8>>().unwrap().push(3)
                })
                .unwrap();
            tracker
                .reaper()
                .register_handler("render_cache", Arc::new(FailingReleaser));
            assert!(matches!(
                tracker.release("render_cache:f"),
                Err(WardenError::ReleaseHandlerFailure { .. })
            ));

            let info = tracker.snapshots().info("render_cache:f").unwrap();
            assert_eq!(info.taken_at, taken_at);
            assert!(tracker.rollback("render_cache:f"));
            let content = tracker
                .read("render_cache:f", SHORT, |p| p.downcast_ref::<Vec<u8>>().unwrap().clone())
                .unwrap();
            assert_eq!(content, vec![1, 2]);
        }

        #[test]
        fn test_uncopyable_payload_released_without_snapshot() {
            #[derive(Debug)]
            struct DeviceBuffer {
                _handle: u32,
            }

            let tracker = tracker();
            let payload = Opaque::new(DeviceBuffer { _handle: 9 });
            tracker.register("render_cache:gpu", payload, "render_cache", 8).unwrap();
            tracker
                .read("render_cache:gpu", SHORT, |p| {
                    assert!(p.downcast_ref::<Opaque<DeviceBuffer>>().is_some())
                })
                .unwrap();

            assert!(tracker.release("render_cache:gpu").unwrap());
            assert!(!tracker.contains("render_cache:gpu"));
            assert!(!tracker.recent_events(1)[0].snapshot_taken);
            assert!(!tracker.snapshots().has("render_cache:gpu"));
        }

        /// Backs up by copy, but only once the test lets it continue
        struct GatedBackup {
            entered: Mutex<mpsc::Sender<()>>,
            resume: Mutex<mpsc::Receiver<()>>,
        }

        impl Snapshotable for GatedBackup {
            fn backup(
                &self,
                id: &str,
                payload: &dyn Payload,
            ) -> std::result::Result<Box<dyn Payload>, HandlerError> {
                self.entered.lock().unwrap().send(()).unwrap();
                self.resume.lock().unwrap().recv().unwrap();
                StructuralCopy.backup(id, payload)
            }
        }

        #[test]
        fn test_no_new_users_while_release_in_flight() {
            let tracker = Arc::new(tracker());
            let (entered_tx, entered_rx) = mpsc::channel();
            let (resume_tx, resume_rx) = mpsc::channel();
            tracker.snapshots().register_handler(
                "render_cache",
                Arc::new(GatedBackup {
                    entered: Mutex::new(entered_tx),
                    resume: Mutex::new(resume_rx),
                }),
            );
            tracker.register("render_cache:f", vec![1u8; 4], "render_cache", 10 * MB).unwrap();

            let releaser = {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || tracker.release_by_pressure(10 * MB))
            };
            entered_rx.recv().unwrap();

            assert!(matches!(
                tracker.acquire("render_cache:f"),
                Err(WardenError::AlreadyLocked(_))
            ));
            assert!(matches!(
                tracker.read("render_cache:f", SHORT, |_| ()),
                Err(WardenError::AlreadyLocked(_))
            ));
            assert!(matches!(
                tracker.write("render_cache:f", SHORT, |_| ()),
                Err(WardenError::AlreadyLocked(_))
            ));
            assert!(tracker.touch("render_cache:f").is_ok());
            resume_tx.send(()).unwrap();

            assert_eq!(releaser.join().unwrap(), 1);
            assert!(!tracker.contains("render_cache:f"));
            assert!(tracker.snapshots().has("render_cache:f"));
            assert_eq!(tracker.stats().active, 0);
        }

        #[test]
        fn test_subscribers_see_events() {
            let tracker = tracker();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            tracker.subscribe(move |event| sink.lock().unwrap().push(event.resource_id.clone()));
            tracker.subscribe(|_| panic!("listener failure must not break releases"));

            tracker.register("temp_buffers:a", 1u8, "temp_buffers", 1).unwrap();
            assert!(tracker.release("temp_buffers:a").unwrap());
            assert_eq!(*seen.lock().unwrap(), ["temp_buffers:a"]);
        }
    }

    mod pressure {
        use super::*;

        #[test]
        fn test_lowest_priority_first() {
            let tracker = tracker();
            tracker.register("model_shards:s", 0u8, "model_shards", 30 * MB).unwrap();
            tracker.register("temp_buffers:t", 0u8, "temp_buffers", 30 * MB).unwrap();
            tracker.register("render_cache:r", 0u8, "render_cache", 30 * MB).unwrap();

            assert_eq!(tracker.release_by_pressure(50 * MB), 2);
            assert!(tracker.contains("model_shards:s"));
            assert!(!tracker.contains("temp_buffers:t"));
            assert!(!tracker.contains("render_cache:r"));
        }

        #[test]
        fn test_skips_active_and_locked() {
            let tracker = tracker();
            tracker.register("temp_buffers:busy", 0u8, "temp_buffers", 10 * MB).unwrap();
            tracker.register("temp_buffers:held", 0u8, "temp_buffers", 10 * MB).unwrap();
            tracker.register("model_shards:s", 0u8, "model_shards", 10 * MB).unwrap();

            let _usage = tracker.acquire("temp_buffers:busy").unwrap();
            let _lock = tracker.locks().lock_read("temp_buffers:held", SHORT).unwrap();

            assert_eq!(tracker.release_by_pressure(100 * MB), 1);
            assert!(tracker.contains("temp_buffers:busy"));
            assert!(tracker.contains("temp_buffers:held"));
            assert!(!tracker.contains("model_shards:s"));
        }

        #[test]
        fn test_zero_need_is_noop() {
            let tracker = tracker();
            tracker.register("temp_buffers:t", 0u8, "temp_buffers", 1).unwrap();
            assert_eq!(tracker.release_by_pressure(0), 0);
            assert!(tracker.contains("temp_buffers:t"));
        }

        #[test]
        fn test_moderate_pressure_shrinks_incremental() {
            let tracker = tracker();
            tracker
                .reaper()
                .register_handler("index_structures", Arc::new(RollingBufferHandler));

            let buffer: RollingBuffer = (0..4).map(|_| vec![0u8; 25]).collect();
            tracker.register("index_structures:idx", buffer, "index_structures", 100).unwrap();
            tracker.register("model_shards:s", 0u8, "model_shards", 900).unwrap();

            // 50 of 1000 tracked bytes is moderate
            assert_eq!(tracker.release_by_pressure(50), 1);
            let handle = tracker.handle("index_structures:idx").unwrap();
            assert_eq!(handle.size_bytes, 50);
            assert!(tracker.contains("model_shards:s"));

            let events = tracker.recent_events(1);
            assert_eq!(events[0].kind, ReleaseKind::Incremental);
            assert_eq!(events[0].freed_bytes, 50);
        }

        #[test]
        fn test_moderate_shortfall_releases_fully() {
            let tracker = tracker();
            tracker
                .reaper()
                .register_handler("index_structures", Arc::new(RollingBufferHandler));

            let buffer: RollingBuffer = (0..4).map(|_| vec![0u8; 25]).collect();
            tracker.register("index_structures:idx", buffer, "index_structures", 100).unwrap();
            tracker.register("model_shards:s", 0u8, "model_shards", 1000).unwrap();

            // 200 of 1100 is moderate, but only model_shards can cover it after the shrink
            let count = tracker.release_by_pressure(200);
            assert_eq!(count, 2);
            assert!(!tracker.contains("model_shards:s"));
            assert_eq!(tracker.handle("index_structures:idx").unwrap().size_bytes, 50);
        }

        #[test]
        fn test_shrink_shortfall_falls_back_to_full_release() {
            let tracker = tracker();
            tracker
                .reaper()
                .register_handler("index_structures", Arc::new(RollingBufferHandler));

            let buffer: RollingBuffer = [vec![0u8; 1], vec![0u8; 1], vec![0u8; 98]]
                .into_iter()
                .collect();
            tracker.register("index_structures:idx", buffer, "index_structures", 100).unwrap();
            tracker.register("model_shards:busy", 0u8, "model_shards", 300).unwrap();
            let _usage = tracker.acquire("model_shards:busy").unwrap();

            // Moderate (50 <= 100), but shedding one chunk frees a single byte
            assert_eq!(tracker.release_by_pressure(50), 1);
            assert!(!tracker.contains("index_structures:idx"));

            let kinds: Vec<_> = tracker.recent_events(10).into_iter().map(|e| e.kind).collect();
            assert_eq!(kinds, [ReleaseKind::Full, ReleaseKind::Incremental]);
            assert_eq!(tracker.release_stats().total_released_bytes, 100);
        }

        #[test]
        fn test_emergency_pressure_destroys_incremental() {
            let tracker = tracker();
            tracker
                .reaper()
                .register_handler("index_structures", Arc::new(RollingBufferHandler));

            let buffer: RollingBuffer = (0..4).map(|_| vec![0u8; 25]).collect();
            tracker.register("index_structures:idx", buffer, "index_structures", 100).unwrap();

            assert_eq!(tracker.release_by_pressure(80), 1);
            assert!(!tracker.contains("index_structures:idx"));
        }
    }

    mod expiry {
        use super::*;

        #[test]
        fn test_sweep_releases_only_expired() {
            let tracker = tracker();
            tracker.register("temp_buffers:old", 0u8, "temp_buffers", 1).unwrap();
            tracker.register("model_shards:young", 0u8, "model_shards", 1).unwrap();

            let later = Utc::now() + TimeDelta::seconds(120);
            assert_eq!(tracker.sweep_expired_at(later), 1);
            assert!(!tracker.contains("temp_buffers:old"));
            assert!(tracker.contains("model_shards:young"));
            assert_eq!(tracker.recent_events(1)[0].cause, ReleaseCause::Expired);
        }

        #[test]
        fn test_sweep_skips_in_use() {
            let tracker = tracker();
            tracker.register("temp_buffers:busy", 0u8, "temp_buffers", 1).unwrap();
            let _usage = tracker.acquire("temp_buffers:busy").unwrap();

            let later = Utc::now() + TimeDelta::seconds(120);
            assert_eq!(tracker.sweep_expired_at(later), 0);
            assert!(tracker.contains("temp_buffers:busy"));
        }
    }

    mod rollback {
        use super::*;

        #[test]
        fn test_rollback_after_release() {
            let tracker = tracker();
            tracker.register("render_cache:f", vec![1u8, 2], "render_cache", 2).unwrap();
            assert!(tracker.release("render_cache:f").unwrap());
            assert!(tracker.recent_events(1)[0].snapshot_taken);

            assert!(tracker.rollback("render_cache:f"));
            let content = tracker
                .read("render_cache:f", SHORT, |p| p.downcast_ref::<Vec<u8>>().unwrap().clone())
                .unwrap();
            assert_eq!(content, vec![1, 2]);
            assert_eq!(tracker.handle("render_cache:f").unwrap().size_bytes, 2);
        }

        #[test]
        fn test_rollback_reinstates_then_restores_in_place() {
            let tracker = tracker();
            tracker
                .reaper()
                .register_handler("audio_buffers", Arc::new(RollingBufferHandler));
            let buffer: RollingBuffer = (0..4).map(|_| vec![0u8; 25]).collect();
            tracker.register("audio_buffers:a", buffer, "audio_buffers", 100).unwrap();
            tracker.register("model_shards:s", 0u8, "model_shards", 900).unwrap();

            // audio_buffers is not incremental in the sample catalog, so it is destroyed
            assert_eq!(tracker.release_by_pressure(50), 1);
            assert!(tracker.rollback("audio_buffers:a"));
            let chunks = tracker
                .read("audio_buffers:a", SHORT, |p| p.downcast_ref::<RollingBuffer>().unwrap().len())
                .unwrap();
            assert_eq!(chunks, 4);

            // Registered again: second rollback restores in place
            tracker
                .write("audio_buffers:a", SHORT, |p| {
                    p.downcast_mut::<RollingBuffer>().unwrap().discard_oldest(1.0)
                })
                .unwrap();
            assert!(tracker.rollback("audio_buffers:a"));
            let chunks = tracker
                .read("audio_buffers:a", SHORT, |p| p.downcast_ref::<RollingBuffer>().unwrap().len())
                .unwrap();
            assert_eq!(chunks, 4);
            assert_eq!(tracker.release_stats().rollback_count, 2);
        }

        #[test]
        fn test_rollback_without_snapshot() {
            let tracker = tracker();
            tracker.register("model_shards:s", 0u8, "model_shards", 1).unwrap();
            assert!(tracker.release("model_shards:s").unwrap());
            assert!(!tracker.rollback("model_shards:s"));

            let stats = tracker.release_stats();
            assert_eq!(stats.rollback_count, 1);
            assert_eq!(stats.rollback_success_rate, 0.0);
        }
    }

    #[test]
    fn test_explain_and_compact() {
        let tracker = tracker();
        tracker.register("temp_buffers:t", 0u8, "temp_buffers", 1).unwrap();
        let explanation = tracker.explain("temp_buffers:t").unwrap();
        assert_eq!(explanation.position, 0);
        assert!(tracker.explain("temp_buffers:none").is_none());

        tracker.read("temp_buffers:t", SHORT, |_| ()).unwrap();
        assert_eq!(tracker.compact(), 0);
    }
}
