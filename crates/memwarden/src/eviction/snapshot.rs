//! Pre-release snapshots
//!
//! Before a low-priority resource is torn down the store keeps a deep copy of
//! its payload so that the release can be rolled back. Backups are
//! best-effort: any failure makes [`SnapshotStore::capture`] return `None` and
//! the release proceeds regardless. A captured backup only replaces the stored
//! snapshot once it is committed.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use super::reaper::{HandlerError, contain};
use crate::config::SnapshotConfig;
use crate::error::{Result, WardenError};
use crate::lock::LockManager;
use crate::resource::{Payload, PayloadSlot, ResourceHandle, ResourceTypeDescriptor};
use crate::sync;

/// Type-specific backup and restore.
///
/// The default implementation is a structural deep copy, which fails for
/// payloads that cannot be copied.
pub trait Snapshotable: Send + Sync {
    fn backup(
        &self,
        id: &str,
        payload: &dyn Payload,
    ) -> std::result::Result<Box<dyn Payload>, HandlerError> {
        payload
            .duplicate()
            .ok_or_else(|| HandlerError::new(format!("payload of {id} cannot be copied")))
    }

    fn restore(
        &self,
        id: &str,
        current: &mut dyn Payload,
        backup: &dyn Payload,
    ) -> std::result::Result<(), HandlerError> {
        if current.restore_from(backup) {
            Ok(())
        } else {
            Err(HandlerError::new(format!(
                "backup of {id} does not match the live payload type"
            )))
        }
    }
}

/// Deep copy via [`Payload::duplicate`]
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralCopy;

impl Snapshotable for StructuralCopy {}

/// Where a rollback lands.
///
/// Implemented by the tracker, which owns the registry.
pub trait RestoreTarget {
    /// Overwrite the live payload of a registered resource.
    ///
    /// Returns `Ok(false)` when the resource is no longer registered.
    fn restore_in_place(
        &self,
        snapshot: &SnapshotInfo,
        backup: &dyn Payload,
        handler: &dyn Snapshotable,
    ) -> Result<bool>;

    /// Register the resource again with `payload`
    fn reinstate(&self, snapshot: &SnapshotInfo, payload: Box<dyn Payload>) -> Result<()>;
}

#[derive(Debug)]
struct Snapshot {
    info: SnapshotInfo,
    backup: Box<dyn Payload>,
    captured: Instant,
}

/// A backup that has been taken but not stored yet.
///
/// Dropping it discards the backup.
#[derive(Debug)]
pub struct PendingSnapshot(Snapshot);

impl PendingSnapshot {
    pub fn info(&self) -> &SnapshotInfo {
        &self.0.info
    }
}

/// Metadata of a stored snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub resource_id: String,
    pub type_name: String,
    pub size_bytes: u64,
    pub taken_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub expires_at: DateTime<Utc>,
}

pub struct SnapshotStore {
    config: SnapshotConfig,
    locks: Arc<LockManager>,
    snapshots: Mutex<HashMap<String, Arc<Snapshot>>>,
    handlers: RwLock<HashMap<String, Arc<dyn Snapshotable>>>,
    fallback: Arc<dyn Snapshotable>,
}

impl SnapshotStore {
    pub fn new(locks: Arc<LockManager>) -> Self {
        Self::with_config(locks, SnapshotConfig::default())
    }

    pub fn with_config(locks: Arc<LockManager>, config: SnapshotConfig) -> Self {
        Self {
            config,
            locks,
            snapshots: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            fallback: Arc::new(StructuralCopy),
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Install backup/restore logic for `type_name`
    pub fn register_handler(&self, type_name: impl Into<String>, handler: Arc<dyn Snapshotable>) {
        sync::write(&self.handlers, "snapshot handlers").insert(type_name.into(), handler);
    }

    fn handler_for(&self, type_name: &str) -> Arc<dyn Snapshotable> {
        sync::read(&self.handlers, "snapshot handlers")
            .get(type_name)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Whether resources of this type are backed up before release
    pub fn covers(&self, descriptor: &ResourceTypeDescriptor) -> bool {
        descriptor.priority < self.config.priority_threshold
    }

    /// Back up a resource and store the backup right away.
    ///
    /// Returns `false` when the type is not covered, the lock cannot be
    /// taken in time, the payload is gone or the backup handler fails.
    pub fn take(
        &self,
        handle: &ResourceHandle,
        slot: &PayloadSlot,
        descriptor: &ResourceTypeDescriptor,
    ) -> bool {
        match self.capture(handle, slot, descriptor) {
            Some(pending) => {
                self.commit(pending);
                true
            }
            None => false,
        }
    }

    /// Back up a resource under a short read lock without storing it.
    ///
    /// A stored snapshot of the same resource stays untouched until the
    /// backup is committed, so a release that does not go through can drop
    /// the backup instead.
    pub fn capture(
        &self,
        handle: &ResourceHandle,
        slot: &PayloadSlot,
        descriptor: &ResourceTypeDescriptor,
    ) -> Option<PendingSnapshot> {
        if !self.covers(descriptor) {
            return None;
        }

        let id = handle.id.as_str();
        let _guard = match self.locks.lock_read(id, self.config.read_lock_timeout()) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::debug!(resource = id, "snapshot skipped: read lock timed out");
                return None;
            }
            Err(e) => {
                tracing::debug!(resource = id, error = %e, "snapshot skipped");
                return None;
            }
        };

        let handler = self.handler_for(&descriptor.type_name);
        let backup = match slot.with(|payload| contain(|| handler.backup(id, payload)))? {
            Ok(backup) => backup,
            Err(message) => {
                let error = WardenError::SnapshotUnavailable(id.to_string());
                tracing::warn!(resource = id, error = %error, reason = %message, "snapshot failed");
                return None;
            }
        };

        let taken_at = Utc::now();
        let ttl_seconds = self.config.ttl_secs;
        Some(PendingSnapshot(Snapshot {
            info: SnapshotInfo {
                resource_id: handle.id.clone(),
                type_name: handle.type_name.clone(),
                size_bytes: handle.size_bytes,
                taken_at,
                ttl_seconds,
                expires_at: taken_at + TimeDelta::seconds(ttl_seconds as i64),
            },
            backup,
            captured: Instant::now(),
        }))
    }

    /// Store a captured backup, replacing any older snapshot of the resource
    pub fn commit(&self, pending: PendingSnapshot) {
        let snapshot = pending.0;
        let id = snapshot.info.resource_id.clone();

        let mut snapshots = sync::lock(&self.snapshots, "snapshots");
        snapshots.insert(id.clone(), Arc::new(snapshot));
        let evicted = enforce_capacity(&mut snapshots, self.config.max_snapshots);
        drop(snapshots);

        tracing::debug!(resource = %id, evicted, "snapshot taken");
    }

    /// True if a live (unexpired) snapshot exists for `id`
    pub fn has(&self, id: &str) -> bool {
        let ttl = self.config.ttl();
        sync::lock(&self.snapshots, "snapshots")
            .get(id)
            .is_some_and(|snapshot| !is_expired(snapshot, ttl))
    }

    pub fn info(&self, id: &str) -> Option<SnapshotInfo> {
        let ttl = self.config.ttl();
        sync::lock(&self.snapshots, "snapshots")
            .get(id)
            .filter(|snapshot| !is_expired(snapshot, ttl))
            .map(|snapshot| snapshot.info.clone())
    }

    /// Restore the backup of `id` into `target`.
    ///
    /// Restores in place when the resource is still registered, otherwise
    /// registers it again. The snapshot is kept either way. Returns `false`
    /// when there is no live snapshot or the restore fails.
    pub fn rollback(&self, id: &str, target: &dyn RestoreTarget) -> bool {
        let ttl = self.config.ttl();
        let snapshot = {
            let snapshots = sync::lock(&self.snapshots, "snapshots");
            match snapshots.get(id) {
                Some(snapshot) if !is_expired(snapshot, ttl) => Arc::clone(snapshot),
                _ => {
                    tracing::debug!(resource = id, "rollback requested without a live snapshot");
                    return false;
                }
            }
        };

        let handler = self.handler_for(&snapshot.info.type_name);
        let result = target
            .restore_in_place(&snapshot.info, snapshot.backup.as_ref(), handler.as_ref())
            .and_then(|restored| {
                if restored {
                    return Ok(());
                }
                let copy = contain(|| handler.backup(id, snapshot.backup.as_ref()))
                    .map_err(|_| WardenError::SnapshotUnavailable(id.to_string()))?;
                target.reinstate(&snapshot.info, copy)
            });

        match result {
            Ok(()) => {
                tracing::info!(resource = id, "resource rolled back from snapshot");
                true
            }
            Err(e) => {
                tracing::warn!(resource = id, error = %e, "rollback failed");
                false
            }
        }
    }

    /// Metadata of every live snapshot, oldest first
    pub fn list(&self) -> Vec<SnapshotInfo> {
        let ttl = self.config.ttl();
        let snapshots = sync::lock(&self.snapshots, "snapshots");
        let mut live: Vec<&Arc<Snapshot>> = snapshots
            .values()
            .filter(|snapshot| !is_expired(snapshot, ttl))
            .collect();
        live.sort_by_key(|snapshot| snapshot.captured);
        live.into_iter().map(|snapshot| snapshot.info.clone()).collect()
    }

    /// Drop snapshots past their TTL and any above the count limit.
    ///
    /// Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.config.ttl();
        let mut snapshots = sync::lock(&self.snapshots, "snapshots");
        let before = snapshots.len();
        snapshots.retain(|_, snapshot| !is_expired(snapshot, ttl));
        let expired = before - snapshots.len();
        let evicted = enforce_capacity(&mut snapshots, self.config.max_snapshots);
        snapshots.shrink_to_fit();

        let removed = expired + evicted;
        if removed > 0 {
            tracing::debug!(expired, evicted, "snapshots purged");
        }
        removed
    }

    pub fn delete(&self, id: &str) -> bool {
        sync::lock(&self.snapshots, "snapshots").remove(id).is_some()
    }

    /// Remove every snapshot, returning how many there were
    pub fn clear(&self) -> usize {
        let mut snapshots = sync::lock(&self.snapshots, "snapshots");
        let count = snapshots.len();
        snapshots.clear();
        count
    }

    /// Number of stored snapshots, including expired ones not yet purged
    pub fn len(&self) -> usize {
        sync::lock(&self.snapshots, "snapshots").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_expired(snapshot: &Snapshot, ttl: Duration) -> bool {
    snapshot.captured.elapsed() > ttl
}

/// Evict oldest snapshots until at most `max` remain
fn enforce_capacity(snapshots: &mut HashMap<String, Arc<Snapshot>>, max: usize) -> usize {
    let mut evicted = 0;
    while snapshots.len() > max {
        let oldest = snapshots
            .iter()
            .min_by_key(|(_, snapshot)| snapshot.captured)
            .map(|(id, _)| id.clone());
        match oldest {
            Some(id) => {
                snapshots.remove(&id);
                evicted += 1;
            }
            None => break,
        }
    }
    evicted
}
