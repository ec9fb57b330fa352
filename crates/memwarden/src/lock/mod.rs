//! Per-resource read/write locks with timeout-based force release
//!
//! Locks are keyed by resource id and created lazily. Ownership is tracked per
//! thread so that re-entrant acquisition fails fast instead of deadlocking, and
//! so that a background sweep can revoke holds that outlive the configured
//! timeout. Waiting writers block new readers.

mod guard;

pub use guard::{ReadGuard, WriteGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::config::LockConfig;
use crate::error::{Result, WardenError};
use crate::sync;

/// Kind of hold a thread has on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    mode: LockMode,
    acquired_at: Instant,
}

#[derive(Debug, Default)]
struct LockState {
    holders: HashMap<ThreadId, Holder>,
    pending_writers: usize,
    /// Holds revoked by the timeout sweep whose owners have not released yet
    revoked: HashMap<ThreadId, Revoked>,
}

#[derive(Debug, Clone, Copy)]
struct Revoked {
    mode: LockMode,
    revoked_at: Instant,
}

impl LockState {
    fn readers(&self) -> usize {
        self.holders
            .values()
            .filter(|h| h.mode == LockMode::Read)
            .count()
    }

    fn writer_held(&self) -> bool {
        self.holders.values().any(|h| h.mode == LockMode::Write)
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.pending_writers == 0 && self.revoked.is_empty()
    }
}

#[derive(Debug, Default)]
struct ResourceLock {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl ResourceLock {
    fn is_idle(&self) -> bool {
        sync::lock(&self.state, "lock state").is_idle()
    }
}

/// Observable state of one resource lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub readers: usize,
    pub writer_held: bool,
    pub pending_writers: usize,
}

/// A hold that exceeded the lock timeout and was revoked
#[derive(Debug, Clone, Serialize)]
pub struct LockViolation {
    pub resource_id: String,
    pub mode: LockMode,
    pub held_ms: u64,
    pub detected_at: DateTime<Utc>,
}

/// Table of per-resource locks.
pub struct LockManager {
    locks: DashMap<String, Arc<ResourceLock>>,
    config: LockConfig,
    violations: Mutex<VecDeque<LockViolation>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_config(LockConfig::default())
    }

    pub fn with_config(config: LockConfig) -> Self {
        Self {
            locks: DashMap::new(),
            config,
            violations: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn entry(&self, id: &str) -> Arc<ResourceLock> {
        if let Some(lock) = self.locks.get(id) {
            return Arc::clone(lock.value());
        }
        Arc::clone(self.locks.entry(id.to_string()).or_default().value())
    }

    fn existing(&self, id: &str) -> Option<Arc<ResourceLock>> {
        self.locks.get(id).map(|lock| Arc::clone(lock.value()))
    }

    /// Take a shared hold, waiting up to `timeout`.
    ///
    /// Returns `Ok(false)` on timeout. Fails with `SelfDeadlock` if the calling
    /// thread already holds this resource in any mode.
    pub fn acquire_read(&self, id: &str, timeout: Duration) -> Result<bool> {
        let lock = self.entry(id);
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;

        let mut state = sync::lock(&lock.state, "lock state");
        if state.holders.contains_key(&me) {
            return Err(WardenError::SelfDeadlock(id.to_string()));
        }
        state.revoked.remove(&me);

        loop {
            if !state.writer_held() && state.pending_writers == 0 {
                state.holders.insert(
                    me,
                    Holder {
                        mode: LockMode::Read,
                        acquired_at: Instant::now(),
                    },
                );
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(resource = id, ?timeout, "read lock timed out");
                drop(state);
                drop(lock);
                self.collect(id);
                return Ok(false);
            }
            state = sync::wait_timeout(&lock.changed, state, deadline - now, "lock state");
        }
    }

    /// Take an exclusive hold, waiting up to `timeout`.
    ///
    /// While waiting, the caller counts as a pending writer and new readers
    /// are refused.
    pub fn acquire_write(&self, id: &str, timeout: Duration) -> Result<bool> {
        let lock = self.entry(id);
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;

        let mut state = sync::lock(&lock.state, "lock state");
        if state.holders.contains_key(&me) {
            return Err(WardenError::SelfDeadlock(id.to_string()));
        }
        state.revoked.remove(&me);
        state.pending_writers += 1;

        loop {
            if state.holders.is_empty() {
                state.pending_writers -= 1;
                state.holders.insert(
                    me,
                    Holder {
                        mode: LockMode::Write,
                        acquired_at: Instant::now(),
                    },
                );
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                state.pending_writers -= 1;
                lock.changed.notify_all();
                tracing::debug!(resource = id, ?timeout, "write lock timed out");
                drop(state);
                drop(lock);
                self.collect(id);
                return Ok(false);
            }
            state = sync::wait_timeout(&lock.changed, state, deadline - now, "lock state");
        }
    }

    pub fn release_read(&self, id: &str) -> Result<()> {
        self.release(id, LockMode::Read)
    }

    pub fn release_write(&self, id: &str) -> Result<()> {
        self.release(id, LockMode::Write)
    }

    fn release(&self, id: &str, mode: LockMode) -> Result<()> {
        let Some(lock) = self.existing(id) else {
            return Err(WardenError::NotOwner(id.to_string()));
        };
        let me = thread::current().id();

        {
            let mut state = sync::lock(&lock.state, "lock state");
            match state.holders.get(&me) {
                Some(holder) if holder.mode == mode => {
                    state.holders.remove(&me);
                    lock.changed.notify_all();
                }
                Some(_) => return Err(WardenError::NotOwner(id.to_string())),
                None => match state.revoked.get(&me) {
                    Some(revoked) if revoked.mode == mode => {
                        state.revoked.remove(&me);
                        tracing::debug!(
                            resource = id,
                            ?mode,
                            "release of a force-released hold ignored"
                        );
                    }
                    _ => return Err(WardenError::NotOwner(id.to_string())),
                },
            }
        }

        drop(lock);
        self.collect(id);
        Ok(())
    }

    /// Turn the caller's read hold into a write hold.
    ///
    /// Succeeds once the caller is the only reader. On timeout returns
    /// `Ok(false)` and the read hold is kept.
    pub fn upgrade(&self, id: &str, timeout: Duration) -> Result<bool> {
        let Some(lock) = self.existing(id) else {
            return Err(WardenError::NotOwner(id.to_string()));
        };
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;

        let mut state = sync::lock(&lock.state, "lock state");
        match state.holders.get(&me) {
            Some(holder) if holder.mode == LockMode::Read => {}
            _ => return Err(WardenError::NotOwner(id.to_string())),
        }
        state.pending_writers += 1;

        loop {
            // The hold may have been revoked by the timeout sweep while waiting
            if !state.holders.contains_key(&me) {
                state.pending_writers -= 1;
                lock.changed.notify_all();
                return Ok(false);
            }
            if state.holders.len() == 1 {
                state.pending_writers -= 1;
                state.holders.insert(
                    me,
                    Holder {
                        mode: LockMode::Write,
                        acquired_at: Instant::now(),
                    },
                );
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                state.pending_writers -= 1;
                lock.changed.notify_all();
                return Ok(false);
            }
            state = sync::wait_timeout(&lock.changed, state, deadline - now, "lock state");
        }
    }

    /// Turn the caller's write hold into a read hold, waking waiting readers
    pub fn downgrade(&self, id: &str) -> Result<()> {
        let Some(lock) = self.existing(id) else {
            return Err(WardenError::NotOwner(id.to_string()));
        };
        let me = thread::current().id();

        let mut state = sync::lock(&lock.state, "lock state");
        match state.holders.get_mut(&me) {
            Some(holder) if holder.mode == LockMode::Write => {
                holder.mode = LockMode::Read;
                lock.changed.notify_all();
                Ok(())
            }
            _ => Err(WardenError::NotOwner(id.to_string())),
        }
    }

    /// Scoped shared hold; `Ok(None)` on timeout
    pub fn lock_read(&self, id: &str, timeout: Duration) -> Result<Option<ReadGuard<'_>>> {
        Ok(self
            .acquire_read(id, timeout)?
            .then(|| ReadGuard::new(self, id)))
    }

    /// Scoped exclusive hold; `Ok(None)` on timeout
    pub fn lock_write(&self, id: &str, timeout: Duration) -> Result<Option<WriteGuard<'_>>> {
        Ok(self
            .acquire_write(id, timeout)?
            .then(|| WriteGuard::new(self, id)))
    }

    /// True while any thread holds the resource
    pub fn is_locked(&self, id: &str) -> bool {
        self.existing(id)
            .is_some_and(|lock| !sync::lock(&lock.state, "lock state").holders.is_empty())
    }

    /// Current lock state, or `None` if no lock exists for `id`
    pub fn state(&self, id: &str) -> Option<LockStatus> {
        let lock = self.existing(id)?;
        let state = sync::lock(&lock.state, "lock state");
        Some(LockStatus {
            readers: state.readers(),
            writer_held: state.writer_held(),
            pending_writers: state.pending_writers,
        })
    }

    /// Revoke every hold older than the configured timeout.
    ///
    /// Returns the violations found in this pass. Waiters are woken so they
    /// can take the freed lock.
    pub fn sweep_timeouts(&self) -> Vec<LockViolation> {
        let timeout = self.config.timeout();
        let locks: Vec<(String, Arc<ResourceLock>)> = self
            .locks
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut found = Vec::new();
        for (id, lock) in locks {
            let mut state = sync::lock(&lock.state, "lock state");
            // Owners that never came back within another timeout are gone
            state
                .revoked
                .retain(|_, revoked| revoked.revoked_at.elapsed() <= timeout);
            let expired: Vec<(ThreadId, Holder)> = state
                .holders
                .iter()
                .filter(|(_, holder)| holder.acquired_at.elapsed() > timeout)
                .map(|(thread, holder)| (*thread, *holder))
                .collect();
            if expired.is_empty() {
                continue;
            }

            for (thread, holder) in expired {
                state.holders.remove(&thread);
                state.revoked.insert(
                    thread,
                    Revoked {
                        mode: holder.mode,
                        revoked_at: Instant::now(),
                    },
                );

                let held = holder.acquired_at.elapsed();
                let error = WardenError::LockTimeoutViolation {
                    id: id.clone(),
                    held,
                };
                tracing::warn!(resource = %id, mode = ?holder.mode, error = %error, "lock force-released");
                found.push(LockViolation {
                    resource_id: id.clone(),
                    mode: holder.mode,
                    held_ms: held.as_millis() as u64,
                    detected_at: Utc::now(),
                });
            }
            lock.changed.notify_all();
        }

        if !found.is_empty() {
            let mut history = sync::lock(&self.violations, "lock violations");
            for violation in &found {
                history.push_back(violation.clone());
            }
            while history.len() > self.config.violation_history {
                history.pop_front();
            }
        }
        found
    }

    /// Recent timeout violations, oldest first
    pub fn violations(&self) -> Vec<LockViolation> {
        sync::lock(&self.violations, "lock violations")
            .iter()
            .cloned()
            .collect()
    }

    /// Drop lock state for `id` if nobody holds or waits on it.
    ///
    /// Returns true if an entry was removed.
    pub fn forget(&self, id: &str) -> bool {
        self.collect(id)
    }

    /// Drop every idle, unreferenced lock entry. Returns how many were removed.
    pub fn collect_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks
            .retain(|_, lock| Arc::strong_count(lock) > 1 || !lock.is_idle());
        self.locks.shrink_to_fit();
        before.saturating_sub(self.locks.len())
    }

    /// Number of lock entries currently allocated
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn collect(&self, id: &str) -> bool {
        self.locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1 && lock.is_idle())
            .is_some()
    }
}
