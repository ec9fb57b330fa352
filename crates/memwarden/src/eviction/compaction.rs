//! Memory compaction
//!
//! The defragmenter runs registered compaction hooks (registry shrink, idle
//! lock collection, snapshot purge) and then asks the allocator to return
//! free pages to the OS. It fires on a timer and whenever cumulative
//! released bytes cross a threshold.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::DefragConfig;
use crate::error::Result;
use crate::process;
use crate::sync;
use crate::task::PeriodicTask;
use crate::tracker::ResourceTracker;

/// A compaction step. Returns how many items it reclaimed.
pub type CompactionHook = Arc<dyn Fn() -> usize + Send + Sync>;

/// What started a compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionTrigger {
    Manual,
    Timer,
    Threshold,
}

/// Result of a compaction run
#[derive(Debug, Clone, Serialize)]
pub struct CompactionResult {
    pub trigger: CompactionTrigger,
    /// Resident set size before, if the platform reports it
    pub bytes_before: Option<u64>,
    pub bytes_after: Option<u64>,
    /// Hooks executed
    pub hooks_run: usize,
    /// Items reclaimed across all hooks
    pub items_reclaimed: usize,
    /// The allocator reported returning memory to the OS
    pub allocator_trimmed: bool,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl CompactionResult {
    /// Drop in resident set size, zero when unknown or when it grew
    pub fn freed_bytes(&self) -> u64 {
        match (self.bytes_before, self.bytes_after) {
            (Some(before), Some(after)) => before.saturating_sub(after),
            _ => 0,
        }
    }
}

struct DefragInner {
    config: DefragConfig,
    hooks: Mutex<Vec<(String, CompactionHook)>>,
    /// Held for the duration of a compaction
    running: Mutex<()>,
    released_since: AtomicU64,
    runs: AtomicU64,
    last: Mutex<Option<CompactionResult>>,
    auto: Mutex<Option<PeriodicTask>>,
}

/// Cheap-to-clone handle to the compaction engine.
#[derive(Clone)]
pub struct MemoryDefragmenter {
    inner: Arc<DefragInner>,
}

impl Default for MemoryDefragmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDefragmenter {
    pub fn new() -> Self {
        Self::with_config(DefragConfig::default())
    }

    pub fn with_config(config: DefragConfig) -> Self {
        Self {
            inner: Arc::new(DefragInner {
                config,
                hooks: Mutex::new(Vec::new()),
                running: Mutex::new(()),
                released_since: AtomicU64::new(0),
                runs: AtomicU64::new(0),
                last: Mutex::new(None),
                auto: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &DefragConfig {
        &self.inner.config
    }

    /// Add a compaction step, run in registration order
    pub fn register_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        sync::lock(&self.inner.hooks, "compaction hooks").push((name.into(), Arc::new(hook)));
    }

    /// Forward the tracker's release events into [`MemoryDefragmenter::notify_released`]
    pub fn attach(&self, tracker: &ResourceTracker) {
        let defrag = self.clone();
        tracker.subscribe(move |event| defrag.notify_released(event.freed_bytes));
    }

    /// Compact now, waiting for any compaction already in progress
    pub fn compact_now(&self) -> CompactionResult {
        let _running = sync::lock(&self.inner.running, "compaction");
        self.inner.compact(CompactionTrigger::Manual)
    }

    /// Record released bytes; crossing the threshold schedules a compaction.
    ///
    /// The compaction runs off the calling thread and is skipped if another
    /// one is already running.
    pub fn notify_released(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let threshold = self.inner.config.release_threshold_bytes;
        let total = self.inner.released_since.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if total < threshold {
            return;
        }
        // Only the caller that resets the counter dispatches
        if self
            .inner
            .released_since
            .compare_exchange(total, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        tracing::debug!(released = total, threshold, "release threshold reached");
        let inner = Arc::clone(&self.inner);
        let work = move || {
            inner.try_compact(CompactionTrigger::Threshold);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(work);
            }
            Err(_) => {
                if let Err(e) = std::thread::Builder::new()
                    .name("memwarden-defrag".into())
                    .spawn(work)
                {
                    tracing::warn!(error = %e, "failed to spawn compaction thread");
                }
            }
        }
    }

    /// Bytes released since the last threshold-triggered compaction
    pub fn released_since_last(&self) -> u64 {
        self.inner.released_since.load(Ordering::Acquire)
    }

    /// Number of completed compactions
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::Acquire)
    }

    pub fn last_result(&self) -> Option<CompactionResult> {
        sync::lock(&self.inner.last, "compaction result").clone()
    }

    /// Start timer-driven compaction. Restarts the timer if already running.
    pub fn start_auto(&self, interval: Duration) -> Result<()> {
        let inner = Arc::downgrade(&self.inner);
        let task = PeriodicTask::spawn("defragmenter", interval, move || {
            if let Some(inner) = inner.upgrade() {
                inner.try_compact(CompactionTrigger::Timer);
            }
        })?;
        if let Some(mut previous) = sync::lock(&self.inner.auto, "defrag timer").replace(task) {
            previous.stop();
        }
        tracing::info!(?interval, "automatic compaction started");
        Ok(())
    }

    pub fn stop_auto(&self) {
        if let Some(mut task) = sync::lock(&self.inner.auto, "defrag timer").take() {
            task.stop();
            tracing::info!("automatic compaction stopped");
        }
    }

    pub fn is_auto_running(&self) -> bool {
        sync::lock(&self.inner.auto, "defrag timer")
            .as_ref()
            .is_some_and(PeriodicTask::is_running)
    }
}

impl DefragInner {
    /// Compact unless another compaction holds the lock
    fn try_compact(&self, trigger: CompactionTrigger) -> Option<CompactionResult> {
        match self.running.try_lock() {
            Ok(_running) => Some(self.compact(trigger)),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                let _running = poisoned.into_inner();
                Some(self.compact(trigger))
            }
            Err(std::sync::TryLockError::WouldBlock) => {
                tracing::debug!(?trigger, "compaction already running, skipped");
                None
            }
        }
    }

    /// Caller must hold `running`
    fn compact(&self, trigger: CompactionTrigger) -> CompactionResult {
        let started = Instant::now();
        let bytes_before = process::current_rss_bytes();

        let hooks = sync::lock(&self.hooks, "compaction hooks").clone();
        let mut items_reclaimed = 0;
        for (name, hook) in &hooks {
            let reclaimed = hook();
            tracing::debug!(hook = %name, reclaimed, "compaction hook finished");
            items_reclaimed += reclaimed;
        }

        let allocator_trimmed = process::trim_allocator();
        let bytes_after = process::current_rss_bytes();

        let result = CompactionResult {
            trigger,
            bytes_before,
            bytes_after,
            hooks_run: hooks.len(),
            items_reclaimed,
            allocator_trimmed,
            duration_ms: started.elapsed().as_millis() as u64,
            completed_at: Utc::now(),
        };
        self.runs.fetch_add(1, Ordering::AcqRel);
        tracing::info!(
            ?trigger,
            freed_bytes = result.freed_bytes(),
            items_reclaimed,
            duration_ms = result.duration_ms,
            "memory compaction finished"
        );
        *sync::lock(&self.last, "compaction result") = Some(result.clone());
        result
    }
}

impl Drop for DefragInner {
    fn drop(&mut self) {
        if let Ok(auto) = self.auto.get_mut() {
            if let Some(task) = auto.as_mut() {
                task.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_hook(defrag: &MemoryDefragmenter) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        defrag.register_hook("count", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            3
        });
        calls
    }

    #[test]
    fn test_compact_now_runs_hooks() {
        let defrag = MemoryDefragmenter::new();
        let calls = counting_hook(&defrag);

        let result = defrag.compact_now();
        assert_eq!(result.trigger, CompactionTrigger::Manual);
        assert_eq!(result.hooks_run, 1);
        assert_eq!(result.items_reclaimed, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(defrag.runs(), 1);
        assert!(defrag.last_result().is_some());
    }

    #[test]
    fn test_below_threshold_accumulates() {
        let defrag = MemoryDefragmenter::with_config(DefragConfig {
            release_threshold_bytes: 1000,
            ..DefragConfig::default()
        });
        defrag.notify_released(400);
        defrag.notify_released(0);
        defrag.notify_released(500);
        assert_eq!(defrag.released_since_last(), 900);
        assert_eq!(defrag.runs(), 0);
    }

    #[test]
    fn test_threshold_resets_and_compacts() {
        let defrag = MemoryDefragmenter::with_config(DefragConfig {
            release_threshold_bytes: 1000,
            ..DefragConfig::default()
        });
        let calls = counting_hook(&defrag);

        defrag.notify_released(600);
        defrag.notify_released(600);
        assert_eq!(defrag.released_since_last(), 0);

        let deadline = Instant::now() + Duration::from_secs(5);
        while defrag.runs() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(defrag.runs(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            defrag.last_result().unwrap().trigger,
            CompactionTrigger::Threshold
        );
    }

    #[test]
    fn test_busy_compaction_is_coalesced() {
        let defrag = MemoryDefragmenter::new();
        let _running = defrag.inner.running.lock().unwrap();
        assert!(defrag.inner.try_compact(CompactionTrigger::Threshold).is_none());
        assert_eq!(defrag.runs(), 0);
    }

    #[tokio::test]
    async fn test_auto_compaction_timer() {
        let defrag = MemoryDefragmenter::new();
        let calls = counting_hook(&defrag);

        defrag.start_auto(Duration::from_millis(10)).unwrap();
        assert!(defrag.is_auto_running());
        tokio::time::sleep(Duration::from_millis(80)).await;
        defrag.stop_auto();

        assert!(!defrag.is_auto_running());
        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(
            defrag.last_result().unwrap().trigger,
            CompactionTrigger::Timer
        );
    }
}
