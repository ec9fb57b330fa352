//! Composition root
//!
//! Builds exactly one of each component from a [`Config`], wires them
//! together and owns their background loops.

use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::error::{Result, WardenError};
use crate::eviction::{
    MemoryDefragmenter, ReleasePrioritizer, ResourceReaper, RollingBufferHandler, SnapshotStore,
};
use crate::lock::LockManager;
use crate::resource::TypeCatalog;
use crate::sync;
use crate::task::PeriodicTask;
use crate::tracker::{ResourceTracker, TrackerParts};

pub struct Engine {
    config: Config,
    catalog: Arc<TypeCatalog>,
    locks: Arc<LockManager>,
    snapshots: Arc<SnapshotStore>,
    reaper: Arc<ResourceReaper>,
    tracker: Arc<ResourceTracker>,
    defrag: MemoryDefragmenter,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl Engine {
    /// Validate `config` and wire all components. No background work starts
    /// until [`Engine::start_background`].
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let catalog = Arc::new(TypeCatalog::new(config.types.clone())?);

        let locks = Arc::new(LockManager::with_config(config.locks.clone()));
        let snapshots = Arc::new(SnapshotStore::with_config(
            Arc::clone(&locks),
            config.snapshots.clone(),
        ));
        let reaper = Arc::new(ResourceReaper::new(
            Arc::clone(&locks),
            config.tracker.release_lock_timeout(),
        ));
        for descriptor in catalog.descriptors() {
            if descriptor.incrementally_releasable {
                reaper.register_handler(
                    descriptor.type_name.clone(),
                    Arc::new(RollingBufferHandler),
                );
            }
        }

        let tracker = Arc::new(ResourceTracker::with_parts(
            Arc::clone(&catalog),
            config.tracker.clone(),
            TrackerParts {
                locks: Arc::clone(&locks),
                snapshots: Arc::clone(&snapshots),
                reaper: Arc::clone(&reaper),
                prioritizer: ReleasePrioritizer::with_weights(config.scoring),
            },
        ));

        let defrag = MemoryDefragmenter::with_config(config.defrag.clone());
        defrag.attach(&tracker);
        let registry = Arc::downgrade(&tracker);
        defrag.register_hook("registry", move || {
            registry.upgrade().map_or(0, |tracker| tracker.compact())
        });
        let store = Arc::downgrade(&snapshots);
        defrag.register_hook("snapshots", move || {
            store.upgrade().map_or(0, |snapshots| snapshots.purge_expired())
        });

        tracing::info!(types = catalog.len(), "memwarden engine initialized");
        Ok(Self {
            config,
            catalog,
            locks,
            snapshots,
            reaper,
            tracker,
            defrag,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the lock monitor, snapshot cleanup, expiry sweep and
    /// compaction timer on the current tokio runtime
    pub fn start_background(&self) -> Result<()> {
        let mut tasks = sync::lock(&self.tasks, "engine tasks");
        if !tasks.is_empty() {
            return Err(WardenError::Runtime(
                "background tasks already running".into(),
            ));
        }

        let locks = Arc::clone(&self.locks);
        let monitor = PeriodicTask::spawn(
            "lock-monitor",
            self.config.locks.monitor_interval(),
            move || {
                locks.sweep_timeouts();
            },
        )?;

        let snapshots = Arc::clone(&self.snapshots);
        let cleanup = PeriodicTask::spawn(
            "snapshot-cleanup",
            self.config.snapshots.cleanup_interval(),
            move || {
                snapshots.purge_expired();
            },
        )?;

        let tracker = Arc::clone(&self.tracker);
        let sweep = PeriodicTask::spawn(
            "expiry-sweep",
            self.config.tracker.sweep_interval(),
            move || {
                tracker.sweep_expired();
            },
        )?;

        self.defrag.start_auto(self.config.defrag.interval())?;
        tasks.extend([monitor, cleanup, sweep]);

        tracing::info!("background tasks started");
        Ok(())
    }

    /// Stop every background task. Safe to call more than once.
    pub fn shutdown(&self) {
        let mut tasks = sync::lock(&self.tasks, "engine tasks");
        if tasks.is_empty() {
            return;
        }
        for task in tasks.iter_mut() {
            task.stop();
        }
        tasks.clear();
        self.defrag.stop_auto();
        tracing::info!("background tasks stopped");
    }

    pub fn is_running(&self) -> bool {
        sync::lock(&self.tasks, "engine tasks")
            .iter()
            .any(PeriodicTask::is_running)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<TypeCatalog> {
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

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    pub fn defragmenter(&self) -> &MemoryDefragmenter {
        &self.defrag
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
