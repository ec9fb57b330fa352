//! memwarden - resource lifecycle and eviction engine
//!
//! Tracks in-memory resources (model shards, render caches, buffers, index
//! structures) on a host with a hard memory ceiling. Resources are scored for
//! release, guarded by per-resource read/write locks with timeout-based force
//! release, snapshotted before teardown so releases can be rolled back, and
//! followed by periodic memory compaction.

pub mod config;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod lock;
pub mod process;
pub mod resource;
pub mod task;
pub mod testing;
pub mod tracker;

mod sync;

pub use config::Config;
pub use engine::Engine;
pub use error::{Result, WardenError};
pub use eviction::{MemoryDefragmenter, ReleasePrioritizer, ResourceReaper, SnapshotStore};
pub use lock::LockManager;
pub use resource::{Opaque, Payload, ResourceHandle, ResourceTypeDescriptor, TypeCatalog};
pub use tracker::ResourceTracker;
