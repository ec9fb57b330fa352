//! Release pipeline components: scoring, snapshots, teardown and compaction

pub mod compaction;
pub mod prioritizer;
pub mod reaper;
pub mod snapshot;

pub use compaction::{CompactionResult, CompactionTrigger, MemoryDefragmenter};
pub use prioritizer::{Explanation, ReleasePrioritizer, ScoreBreakdown};
pub use reaper::{
    DefaultReleaser, HandlerError, Releasable, ReleaseMode, ReleaseOutcome, ReleaseTarget,
    ResourceReaper, RollingBufferHandler,
};
pub use snapshot::{
    PendingSnapshot, RestoreTarget, SnapshotInfo, SnapshotStore, Snapshotable, StructuralCopy,
};
