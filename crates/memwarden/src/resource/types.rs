//! Registry-facing resource types

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::error::{Result, WardenError};
use crate::resource::ResourceTypeDescriptor;

/// Point-in-time view of one registered resource.
///
/// Handles are copies; mutating one has no effect on the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceHandle {
    /// `<type>:<instance>` identifier
    pub id: String,
    pub type_name: String,
    /// Footprint reported by the producer
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// At least one usage guard is alive
    pub active: bool,
    /// A per-resource read or write lock is held
    pub locked: bool,
}

impl ResourceHandle {
    /// Build a fresh, idle, unlocked handle stamped at `now`
    pub fn new(
        id: impl Into<String>,
        type_name: impl Into<String>,
        size_bytes: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            size_bytes,
            created_at: now,
            last_accessed_at: now,
            active: false,
            locked: false,
        }
    }

    /// Time since the last access, zero if `now` is earlier
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_accessed_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Idle longer than the type's retain time
    pub fn is_expired(&self, descriptor: &ResourceTypeDescriptor, now: DateTime<Utc>) -> bool {
        self.idle_for(now) > descriptor.max_retain()
    }

    /// Neither in use nor locked
    pub fn is_releasable(&self) -> bool {
        !self.active && !self.locked
    }
}

/// Split a resource id into `(type_name, instance)`.
///
/// Both halves must be non-empty. The instance may itself contain `:`.
pub fn parse_id(id: &str) -> Result<(&str, &str)> {
    match id.split_once(':') {
        Some((type_name, instance)) if !type_name.is_empty() && !instance.is_empty() => {
            Ok((type_name, instance))
        }
        _ => Err(WardenError::InvalidId(id.to_string())),
    }
}
