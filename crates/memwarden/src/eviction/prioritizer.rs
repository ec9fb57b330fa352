//! Release scoring
//!
//! Pure functions over resource handles and the type catalog. Lower scores
//! are released first. `now` is always an explicit input in the `*_at`
//! variants so rankings are reproducible.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;

use crate::config::ScoringWeights;
use crate::resource::{ResourceHandle, ResourceTypeDescriptor, TypeCatalog};

const MIB: f64 = 1024.0 * 1024.0;

/// Individual terms of a release score
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub priority_term: f64,
    pub age_term: f64,
    pub active_term: f64,
    pub size_term: f64,
    pub expired_term: f64,
    pub total: f64,
}

/// Why a resource sits where it does in the release order
#[derive(Debug, Clone, Serialize)]
pub struct Explanation {
    pub id: String,
    pub type_name: String,
    /// Zero-based position in the current ranking
    pub position: usize,
    pub score: ScoreBreakdown,
    pub reasons: Vec<String>,
}

/// Orders release candidates by type priority, idleness, size and state.
#[derive(Debug, Clone, Default)]
pub struct ReleasePrioritizer {
    weights: ScoringWeights,
}

impl ReleasePrioritizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weights(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Score one resource at `now`
    pub fn score(
        &self,
        handle: &ResourceHandle,
        descriptor: &ResourceTypeDescriptor,
        now: DateTime<Utc>,
    ) -> ScoreBreakdown {
        let w = &self.weights;
        let idle = handle.idle_for(now).as_secs_f64();

        let priority_term = descriptor.priority as f64 * w.base_weight;
        let age_term = -(idle * w.age_per_second);
        let active_term = if handle.active { w.active_penalty } else { 0.0 };
        let size_term = -(handle.size_bytes as f64 / MIB * w.size_per_mib);
        let expired_term = if handle.is_expired(descriptor, now) {
            -w.expired_bonus
        } else {
            0.0
        };

        ScoreBreakdown {
            priority_term,
            age_term,
            active_term,
            size_term,
            expired_term,
            total: priority_term + age_term + active_term + size_term + expired_term,
        }
    }

    /// Resource ids in release order at the current time
    pub fn rank(&self, resources: &[ResourceHandle], types: &TypeCatalog) -> Vec<String> {
        self.rank_at(resources, types, Utc::now())
    }

    /// Resource ids in release order.
    ///
    /// Resources whose type is missing from the catalog are left out.
    pub fn rank_at(
        &self,
        resources: &[ResourceHandle],
        types: &TypeCatalog,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        self.ranked(resources, types, now)
            .into_iter()
            .map(|(handle, _)| handle.id.clone())
            .collect()
    }

    /// Shortest prefix of the ranking whose sizes add up to `needed_bytes`
    pub fn select_for_target(
        &self,
        resources: &[ResourceHandle],
        types: &TypeCatalog,
        needed_bytes: u64,
    ) -> Vec<String> {
        self.select_for_target_at(resources, types, needed_bytes, Utc::now())
    }

    /// Like [`ReleasePrioritizer::select_for_target`] with an explicit clock.
    ///
    /// Returns every ranked resource if the target cannot be met.
    pub fn select_for_target_at(
        &self,
        resources: &[ResourceHandle],
        types: &TypeCatalog,
        needed_bytes: u64,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let mut selected = Vec::new();
        let mut total = 0u64;
        for (handle, _) in self.ranked(resources, types, now) {
            if total >= needed_bytes {
                break;
            }
            total = total.saturating_add(handle.size_bytes);
            selected.push(handle.id.clone());
        }
        selected
    }

    pub fn explain(
        &self,
        id: &str,
        resources: &[ResourceHandle],
        types: &TypeCatalog,
    ) -> Option<Explanation> {
        self.explain_at(id, resources, types, Utc::now())
    }

    /// Score breakdown and human-readable reasons for one resource
    pub fn explain_at(
        &self,
        id: &str,
        resources: &[ResourceHandle],
        types: &TypeCatalog,
        now: DateTime<Utc>,
    ) -> Option<Explanation> {
        let ranked = self.ranked(resources, types, now);
        let position = ranked.iter().position(|(handle, _)| handle.id == id)?;
        let (handle, score) = ranked[position];
        let descriptor = types.get(&handle.type_name)?;

        let mut reasons = vec![format!(
            "type {} has priority {} ({:+.1})",
            descriptor.type_name, descriptor.priority, score.priority_term
        )];
        reasons.push(format!(
            "idle for {}s ({:+.1})",
            handle.idle_for(now).as_secs(),
            score.age_term
        ));
        reasons.push(format!(
            "size {:.1} MiB ({:+.1})",
            handle.size_bytes as f64 / MIB,
            score.size_term
        ));
        if handle.active {
            reasons.push(format!("in use ({:+.1})", score.active_term));
        }
        if score.expired_term != 0.0 {
            reasons.push(format!(
                "expired: idle longer than {}s retain time ({:+.1})",
                descriptor.max_retain_seconds, score.expired_term
            ));
        }
        if handle.locked {
            reasons.push("locked: skipped by the release pipeline".to_string());
        }

        Some(Explanation {
            id: handle.id.clone(),
            type_name: handle.type_name.clone(),
            position,
            score,
            reasons,
        })
    }

    fn ranked<'a>(
        &self,
        resources: &'a [ResourceHandle],
        types: &TypeCatalog,
        now: DateTime<Utc>,
    ) -> Vec<(&'a ResourceHandle, ScoreBreakdown)> {
        let mut scored: Vec<_> = resources
            .iter()
            .filter_map(|handle| match types.get(&handle.type_name) {
                Some(descriptor) => Some((handle, self.score(handle, descriptor, now))),
                None => {
                    tracing::warn!(
                        resource = %handle.id,
                        type_name = %handle.type_name,
                        "resource type missing from catalog, not ranked"
                    );
                    None
                }
            })
            .collect();

        scored.sort_by(|(a, sa), (b, sb)| compare(a, sa, b, sb));
        scored
    }
}

fn compare(
    a: &ResourceHandle,
    score_a: &ScoreBreakdown,
    b: &ResourceHandle,
    score_b: &ScoreBreakdown,
) -> Ordering {
    score_a
        .total
        .total_cmp(&score_b.total)
        .then_with(|| a.last_accessed_at.cmp(&b.last_accessed_at))
        .then_with(|| b.size_bytes.cmp(&a.size_bytes))
        .then_with(|| a.id.cmp(&b.id))
}
