//! Type-specific resource teardown
//!
//! The reaper checks the per-resource lock, takes the write lock, and hands the
//! payload to the handler registered for its type. Handlers may destroy the
//! payload outright or shed part of it. Handler errors and panics are contained
//! and reported as [`ReleaseOutcome::Failed`].

use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::WardenError;
use crate::lock::LockManager;
use crate::resource::{Payload, PayloadSlot, RollingBuffer};
use crate::sync;

/// Failure reported by a release or snapshot handler
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Type-specific release logic.
///
/// Both methods run under the resource's write lock. The reaper drops the
/// payload itself after a successful `teardown`.
pub trait Releasable: Send + Sync {
    /// Free whatever the payload holds outside of its own allocation
    fn teardown(&self, _id: &str, _payload: &mut dyn Payload) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Discard roughly `fraction` of the payload's oldest state.
    ///
    /// Returns the bytes freed, or `None` if the payload cannot be shrunk.
    fn shrink(
        &self,
        _id: &str,
        _payload: &mut dyn Payload,
        _fraction: f64,
    ) -> Result<Option<u64>, HandlerError> {
        Ok(None)
    }
}

/// Full teardown with no extra cleanup
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultReleaser;

impl Releasable for DefaultReleaser {}

/// Shrinks [`RollingBuffer`] payloads by dropping their oldest chunks
#[derive(Debug, Default, Clone, Copy)]
pub struct RollingBufferHandler;

impl Releasable for RollingBufferHandler {
    fn shrink(
        &self,
        _id: &str,
        payload: &mut dyn Payload,
        fraction: f64,
    ) -> Result<Option<u64>, HandlerError> {
        Ok(payload
            .downcast_mut::<RollingBuffer>()
            .map(|buffer| buffer.discard_oldest(fraction)))
    }
}

/// How much of a resource to release
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReleaseMode {
    Full,
    /// Shed `fraction` of the payload, falling back to a full release when
    /// the handler cannot shrink it
    Incremental { fraction: f64 },
}

/// Result of one release attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Payload destroyed; the caller must drop the registry entry
    Removed { freed_bytes: u64 },
    /// Payload shed part of its state and stays registered
    Shrunk { freed_bytes: u64 },
    /// Payload was already gone
    AlreadyReleased,
    /// Resource was locked by a consumer
    Aborted,
    /// Handler returned an error or panicked; the resource stays registered
    Failed { message: String },
}

impl ReleaseOutcome {
    /// Removed or shrunk
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Removed { .. } | Self::Shrunk { .. })
    }

    pub fn freed_bytes(&self) -> u64 {
        match self {
            Self::Removed { freed_bytes } | Self::Shrunk { freed_bytes } => *freed_bytes,
            _ => 0,
        }
    }
}

/// Everything the reaper needs to know about one resource
#[derive(Debug, Clone, Copy)]
pub struct ReleaseTarget<'a> {
    pub id: &'a str,
    pub type_name: &'a str,
    pub size_bytes: u64,
    pub slot: &'a PayloadSlot,
    /// Consumer count of the resource, checked again under the write lock
    pub users: Option<&'a AtomicUsize>,
}

pub struct ResourceReaper {
    locks: Arc<LockManager>,
    handlers: RwLock<HashMap<String, Arc<dyn Releasable>>>,
    fallback: Arc<dyn Releasable>,
    lock_timeout: Duration,
}

impl ResourceReaper {
    pub fn new(locks: Arc<LockManager>, lock_timeout: Duration) -> Self {
        Self {
            locks,
            handlers: RwLock::new(HashMap::new()),
            fallback: Arc::new(DefaultReleaser),
            lock_timeout,
        }
    }

    /// Install the handler for every resource of `type_name`, replacing any previous one
    pub fn register_handler(&self, type_name: impl Into<String>, handler: Arc<dyn Releasable>) {
        let type_name = type_name.into();
        tracing::debug!(type_name = %type_name, "release handler registered");
        sync::write(&self.handlers, "release handlers").insert(type_name, handler);
    }

    fn handler_for(&self, type_name: &str) -> Arc<dyn Releasable> {
        sync::read(&self.handlers, "release handlers")
            .get(type_name)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Release one resource.
    ///
    /// Never removes the registry entry; that is the caller's job on
    /// [`ReleaseOutcome::Removed`].
    pub fn release(&self, target: &ReleaseTarget<'_>, mode: ReleaseMode) -> ReleaseOutcome {
        if target.slot.is_released() {
            return ReleaseOutcome::AlreadyReleased;
        }
        if self.locks.is_locked(target.id) {
            tracing::debug!(resource = target.id, "release aborted: resource is locked");
            return ReleaseOutcome::Aborted;
        }

        let _guard = match self.locks.lock_write(target.id, self.lock_timeout) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::debug!(resource = target.id, "release aborted: write lock timed out");
                return ReleaseOutcome::Aborted;
            }
            Err(e) => {
                tracing::warn!(resource = target.id, error = %e, "release aborted");
                return ReleaseOutcome::Aborted;
            }
        };
        if target.users.is_some_and(|users| users.load(Ordering::Acquire) > 0) {
            tracing::debug!(resource = target.id, "release aborted: resource is in use");
            return ReleaseOutcome::Aborted;
        }

        let handler = self.handler_for(target.type_name);

        if let ReleaseMode::Incremental { fraction } = mode {
            let shrunk = target.slot.with_mut(|payload| {
                contain(|| handler.shrink(target.id, payload, fraction))
            });
            match shrunk {
                None => return ReleaseOutcome::AlreadyReleased,
                Some(Ok(Some(freed_bytes))) if freed_bytes > 0 => {
                    tracing::debug!(resource = target.id, freed_bytes, "resource shrunk");
                    return ReleaseOutcome::Shrunk { freed_bytes };
                }
                Some(Ok(_)) => {
                    tracing::debug!(
                        resource = target.id,
                        "nothing to shed, falling back to full release"
                    );
                }
                Some(Err(message)) => return self.failed(target, message),
            }
        }

        let torn_down = target
            .slot
            .with_mut(|payload| contain(|| handler.teardown(target.id, payload)));
        match torn_down {
            None => ReleaseOutcome::AlreadyReleased,
            Some(Ok(())) => {
                drop(target.slot.take());
                tracing::debug!(
                    resource = target.id,
                    freed_bytes = target.size_bytes,
                    "resource released"
                );
                ReleaseOutcome::Removed {
                    freed_bytes: target.size_bytes,
                }
            }
            Some(Err(message)) => self.failed(target, message),
        }
    }

    /// Release each target in order, isolating failures. Returns how many
    /// were removed or shrunk.
    pub fn release_many(&self, targets: &[ReleaseTarget<'_>], mode: ReleaseMode) -> usize {
        targets
            .iter()
            .filter(|target| self.release(target, mode).is_success())
            .count()
    }

    fn failed(&self, target: &ReleaseTarget<'_>, message: String) -> ReleaseOutcome {
        let error = WardenError::ReleaseHandlerFailure {
            id: target.id.to_string(),
            type_name: target.type_name.to_string(),
            message: message.clone(),
        };
        tracing::error!(
            resource = target.id,
            type_name = target.type_name,
            error = %error,
            "release handler failed"
        );
        ReleaseOutcome::Failed { message }
    }
}

/// Run a handler, turning both errors and panics into a message
pub(crate) fn contain<T>(f: impl FnOnce() -> Result<T, HandlerError>) -> Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(format!("handler panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingReleaser, PanickingReleaser, RecordingReleaser};

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn reaper() -> (Arc<LockManager>, ResourceReaper) {
        let locks = Arc::new(LockManager::new());
        let reaper = ResourceReaper::new(Arc::clone(&locks), TIMEOUT);
        (locks, reaper)
    }

    fn target<'a>(id: &'a str, slot: &'a PayloadSlot) -> ReleaseTarget<'a> {
        ReleaseTarget {
            id,
            type_name: id.split(':').next().unwrap(),
            size_bytes: 100,
            slot,
            users: None,
        }
    }

    mod full {
        use super::*;

        #[test]
        fn test_release_drops_payload() {
            let (_, reaper) = reaper();
            let slot = PayloadSlot::new(Box::new(vec![0u8; 100]));

            let outcome = reaper.release(&target("temp_buffers:a", &slot), ReleaseMode::Full);
            assert_eq!(outcome, ReleaseOutcome::Removed { freed_bytes: 100 });
            assert!(slot.is_released());
        }

        #[test]
        fn test_release_is_idempotent() {
            let (_, reaper) = reaper();
            let slot = PayloadSlot::new(Box::new(1u8));
            let target = target("temp_buffers:a", &slot);

            assert!(reaper.release(&target, ReleaseMode::Full).is_success());
            assert_eq!(
                reaper.release(&target, ReleaseMode::Full),
                ReleaseOutcome::AlreadyReleased
            );
        }

        #[test]
        fn test_locked_resource_aborts() {
            let (locks, reaper) = reaper();
            let slot = PayloadSlot::new(Box::new(1u8));

            let _hold = locks.lock_read("temp_buffers:a", TIMEOUT).unwrap().unwrap();
            let outcome = reaper.release(&target("temp_buffers:a", &slot), ReleaseMode::Full);
            assert_eq!(outcome, ReleaseOutcome::Aborted);
            assert!(!slot.is_released());
        }

        #[test]
        fn test_in_use_resource_aborts() {
            let (locks, reaper) = reaper();
            let slot = PayloadSlot::new(Box::new(1u8));
            let users = AtomicUsize::new(1);
            let target = ReleaseTarget {
                users: Some(&users),
                ..target("temp_buffers:a", &slot)
            };

            assert_eq!(reaper.release(&target, ReleaseMode::Full), ReleaseOutcome::Aborted);
            assert!(!slot.is_released());
            assert!(!locks.is_locked("temp_buffers:a"));

            users.store(0, Ordering::Release);
            assert!(reaper.release(&target, ReleaseMode::Full).is_success());
        }

        #[test]
        fn test_registered_handler_runs() {
            let (_, reaper) = reaper();
            let recorder = Arc::new(RecordingReleaser::default());
            reaper.register_handler("render_cache", recorder.clone());

            let slot = PayloadSlot::new(Box::new(1u8));
            reaper.release(&target("render_cache:f", &slot), ReleaseMode::Full);
            assert_eq!(recorder.released(), ["render_cache:f"]);
        }

        #[test]
        fn test_handler_error_keeps_payload() {
            let (locks, reaper) = reaper();
            reaper.register_handler("render_cache", Arc::new(FailingReleaser));

            let slot = PayloadSlot::new(Box::new(1u8));
            let outcome = reaper.release(&target("render_cache:f", &slot), ReleaseMode::Full);

            assert!(matches!(outcome, ReleaseOutcome::Failed { .. }));
            assert!(!slot.is_released());
            assert!(!locks.is_locked("render_cache:f"));
        }

        #[test]
        fn test_handler_panic_is_contained() {
            let (_, reaper) = reaper();
            reaper.register_handler("render_cache", Arc::new(PanickingReleaser));

            let slot = PayloadSlot::new(Box::new(1u8));
            let outcome = reaper.release(&target("render_cache:f", &slot), ReleaseMode::Full);

            match outcome {
                ReleaseOutcome::Failed { message } => assert!(message.contains("panicked")),
                other => panic!("unexpected outcome: {other:?}"),
            }
            assert!(!slot.is_released());
        }
    }

    mod incremental {
        use super::*;

        #[test]
        fn test_rolling_buffer_shrinks() {
            let (_, reaper) = reaper();
            reaper.register_handler("index_structures", Arc::new(RollingBufferHandler));

            let buffer: RollingBuffer = (0..4).map(|_| vec![0u8; 25]).collect();
            let slot = PayloadSlot::new(Box::new(buffer));
            let outcome = reaper.release(
                &target("index_structures:idx", &slot),
                ReleaseMode::Incremental { fraction: 0.5 },
            );

            assert_eq!(outcome, ReleaseOutcome::Shrunk { freed_bytes: 50 });
            let remaining = slot.with(|p| p.downcast_ref::<RollingBuffer>().unwrap().len());
            assert_eq!(remaining, Some(2));
        }

        #[test]
        fn test_unshrinkable_falls_back_to_full() {
            let (_, reaper) = reaper();
            reaper.register_handler("index_structures", Arc::new(RollingBufferHandler));

            let slot = PayloadSlot::new(Box::new(String::from("not a buffer")));
            let outcome = reaper.release(
                &target("index_structures:idx", &slot),
                ReleaseMode::Incremental { fraction: 0.5 },
            );
            assert_eq!(outcome, ReleaseOutcome::Removed { freed_bytes: 100 });
            assert!(slot.is_released());
        }
    }

    mod batch {
        use super::*;

        #[test]
        fn test_release_many_isolates_failures() {
            let (_, reaper) = reaper();
            reaper.register_handler("render_cache", Arc::new(PanickingReleaser));

            let ok_a = PayloadSlot::new(Box::new(1u8));
            let bad = PayloadSlot::new(Box::new(2u8));
            let ok_b = PayloadSlot::new(Box::new(3u8));
            let targets = [
                target("temp_buffers:a", &ok_a),
                target("render_cache:bad", &bad),
                target("temp_buffers:b", &ok_b),
            ];

            assert_eq!(reaper.release_many(&targets, ReleaseMode::Full), 2);
            assert!(ok_a.is_released());
            assert!(!bad.is_released());
            assert!(ok_b.is_released());
        }
    }
}
