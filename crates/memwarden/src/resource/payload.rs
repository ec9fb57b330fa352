//! Opaque resource payloads
//!
//! The registry owns every payload through a [`PayloadSlot`]. Any
//! `Clone + Debug + Send + Sync + 'static` type is a [`Payload`] with
//! structural deep copy, in-place restore and downcasting. State that cannot
//! be copied (file handles, device buffers) is wrapped in [`Opaque`], which
//! registers and releases normally but is never snapshotted.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, RwLock};

use crate::sync;

/// An owned, type-erased resource payload.
pub trait Payload: Any + Send + Sync + fmt::Debug + 'static {
    /// Deep copy of the current content, or `None` if the payload cannot be
    /// copied
    fn duplicate(&self) -> Option<Box<dyn Payload>> {
        None
    }

    /// Overwrite this payload with `backup`. Returns false when `backup` has a
    /// different concrete type or the payload cannot be restored.
    fn restore_from(&mut self, _backup: &dyn Payload) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T> Payload for T
where
    T: Clone + Any + Send + Sync + fmt::Debug,
{
    fn duplicate(&self) -> Option<Box<dyn Payload>> {
        Some(Box::new(self.clone()))
    }

    fn restore_from(&mut self, backup: &dyn Payload) -> bool {
        match backup.as_any().downcast_ref::<T>() {
            Some(backup) => {
                *self = backup.clone();
                true
            }
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl dyn Payload {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Payload wrapper for state that cannot be copied.
///
/// Snapshots of an `Opaque` payload fail unless a type-specific snapshot
/// handler knows how to back it up.
pub struct Opaque<T>(pub T);

impl<T> Opaque<T> {
    pub fn new(inner: T) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Opaque<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Opaque<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for Opaque<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Opaque").field(&self.0).finish()
    }
}

impl<T> Payload for Opaque<T>
where
    T: Any + Send + Sync + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Shared, lock-protected storage for one payload.
///
/// `None` means the payload has been torn down; the slot itself may still be
/// referenced by an in-flight release or snapshot.
#[derive(Clone)]
pub struct PayloadSlot {
    inner: Arc<RwLock<Option<Box<dyn Payload>>>>,
}

impl PayloadSlot {
    pub fn new(payload: Box<dyn Payload>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(payload))),
        }
    }

    /// True once the payload has been taken out of the slot
    pub fn is_released(&self) -> bool {
        sync::read(&self.inner, "payload slot").is_none()
    }

    /// Run `f` against the payload, or return `None` if it was released
    pub fn with<R>(&self, f: impl FnOnce(&dyn Payload) -> R) -> Option<R> {
        let guard = sync::read(&self.inner, "payload slot");
        guard.as_ref().map(|payload| f(payload.as_ref()))
    }

    /// Run `f` against the payload mutably, or return `None` if it was released
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut dyn Payload) -> R) -> Option<R> {
        let mut guard = sync::write(&self.inner, "payload slot");
        guard.as_mut().map(|payload| f(payload.as_mut()))
    }

    /// Remove the payload, leaving the slot released
    pub fn take(&self) -> Option<Box<dyn Payload>> {
        sync::write(&self.inner, "payload slot").take()
    }

    /// True if both handles refer to the same storage
    pub fn same_slot(&self, other: &PayloadSlot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Put a payload back into the slot, returning the previous one
    pub fn replace(&self, payload: Box<dyn Payload>) -> Option<Box<dyn Payload>> {
        sync::write(&self.inner, "payload slot").replace(payload)
    }
}

impl fmt::Debug for PayloadSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadSlot")
            .field("released", &self.is_released())
            .finish()
    }
}

/// A queue of byte chunks, oldest first, that can shed its oldest state.
///
/// Used for rolling index and audio buffers that stay valid after losing
/// their tail history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollingBuffer {
    chunks: VecDeque<Vec<u8>>,
    byte_len: u64,
}

impl RollingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk as the newest entry
    pub fn push(&mut self, chunk: Vec<u8>) {
        self.byte_len += chunk.len() as u64;
        self.chunks.push_back(chunk);
    }

    /// Number of chunks held
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total bytes across all chunks
    pub fn byte_len(&self) -> u64 {
        self.byte_len
    }

    /// Iterate over chunks, oldest first
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(Vec::as_slice)
    }

    /// Drop the oldest `fraction` of chunks, always keeping the newest one.
    ///
    /// Returns the number of bytes discarded.
    pub fn discard_oldest(&mut self, fraction: f64) -> u64 {
        if self.chunks.len() <= 1 {
            return 0;
        }
        let wanted = (self.chunks.len() as f64 * fraction.clamp(0.0, 1.0)).floor() as usize;
        let to_drop = wanted.min(self.chunks.len() - 1);

        let mut freed = 0u64;
        for _ in 0..to_drop {
            if let Some(chunk) = self.chunks.pop_front() {
                freed += chunk.len() as u64;
            }
        }
        self.byte_len -= freed;
        freed
    }
}

impl FromIterator<Vec<u8>> for RollingBuffer {
    fn from_iter<I: IntoIterator<Item = Vec<u8>>>(iter: I) -> Self {
        let mut buffer = RollingBuffer::new();
        for chunk in iter {
            buffer.push(chunk);
        }
        buffer
    }
}
