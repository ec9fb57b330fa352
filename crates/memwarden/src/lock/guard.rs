use std::marker::PhantomData;

use super::LockManager;

/// Shared hold released on drop.
///
/// Holds are owned by the acquiring thread, so guards are `!Send`.
#[must_use = "the read lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    manager: &'a LockManager,
    id: String,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ReadGuard<'a> {
    pub(super) fn new(manager: &'a LockManager, id: &str) -> Self {
        Self {
            manager,
            id: id.to_string(),
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release_read(&self.id) {
            tracing::debug!(resource = %self.id, error = %e, "read guard release failed");
        }
    }
}

/// Exclusive hold released on drop.
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    manager: &'a LockManager,
    id: String,
    _not_send: PhantomData<*const ()>,
}

impl<'a> WriteGuard<'a> {
    pub(super) fn new(manager: &'a LockManager, id: &str) -> Self {
        Self {
            manager,
            id: id.to_string(),
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Trade the exclusive hold for a shared one without letting a writer in
    pub fn downgrade(self) -> crate::Result<ReadGuard<'a>> {
        // Skip our Drop so the hold is converted rather than released
        let mut this = std::mem::ManuallyDrop::new(self);
        let manager = this.manager;
        let id = std::mem::take(&mut this.id);
        manager.downgrade(&id)?;
        Ok(ReadGuard::new(manager, &id))
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release_write(&self.id) {
            tracing::debug!(resource = %self.id, error = %e, "write guard release failed");
        }
    }
}
