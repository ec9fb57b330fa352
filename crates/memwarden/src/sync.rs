//! Poison-tolerant lock helpers.
//!
//! A panicking release handler must not wedge the registry or the lock table,
//! so every std lock in the crate is taken through these helpers, which log and
//! recover the guard instead of propagating the poison.

use std::sync::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, context: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(err) => {
            tracing::error!(
                target = "memwarden",
                context,
                error = %err,
                "mutex poisoned; continuing with recovered guard"
            );
            err.into_inner()
        }
    }
}

pub(crate) fn read<'a, T>(lock: &'a RwLock<T>, context: &'static str) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(err) => {
            tracing::error!(
                target = "memwarden",
                context,
                error = %err,
                "rwlock poisoned on read; continuing with recovered guard"
            );
            err.into_inner()
        }
    }
}

pub(crate) fn write<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(err) => {
            tracing::error!(
                target = "memwarden",
                context,
                error = %err,
                "rwlock poisoned on write; continuing with recovered guard"
            );
            err.into_inner()
        }
    }
}

/// `Condvar::wait_timeout` that recovers from poisoning.
pub(crate) fn wait_timeout<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
    context: &'static str,
) -> MutexGuard<'a, T> {
    match condvar.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(err) => {
            tracing::error!(
                target = "memwarden",
                context,
                "mutex poisoned while waiting; continuing with recovered guard"
            );
            err.into_inner().0
        }
    }
}
