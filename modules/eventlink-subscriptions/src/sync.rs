//! Lock helpers shared by the eventlink crates.
//!
//! A poisoned lock is recovered instead of propagated. No lock in this
//! workspace is held across caller code, so a panic elsewhere cannot leave a
//! guarded collection half-mutated.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Recovering poisoned mutex");
        PoisonError::into_inner(poisoned)
    })
}

pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("Recovering poisoned rwlock (read)");
        PoisonError::into_inner(poisoned)
    })
}

pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("Recovering poisoned rwlock (write)");
        PoisonError::into_inner(poisoned)
    })
}
