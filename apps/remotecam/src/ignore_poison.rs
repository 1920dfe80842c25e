//! Extension trait to ignore mutex poisoning.
//!
//! Session state, listener slots and property caches hold plain values where a
//! panic on another thread leaves nothing half-updated that matters. This trait
//! replaces `.lock().unwrap_or_else(|e| e.into_inner())` with `.lock_ignore_poison()`.

use std::sync::{Mutex, MutexGuard};

pub trait IgnorePoison<T> {
    /// Locks the mutex, ignoring poison.
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T>;
}

impl<T> IgnorePoison<T> for Mutex<T> {
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|e| e.into_inner())
    }
}
