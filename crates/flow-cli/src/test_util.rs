//! Test-only helpers shared across this crate's `#[cfg(test)]` modules.

use std::sync::{Mutex, MutexGuard, OnceLock};

/// Serializes tests that mutate process environment variables, so parallel
/// test execution doesn't clobber another test's env state mid-assertion.
pub fn lock_env() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
