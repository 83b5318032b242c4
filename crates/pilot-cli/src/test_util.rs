//! Shared test-only helpers.

use std::sync::{Mutex, OnceLock};

/// Serializes tests that mutate process-global environment variables, so
/// that `cargo test`'s default multi-threaded runner doesn't let two such
/// tests stomp on each other's `PILOT_*`/`XDG_CONFIG_HOME`/`HOME` state.
pub fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
