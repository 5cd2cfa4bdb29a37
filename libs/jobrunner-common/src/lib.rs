pub mod auth;
pub mod config;
pub mod credentials;
pub mod ee2;
pub mod error;
pub mod types;

// Re-export commonly used types for convenience
pub use config::LaunchConfig;
pub use credentials::Credentials;
pub use error::{LaunchError, EXIT_FAILURE, EXIT_USAGE};

/// Serializes tests that read or mutate the process environment.
#[cfg(test)]
pub(crate) fn env_guard() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
