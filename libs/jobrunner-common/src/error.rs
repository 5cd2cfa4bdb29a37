use thiserror::Error;

/// Exit status for an invalid command line.
pub const EXIT_USAGE: i32 = 1;

/// Exit status for credential/config failures and for unhandled runtime
/// errors after the best-effort termination cascade.
pub const EXIT_FAILURE: i32 = 2;

/// Fatal startup errors, surfaced as values so the top-level dispatcher can
/// map each kind to an exit status instead of aborting mid-boot.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to get token.")]
    MissingToken,

    #[error("Missing admin token needed for volume mounts.")]
    MissingAdminToken,

    #[error("invalid JR_MAX_TASKS value: {0:?}")]
    InvalidMaxTasks(String),

    #[error("failed to prepare working directory: {0}")]
    Workdir(#[from] std::io::Error),
}

impl LaunchError {
    /// Every startup failure shares one exit status; usage errors are
    /// handled before any `LaunchError` can occur.
    pub fn exit_code(&self) -> i32 {
        EXIT_FAILURE
    }
}
