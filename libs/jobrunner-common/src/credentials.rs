use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use tracing::warn;

use crate::error::LaunchError;

/// User credential, exported for downstream consumers (task containers
/// inherit it).
pub const TOKEN_ENV: &str = "KB_AUTH_TOKEN";

/// Admin credential, required for volume mounts. Scrubbed from the
/// environment after retrieval.
pub const ADMIN_TOKEN_ENV: &str = "KB_ADMIN_AUTH_TOKEN";

/// Case-insensitive `"true"` enables debug mode.
pub const DEBUG_ENV: &str = "DEBUG_MODE";

/// Fallback token file in the working directory.
pub const TOKEN_FILE: &str = "token";

/// User and admin tokens, resolved once at startup and passed to the runner
/// explicitly instead of being re-read from the environment.
#[derive(Clone)]
pub struct Credentials {
    pub token: String,
    pub admin_token: String,
}

impl Credentials {
    /// Resolve both tokens from the process environment, with the local
    /// `token` file as the fallback source for the user token.
    pub fn from_process_env() -> Result<Self, LaunchError> {
        let token = get_token()?;
        let admin_token = get_admin_token()?;
        Ok(Self { token, admin_token })
    }
}

// Tokens never appear in debug output or logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("admin_token", &"<redacted>")
            .finish()
    }
}

/// Whether this job run is in debug mode.
pub fn debug_mode() -> bool {
    env::var(DEBUG_ENV)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// User token from the environment, falling back to the `token` file in the
/// working directory. A file-sourced token is exported back into the
/// environment so containerized apps inherit it.
pub fn get_token() -> Result<String, LaunchError> {
    get_token_from(Path::new(TOKEN_FILE))
}

/// As [`get_token`], with an explicit fallback file.
pub fn get_token_from(token_file: &Path) -> Result<String, LaunchError> {
    if let Ok(token) = env::var(TOKEN_ENV) {
        return Ok(token);
    }
    let raw = fs::read_to_string(token_file).map_err(|_| LaunchError::MissingToken)?;
    let token = raw.trim_end().to_string();
    env::set_var(TOKEN_ENV, &token);
    Ok(token)
}

/// Admin token from the environment. The variable is removed after the read
/// so it never leaks into task containers; a removal that does not take
/// effect is logged and ignored rather than treated as fatal.
pub fn get_admin_token() -> Result<String, LaunchError> {
    let admin_token = env::var(ADMIN_TOKEN_ENV).map_err(|_| LaunchError::MissingAdminToken)?;
    env::remove_var(ADMIN_TOKEN_ENV);
    if env::var_os(ADMIN_TOKEN_ENV).is_some() {
        warn!("Failed to sanitize environment");
    }
    Ok(admin_token)
}
