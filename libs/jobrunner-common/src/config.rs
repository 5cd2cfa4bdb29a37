use std::env;
use std::fs;
use std::path::PathBuf;

use tracing::info;

use crate::error::LaunchError;

/// Presence of this variable selects the shifter container runtime.
pub const USE_SHIFTER_ENV: &str = "USE_SHIFTER";

/// Optional cap on concurrent task containers.
pub const MAX_TASKS_ENV: &str = "JR_MAX_TASKS";

/// Path fragment substituted in for `ee2` to reach the legacy login endpoint.
const AUTH_EXT: &str = "auth/api/legacy/KBase/Sessions/Login";

/// Launch configuration, assembled once per invocation and handed to the
/// job runner by value.
///
/// The catalog and auth URLs are naive substring substitutions on the ee2
/// URL. Nothing checks that the substitution matched; a base URL without an
/// `ee2` component yields itself back and the runner fails later at the
/// first service call.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub workdir: PathBuf,
    pub catalog_url: String,
    pub auth_url: String,
    /// Alternate container runtime name, e.g. `shifter`. Absent means the
    /// consumer picks its own default.
    pub runtime: Option<String>,
    /// Cap on concurrent task containers. Absent means the consumer picks
    /// its own default.
    pub max_tasks: Option<usize>,
}

impl LaunchConfig {
    /// Assemble the configuration from the ee2 URL and the process
    /// environment, rooted at the current directory.
    pub fn assemble(ee2_url: &str) -> Result<Self, LaunchError> {
        let workdir = env::current_dir()?;
        Self::assemble_in(ee2_url, workdir)
    }

    /// Assemble rooted at an explicit working directory, creating it if
    /// absent.
    pub fn assemble_in(ee2_url: &str, workdir: PathBuf) -> Result<Self, LaunchError> {
        if !workdir.exists() {
            fs::create_dir_all(&workdir)?;
            info!("Creating work directory at {}", workdir.display());
        }

        // WARNING: Condor job environments may not inherit the system env.
        let runtime = env::var_os(USE_SHIFTER_ENV).map(|_| "shifter".to_string());

        let max_tasks = match env::var(MAX_TASKS_ENV) {
            Ok(raw) => {
                // Zero permits would stall the first task forever, so the
                // cap must be a positive integer.
                let parsed = raw
                    .parse::<usize>()
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or(LaunchError::InvalidMaxTasks(raw))?;
                Some(parsed)
            }
            Err(_) => None,
        };

        Ok(Self {
            workdir,
            catalog_url: ee2_url.replace("ee2", "catalog"),
            auth_url: ee2_url.replace("ee2", AUTH_EXT),
            runtime,
            max_tasks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env_guard;

    #[test]
    fn test_url_derivation() {
        let _guard = env_guard();
        env::remove_var(USE_SHIFTER_ENV);
        env::remove_var(MAX_TASKS_ENV);

        let dir = tempfile::tempdir().unwrap();
        let config =
            LaunchConfig::assemble_in("https://ci.kbase.us/services/ee2", dir.path().to_path_buf())
                .unwrap();

        assert_eq!(config.catalog_url, "https://ci.kbase.us/services/catalog");
        assert_eq!(
            config.auth_url,
            "https://ci.kbase.us/services/auth/api/legacy/KBase/Sessions/Login"
        );
        assert_eq!(config.runtime, None);
        assert_eq!(config.max_tasks, None);
    }

    #[test]
    fn test_substitution_is_naive() {
        let _guard = env_guard();
        env::remove_var(USE_SHIFTER_ENV);
        env::remove_var(MAX_TASKS_ENV);

        let dir = tempfile::tempdir().unwrap();
        // Every occurrence of the substring is replaced, by design.
        let config =
            LaunchConfig::assemble_in("https://ee2.example/ee2", dir.path().to_path_buf()).unwrap();
        assert_eq!(config.catalog_url, "https://catalog.example/catalog");

        // No match leaves the URL untouched.
        let config =
            LaunchConfig::assemble_in("https://example.org/svc", dir.path().to_path_buf()).unwrap();
        assert_eq!(config.catalog_url, "https://example.org/svc");
    }

    #[test]
    fn test_creates_missing_workdir() {
        let _guard = env_guard();
        env::remove_var(USE_SHIFTER_ENV);
        env::remove_var(MAX_TASKS_ENV);

        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("job").join("work");
        assert!(!workdir.exists());

        let config = LaunchConfig::assemble_in("http://x/ee2", workdir.clone()).unwrap();
        assert!(workdir.exists());
        assert_eq!(config.workdir, workdir);
    }

    #[test]
    fn test_runtime_selected_by_presence() {
        let _guard = env_guard();
        env::remove_var(MAX_TASKS_ENV);
        let dir = tempfile::tempdir().unwrap();

        // Any value, even empty, selects shifter.
        env::set_var(USE_SHIFTER_ENV, "");
        let config = LaunchConfig::assemble_in("http://x/ee2", dir.path().to_path_buf()).unwrap();
        assert_eq!(config.runtime.as_deref(), Some("shifter"));

        env::remove_var(USE_SHIFTER_ENV);
        let config = LaunchConfig::assemble_in("http://x/ee2", dir.path().to_path_buf()).unwrap();
        assert_eq!(config.runtime, None);
    }

    #[test]
    fn test_max_tasks_parsing() {
        let _guard = env_guard();
        env::remove_var(USE_SHIFTER_ENV);
        let dir = tempfile::tempdir().unwrap();

        env::set_var(MAX_TASKS_ENV, "5");
        let config = LaunchConfig::assemble_in("http://x/ee2", dir.path().to_path_buf()).unwrap();
        assert_eq!(config.max_tasks, Some(5));

        env::set_var(MAX_TASKS_ENV, "lots");
        let err = LaunchConfig::assemble_in("http://x/ee2", dir.path().to_path_buf()).unwrap_err();
        assert!(matches!(err, LaunchError::InvalidMaxTasks(v) if v == "lots"));

        // Zero would hand the task semaphore no permits.
        env::set_var(MAX_TASKS_ENV, "0");
        let err = LaunchConfig::assemble_in("http://x/ee2", dir.path().to_path_buf()).unwrap_err();
        assert!(matches!(err, LaunchError::InvalidMaxTasks(v) if v == "0"));

        env::remove_var(MAX_TASKS_ENV);
    }
}
