use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use jobrunner_common::auth::AuthClient;
use jobrunner_common::config::LaunchConfig;
use jobrunner_common::credentials::Credentials;
use jobrunner_common::ee2::{Ee2Client, FinishParams};

use crate::callback::CallbackServer;
use crate::cleanup::ResourceManager;

/// Remote job-state reporting, as the termination cascade needs it.
pub trait JobTracker {
    async fn finish_job(&self, params: &FinishParams) -> Result<()>;
    async fn cancel_job(&self, params: &FinishParams) -> Result<()>;
}

/// Container sweep, as the termination cascade needs it.
pub trait TaskCleaner {
    async fn cleanup_all(&self, debug: bool) -> Result<()>;
}

/// Callback server teardown, as the termination cascade needs it.
pub trait Killable {
    async fn kill(&self) -> Result<()>;
}

impl JobTracker for Ee2Client {
    async fn finish_job(&self, params: &FinishParams) -> Result<()> {
        Ee2Client::finish_job(self, params).await.map_err(Into::into)
    }

    async fn cancel_job(&self, params: &FinishParams) -> Result<()> {
        Ee2Client::cancel_job(self, params).await.map_err(Into::into)
    }
}

impl TaskCleaner for ResourceManager {
    async fn cleanup_all(&self, debug: bool) -> Result<()> {
        ResourceManager::cleanup_all(self, debug).await
    }
}

impl Killable for CallbackServer {
    async fn kill(&self) -> Result<()> {
        CallbackServer::kill(self).await
    }
}

/// One job execution: the ee2-tracked job, its app container, and the
/// callback server that serves it.
pub struct JobRunner {
    pub job_id: String,
    pub ee2: Ee2Client,
    pub auth: AuthClient,
    pub mr: ResourceManager,
    pub cbs: CallbackServer,
    config: LaunchConfig,
    credentials: Credentials,
    debug: bool,
}

impl JobRunner {
    pub async fn new(
        config: LaunchConfig,
        ee2_url: &str,
        job_id: &str,
        credentials: Credentials,
        debug: bool,
    ) -> Result<Self> {
        let ee2 = Ee2Client::new(ee2_url, credentials.token.clone());
        let auth = AuthClient::new(config.auth_url.clone());
        let mr = ResourceManager::new(job_id, config.runtime.as_deref(), config.max_tasks)?;
        let cbs = CallbackServer::start(job_id).await?;

        Ok(Self {
            job_id: job_id.to_string(),
            ee2,
            auth,
            mr,
            cbs,
            config,
            credentials,
            debug,
        })
    }

    /// Drive the job to completion. Any error propagates to the launcher,
    /// which runs the termination cascade.
    pub async fn run(&mut self) -> Result<()> {
        let user = self
            .auth
            .validate(&self.credentials.token)
            .await
            .context("User token rejected by auth service")?;
        info!("Running job {} as {}", self.job_id, user.user_id);

        // The admin credential backs volume mounts; reject it up front
        // rather than partway through container setup.
        let admin = self
            .auth
            .validate(&self.credentials.admin_token)
            .await
            .context("Admin token rejected by auth service")?;
        info!("Volume mounts authorized by {}", admin.user_id);

        self.ee2
            .start_job(&self.job_id)
            .await
            .context("Failed to mark job started")?;

        let job = self
            .ee2
            .get_job_params(&self.job_id)
            .await
            .context("Failed to fetch job params")?;
        let image = job.container_image();
        info!("Launching app container {image} for method {}", job.method);

        let result = self
            .mr
            .run_app_container(
                &image,
                &self.credentials.token,
                &self.cbs.url(),
                &self.config.workdir,
                self.debug,
            )
            .await?;

        if !result.stderr.is_empty() {
            warn!("App stderr: {}", result.stderr.trim_end());
        }

        let params = if result.exit_code == 0 {
            info!("App completed ({} bytes of stdout)", result.stdout.len());
            FinishParams::completed(&self.job_id, json!({ "exit_code": 0 }))
        } else {
            warn!("App exited with status {}", result.exit_code);
            FinishParams::app_error(&self.job_id, result.exit_code)
        };
        self.ee2
            .finish_job(&params)
            .await
            .context("Failed to mark job finished")?;

        self.mr
            .cleanup_all(self.debug)
            .await
            .context("Post-run container cleanup failed")?;
        self.cbs.kill().await?;

        Ok(())
    }
}

/// Best-effort termination after an unhandled failure: mark the job
/// finished (falling back to canceled), then sweep containers and kill the
/// callback server. Every step runs regardless of earlier failures, each is
/// logged with its own outcome, and nothing escalates.
pub async fn terminate_job<T, M, C>(job_id: &str, ee2: &T, mr: &M, cbs: &C, debug: bool)
where
    T: JobTracker,
    M: TaskCleaner,
    C: Killable,
{
    let params = FinishParams::unexpected_error(job_id);

    match ee2.finish_job(&params).await {
        Ok(()) => info!("Marked job {job_id} finished with error payload"),
        Err(e) => {
            warn!("finish_job failed ({e}); attempting cancel_job");
            match ee2.cancel_job(&params).await {
                Ok(()) => info!("Marked job {job_id} canceled"),
                Err(e) => warn!("cancel_job failed ({e}); remote job state left as-is"),
            }
        }
    }

    match mr.cleanup_all(debug).await {
        Ok(()) => info!("Container cleanup complete"),
        Err(e) => warn!("Container cleanup failed: {e}"),
    }

    match cbs.kill().await {
        Ok(()) => info!("Callback server stopped"),
        Err(e) => warn!("Callback server shutdown failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockTracker {
        fail_finish: bool,
        fail_cancel: bool,
        finish_calls: AtomicUsize,
        cancel_calls: AtomicUsize,
    }

    impl JobTracker for MockTracker {
        async fn finish_job(&self, params: &FinishParams) -> Result<()> {
            self.finish_calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(params.error_message.as_deref(), Some("Unexpected Job Error"));
            assert_eq!(params.error_code, Some(2));
            assert_eq!(params.terminated_code, Some(2));
            if self.fail_finish {
                Err(anyhow!("finish rejected"))
            } else {
                Ok(())
            }
        }

        async fn cancel_job(&self, _params: &FinishParams) -> Result<()> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_cancel {
                Err(anyhow!("cancel rejected"))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct MockCleaner {
        fail: bool,
        calls: AtomicUsize,
        last_debug: AtomicUsize,
    }

    impl TaskCleaner for MockCleaner {
        async fn cleanup_all(&self, debug: bool) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_debug.store(debug as usize, Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("docker down"))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct MockServer {
        calls: AtomicUsize,
    }

    impl Killable for MockServer {
        async fn kill(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_finish_success_skips_cancel() {
        let tracker = MockTracker::default();
        let cleaner = MockCleaner::default();
        let server = MockServer::default();

        terminate_job("j1", &tracker, &cleaner, &server, false).await;

        assert_eq!(tracker.finish_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.cancel_calls.load(Ordering::SeqCst), 0);
        assert_eq!(cleaner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finish_failure_falls_back_to_cancel() {
        let tracker = MockTracker {
            fail_finish: true,
            ..Default::default()
        };
        let cleaner = MockCleaner::default();
        let server = MockServer::default();

        terminate_job("j1", &tracker, &cleaner, &server, false).await;

        assert_eq!(tracker.finish_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.cancel_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cleaner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_runs_even_when_everything_fails() {
        let tracker = MockTracker {
            fail_finish: true,
            fail_cancel: true,
            ..Default::default()
        };
        let cleaner = MockCleaner {
            fail: true,
            ..Default::default()
        };
        let server = MockServer::default();

        terminate_job("j1", &tracker, &cleaner, &server, false).await;

        assert_eq!(tracker.finish_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.cancel_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cleaner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_debug_flag_reaches_cleanup() {
        let tracker = MockTracker::default();
        let cleaner = MockCleaner::default();
        let server = MockServer::default();

        terminate_job("j1", &tracker, &cleaner, &server, true).await;

        assert_eq!(cleaner.last_debug.load(Ordering::SeqCst), 1);
    }
}
