use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use jobrunner_common::credentials::TOKEN_ENV;

/// Label stamped on every container this runner creates. Cleanup sweeps by
/// this label, so nothing outside the job is ever touched.
pub const JOB_LABEL: &str = "jobrunner.job_id";

/// Cap on concurrent task containers when `JR_MAX_TASKS` is unset.
pub const DEFAULT_MAX_TASKS: usize = 10;

/// Mount point for the job working directory inside the app container.
const WORK_MOUNT: &str = "/kb/module/work";

fn job_label_filter(job_id: &str) -> String {
    format!("{JOB_LABEL}={job_id}")
}

/// Drain a container log stream into stdout/stderr buffers. A stream error
/// ends collection with whatever arrived so far; the cause is logged, not
/// propagated, since the wait call still reports the exit code.
async fn collect_logs<S>(mut logs: S) -> (String, String)
where
    S: futures_util::Stream<Item = Result<LogOutput, bollard::errors::Error>> + Unpin,
{
    let mut stdout = String::new();
    let mut stderr = String::new();
    while let Some(chunk) = logs.next().await {
        match chunk {
            Ok(LogOutput::StdOut { message }) => {
                stdout.push_str(&String::from_utf8_lossy(&message));
            }
            Ok(LogOutput::StdErr { message }) => {
                stderr.push_str(&String::from_utf8_lossy(&message));
            }
            Err(e) => {
                warn!("App log stream ended early: {e}");
                break;
            }
            _ => {}
        }
    }
    (stdout, stderr)
}

/// Output of a finished app container.
#[derive(Debug)]
pub struct ContainerResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Owns the Docker side of a job: launching app containers and sweeping
/// them away on termination.
pub struct ResourceManager {
    docker: Docker,
    job_id: String,
    tasks: Semaphore,
}

impl ResourceManager {
    pub fn new(job_id: &str, runtime: Option<&str>, max_tasks: Option<usize>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        if let Some(runtime) = runtime {
            // Only the docker path is implemented; the selector is accepted
            // for parity with shifter-capable deployments.
            warn!("Runtime override {runtime:?} requested; using the local Docker daemon");
        }
        Ok(Self {
            docker,
            job_id: job_id.to_string(),
            tasks: Semaphore::new(max_tasks.unwrap_or(DEFAULT_MAX_TASKS)),
        })
    }

    /// Pull the image unless it is already present locally.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("Pulling image {image}");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.context("Failed to pull image")?;
        }
        Ok(())
    }

    /// Run one app container to completion and collect its output. The
    /// container inherits the user token and the callback URL, and gets the
    /// job working directory mounted at the conventional path.
    pub async fn run_app_container(
        &self,
        image: &str,
        token: &str,
        callback_url: &str,
        workdir: &Path,
        debug: bool,
    ) -> Result<ContainerResult> {
        let _permit = self
            .tasks
            .acquire()
            .await
            .context("Task semaphore closed")?;

        self.ensure_image(image).await?;

        let name = format!("jobrunner-{}", uuid::Uuid::new_v4());
        let mut labels = HashMap::new();
        labels.insert(JOB_LABEL.to_string(), self.job_id.clone());

        let env = vec![
            format!("{TOKEN_ENV}={token}"),
            format!("SDK_CALLBACK_URL={callback_url}"),
        ];
        let config = Config {
            image: Some(image.to_string()),
            env: Some(env),
            labels: Some(labels),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(vec![format!("{}:{WORK_MOUNT}", workdir.display())]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create app container")?;
        let container_id = container.id;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start app container")?;
        info!("Started app container {name}");

        let logs_options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        });
        let logs = Box::pin(self.docker.logs(&container_id, logs_options));
        let (stdout, stderr) = collect_logs(logs).await;

        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = self.docker.wait_container(&container_id, Some(wait_options));
        let exit_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            // Non-zero exits surface as a wait error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e).context("Failed waiting for app container"),
            None => 0,
        };

        if debug {
            info!("Debug mode: keeping container {name} for inspection");
        } else {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = self
                .docker
                .remove_container(&container_id, Some(remove_options))
                .await
            {
                warn!("Failed to remove container {name}: {e}");
            }
        }

        Ok(ContainerResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    /// Sweep every container labeled with this job id. Debug mode keeps
    /// them in place for inspection. Per-container failures are logged and
    /// do not abort the sweep.
    pub async fn cleanup_all(&self, debug: bool) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![job_label_filter(&self.job_id)]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("Failed to list job containers")?;

        if debug {
            info!(
                "Debug mode: leaving {} container(s) in place",
                containers.len()
            );
            return Ok(());
        }

        for summary in containers {
            let Some(id) = summary.id else { continue };
            if let Err(e) = self
                .docker
                .stop_container(&id, Some(StopContainerOptions { t: 5 }))
                .await
            {
                warn!("Failed to stop container {id}: {e}");
            }
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match self
                .docker
                .remove_container(&id, Some(remove_options))
                .await
            {
                Ok(()) => info!("Removed container {id}"),
                Err(e) => warn!("Failed to remove container {id}: {e}"),
            }
        }
        Ok(())
    }
}
