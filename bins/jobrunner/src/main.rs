mod callback;
mod cleanup;
mod runner;

use tracing::{error, info};

use jobrunner_common::config::LaunchConfig;
use jobrunner_common::credentials::{self, Credentials};
use jobrunner_common::error::{EXIT_FAILURE, EXIT_USAGE};

use runner::{terminate_job, JobRunner};

#[tokio::main]
async fn main() {
    // A usage error touches neither the environment nor any credentials.
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((job_id, ee2_url)) = parse_args(&args) else {
        println!("Incorrect usage");
        std::process::exit(EXIT_USAGE);
    };

    // Condor job environments may not inherit the system env; a .env file
    // fills the gaps when present.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    std::process::exit(launch(&job_id, &ee2_url).await);
}

/// Exactly two positional arguments: job id and ee2 base URL.
fn parse_args(args: &[String]) -> Option<(String, String)> {
    match args {
        [job_id, ee2_url] => Some((job_id.clone(), ee2_url.clone())),
        _ => None,
    }
}

/// Everything after argument validation. Returns the process exit code so
/// every startup failure maps through a single dispatcher.
async fn launch(job_id: &str, ee2_url: &str) -> i32 {
    let config = match LaunchConfig::assemble(ee2_url) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return e.exit_code();
        }
    };

    let credentials = match Credentials::from_process_env() {
        Ok(credentials) => credentials,
        Err(e) => {
            error!("{e}");
            return e.exit_code();
        }
    };
    // Named to steer clear of `tracing::field::debug`, which the logging
    // macros pull into scope and which would shadow a local `debug`.
    let debug_enabled = credentials::debug_mode();

    info!("About to create job runner");
    let mut jr = match JobRunner::new(config, ee2_url, job_id, credentials, debug_enabled).await {
        Ok(jr) => jr,
        Err(e) => {
            // No runner exists yet, so there is nothing to tear down.
            error!("An unhandled error was encountered");
            error!("{e:#}");
            return EXIT_FAILURE;
        }
    };
    info!("Debug Mode is {debug_enabled}");

    info!("About to run job");
    if let Err(e) = jr.run().await {
        error!("An unhandled error was encountered");
        error!("{e:#}");
        terminate_job(
            &jr.job_id,
            &jr.ee2,
            &jr.mr,
            &jr.cbs,
            credentials::debug_mode(),
        )
        .await;
        return EXIT_FAILURE;
    }

    0
}
