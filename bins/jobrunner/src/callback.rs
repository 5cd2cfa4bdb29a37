use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Overrides the address advertised to app containers, for deployments
/// where outbound-route discovery picks the wrong interface.
pub const CALLBACK_IP_ENV: &str = "CALLBACK_IP";

/// Auxiliary HTTP listener the app container can reach while the job runs.
/// Torn down by [`CallbackServer::kill`] during termination.
pub struct CallbackServer {
    /// Host-reachable address handed to app containers. The listener binds
    /// the wildcard, which containers cannot dial back.
    advertise: SocketAddr,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Address the app container should dial: the `CALLBACK_IP` override when
/// set, else the host IP on the default outbound route, else loopback.
fn advertised_ip() -> IpAddr {
    if let Ok(raw) = env::var(CALLBACK_IP_ENV) {
        match raw.parse() {
            Ok(ip) => return ip,
            Err(_) => warn!("Ignoring unparseable {CALLBACK_IP_ENV} value {raw:?}"),
        }
    }
    // The socket never sends anything; connect() just makes the OS pick
    // the outbound interface.
    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:53").is_ok() {
            if let Ok(addr) = socket.local_addr() {
                return addr.ip();
            }
        }
    }
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[derive(Clone)]
struct CallbackState {
    job_id: String,
}

impl CallbackServer {
    /// Bind an ephemeral port on all interfaces and start serving.
    pub async fn start(job_id: &str) -> Result<Self> {
        let listener = TcpListener::bind("0.0.0.0:0")
            .await
            .context("Failed to bind callback listener")?;
        let addr = listener
            .local_addr()
            .context("Failed to read callback listener address")?;

        let state = CallbackState {
            job_id: job_id.to_string(),
        };
        let app = Router::new().route("/", get(status)).with_state(state);

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                rx.await.ok();
            });
            if let Err(e) = serve.await {
                error!("Callback server error: {e}");
            }
        });

        let advertise = SocketAddr::new(advertised_ip(), addr.port());
        info!("Callback server listening on {addr}, advertised as {advertise}");
        Ok(Self {
            advertise,
            shutdown: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// URL the app container uses to reach the server.
    pub fn url(&self) -> String {
        format!("http://{}", self.advertise)
    }

    /// Stop the server and wait for the serve task to drain. Safe to call
    /// more than once.
    pub async fn kill(&self) -> Result<()> {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().await.take() {
            handle.await.context("Callback server task panicked")?;
        }
        Ok(())
    }
}

async fn status(State(state): State<CallbackState>) -> Json<serde_json::Value> {
    Json(json!({ "job_id": state.job_id, "state": "running" }))
}
