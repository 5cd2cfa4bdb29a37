use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::JobParams;

/// Registered module name of the execution engine service.
const SERVICE: &str = "execution_engine2";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum Ee2Error {
    #[error("ee2 transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("ee2 call failed: {0}")]
    Rpc(String),

    #[error("ee2 returned an empty result")]
    EmptyResult,
}

/// KBase JSON-RPC 1.1 envelope. Params are a single-element array wrapping
/// one object.
#[derive(Debug, Serialize)]
struct RpcRequest<'a, P: Serialize> {
    version: &'static str,
    id: String,
    method: &'a str,
    params: [P; 1],
}

// Option fields deserialize a missing key as None on their own; a
// `default` attribute here would saddle R with a Default bound.
#[derive(Debug, Deserialize)]
struct RpcResponse<R> {
    result: Option<Vec<R>>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    message: String,
}

fn rpc_method(method: &str) -> String {
    format!("{SERVICE}.{method}")
}

/// Payload for `finish_job` and `cancel_job`. Unset fields are omitted from
/// the wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishParams {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_output: Option<serde_json::Value>,
}

impl FinishParams {
    /// Fixed payload reported when the runner dies unexpectedly.
    pub fn unexpected_error(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            error_message: Some("Unexpected Job Error".to_string()),
            error_code: Some(2),
            terminated_code: Some(2),
            job_output: None,
        }
    }

    /// Payload for a job whose app container ran to completion.
    pub fn completed(job_id: &str, job_output: serde_json::Value) -> Self {
        Self {
            job_id: job_id.to_string(),
            error_message: None,
            error_code: None,
            terminated_code: None,
            job_output: Some(job_output),
        }
    }

    /// Payload for a job whose app container exited non-zero.
    pub fn app_error(job_id: &str, exit_code: i64) -> Self {
        Self {
            job_id: job_id.to_string(),
            error_message: Some(format!("App exited with status {exit_code}")),
            error_code: Some(1),
            terminated_code: None,
            job_output: None,
        }
    }
}

/// Client for the remote job-tracking service.
pub struct Ee2Client {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl Ee2Client {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            token: token.into(),
        }
    }

    async fn call<P, R>(&self, method: &str, params: P) -> Result<Option<R>, Ee2Error>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let method = rpc_method(method);
        let request = RpcRequest {
            version: "1.1",
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed).to_string(),
            method: &method,
            params: [params],
        };

        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::AUTHORIZATION, self.token.as_str())
            .json(&request)
            .send()
            .await?;

        // Service errors come back as HTTP 500 with a JSON-RPC error body,
        // so parse the body before looking at the status.
        let status = response.status();
        let body: RpcResponse<R> = match response.json().await {
            Ok(body) => body,
            Err(e) if !status.is_success() => {
                return Err(Ee2Error::Rpc(format!("HTTP {status}: {e}")))
            }
            Err(e) => return Err(Ee2Error::Transport(e)),
        };

        if let Some(error) = body.error {
            return Err(Ee2Error::Rpc(error.message));
        }
        Ok(body.result.and_then(|r| r.into_iter().next()))
    }

    /// Transition the job to the running state.
    pub async fn start_job(&self, job_id: &str) -> Result<(), Ee2Error> {
        self.call::<_, serde_json::Value>("start_job", serde_json::json!({ "job_id": job_id }))
            .await
            .map(|_| ())
    }

    /// Fetch the narrative-supplied parameters for a job.
    pub async fn get_job_params(&self, job_id: &str) -> Result<JobParams, Ee2Error> {
        self.call("get_job_params", serde_json::json!({ "job_id": job_id }))
            .await?
            .ok_or(Ee2Error::EmptyResult)
    }

    /// Mark the job finished, successfully or with an error payload.
    pub async fn finish_job(&self, params: &FinishParams) -> Result<(), Ee2Error> {
        self.call::<_, serde_json::Value>("finish_job", params)
            .await
            .map(|_| ())
    }

    /// Mark the job canceled. Fallback when `finish_job` is rejected.
    pub async fn cancel_job(&self, params: &FinishParams) -> Result<(), Ee2Error> {
        self.call::<_, serde_json::Value>("cancel_job", params)
            .await
            .map(|_| ())
    }
}
