//! Client for the HTTP shim running inside each guest.
//!
//! `GET /status` reports the CI job state seen by the in-guest monitor;
//! `POST /exec` runs a command and returns its output and exit code.

use std::time::Duration;

use bytes::Bytes;
use hangar_core::GuestRunnerState;
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{VmError, VmResult};

/// Job the guest runner is currently executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: i64,
    pub run_id: i64,
    #[serde(default)]
    pub run_number: i64,
    #[serde(default)]
    pub workflow_name: String,
    #[serde(default)]
    pub job_name: String,
    #[serde(default)]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Body of `GET /status`. `state` is the numeric guest state code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestStatus {
    #[serde(default)]
    pub state: i32,
    #[serde(default)]
    pub runner_name: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl GuestStatus {
    pub fn guest_state(&self) -> GuestRunnerState {
        match self.state {
            1 => GuestRunnerState::Offline,
            2 => GuestRunnerState::Idle,
            3 => GuestRunnerState::Running,
            _ => GuestRunnerState::Unspecified,
        }
    }
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    command: &'a str,
    args: &'a [String],
}

/// Result of `POST /exec`. A non-empty `error` means the shim could not
/// run the command at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutput {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GuestShimClient {
    port: u16,
    exec_timeout: Duration,
    status_timeout: Duration,
}

impl GuestShimClient {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            exec_timeout: Duration::from_secs(120),
            status_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeouts(mut self, exec: Duration, status: Duration) -> Self {
        self.exec_timeout = exec;
        self.status_timeout = status;
        self
    }

    pub async fn status(&self, ip: &str) -> VmResult<GuestStatus> {
        let body = self
            .request(ip, "GET", "/status", None, self.status_timeout)
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn exec(&self, ip: &str, command: &str, args: &[String]) -> VmResult<ExecOutput> {
        let payload = serde_json::to_vec(&ExecRequest { command, args })?;
        let body = self
            .request(ip, "POST", "/exec", Some(Bytes::from(payload)), self.exec_timeout)
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn request(
        &self,
        ip: &str,
        method: &str,
        path: &str,
        body: Option<Bytes>,
        timeout: Duration,
    ) -> VmResult<Bytes> {
        let address = format!("{ip}:{}", self.port);
        let uri = format!("http://{address}{path}");

        let fut = async {
            let stream = tokio::net::TcpStream::connect(&address)
                .await
                .map_err(|e| VmError::Exec(format!("connect {uri}: {e}")))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| VmError::Exec(format!("handshake {uri}: {e}")))?;

            tokio::spawn(async move {
                let _ = conn.await;
            });

            let builder = http::Request::builder()
                .method(method)
                .uri(&uri)
                .header("host", &address)
                .header("user-agent", "hangar-agent/0.1");
            let req = match body {
                Some(bytes) => builder
                    .header("content-type", "application/json")
                    .body(Full::new(bytes)),
                None => builder.body(Full::new(Bytes::new())),
            }
            .map_err(|e| VmError::Exec(format!("build request: {e}")))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| VmError::Exec(format!("{method} {uri}: {e}")))?;
            let status = resp.status();
            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| VmError::Exec(format!("read body from {uri}: {e}")))?
                .to_bytes();

            if !status.is_success() {
                return Err(VmError::Exec(format!(
                    "HTTP request failed with status {}: {}",
                    status.as_u16(),
                    String::from_utf8_lossy(&bytes).trim()
                )));
            }
            debug!(%uri, status = %status, len = bytes.len(), "guest shim response");
            Ok(bytes)
        };

        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| VmError::Exec(format!("{method} {uri} timed out after {timeout:?}")))?
    }
}
