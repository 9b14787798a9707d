//! HTTP client for the tunnelforge session-control REST endpoints.
//!
//! [`TunnelforgeClient`] wraps `reqwest::Client` and provides typed methods
//! for the handful of endpoints `vt` needs to create or locate a session.
//! Everything else (stdin, output, resize) flows over the IPC socket once
//! the session directory is known.
//!
//! ## Error handling
//!
//! Non-2xx responses are parsed for an `error` field in the JSON body. If
//! parsing fails, the raw response body is returned as the error message.

use serde::{Deserialize, Serialize};

/// HTTP client for a single tunnelforge server.
pub struct TunnelforgeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "workingDir")]
    working_dir: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub status: String,
    pub cols: u16,
    pub rows: u16,
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
}

impl TunnelforgeClient {
    /// Create a new client for a tunnelforge server at the given URL.
    pub fn new(base_url: String, api_key: String) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("Failed to build HTTP client");
        let base_url = base_url.trim_end_matches('/').to_string();
        Self { http, base_url, api_key }
    }

    /// `POST /sessions` — create a new session, optionally running `command`.
    pub async fn create_session(
        &self,
        command: Option<&[String]>,
        working_dir: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> Result<SessionRecord, ClientError> {
        let body = CreateRequest {
            command,
            working_dir,
            cols: Some(cols),
            rows: Some(rows),
        };
        let resp = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ClientError::Request)?;
        Self::handle_response(resp).await
    }

    /// `GET /sessions/{id}` — fetch a session's current record.
    pub async fn get_session(&self, id: &str) -> Result<SessionRecord, ClientError> {
        let resp = self
            .http
            .get(format!("{}/sessions/{id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(ClientError::Request)?;
        Self::handle_response(resp).await
    }

    async fn handle_response<T: for<'de> Deserialize<'de>>(
        resp: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = resp.status();
        let body = resp.text().await.map_err(ClientError::Request)?;

        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| ClientError::Protocol(format!("Invalid JSON from server: {e}")))
        } else {
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(String::from))
                .unwrap_or(body);
            Err(ClientError::Server {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Errors returned by [`TunnelforgeClient`] methods.
#[derive(Debug)]
pub enum ClientError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    Request(reqwest::Error),
    /// The server returned a non-2xx HTTP status.
    Server { status: u16, message: String },
    /// The response body was not valid JSON.
    Protocol(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Request(e) => write!(f, "HTTP request failed: {e}"),
            ClientError::Server { status, message } => {
                write!(f, "server error (HTTP {status}): {message}")
            }
            ClientError::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}
