//! Async client for the processing API.

use std::{collections::BTreeMap, time::Duration};

use actix_web::web::Bytes;
use reqwest::{StatusCode, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Header carrying the original file name to the API.
pub const FILE_NAME_HEADER: &str = "x-file-name";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClientError {
    #[error("processing API is unreachable: {0}")]
    Unreachable(String),
    #[error("processing API did not answer within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("processing API answered {status}: {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },
    #[error("unexpected response from processing API: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ClientError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }
        } else if err.is_decode() {
            ClientError::InvalidResponse(err.to_string())
        } else {
            ClientError::Unreachable(err.to_string())
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DetectionView {
    pub label: String,
    pub bbox: [u32; 4],
    pub area: u64,
    pub score: f32,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct StageView {
    pub name: String,
    pub elapsed_ms: f64,
    pub outcome: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TerminationView {
    pub stage: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct TimingsView {
    pub queue_ms: f64,
    pub decode_ms: f64,
    pub process_ms: f64,
    pub encode_ms: f64,
    pub total_ms: f64,
}

/// Successful `POST /process` answer as the dashboard renders it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ProcessResult {
    pub request_id: String,
    pub received_at: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub channels: Option<usize>,
    pub format: Option<String>,
    /// Base64 encoded output image.
    pub image: Option<String>,
    #[serde(default)]
    pub measurements: BTreeMap<String, f64>,
    #[serde(default)]
    pub detections: Vec<DetectionView>,
    #[serde(default)]
    pub stages: Vec<StageView>,
    pub terminated_by: Option<TerminationView>,
    #[serde(default)]
    pub timings: TimingsView,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(default)]
    request_id: Option<String>,
}

/// `GET /health` of the API; `reachable` is false when the call failed.
#[derive(Clone, Debug, Serialize)]
pub struct ApiHealth {
    pub reachable: bool,
    pub status: Option<u16>,
    pub body: Option<serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ClientError::Unreachable(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send one image to `POST /process` and parse the JSON answer.
    pub async fn process(
        &self,
        file_name: &str,
        content_type: &str,
        bytes: Bytes,
    ) -> Result<ProcessResult, ClientError> {
        let url = format!("{}/process?output=json", self.base_url);
        debug!(%url, file_name, bytes = bytes.len(), "forwarding upload");
        let response = self
            .http
            .post(&url)
            .header(header::CONTENT_TYPE, content_type)
            .header(FILE_NAME_HEADER, sanitize_header(file_name))
            .body(bytes)
            .send()
            .await
            .map_err(|err| ClientError::from_transport(err, self.timeout))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ClientError::from_transport(err, self.timeout))?;

        if status.is_success() {
            serde_json::from_slice::<ProcessResult>(&body)
                .map_err(|err| ClientError::InvalidResponse(err.to_string()))
        } else {
            Err(api_error(status, &body))
        }
    }

    pub async fn health(&self) -> ApiHealth {
        let url = format!("{}/health", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.json::<serde_json::Value>().await.ok();
                ApiHealth {
                    reachable: true,
                    status: Some(status),
                    body,
                }
            }
            Err(_) => ApiHealth {
                reachable: false,
                status: None,
                body: None,
            },
        }
    }
}

fn api_error(status: StatusCode, body: &[u8]) -> ClientError {
    match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(envelope) => ClientError::Api {
            status: status.as_u16(),
            code: envelope.error.code,
            message: envelope.error.message,
            request_id: envelope.error.request_id.filter(|id| !id.is_empty()),
        },
        Err(_) => ClientError::Api {
            status: status.as_u16(),
            code: format!("http_{}", status.as_u16()),
            message: String::from_utf8_lossy(body).chars().take(200).collect(),
            request_id: None,
        },
    }
}

/// Header values must be visible ASCII.
fn sanitize_header(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_api_errors_are_parsed() {
        let body = br#"{"error":{"code":"overloaded","message":"busy","phase":"received","request_id":"r1"}}"#;
        assert_eq!(
            api_error(StatusCode::SERVICE_UNAVAILABLE, body),
            ClientError::Api {
                status: 503,
                code: "overloaded".into(),
                message: "busy".into(),
                request_id: Some("r1".into()),
            }
        );
    }

    #[test]
    fn unstructured_errors_fall_back_to_status_code() {
        match api_error(StatusCode::BAD_GATEWAY, b"<html>proxy error</html>") {
            ClientError::Api { code, message, .. } => {
                assert_eq!(code, "http_502");
                assert!(message.contains("proxy error"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn file_names_are_header_safe() {
        assert_eq!(sanitize_header("ph\u{f6}to\n.png"), "ph_to_.png");
    }
}
