//! Structured failures returned by the dispatcher.
//!
//! Every fault below the HTTP layer (codec, pipeline, pool, timeout) is turned
//! into a [`DispatchError`] whose [`ErrorKind`] picks the status code and the
//! stable `code` string clients branch on.

use std::fmt;

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::Serialize;
use thiserror::Error;
use vision::{CodecError, PipelineError};

use crate::{context::RequestPhase, pool::PoolError};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedFormat,
    CorruptInput,
    InvalidParameters,
    PayloadTooLarge,
    Timeout,
    Overloaded,
    StageFailure,
    EncodeFailure,
    InternalError,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::CorruptInput => "corrupt_input",
            ErrorKind::InvalidParameters => "invalid_parameters",
            ErrorKind::PayloadTooLarge => "payload_too_large",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::StageFailure => "stage_failure",
            ErrorKind::EncodeFailure => "encode_failure",
            ErrorKind::InternalError => "internal_error",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::UnsupportedFormat | ErrorKind::CorruptInput | ErrorKind::InvalidParameters => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::StageFailure | ErrorKind::EncodeFailure | ErrorKind::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the client caused the failure (4xx) rather than the service.
    pub fn is_client_error(self) -> bool {
        self.status().is_client_error()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Clone, Debug, Error)]
#[error("{kind} during {phase}: {message}")]
pub struct DispatchError {
    pub kind: ErrorKind,
    pub message: String,
    /// Phase the request was in when it failed.
    pub phase: RequestPhase,
    pub request_id: String,
}

impl DispatchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            phase: RequestPhase::Received,
            request_id: String::new(),
        }
    }

    pub fn in_phase(mut self, phase: RequestPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn for_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn from_codec(err: CodecError) -> Self {
        let kind = match &err {
            CodecError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            CodecError::CorruptInput(_) => ErrorKind::CorruptInput,
            CodecError::EncodeFailure(_) => ErrorKind::EncodeFailure,
        };
        Self::new(kind, err.to_string())
    }

    pub fn from_pipeline(err: PipelineError) -> Self {
        let kind = match &err {
            PipelineError::InvalidParameter { .. } => ErrorKind::InvalidParameters,
            PipelineError::Stage { .. } => ErrorKind::StageFailure,
            PipelineError::Config(_) => ErrorKind::InternalError,
        };
        Self::new(kind, err.to_string())
    }

    pub fn from_pool(err: PoolError) -> Self {
        let kind = match &err {
            PoolError::Overloaded | PoolError::QueueTimeout { .. } => ErrorKind::Overloaded,
            PoolError::Panicked(_) | PoolError::Closed => ErrorKind::InternalError,
        };
        Self::new(kind, err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'static str,
    message: &'a str,
    phase: RequestPhase,
    request_id: &'a str,
}

impl ResponseError for DispatchError {
    fn status_code(&self) -> StatusCode {
        self.kind.status()
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = HttpResponse::build(self.status_code());
        if !self.request_id.is_empty() {
            response.insert_header((REQUEST_ID_HEADER, self.request_id.as_str()));
        }
        if self.kind == ErrorKind::Overloaded {
            response.insert_header((actix_web::http::header::RETRY_AFTER, "1"));
        }
        response.json(ErrorEnvelope {
            error: ErrorBody {
                code: self.kind.code(),
                message: &self.message,
                phase: self.phase,
                request_id: &self.request_id,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use actix_web::body::MessageBody;

    use super::*;

    #[test]
    fn kinds_map_to_documented_statuses() {
        assert_eq!(ErrorKind::UnsupportedFormat.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::CorruptInput.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::PayloadTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ErrorKind::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ErrorKind::Overloaded.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorKind::StageFailure.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(ErrorKind::InvalidParameters.is_client_error());
        assert!(!ErrorKind::EncodeFailure.is_client_error());
    }

    #[test]
    fn lower_layer_errors_are_classified() {
        let codec = DispatchError::from_codec(CodecError::CorruptInput("truncated".into()));
        assert_eq!(codec.kind, ErrorKind::CorruptInput);

        let stage = DispatchError::from_pipeline(PipelineError::Stage {
            stage: "fail".into(),
            cause: "boom".into(),
        });
        assert_eq!(stage.kind, ErrorKind::StageFailure);

        let queued = DispatchError::from_pool(PoolError::QueueTimeout { waited_ms: 10 });
        assert_eq!(queued.kind, ErrorKind::Overloaded);
        let panicked = DispatchError::from_pool(PoolError::Panicked("x".into()));
        assert_eq!(panicked.kind, ErrorKind::InternalError);
    }

    #[test]
    fn response_carries_code_phase_and_request_id() {
        let err = DispatchError::new(ErrorKind::Timeout, "deadline exceeded")
            .in_phase(RequestPhase::Processing)
            .for_request("abc");
        let response = err.error_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), "abc");

        let body = response.into_body().try_into_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "timeout");
        assert_eq!(json["error"]["phase"], "processing");
        assert_eq!(json["error"]["request_id"], "abc");
    }

    #[test]
    fn display_names_kind_and_phase() {
        let err = DispatchError::new(ErrorKind::Timeout, "deadline exceeded")
            .in_phase(RequestPhase::Processing);
        assert_eq!(err.to_string(), "timeout during processing: deadline exceeded");
        let source: &dyn std::error::Error = &err;
        assert!(source.source().is_none());
    }
}
