//! Human-readable explanations for every way an upload can fail.
//!
//! Each failure is filed as either an `input` problem (change the file or the
//! options) or a `service` problem (the same upload may work later).

use serde::Serialize;

use crate::client::ClientError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Input,
    Service,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UserMessage {
    /// Machine code from the API, or a dashboard-local code.
    pub code: String,
    pub title: &'static str,
    pub detail: String,
    pub category: Category,
    pub retryable: bool,
    pub request_id: Option<String>,
}

struct Explanation {
    title: &'static str,
    hint: &'static str,
    category: Category,
    retryable: bool,
}

const fn input(title: &'static str, hint: &'static str) -> Explanation {
    Explanation {
        title,
        hint,
        category: Category::Input,
        retryable: false,
    }
}

const fn service(title: &'static str, hint: &'static str) -> Explanation {
    Explanation {
        title,
        hint,
        category: Category::Service,
        retryable: true,
    }
}

fn explain(code: &str, status: Option<u16>) -> Explanation {
    match code {
        "unsupported_format" => input(
            "Unsupported file type",
            "Upload a PNG, JPEG, BMP or TIFF image.",
        ),
        "corrupt_input" => input(
            "The image could not be read",
            "The file looks damaged or incomplete. Export it again and re-upload.",
        ),
        "invalid_parameters" => input(
            "Invalid processing options",
            "One of the processing options is out of range.",
        ),
        "payload_too_large" => input(
            "The image is too large",
            "Reduce the resolution or compress the file and try again.",
        ),
        "nothing_to_retry" => input(
            "Nothing to retry",
            "Upload an image first.",
        ),
        "timeout" => service(
            "Processing took too long",
            "The service gave up on this image. Retrying later may succeed.",
        ),
        "overloaded" => service(
            "The service is busy",
            "Too many images are being processed right now. Wait a moment and retry.",
        ),
        "stage_failure" => service(
            "A processing step failed",
            "The image was read but one of the processing steps broke.",
        ),
        "encode_failure" => service(
            "The result could not be encoded",
            "Processing finished but the output image could not be produced.",
        ),
        "internal_error" => service(
            "Unexpected service error",
            "Something went wrong inside the service.",
        ),
        "api_unreachable" => service(
            "The processing service is unreachable",
            "The dashboard could not connect to the processing API.",
        ),
        "api_timeout" => service(
            "No response from the processing service",
            "The processing API did not answer in time.",
        ),
        "invalid_response" => service(
            "Unexpected response from the processing service",
            "The processing API answered with something the dashboard does not understand.",
        ),
        _ => match status {
            Some(status) if (400..500).contains(&status) => input(
                "The upload was rejected",
                "The service refused this upload.",
            ),
            _ => service(
                "The service failed to process the upload",
                "The service answered with an error.",
            ),
        },
    }
}

fn build(
    code: String,
    status: Option<u16>,
    detail: Option<String>,
    request_id: Option<String>,
) -> UserMessage {
    let explanation = explain(&code, status);
    let detail = match detail {
        Some(detail) if !detail.is_empty() => format!("{} ({detail})", explanation.hint),
        _ => explanation.hint.to_string(),
    };
    UserMessage {
        code,
        title: explanation.title,
        detail,
        category: explanation.category,
        retryable: explanation.retryable,
        request_id,
    }
}

/// Explain a failed API call.
pub fn describe(err: &ClientError) -> UserMessage {
    match err {
        ClientError::Api {
            status,
            code,
            message,
            request_id,
        } => build(code.clone(), Some(*status), Some(message.clone()), request_id.clone()),
        ClientError::Unreachable(cause) => {
            build("api_unreachable".into(), None, Some(cause.clone()), None)
        }
        ClientError::Timeout { .. } => {
            build("api_timeout".into(), None, Some(err.to_string()), None)
        }
        ClientError::InvalidResponse(cause) => {
            build("invalid_response".into(), None, Some(cause.clone()), None)
        }
    }
}

/// Explain a failure detected by the dashboard itself.
pub fn local(code: &str, detail: Option<String>) -> UserMessage {
    build(code.to_string(), None, detail, None)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn api(status: u16, code: &str) -> ClientError {
        ClientError::Api {
            status,
            code: code.into(),
            message: String::new(),
            request_id: Some("req".into()),
        }
    }

    #[test]
    fn every_api_code_has_its_own_title() {
        let codes = [
            (400, "unsupported_format"),
            (400, "corrupt_input"),
            (400, "invalid_parameters"),
            (413, "payload_too_large"),
            (504, "timeout"),
            (503, "overloaded"),
            (500, "stage_failure"),
            (500, "encode_failure"),
            (500, "internal_error"),
        ];
        let titles: HashSet<_> = codes
            .iter()
            .map(|(status, code)| describe(&api(*status, code)).title)
            .collect();
        assert_eq!(titles.len(), codes.len());
    }

    #[test]
    fn client_errors_are_input_and_service_errors_are_retryable() {
        for code in ["unsupported_format", "corrupt_input", "payload_too_large"] {
            let message = describe(&api(400, code));
            assert_eq!(message.category, Category::Input, "{code}");
            assert!(!message.retryable);
        }
        for (status, code) in [(503, "overloaded"), (504, "timeout"), (500, "stage_failure")] {
            let message = describe(&api(status, code));
            assert_eq!(message.category, Category::Service, "{code}");
            assert!(message.retryable);
            assert_eq!(message.request_id.as_deref(), Some("req"));
        }
    }

    #[test]
    fn transport_failures_are_service_errors() {
        let unreachable = describe(&ClientError::Unreachable("connection refused".into()));
        assert_eq!(unreachable.code, "api_unreachable");
        assert_eq!(unreachable.category, Category::Service);
        assert!(unreachable.detail.contains("connection refused"));

        let timeout = describe(&ClientError::Timeout { timeout_ms: 10 });
        assert_eq!(timeout.code, "api_timeout");
        assert_ne!(timeout.title, describe(&api(504, "timeout")).title);
    }

    #[test]
    fn unknown_codes_fall_back_on_status_class() {
        assert_eq!(describe(&api(418, "teapot")).category, Category::Input);
        assert_eq!(describe(&api(502, "http_502")).category, Category::Service);
    }
}
