//! Error-body decoding
//!
//! Backends disagree on where the human-readable message lives. Known shapes
//! are tried in order and the first one that matches wins:
//!
//! 1. `{"message": "..."}`
//! 2. `{"error": {"message": "..."}}`
//! 3. `{"error": "..."}`
//! 4. `{"statusMessage": "..."}`
//!
//! Anything else falls back to the status line's reason phrase.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;

#[derive(Debug, PartialEq, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Flat {
        message: String,
    },
    Nested {
        error: NestedError,
    },
    Bare {
        error: String,
    },
    Status {
        #[serde(rename = "statusMessage")]
        status_message: String,
    },
}

#[derive(Debug, PartialEq, Deserialize)]
struct NestedError {
    message: String,
}

impl ErrorBody {
    fn into_message(self) -> String {
        match self {
            ErrorBody::Flat { message } => message,
            ErrorBody::Nested { error } => error.message,
            ErrorBody::Bare { error } => error,
            ErrorBody::Status { status_message } => status_message,
        }
    }
}

/// Normalized message for a non-2xx response.
pub fn error_message(status: StatusCode, body: &[u8]) -> String {
    serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .map(ErrorBody::into_message)
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| status_text(status))
}

fn status_text(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => reason.to_string(),
        None => format!("HTTP {}", status.as_u16()),
    }
}

#[derive(Deserialize)]
struct RetryHint {
    #[serde(alias = "retryAfter")]
    retry_after: Option<f64>,
}

/// Wait advertised by a 429: the `Retry-After` header (delta-seconds) if
/// present, else a `retryAfter` / `retry_after` number in the body.
pub fn retry_after(headers: &HeaderMap, body: &[u8]) -> Option<Duration> {
    retry_after_header(headers).or_else(|| retry_after_body(body))
}

fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn retry_after_body(body: &[u8]) -> Option<Duration> {
    let secs = serde_json::from_slice::<RetryHint>(body).ok()?.retry_after?;
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn flat_message() {
        let body = br#"{"message":"Lead not found","code":"E404"}"#;
        assert_eq!(error_message(StatusCode::NOT_FOUND, body), "Lead not found");
    }

    #[test]
    fn nested_error_message() {
        let body = br#"{"error":{"message":"Template is archived","type":"conflict"}}"#;
        assert_eq!(error_message(StatusCode::CONFLICT, body), "Template is archived");
    }

    #[test]
    fn bare_error_string() {
        let body = br#"{"error":"forbidden"}"#;
        assert_eq!(error_message(StatusCode::FORBIDDEN, body), "forbidden");
    }

    #[test]
    fn status_message_field() {
        let body = br#"{"statusCode":502,"statusMessage":"Bad upstream"}"#;
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, body), "Bad upstream");
    }

    #[test]
    fn flat_message_wins_over_nested() {
        let body = br#"{"message":"outer","error":{"message":"inner"}}"#;
        assert_eq!(error_message(StatusCode::BAD_REQUEST, body), "outer");
    }

    #[test]
    fn unknown_shapes_fall_back_to_reason_phrase() {
        assert_eq!(
            error_message(StatusCode::INTERNAL_SERVER_ERROR, b"<html>oops</html>"),
            "Internal Server Error"
        );
        assert_eq!(error_message(StatusCode::BAD_REQUEST, b""), "Bad Request");
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, br#"{"error":{"code":7}}"#),
            "Bad Request"
        );
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, br#"{"message":"  "}"#),
            "Bad Request"
        );
    }

    #[test]
    fn unknown_status_without_reason() {
        let status = StatusCode::from_u16(599).unwrap();
        assert_eq!(error_message(status, b""), "HTTP 599");
    }

    #[test]
    fn retry_after_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        let body = br#"{"retryAfter":5}"#;
        assert_eq!(retry_after(&headers, body), Some(Duration::from_secs(30)));
    }

    #[test]
    fn retry_after_from_body_in_either_case() {
        let headers = HeaderMap::new();
        assert_eq!(
            retry_after(&headers, br#"{"retryAfter":5}"#),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            retry_after(&headers, br#"{"retry_after":2.5}"#),
            Some(Duration::from_millis(2500))
        );
    }

    #[test]
    fn retry_after_absent_or_unusable() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers, b"slow down"), None);
        assert_eq!(retry_after(&headers, br#"{"retryAfter":-1}"#), None);

        // HTTP-date form is not understood; the caller's default applies
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers, b""), None);
    }
}
