//! Content-type aware response decoding

use bytes::Bytes;
use serde_json::Value;

use crate::error::{ApiError, Result};

/// A decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// True for an empty body without a JSON content type.
    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Json(Value::Null))
    }
}

/// Whether a Content-Type header value denotes JSON.
pub fn is_json_content_type(content_type: &str) -> bool {
    let media = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    media == "application/json" || media.ends_with("+json")
}

/// Decode a successful response body.
///
/// Rules, first match wins:
/// 1. empty body with a JSON content type → `{}`
/// 2. empty body otherwise → `null`
/// 3. JSON content type, or a body opening with `{` or `[` → parsed JSON,
///    `ApiError::Parse` if it does not parse
/// 4. binary response requested → raw bytes
/// 5. otherwise → body as text
pub fn parse(content_type: Option<&str>, body: Bytes, binary: bool) -> Result<Payload> {
    let json_type = content_type.is_some_and(is_json_content_type);

    if body.is_empty() {
        return Ok(if json_type {
            Payload::Json(Value::Object(Default::default()))
        } else {
            Payload::Json(Value::Null)
        });
    }

    if json_type || looks_like_json(&body) {
        return serde_json::from_slice(&body)
            .map(Payload::Json)
            .map_err(|e| ApiError::Parse(e.to_string()));
    }

    if binary {
        return Ok(Payload::Binary(body));
    }

    Ok(Payload::Text(String::from_utf8_lossy(&body).into_owned()))
}

fn looks_like_json(body: &[u8]) -> bool {
    matches!(
        body.iter().find(|b| !b.is_ascii_whitespace()),
        Some(b'{') | Some(b'[')
    )
}
