//! Per-call request options and URL resolution

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, Url};
use serde_json::Value;

use crate::error::{ApiError, Result};

/// A file to send as `multipart/form-data`.
///
/// Held as owned bytes so the form can be rebuilt for the post-refresh retry.
#[derive(Debug, Clone)]
pub struct Upload {
    pub field_name: String,
    pub file_name: String,
    pub data: Bytes,
    pub mime: Option<String>,
    /// Extra text fields sent alongside the file
    pub fields: Vec<(String, String)>,
}

impl Upload {
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            field_name: "file".to_string(),
            file_name: file_name.into(),
            data: data.into(),
            mime: None,
            fields: Vec::new(),
        }
    }

    pub fn field_name(mut self, name: impl Into<String>) -> Self {
        self.field_name = name.into();
        self
    }

    pub fn mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub(crate) fn to_form(&self) -> Result<Form> {
        let mut part = Part::bytes(self.data.to_vec()).file_name(self.file_name.clone());
        if let Some(mime) = &self.mime {
            part = part
                .mime_str(mime)
                .map_err(|e| ApiError::InvalidRequest(format!("invalid upload mime type {mime}: {e}")))?;
        }
        let form = self
            .fields
            .iter()
            .fold(Form::new(), |form, (name, value)| {
                form.text(name.clone(), value.clone())
            });
        Ok(form.part(self.field_name.clone(), part))
    }
}

/// Request body. Only `Json` carries a JSON content type; bytes and
/// multipart leave it to the caller or the transport.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Bytes {
        data: Bytes,
        content_type: Option<String>,
    },
    Multipart(Upload),
}

/// Options for a single call.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub headers: HeaderMap,
    /// Overrides the client-wide timeout
    pub timeout: Option<Duration>,
    /// Return non-JSON bodies as raw bytes instead of text
    pub binary: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn bytes(mut self, data: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        self.body = RequestBody::Bytes {
            data: data.into(),
            content_type: content_type.map(str::to_string),
        };
        self
    }

    pub fn multipart(mut self, upload: Upload) -> Self {
        self.body = RequestBody::Multipart(upload);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn binary(mut self) -> Self {
        self.binary = true;
        self
    }
}

/// A resolved call target.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub url: Url,
    /// Endpoint path without query; what the guards key on
    pub path: String,
    /// `METHOD:path?sorted-query`
    pub key: String,
}

impl Target {
    /// Join `endpoint` onto `base_url` and append `query`.
    ///
    /// `endpoint` may carry its own query string; both sources are merged.
    pub fn resolve(
        base_url: &str,
        method: &Method,
        endpoint: &str,
        query: &[(String, String)],
    ) -> Result<Self> {
        let endpoint = if endpoint.starts_with('/') {
            endpoint.to_string()
        } else {
            format!("/{endpoint}")
        };
        let raw = format!("{}{}", base_url.trim_end_matches('/'), endpoint);
        let mut url = Url::parse(&raw)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid request URL {raw}: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }

        let path = endpoint_guard::endpoint_path(&endpoint).to_string();
        let key = dedup_key(method, &path, &url);
        Ok(Self { url, path, key })
    }
}

/// Sorted pairs are form-encoded again so separators inside a value never
/// read as structure: `a=1%26b%3D2` and `a=1&b=2` stay distinct keys.
fn dedup_key(method: &Method, path: &str, url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if pairs.is_empty() {
        return format!("{method}:{path}");
    }
    pairs.sort();
    let mut canonical = url.clone();
    canonical.set_query(None);
    canonical.query_pairs_mut().extend_pairs(&pairs);
    format!("{method}:{path}?{}", canonical.query().unwrap_or_default())
}
