//! The request orchestrator
//!
//! Every admin API call goes through `ApiClient::request`. Per call, in order:
//!
//! 1. GETs are keyed on `METHOD:path?sorted-query`; an identical GET already
//!    in flight is joined instead of re-sent
//! 2. fail fast if the endpoint is rate-limited, then if its breaker is open
//! 3. attach the Authorization header and send under a timeout
//! 4. a 401 outside the auth namespace triggers one single-flight refresh and
//!    exactly one retry; if that does not recover, the scope is cleared and
//!    `SessionExpired` is published
//! 5. a 429 blocks the endpoint and surfaces as `RateLimited`
//! 6. any other non-2xx counts toward the breaker and surfaces as `Http`
//! 7. a success resets the breaker and the body is decoded
//!
//! Nothing is retried beyond the single post-refresh attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use common::EventBus;
use endpoint_guard::{FailureTracker, RateLimiter, spawn_sweep_task};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use session_auth::{Scope, TokenManager};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::error::{ApiError, Result};
use crate::error_body;
use crate::request::{RequestBody, RequestOptions, Target, Upload};
use crate::response::{self, Payload};

/// Component name carried on `SessionExpired` events.
const EVENT_SOURCE: &str = "api_client";

type SharedResponse = Shared<BoxFuture<'static, Result<Payload>>>;

struct PendingGet {
    id: u64,
    future: SharedResponse,
}

struct Inner {
    config: ClientConfig,
    http: reqwest::Client,
    tokens: TokenManager,
    events: EventBus,
    limiter: Arc<RateLimiter>,
    tracker: Arc<FailureTracker>,
    pending: Mutex<HashMap<String, PendingGet>>,
    next_get_id: AtomicU64,
    sweeper: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Shared handle to the process-wide request layer.
///
/// Construct once at the composition root and clone into every consumer.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

fn request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

impl ApiClient {
    /// Build the client and start its guard sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: ClientConfig,
        http: reqwest::Client,
        tokens: TokenManager,
        events: EventBus,
    ) -> common::Result<Self> {
        config.validate()?;

        let limiter = Arc::new(RateLimiter::new(
            config.public_prefixes.clone(),
            config.default_retry_after(),
            events.clone(),
        ));
        let tracker = Arc::new(FailureTracker::new(
            config.failure_threshold,
            config.sweep_interval(),
            events.clone(),
        ));
        let sweeper = spawn_sweep_task(limiter.clone(), tracker.clone(), config.sweep_interval());

        info!(
            base_url = %config.base_url,
            timeout_secs = config.timeout_secs,
            failure_threshold = config.failure_threshold,
            "api client ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                http,
                tokens,
                events,
                limiter,
                tracker,
                pending: Mutex::new(HashMap::new()),
                next_get_id: AtomicU64::new(0),
                sweeper,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub async fn get(&self, endpoint: &str) -> Result<Payload> {
        self.request(Method::GET, endpoint, RequestOptions::new())
            .await
    }

    pub async fn post(&self, endpoint: &str, body: Value) -> Result<Payload> {
        self.request(Method::POST, endpoint, RequestOptions::new().json(body))
            .await
    }

    pub async fn patch(&self, endpoint: &str, body: Value) -> Result<Payload> {
        self.request(Method::PATCH, endpoint, RequestOptions::new().json(body))
            .await
    }

    pub async fn put(&self, endpoint: &str, body: Value) -> Result<Payload> {
        self.request(Method::PUT, endpoint, RequestOptions::new().json(body))
            .await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<Payload> {
        self.request(Method::DELETE, endpoint, RequestOptions::new())
            .await
    }

    /// POST a file as `multipart/form-data`.
    pub async fn upload_file(&self, endpoint: &str, upload: Upload) -> Result<Payload> {
        self.request(Method::POST, endpoint, RequestOptions::new().multipart(upload))
            .await
    }

    /// GET and deserialize a JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        decode_json(self.get(endpoint).await?)
    }

    /// POST a serializable body and deserialize the JSON answer.
    pub async fn post_json<T, B>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidRequest(format!("serializing request body: {e}")))?;
        decode_json(self.post(endpoint, body).await?)
    }

    /// Issue one call. See the module docs for the per-call contract.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Payload> {
        let target = Target::resolve(&self.inner.config.base_url, &method, endpoint, &options.query)?;
        if method == Method::GET && self.inner.config.dedup_gets {
            self.deduplicated(target, options).await
        } else {
            self.execute(method, target, options).await
        }
    }

    /// Consecutive failures currently recorded for `METHOD:endpoint`.
    pub async fn failures(&self, method: &Method, endpoint: &str) -> u32 {
        self.inner.tracker.failures(method.as_str(), endpoint).await
    }

    pub async fn is_blocked(&self, endpoint: &str) -> bool {
        self.inner.limiter.is_blocked(endpoint).await
    }

    /// Number of distinct GETs in flight.
    pub async fn pending_gets(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Join an identical in-flight GET, or start one that others can join.
    ///
    /// The call runs on its own task and removes its entry when it settles,
    /// so the entry goes away exactly once even if every caller gives up.
    async fn deduplicated(&self, target: Target, options: RequestOptions) -> Result<Payload> {
        let future = {
            let mut pending = self.inner.pending.lock().await;
            match pending.get(&target.key) {
                Some(in_flight) => {
                    crate::metrics::record_dedup_hit();
                    debug!(key = %target.key, "joining in-flight GET");
                    in_flight.future.clone()
                }
                None => {
                    let id = self.inner.next_get_id.fetch_add(1, Ordering::Relaxed);
                    let key = target.key.clone();
                    let client = self.clone();
                    let task_key = key.clone();
                    let task = tokio::spawn(async move {
                        let result = client.execute(Method::GET, target, options).await;
                        client.release(&task_key, id).await;
                        result
                    });
                    let future = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(ApiError::Network(format!("request task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    pending.insert(
                        key,
                        PendingGet {
                            id,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };
        future.await
    }

    async fn release(&self, key: &str, id: u64) {
        let mut pending = self.inner.pending.lock().await;
        if pending.get(key).is_some_and(|p| p.id == id) {
            pending.remove(key);
        }
    }

    #[instrument(skip_all, fields(request_id = %request_id(), method = %method, path = %target.path))]
    async fn execute(&self, method: Method, target: Target, options: RequestOptions) -> Result<Payload> {
        let result = self.run(&method, &target, &options).await;
        if let Err(e) = &result {
            crate::metrics::record_error(e.kind());
        }
        result
    }

    async fn run(&self, method: &Method, target: &Target, options: &RequestOptions) -> Result<Payload> {
        let path = target.path.as_str();
        self.inner.limiter.check_rate_limit(path).await?;
        self.inner.tracker.check(method.as_str(), path).await?;

        let started = Instant::now();
        let mut response = self.attempt(method, target, options).await?;
        if response.status() == StatusCode::UNAUTHORIZED && self.can_recover(path).await {
            response = self.recover_unauthorized(method, target, options).await?;
        }

        let status = response.status();
        crate::metrics::record_request(
            status.as_u16(),
            method.as_str(),
            started.elapsed().as_secs_f64(),
        );

        let headers = response.headers().clone();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                let err = ApiError::from_transport(e, self.timeout_for(options));
                return Err(self.record_failure(method, target, err).await);
            }
        };

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = error_body::retry_after(&headers, &body);
            let err = self
                .inner
                .limiter
                .handle_rate_limit_error(path, retry_after)
                .await;
            return Err(err.into());
        }

        if !status.is_success() {
            let err = ApiError::Http {
                status: status.as_u16(),
                message: error_body::error_message(status, &body),
            };
            return Err(self.record_failure(method, target, err).await);
        }

        self.inner.tracker.record_success(method.as_str(), path).await;
        let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        response::parse(content_type, body, options.binary)
    }

    /// Only endpoints outside the auth namespace that are not rate-limited
    /// get the refresh-and-retry treatment.
    async fn can_recover(&self, path: &str) -> bool {
        !self.inner.tokens.is_auth_endpoint(path) && !self.inner.limiter.is_blocked(path).await
    }

    async fn recover_unauthorized(
        &self,
        method: &Method,
        target: &Target,
        options: &RequestOptions,
    ) -> Result<Response> {
        let scope = self.inner.tokens.active_scope().await;
        debug!("unauthorized, refreshing session before one retry");

        if let Err(e) = self.inner.tokens.refresh_token().await {
            let err = self
                .expire_session(
                    scope,
                    target,
                    "token_refresh_failed",
                    format!("session refresh failed: {e}"),
                )
                .await;
            return Err(err);
        }

        let response = self.attempt(method, target, options).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let err = self
                .expire_session(
                    scope,
                    target,
                    "unauthorized_after_refresh",
                    "still unauthorized after refreshing the session".to_string(),
                )
                .await;
            return Err(err);
        }
        Ok(response)
    }

    async fn expire_session(
        &self,
        scope: Option<Scope>,
        target: &Target,
        reason: &str,
        detail: String,
    ) -> ApiError {
        if let Some(scope) = scope {
            if let Err(e) = self.inner.tokens.clear_tokens(scope).await {
                warn!(%scope, error = %e, "failed to clear expired session");
            }
        }
        warn!(reason, "session expired");
        self.inner
            .events
            .session_expired(reason, EVENT_SOURCE, Some(target.path.clone()));
        ApiError::Authentication(detail)
    }

    /// Send once; a transport failure counts toward the breaker, a request
    /// that could not be built does not.
    async fn attempt(
        &self,
        method: &Method,
        target: &Target,
        options: &RequestOptions,
    ) -> Result<Response> {
        match self.send(method, target, options).await {
            Ok(response) => Ok(response),
            Err(e @ ApiError::InvalidRequest(_)) => Err(e),
            Err(e) => Err(self.record_failure(method, target, e).await),
        }
    }

    async fn send(
        &self,
        method: &Method,
        target: &Target,
        options: &RequestOptions,
    ) -> Result<Response> {
        let timeout = self.timeout_for(options);
        let builder = self
            .inner
            .http
            .request(method.clone(), target.url.clone())
            .timeout(timeout)
            .headers(self.inner.tokens.auth_headers().await);

        let builder = match &options.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Bytes { data, content_type } => {
                let builder = builder.body(data.clone());
                match content_type {
                    Some(content_type) => builder.header(CONTENT_TYPE, content_type.as_str()),
                    None => builder,
                }
            }
            RequestBody::Multipart(upload) => builder.multipart(upload.to_form()?),
        };

        // Caller-supplied headers go last and win.
        builder
            .headers(options.headers.clone())
            .send()
            .await
            .map_err(|e| ApiError::from_transport(e, timeout))
    }

    async fn record_failure(&self, method: &Method, target: &Target, err: ApiError) -> ApiError {
        let failures = self
            .inner
            .tracker
            .record_failure(method.as_str(), &target.path)
            .await;
        warn!(error = %err, failures, "request failed");
        err
    }

    fn timeout_for(&self, options: &RequestOptions) -> std::time::Duration {
        options.timeout.unwrap_or_else(|| self.inner.config.timeout())
    }
}

fn decode_json<T: DeserializeOwned>(payload: Payload) -> Result<T> {
    match payload {
        Payload::Json(value) => {
            serde_json::from_value(value).map_err(|e| ApiError::Parse(e.to_string()))
        }
        Payload::Text(_) => Err(ApiError::Parse("expected a JSON body, got text".into())),
        Payload::Binary(_) => Err(ApiError::Parse(
            "expected a JSON body, got binary data".into(),
        )),
    }
}
