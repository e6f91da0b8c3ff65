//! Token manager: auth headers, single-flight refresh, preemptive refresh
//!
//! One `TokenManager` exists per process. It is constructed at the
//! composition root and cloned (cheaply, it is an `Arc`) into every
//! component that needs auth.
//!
//! Per-scope state machine:
//! - Unauthenticated → Authenticated (`set_tokens`)
//! - Authenticated → Refreshing (401 on the request path, or the preemptive timer)
//! - Refreshing → Authenticated (exchange succeeded, both tokens rotated)
//! - Refreshing → Unauthenticated (exchange failed, pair cleared, error returned)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::claims;
use crate::constants::{
    AUTH_PREFIX, DEFAULT_PREEMPTIVE_RATIO, MIN_REFRESH_DELAY, REFRESH_PATH, REFRESH_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::store::{Scope, TokenPair, TokenStore};
use crate::token;

type SharedRefresh = Shared<BoxFuture<'static, Result<TokenPair>>>;

/// Tunables for refresh behaviour.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    /// Fraction of the remaining access-token lifetime to wait before refreshing
    pub preemptive_ratio: f64,
    /// Floor for the preemptive delay
    pub min_refresh_delay: Duration,
    /// Requests under this prefix are auth calls and never refresh-retried
    pub auth_prefix: String,
    /// Path of the refresh exchange, relative to the base URL
    pub refresh_path: String,
    /// Deadline for one exchange
    pub refresh_timeout: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            preemptive_ratio: DEFAULT_PREEMPTIVE_RATIO,
            min_refresh_delay: MIN_REFRESH_DELAY,
            auth_prefix: AUTH_PREFIX.to_string(),
            refresh_path: REFRESH_PATH.to_string(),
            refresh_timeout: REFRESH_TIMEOUT,
        }
    }
}

struct PendingRefresh {
    id: u64,
    future: SharedRefresh,
}

struct ScheduledRefresh {
    scope: Scope,
    handle: JoinHandle<()>,
}

struct Inner {
    store: TokenStore,
    http: reqwest::Client,
    base_url: String,
    policy: RefreshPolicy,
    pending: Mutex<Option<PendingRefresh>>,
    timer: Mutex<Option<ScheduledRefresh>>,
    next_refresh_id: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.handle.abort();
        }
    }
}

/// Shared handle to the process-wide token state.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    pub fn new(
        store: TokenStore,
        http: reqwest::Client,
        base_url: impl Into<String>,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                http,
                base_url: base_url.into(),
                policy,
                pending: Mutex::new(None),
                timer: Mutex::new(None),
                next_refresh_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.inner.store
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.inner.policy
    }

    /// Authorization header for the active scope, or an empty map.
    ///
    /// Admin tokens win over user tokens when both are stored.
    pub async fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(pair) = self.inner.store.active().await {
            match HeaderValue::from_str(&format!("Bearer {}", pair.access_token.expose())) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    headers.insert(AUTHORIZATION, value);
                }
                Err(e) => {
                    warn!(scope = %pair.scope, error = %e, "access token is not a valid header value, sending unauthenticated");
                }
            }
        }
        headers
    }

    /// Scope whose pair currently backs the auth header.
    pub async fn active_scope(&self) -> Option<Scope> {
        self.inner.store.active().await.map(|pair| pair.scope)
    }

    /// Store a freshly issued pair (login or external refresh) and
    /// reschedule the preemptive refresh.
    pub async fn set_tokens(&self, pair: TokenPair) -> Result<()> {
        let scope = pair.scope;
        self.inner.store.set(pair).await?;
        info!(%scope, "session tokens stored");
        self.schedule_preemptive_refresh().await;
        Ok(())
    }

    /// Erase the pair for `scope`. The timer follows whichever pair is
    /// still active, or is cancelled if none is.
    pub async fn clear_tokens(&self, scope: Scope) -> Result<()> {
        self.inner.store.remove(scope).await?;
        info!(%scope, "session tokens cleared");
        self.schedule_preemptive_refresh().await;
        Ok(())
    }

    /// Erase every pair and cancel the timer (logout, idle timeout).
    pub async fn clear_all(&self) -> Result<()> {
        self.inner.store.clear().await?;
        self.cancel_preemptive_refresh().await;
        info!("all session tokens cleared");
        Ok(())
    }

    /// Exchange the active refresh token for a new pair.
    ///
    /// If an exchange is already in flight, waits for that one instead of
    /// starting another: the backend rotates refresh tokens, so a second
    /// exchange with the now-stale token would kill the session.
    ///
    /// The exchange runs on its own task so it completes (and the rotated
    /// pair is persisted) even if every caller gives up waiting.
    pub async fn refresh_token(&self) -> Result<TokenPair> {
        let future = {
            let mut pending = self.inner.pending.lock().await;
            match pending.as_ref() {
                Some(in_flight) => {
                    debug!(refresh_id = in_flight.id, "joining in-flight token refresh");
                    in_flight.future.clone()
                }
                None => {
                    let id = self.inner.next_refresh_id.fetch_add(1, Ordering::Relaxed);
                    let manager = self.clone();
                    let task = tokio::spawn(async move {
                        let result = manager.perform_refresh().await;
                        manager.finish_refresh(id).await;
                        result
                    });
                    let future = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(Error::Internal(format!("token refresh task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    *pending = Some(PendingRefresh {
                        id,
                        future: future.clone(),
                    });
                    future
                }
            }
        };
        future.await
    }

    async fn perform_refresh(&self) -> Result<TokenPair> {
        let Some(current) = self.inner.store.active().await else {
            return Err(Error::NoRefreshToken);
        };
        let scope = current.scope;

        let exchanged = if current.refresh_token.expose().is_empty() {
            Err(Error::NoRefreshToken)
        } else {
            debug!(%scope, "refreshing access token");
            token::refresh_token(
                &self.inner.http,
                &self.inner.base_url,
                &self.inner.policy.refresh_path,
                current.refresh_token.expose(),
                self.inner.policy.refresh_timeout,
            )
            .await
        };

        match exchanged {
            Ok(response) => {
                let pair = TokenPair::new(scope, response.access_token, response.refresh_token);
                self.inner.store.set(pair.clone()).await?;
                metrics::counter!("auth_token_refresh_total", "outcome" => "success").increment(1);
                info!(%scope, "token refresh succeeded");
                self.schedule_preemptive_refresh().await;
                Ok(pair)
            }
            Err(e) => {
                metrics::counter!("auth_token_refresh_total", "outcome" => "failure").increment(1);
                warn!(%scope, error = %e, "token refresh failed, clearing session");
                if let Err(clear_err) = self.inner.store.remove(scope).await {
                    warn!(%scope, error = %clear_err, "failed to persist cleared session");
                }
                self.schedule_preemptive_refresh().await;
                Err(e)
            }
        }
    }

    async fn finish_refresh(&self, id: u64) {
        let mut pending = self.inner.pending.lock().await;
        if pending.as_ref().is_some_and(|p| p.id == id) {
            *pending = None;
        }
    }

    /// Arm the preemptive refresh for the active access token.
    ///
    /// Any previously armed timer is cancelled first, so at most one timer is
    /// live per manager. Nothing is armed when there is no active pair, the
    /// token carries no `exp` claim, or it has already expired.
    pub async fn schedule_preemptive_refresh(&self) {
        let mut timer = self.inner.timer.lock().await;
        if let Some(previous) = timer.take() {
            previous.handle.abort();
        }

        let Some(pair) = self.inner.store.active().await else {
            return;
        };
        let scope = pair.scope;
        let Some(exp) = claims::expires_at(pair.access_token.expose()) else {
            debug!(%scope, "access token has no exp claim, preemptive refresh disabled");
            return;
        };
        let policy = &self.inner.policy;
        let Some(delay) = claims::refresh_delay(
            exp,
            claims::unix_now(),
            policy.preemptive_ratio,
            policy.min_refresh_delay,
        ) else {
            debug!(%scope, "access token already expired, leaving it to the 401 path");
            return;
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = TokenManager { inner };
            if let Err(e) = manager.background_refresh().await {
                // The reactive 401 path escalates; nothing to do here.
                debug!(%scope, error = %e, "preemptive refresh failed");
            }
        });
        debug!(%scope, delay_secs = delay.as_secs(), "preemptive refresh scheduled");
        *timer = Some(ScheduledRefresh { scope, handle });
    }

    /// Boxed: timer → refresh → reschedule → timer is a cycle and needs a
    /// concrete future type to break it.
    fn background_refresh(&self) -> BoxFuture<'static, Result<TokenPair>> {
        let manager = self.clone();
        async move { manager.refresh_token().await }.boxed()
    }

    pub async fn cancel_preemptive_refresh(&self) {
        if let Some(previous) = self.inner.timer.lock().await.take() {
            debug!(scope = %previous.scope, "preemptive refresh cancelled");
            previous.handle.abort();
        }
    }

    /// Whether a preemptive refresh is armed and has not fired yet.
    pub async fn has_scheduled_refresh(&self) -> bool {
        self.inner
            .timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Whether `path` is under the auth namespace.
    ///
    /// Auth calls are exempt from the 401 refresh-retry protocol so a failing
    /// refresh can never recurse into itself.
    pub fn is_auth_endpoint(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        let prefix = self.inner.policy.auth_prefix.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use axum::Json;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use tokio::net::TcpListener;

    /// Refresh endpoint that counts hits, waits `delay`, then answers with
    /// `status`. Successful answers rotate both tokens.
    async fn start_refresh_server(status: StatusCode, delay: Duration) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = axum::Router::new().route(
            "/auth/refresh",
            post(move |Json(_body): Json<serde_json::Value>| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(delay).await;
                    if status.is_success() {
                        Json(serde_json::json!({
                            "access_token": format!("at_rotated_{n}"),
                            "refresh_token": format!("rt_rotated_{n}"),
                        }))
                        .into_response()
                    } else {
                        (status, "refresh rejected").into_response()
                    }
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    fn manager(base_url: &str) -> TokenManager {
        TokenManager::new(
            TokenStore::in_memory(),
            reqwest::Client::new(),
            base_url,
            RefreshPolicy::default(),
        )
    }

    fn jwt_expiring_in(secs: u64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let claims = serde_json::json!({"exp": claims::unix_now() + secs});
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.sig")
    }

    #[tokio::test]
    async fn auth_headers_empty_when_unauthenticated() {
        let manager = manager("http://unused");
        assert!(manager.auth_headers().await.is_empty());
        assert!(manager.active_scope().await.is_none());
    }

    #[tokio::test]
    async fn admin_token_wins_for_auth_headers() {
        let manager = manager("http://unused");
        manager
            .set_tokens(TokenPair::new(Scope::User, "at_user", "rt_user"))
            .await
            .unwrap();
        assert_eq!(
            manager.auth_headers().await.get(AUTHORIZATION).unwrap(),
            "Bearer at_user"
        );

        manager
            .set_tokens(TokenPair::new(Scope::Admin, "at_admin", "rt_admin"))
            .await
            .unwrap();
        assert_eq!(
            manager.auth_headers().await.get(AUTHORIZATION).unwrap(),
            "Bearer at_admin"
        );
        assert_eq!(manager.active_scope().await, Some(Scope::Admin));
    }

    #[tokio::test]
    async fn concurrent_refreshes_issue_one_exchange() {
        let (base, hits) = start_refresh_server(StatusCode::OK, Duration::from_millis(150)).await;
        let manager = manager(&base);
        manager
            .set_tokens(TokenPair::new(Scope::User, "at_old", "rt_old"))
            .await
            .unwrap();

        let (a, b) = tokio::join!(manager.refresh_token(), manager.refresh_token());
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1, "exactly one POST /auth/refresh");
        assert_eq!(a, b, "both callers observe the same rotated pair");
        assert_eq!(a.access_token.expose(), "at_rotated_1");

        let stored = manager.store().get(Scope::User).await.unwrap();
        assert_eq!(stored.refresh_token.expose(), "rt_rotated_1");
    }

    #[tokio::test]
    async fn sequential_refreshes_each_hit_the_backend() {
        let (base, hits) = start_refresh_server(StatusCode::OK, Duration::ZERO).await;
        let manager = manager(&base);
        manager
            .set_tokens(TokenPair::new(Scope::User, "at_old", "rt_old"))
            .await
            .unwrap();

        manager.refresh_token().await.unwrap();
        let second = manager.refresh_token().await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2, "settled refresh must not be reused");
        assert_eq!(second.access_token.expose(), "at_rotated_2");
    }

    #[tokio::test]
    async fn failed_refresh_clears_scope_and_propagates() {
        let (base, hits) =
            start_refresh_server(StatusCode::UNAUTHORIZED, Duration::from_millis(50)).await;
        let manager = manager(&base);
        manager
            .set_tokens(TokenPair::new(Scope::Admin, "at_admin", "rt_admin"))
            .await
            .unwrap();

        let (a, b) = tokio::join!(manager.refresh_token(), manager.refresh_token());
        assert!(matches!(a, Err(Error::InvalidCredentials(_))), "got: {a:?}");
        assert!(matches!(b, Err(Error::InvalidCredentials(_))), "got: {b:?}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(manager.store().get(Scope::Admin).await.is_none());
        assert!(manager.auth_headers().await.is_empty());
    }

    #[tokio::test]
    async fn refresh_without_tokens_skips_the_network() {
        let (base, hits) = start_refresh_server(StatusCode::OK, Duration::ZERO).await;
        let manager = manager(&base);

        let err = manager.refresh_token().await.unwrap_err();
        assert!(matches!(err, Error::NoRefreshToken), "got: {err:?}");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_refresh_token_clears_scope() {
        let (base, hits) = start_refresh_server(StatusCode::OK, Duration::ZERO).await;
        let manager = manager(&base);
        manager
            .set_tokens(TokenPair::new(Scope::User, "at_user", ""))
            .await
            .unwrap();

        let err = manager.refresh_token().await.unwrap_err();
        assert!(matches!(err, Error::NoRefreshToken), "got: {err:?}");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(manager.store().get(Scope::User).await.is_none());
        assert!(manager.auth_headers().await.is_empty());
    }

    #[tokio::test]
    async fn stalled_refresh_releases_the_slot() {
        let (base, hits) = start_refresh_server(StatusCode::OK, Duration::from_secs(5)).await;
        let manager = TokenManager::new(
            TokenStore::in_memory(),
            reqwest::Client::new(),
            base,
            RefreshPolicy {
                refresh_timeout: Duration::from_millis(100),
                ..RefreshPolicy::default()
            },
        );
        manager
            .set_tokens(TokenPair::new(Scope::User, "at_user", "rt_user"))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(manager.refresh_token(), manager.refresh_token());
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        assert!(matches!(a, Err(Error::Http(ref msg)) if msg.contains("timed out")), "got: {a:?}");
        assert!(b.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(manager.store().get(Scope::User).await.is_none());
    }

    #[tokio::test]
    async fn set_tokens_arms_timer_and_clear_cancels_it() {
        let manager = manager("http://unused");
        manager
            .set_tokens(TokenPair::new(Scope::User, jwt_expiring_in(3600), "rt"))
            .await
            .unwrap();
        assert!(manager.has_scheduled_refresh().await);

        manager.clear_tokens(Scope::User).await.unwrap();
        assert!(!manager.has_scheduled_refresh().await);
    }

    #[tokio::test]
    async fn timer_follows_remaining_scope_after_clear() {
        let manager = manager("http://unused");
        manager
            .set_tokens(TokenPair::new(Scope::User, jwt_expiring_in(3600), "rt_u"))
            .await
            .unwrap();
        manager
            .set_tokens(TokenPair::new(Scope::Admin, jwt_expiring_in(3600), "rt_a"))
            .await
            .unwrap();

        manager.clear_tokens(Scope::Admin).await.unwrap();
        assert!(manager.has_scheduled_refresh().await, "user pair still needs a timer");

        manager.clear_all().await.unwrap();
        assert!(!manager.has_scheduled_refresh().await);
    }

    #[tokio::test]
    async fn no_timer_for_expired_or_opaque_tokens() {
        let manager = manager("http://unused");

        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(r#"{"exp":1000}"#);
        let expired = format!("{header}.{payload}.sig");
        manager
            .set_tokens(TokenPair::new(Scope::User, expired, "rt"))
            .await
            .unwrap();
        assert!(!manager.has_scheduled_refresh().await);

        manager
            .set_tokens(TokenPair::new(Scope::User, "opaque-token", "rt"))
            .await
            .unwrap();
        assert!(!manager.has_scheduled_refresh().await);
    }

    #[tokio::test]
    async fn preemptive_timer_refreshes_before_expiry() {
        let (base, hits) = start_refresh_server(StatusCode::OK, Duration::ZERO).await;
        let manager = manager(&base);
        // 2s lifetime → fires after 1.6s
        manager
            .set_tokens(TokenPair::new(Scope::User, jwt_expiring_in(2), "rt_old"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let stored = manager.store().get(Scope::User).await.unwrap();
        assert_eq!(stored.access_token.expose(), "at_rotated_1");
        // rotated tokens are opaque, so nothing is re-armed
        assert!(!manager.has_scheduled_refresh().await);
    }

    #[tokio::test]
    async fn auth_endpoint_classification() {
        let manager = manager("http://unused");
        assert!(manager.is_auth_endpoint("/auth"));
        assert!(manager.is_auth_endpoint("/auth/refresh"));
        assert!(manager.is_auth_endpoint("/auth/login?next=/forms"));
        assert!(!manager.is_auth_endpoint("/authors"));
        assert!(!manager.is_auth_endpoint("/forms/templates/42"));
        assert!(!manager.is_auth_endpoint("/lead?auth=1"));
    }
}
