//! Refresh-token exchange
//!
//! `POST {base_url}/auth/refresh` with `{"refresh_token": ...}`. The backend
//! rotates both tokens on every successful exchange, so the old refresh
//! token is dead once this returns `Ok`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Response from the refresh endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(alias = "refreshToken")]
    pub refresh_token: String,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Exchange a refresh token for a new access/refresh pair.
///
/// The whole exchange, body included, must finish within `timeout`.
/// Called by `TokenManager::refresh_token`, never directly from the request
/// path, so at most one exchange is in flight at a time.
pub async fn refresh_token(
    client: &reqwest::Client,
    base_url: &str,
    refresh_path: &str,
    refresh: &str,
    timeout: Duration,
) -> Result<TokenResponse> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), refresh_path);
    let response = client
        .post(&url)
        .timeout(timeout)
        .json(&RefreshRequest {
            refresh_token: refresh,
        })
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                Error::Http(format!(
                    "token refresh timed out after {}ms",
                    timeout.as_millis()
                ))
            } else {
                Error::Http(format!("token refresh request failed: {e}"))
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // 401/403 means the refresh token is revoked, expired, or already rotated
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
}
