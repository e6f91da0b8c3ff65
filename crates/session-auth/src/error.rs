//! Error types for session authentication operations

/// Errors from token storage and refresh.
///
/// Payloads are strings so the error is `Clone` and one refresh outcome can
/// be handed to every caller that joined it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
