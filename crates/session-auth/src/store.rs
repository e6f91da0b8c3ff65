//! Scoped token storage
//!
//! Holds at most one access/refresh pair per `Scope` and optionally mirrors
//! them to a JSON file. All writes use atomic temp-file + rename to prevent
//! corruption on crash. A tokio Mutex serializes concurrent writes from the
//! request path and the preemptive refresh timer.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Credential namespace a pair is stored and resolved under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    User,
    Admin,
}

impl Scope {
    /// Scopes in ambient-auth precedence order: admin wins over user.
    pub const PRECEDENCE: [Scope; 2] = [Scope::Admin, Scope::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Admin => "admin",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An access/refresh token pair for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub scope: Scope,
    /// Bearer token sent on every request
    pub access_token: Secret<String>,
    /// Rotating credential exchanged for a new pair
    pub refresh_token: Secret<String>,
}

impl TokenPair {
    pub fn new(
        scope: Scope,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            access_token: Secret::new(access_token.into()),
            refresh_token: Secret::new(refresh_token.into()),
        }
    }
}

/// Token pair store, optionally backed by a file.
pub struct TokenStore {
    path: Option<PathBuf>,
    state: Mutex<HashMap<Scope, TokenPair>>,
}

impl TokenStore {
    /// Load pairs from the given file path.
    ///
    /// If the file doesn't exist, starts empty without creating it; the file
    /// appears on the first `set`.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading token file: {e}")))?;
            let pairs: HashMap<Scope, TokenPair> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing token file: {e}")))?;
            info!(path = %path.display(), scopes = pairs.len(), "loaded tokens");
            pairs
        } else {
            info!(path = %path.display(), "token file not found, starting unauthenticated");
            HashMap::new()
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Store that lives only in process memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Get a clone of the pair stored for `scope`.
    pub async fn get(&self, scope: Scope) -> Option<TokenPair> {
        let state = self.state.lock().await;
        state.get(&scope).cloned()
    }

    /// The pair used for ambient auth headers: admin if present, else user.
    pub async fn active(&self) -> Option<TokenPair> {
        let state = self.state.lock().await;
        Scope::PRECEDENCE
            .iter()
            .find_map(|scope| state.get(scope).cloned())
    }

    /// Add or replace the pair for its scope and persist.
    pub async fn set(&self, pair: TokenPair) -> Result<()> {
        let mut state = self.state.lock().await;
        let scope = pair.scope;
        state.insert(scope, pair);
        debug!(%scope, "stored token pair");
        self.persist(&state).await
    }

    /// Remove the pair for `scope` and persist.
    ///
    /// Returns the removed pair if it existed.
    pub async fn remove(&self, scope: Scope) -> Result<Option<TokenPair>> {
        let mut state = self.state.lock().await;
        let removed = state.remove(&scope);
        if removed.is_some() {
            debug!(%scope, "removed token pair");
            self.persist(&state).await?;
        }
        Ok(removed)
    }

    /// Remove every pair and persist.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_empty() {
            return Ok(());
        }
        state.clear();
        debug!("cleared all token pairs");
        self.persist(&state).await
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.is_empty()
    }

    async fn persist(&self, state: &HashMap<Scope, TokenPair>) -> Result<()> {
        match &self.path {
            Some(path) => write_atomic(path, state).await,
            None => Ok(()),
        }
    }
}

/// Write pairs to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains bearer tokens.
async fn write_atomic(path: &Path, data: &HashMap<Scope, TokenPair>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing tokens: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("token path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".tokens.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp token file: {e}")))?;

    debug!(path = %path.display(), "persisted tokens");
    Ok(())
}
