//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! `API_BASE_URL` overrides `[api].base_url`. Tokens are never stored in the
//! TOML; they live in the token file named by `[auth].token_file`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use api_client::ClientConfig;
use serde::Deserialize;
use session_auth::RefreshPolicy;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ClientConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Session token settings
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    /// Fraction of the access token's remaining lifetime before refreshing
    #[serde(default = "default_preemptive_ratio")]
    pub preemptive_ratio: f64,
    #[serde(default = "default_min_refresh_delay")]
    pub min_refresh_delay_secs: u64,
    #[serde(default = "default_auth_prefix")]
    pub auth_prefix: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
}

fn default_token_file() -> PathBuf {
    PathBuf::from("adminctl-tokens.json")
}

fn default_preemptive_ratio() -> f64 {
    session_auth::DEFAULT_PREEMPTIVE_RATIO
}

fn default_min_refresh_delay() -> u64 {
    session_auth::MIN_REFRESH_DELAY.as_secs()
}

fn default_auth_prefix() -> String {
    session_auth::AUTH_PREFIX.to_string()
}

fn default_refresh_path() -> String {
    session_auth::REFRESH_PATH.to_string()
}

fn default_refresh_timeout() -> u64 {
    session_auth::REFRESH_TIMEOUT.as_secs()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_file: default_token_file(),
            preemptive_ratio: default_preemptive_ratio(),
            min_refresh_delay_secs: default_min_refresh_delay(),
            auth_prefix: default_auth_prefix(),
            refresh_path: default_refresh_path(),
            refresh_timeout_secs: default_refresh_timeout(),
        }
    }
}

impl AuthConfig {
    pub fn policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            preemptive_ratio: self.preemptive_ratio,
            min_refresh_delay: Duration::from_secs(self.min_refresh_delay_secs),
            auth_prefix: self.auth_prefix.clone(),
            refresh_path: self.refresh_path.clone(),
            refresh_timeout: Duration::from_secs(self.refresh_timeout_secs),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(base_url) = std::env::var("API_BASE_URL") {
            config.api.base_url = base_url;
        }

        config.api.validate()?;

        let ratio = config.auth.preemptive_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(common::Error::Config(format!(
                "preemptive_ratio must be in (0, 1], got: {ratio}"
            )));
        }

        if !config.auth.refresh_path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "refresh_path must start with /, got: {}",
                config.auth.refresh_path
            )));
        }

        if config.auth.refresh_timeout_secs == 0 {
            return Err(common::Error::Config(
                "refresh_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("adminctl.toml")
    }
}
