//! Client policy configuration
//!
//! Every tunable is a named, overridable field. The binary fills this from
//! the `[api]` table of its TOML file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Consecutive failures on one `METHOD:endpoint` before calls are refused
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_sweep_interval")]
    pub failure_sweep_interval_secs: u64,
    /// Block length after a 429 that advertised no wait
    #[serde(default = "default_retry_after")]
    pub default_retry_after_secs: u64,
    /// Path prefixes exempt from client-side rate-limit blocking
    #[serde(default = "default_public_prefixes")]
    pub public_prefixes: Vec<String>,
    #[serde(default = "default_dedup_gets")]
    pub dedup_gets: bool,
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_retry_after() -> u64 {
    60
}

fn default_public_prefixes() -> Vec<String> {
    vec!["/public".to_string()]
}

fn default_dedup_gets() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            failure_threshold: default_failure_threshold(),
            failure_sweep_interval_secs: default_sweep_interval(),
            default_retry_after_secs: default_retry_after(),
            public_prefixes: default_public_prefixes(),
            dedup_gets: default_dedup_gets(),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> common::Result<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.base_url
            )));
        }
        if self.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than zero".into(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(common::Error::Config(
                "failure_threshold must be greater than zero".into(),
            ));
        }
        if self.failure_sweep_interval_secs == 0 {
            return Err(common::Error::Config(
                "failure_sweep_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.failure_sweep_interval_secs)
    }

    pub fn default_retry_after(&self) -> Duration {
        Duration::from_secs(self.default_retry_after_secs)
    }
}
