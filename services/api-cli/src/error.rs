//! Command-line argument errors

use thiserror::Error;

/// Argument values rejected by the custom clap value parsers.
#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("unknown scope: {0} (expected user or admin)")]
    UnknownScope(String),

    #[error("invalid JSON body: {0}")]
    InvalidBody(String),
}

/// Result alias using CLI Error
pub type Result<T> = std::result::Result<T, Error>;
