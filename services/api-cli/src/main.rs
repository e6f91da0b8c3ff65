//! adminctl: command-line client for the admin API
//!
//! The composition root of the request layer:
//! 1. Loads the TOML config and the persisted session tokens
//! 2. Builds exactly one `TokenManager` and one `ApiClient`
//! 3. Runs a single command through them
//! 4. Logs any events the request layer published (rate-limit notices,
//!    session expiry) and optionally prints the collected metrics

mod config;
mod error;
mod metrics;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use api_client::{ApiClient, Payload, RequestOptions, Upload};
use clap::{Parser, Subcommand};
use common::{Event, EventBus, NoticeLevel};
use reqwest::Method;
use serde_json::Value;
use session_auth::{Scope, TokenManager, TokenPair, TokenStore};
use tokio::sync::broadcast::Receiver;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Command-line client for the admin API
#[derive(Debug, Parser)]
#[command(name = "adminctl", version)]
struct Cli {
    /// Config file path (falls back to CONFIG_PATH, then ./adminctl.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print Prometheus metrics collected during the command
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, PartialEq, Subcommand)]
enum Command {
    /// GET a path and print the response
    Get { path: String },
    /// DELETE a path
    Delete { path: String },
    /// POST an optional JSON body
    Post {
        path: String,
        #[arg(value_parser = parse_body)]
        body: Option<Value>,
    },
    /// PUT an optional JSON body
    Put {
        path: String,
        #[arg(value_parser = parse_body)]
        body: Option<Value>,
    },
    /// PATCH an optional JSON body
    Patch {
        path: String,
        #[arg(value_parser = parse_body)]
        body: Option<Value>,
    },
    /// Upload a file as multipart/form-data
    Upload { path: String, file: PathBuf },
    /// Manage the persisted session tokens
    Tokens {
        #[command(subcommand)]
        action: TokensCommand,
    },
    /// Exchange the active refresh token now
    Refresh,
}

#[derive(Debug, PartialEq, Subcommand)]
enum TokensCommand {
    /// Store a token pair for a scope
    Set {
        /// user or admin
        #[arg(value_parser = parse_scope)]
        scope: Scope,
        access_token: String,
        refresh_token: String,
    },
    /// Clear one scope, or every scope when omitted
    Clear {
        #[arg(value_parser = parse_scope)]
        scope: Option<Scope>,
    },
    /// Show which scopes hold tokens
    Show,
}

impl Command {
    /// Method, path and body for the plain request commands.
    fn request(&self) -> Option<(Method, &str, Option<&Value>)> {
        match self {
            Command::Get { path } => Some((Method::GET, path.as_str(), None)),
            Command::Delete { path } => Some((Method::DELETE, path.as_str(), None)),
            Command::Post { path, body } => Some((Method::POST, path.as_str(), body.as_ref())),
            Command::Put { path, body } => Some((Method::PUT, path.as_str(), body.as_ref())),
            Command::Patch { path, body } => Some((Method::PATCH, path.as_str(), body.as_ref())),
            _ => None,
        }
    }
}

fn parse_scope(raw: &str) -> error::Result<Scope> {
    match raw {
        "user" => Ok(Scope::User),
        "admin" => Ok(Scope::Admin),
        other => Err(error::Error::UnknownScope(other.to_string())),
    }
}

fn parse_body(raw: &str) -> error::Result<Value> {
    serde_json::from_str(raw).map_err(|e| error::Error::InvalidBody(e.to_string()))
}

/// Write a decoded payload: JSON pretty-printed, text as-is, bytes raw.
fn write_payload(out: &mut impl Write, payload: &Payload) -> std::io::Result<()> {
    match payload {
        Payload::Json(Value::Null) => Ok(()),
        Payload::Json(value) => {
            let pretty = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
            writeln!(out, "{pretty}")
        }
        Payload::Text(text) => writeln!(out, "{text}"),
        Payload::Binary(bytes) => out.write_all(bytes),
    }
}

async fn run_command(client: &ApiClient, command: Command, out: &mut impl Write) -> Result<()> {
    if let Some((method, path, body)) = command.request() {
        let options = match body {
            Some(body) => RequestOptions::new().json(body.clone()),
            None => RequestOptions::new(),
        };
        let payload = client
            .request(method.clone(), path, options)
            .await
            .with_context(|| format!("{method} {path} failed"))?;
        write_payload(out, &payload)?;
        return Ok(());
    }

    let tokens = client.tokens();
    match command {
        Command::Upload { path, file } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let file_name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            let payload = client
                .upload_file(&path, Upload::new(file_name, data))
                .await
                .with_context(|| format!("upload to {path} failed"))?;
            write_payload(out, &payload)?;
        }
        Command::Tokens { action } => match action {
            TokensCommand::Set {
                scope,
                access_token,
                refresh_token,
            } => {
                tokens
                    .set_tokens(TokenPair::new(scope, access_token, refresh_token))
                    .await
                    .context("failed to store tokens")?;
                writeln!(out, "stored {scope} tokens")?;
            }
            TokensCommand::Clear { scope: Some(scope) } => {
                tokens.clear_tokens(scope).await.context("failed to clear tokens")?;
                writeln!(out, "cleared {scope} tokens")?;
            }
            TokensCommand::Clear { scope: None } => {
                tokens.clear_all().await.context("failed to clear tokens")?;
                writeln!(out, "cleared all tokens")?;
            }
            TokensCommand::Show => {
                let active = tokens.active_scope().await;
                for scope in Scope::PRECEDENCE {
                    let state = match tokens.store().get(scope).await {
                        Some(_) if active == Some(scope) => "present (active)",
                        Some(_) => "present",
                        None => "absent",
                    };
                    writeln!(out, "{scope}: {state}")?;
                }
            }
        },
        Command::Refresh => {
            let pair = tokens.refresh_token().await.context("token refresh failed")?;
            writeln!(out, "refreshed {} tokens", pair.scope)?;
        }
        Command::Get { .. }
        | Command::Delete { .. }
        | Command::Post { .. }
        | Command::Put { .. }
        | Command::Patch { .. } => {}
    }
    Ok(())
}

/// Log everything the request layer published during the command.
fn drain_events(events: &mut Receiver<Event>) {
    while let Ok(event) = events.try_recv() {
        match event {
            Event::SessionExpired(expired) => warn!(
                reason = %expired.reason,
                source = %expired.source,
                return_to = ?expired.return_to,
                "session expired, set new tokens to continue"
            ),
            Event::Notice(notice) => match notice.level {
                NoticeLevel::Info => info!(title = %notice.title, "{}", notice.message),
                NoticeLevel::Warning => warn!(title = %notice.title, "{}", notice.message),
                NoticeLevel::Error => error!(title = %notice.title, "{}", notice.message),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Install the recorder before any metrics are emitted
    let prometheus = if cli.metrics {
        Some(metrics::install_recorder()?)
    } else {
        None
    };

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.api.base_url,
        token_file = %config.auth.token_file.display(),
        "configuration loaded"
    );

    let events = EventBus::new();
    let mut received = events.subscribe();

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let store = TokenStore::load(config.auth.token_file.clone())
        .await
        .context("failed to load session tokens")?;
    let tokens = TokenManager::new(
        store,
        http.clone(),
        config.api.base_url.clone(),
        config.auth.policy(),
    );
    tokens.schedule_preemptive_refresh().await;

    let client = ApiClient::new(config.api, http, tokens, events)
        .context("failed to build API client")?;

    let mut stdout = std::io::stdout();
    let outcome = run_command(&client, cli.command, &mut stdout).await;
    drain_events(&mut received);

    if let Some(handle) = prometheus {
        println!("{}", handle.render());
    }

    outcome
}
