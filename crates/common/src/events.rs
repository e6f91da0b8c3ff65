//! Process-wide event bus
//!
//! The request layer never navigates or renders anything itself. It publishes
//! `Event`s on a broadcast channel and lets collaborators (login redirect,
//! notification toasts, the CLI) decide what to do with them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity. Slow subscribers lag rather than block emitters.
const DEFAULT_CAPACITY: usize = 64;

/// The authenticated session can no longer be recovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExpired {
    /// Machine-readable cause, e.g. `token_refresh_failed`
    pub reason: String,
    /// Component that detected the expiry, e.g. `api_client`
    pub source: String,
    /// Path the user should return to after logging in again
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            title: title.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SessionExpired(SessionExpired),
    Notice(Notice),
}

/// Cloneable handle to the broadcast channel.
///
/// Construct one at the composition root and hand clones to every component
/// that emits or listens.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }

    pub fn session_expired(
        &self,
        reason: impl Into<String>,
        source: impl Into<String>,
        return_to: Option<String>,
    ) {
        self.emit(Event::SessionExpired(SessionExpired {
            reason: reason.into(),
            source: source.into(),
            return_to,
        }));
    }

    pub fn notify(&self, notice: Notice) {
        self.emit(Event::Notice(notice));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a wait as the coarsest whole unit a person would say out loud.
///
/// Sub-second waits round up to one second.
pub fn human_wait(wait: Duration) -> String {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    let secs = secs.max(1);
    let (value, unit) = if secs < 60 {
        (secs, "second")
    } else if secs < 3600 {
        (secs.div_ceil(60), "minute")
    } else {
        (secs.div_ceil(3600), "hour")
    };
    if value == 1 {
        format!("1 {unit}")
    } else {
        format!("{value} {unit}s")
    }
}
