//! Common types shared by the admin API request layer

mod error;
pub mod events;
mod secret;

pub use error::{Error, Result};
pub use events::{Event, EventBus, Notice, NoticeLevel, SessionExpired, human_wait};
pub use secret::Secret;
