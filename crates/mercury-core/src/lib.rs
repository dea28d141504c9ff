pub mod config;
pub mod error;
pub mod event;
pub mod modes;
pub mod types;

pub use config::MercuryConfig;
pub use error::{MercuryError, Result};
pub use event::{ChatEvent, EventKind};
pub use types::{ChatId, ChatMessage, ContentItem, MessageId, Role};
