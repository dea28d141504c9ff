pub mod chat;
pub mod history;
pub mod machine;
pub mod state;
pub mod stream;
pub mod ui;

pub use chat::{Chat, ChatDeps};
pub use history::{ChatHistory, Turn};
pub use machine::{ChatStateId, StateMachine, Trigger, TriggerKind};
pub use state::ChatState;
pub use stream::StreamingContext;
pub use ui::{ChatUiState, UiMessage};
