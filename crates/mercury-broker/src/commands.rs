//! Dispatch contracts the batch executor consumes.
//!
//! Commands and button actions are pluggable units; the executor only
//! routes them. The defaults cover the built-in lifecycle controls.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use mercury_chat::{Chat, Trigger};
use mercury_core::error::Result;
use mercury_core::types::{actions, MediaData};

/// Routes a slash command (e.g. `reset`, `mode general`) to its handler.
#[async_trait]
pub trait ChatCommandDispatcher: Send + Sync {
    async fn dispatch(&self, chat: &Chat, command: &str, ct: &CancellationToken) -> Result<()>;
}

/// Routes an inline-button click back into the chat lifecycle.
#[async_trait]
pub trait ActionProcessor: Send + Sync {
    async fn process(&self, chat: &Chat, action: &str, ct: &CancellationToken) -> Result<()>;
}

/// Captures the current screen for the desktop hotkeys.
#[async_trait]
pub trait ScreenshotProvider: Send + Sync {
    async fn capture(&self) -> Result<MediaData>;
}

/// Built-in command handling: `reset` and `mode <name>`. Unknown commands
/// are logged and ignored.
#[derive(Debug, Default)]
pub struct DefaultCommandDispatcher;

#[async_trait]
impl ChatCommandDispatcher for DefaultCommandDispatcher {
    async fn dispatch(&self, chat: &Chat, command: &str, ct: &CancellationToken) -> Result<()> {
        let trimmed = command.trim().trim_start_matches('/');
        let (name, arg) = match trimmed.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (trimmed, ""),
        };

        match name {
            "reset" | "start" => chat.reset(ct).await,
            "mode" if !arg.is_empty() => {
                // Mode names come straight from user input; reduce to a pure
                // filename before anything touches the template directory.
                let mode = mercury_core::modes::sanitize_mode_name(arg);
                chat.set_mode(&mode, ct).await
            }
            other => {
                debug!(chat = %chat.chat_id(), command = other, "unknown command ignored");
                Ok(())
            }
        }
    }
}

/// Built-in action handling for the lifecycle buttons. Actions that are not
/// permitted in the current state are dropped silently; a stale button is
/// not an error.
#[derive(Debug, Default)]
pub struct DefaultActionProcessor;

#[async_trait]
impl ActionProcessor for DefaultActionProcessor {
    async fn process(&self, chat: &Chat, action: &str, ct: &CancellationToken) -> Result<()> {
        let accepted = match action {
            actions::STOP | actions::CANCEL => chat.try_fire(Trigger::UserStop, ct).await?,
            actions::CONTINUE => chat.try_fire(Trigger::UserContinue, ct).await?,
            actions::REGENERATE | actions::RETRY => {
                chat.try_fire(Trigger::UserRegenerate, ct).await?
            }
            other => {
                debug!(chat = %chat.chat_id(), action = other, "unknown action ignored");
                true
            }
        };
        if !accepted {
            debug!(chat = %chat.chat_id(), action, "stale action dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parsing_splits_name_and_arg() {
        let trimmed = "/mode general helper".trim_start_matches('/');
        let (name, arg) = trimmed.split_once(char::is_whitespace).unwrap();
        assert_eq!(name, "mode");
        assert_eq!(arg.trim(), "general helper");
    }
}
