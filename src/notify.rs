//! Desktop notifications

#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::DEFAULT_NOTIFY_METHOD;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to run terminal-notifier: {0}")]
    Io(#[from] std::io::Error),

    #[error("terminal-notifier exited with {0}")]
    Failed(std::process::ExitStatus),
}

/// Best-effort delivery of a user notification
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers `title`/`message`; `action` is a command suggested to the user
    async fn notify(&self, title: &str, message: &str, action: &str) -> Result<(), NotifyError>;
}

/// Builds the notifier for a configured method; unknown methods disable notifications
pub fn notifier_for(method: &str) -> Box<dyn Notifier> {
    if method == DEFAULT_NOTIFY_METHOD {
        Box::new(TerminalNotifier)
    } else {
        debug!("Notifications disabled (method {:?})", method);
        Box::new(Silent)
    }
}

/// Sends notifications through the `terminal-notifier` command
pub struct TerminalNotifier;

#[async_trait::async_trait]
impl Notifier for TerminalNotifier {
    async fn notify(&self, title: &str, message: &str, action: &str) -> Result<(), NotifyError> {
        let mut cmd = Command::new("terminal-notifier");
        cmd.args(["-title", title, "-message", message]);
        if !action.is_empty() {
            cmd.args(["-execute", action]);
        }
        let status = cmd.status().await?;
        if !status.success() {
            return Err(NotifyError::Failed(status));
        }
        Ok(())
    }
}

/// Discards every notification
pub struct Silent;

#[async_trait::async_trait]
impl Notifier for Silent {
    async fn notify(&self, _title: &str, _message: &str, _action: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}
