//! Notifier that keeps what it was asked to send

use std::sync::Mutex;

use async_trait::async_trait;

use brew_updater::notify::{Notifier, NotifyError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub title: String,
    pub message: String,
    pub action: String,
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.sent().into_iter().map(|s| s.title).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, title: &str, message: &str, action: &str) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(Sent {
            title: title.to_string(),
            message: message.to_string(),
            action: action.to_string(),
        });
        Ok(())
    }
}
