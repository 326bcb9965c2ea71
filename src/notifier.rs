use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ERROR_DISPLAY_MS: u64 = 20_000;

pub const STATUS_CONNECTED: &str = "Connected";
pub const STATUS_DISCONNECTED: &str = "Disconnected";
pub const STATUS_READY: &str = "Ready";
pub const LABEL_IDLE: &str = "Start talking";
pub const LABEL_LISTENING: &str = "Listening...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Assistant => "assistant",
        }
    }
}

/// Presentation sink. Implemented by whatever renders the conversation.
pub trait Notifier: Send + Sync {
    fn set_status(&self, text: &str);
    fn append_message(&self, text: &str, speaker: Speaker);
    fn show_error(&self, text: &str);
    fn hide_error(&self);
    fn set_trigger_label(&self, label: &str);
    fn set_trigger_enabled(&self, enabled: bool);
}

/// Shows errors through a notifier and hides each one after a fixed window.
/// A newer error restarts the window.
#[derive(Clone)]
pub struct ErrorBanner {
    notifier: Arc<dyn Notifier>,
    display: Duration,
    shown: Arc<AtomicU64>,
}

impl ErrorBanner {
    pub fn new(notifier: Arc<dyn Notifier>, display: Duration) -> Self {
        Self {
            notifier,
            display,
            shown: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Must be called from inside a tokio runtime.
    pub fn show(&self, text: &str) {
        log::warn!("[error] {}", text);
        let token = self.shown.fetch_add(1, Ordering::SeqCst) + 1;
        self.notifier.show_error(text);

        let shown = self.shown.clone();
        let notifier = self.notifier.clone();
        let display = self.display;
        tokio::spawn(async move {
            tokio::time::sleep(display).await;
            if shown.load(Ordering::SeqCst) == token {
                notifier.hide_error();
            }
        });
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }
}
