use crate::connection::{ConnectionEvent, MessageSender};
use crate::notifier::{
    ErrorBanner, Notifier, Speaker, STATUS_CONNECTED, STATUS_DISCONNECTED, STATUS_READY,
};
use crate::playback::{PlaybackRequest, Player};
use crate::protocol::Reply;
use crate::recording::{CaptureConfig, RecordingController, SpeechCapture};
use crate::state::AppEvent;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const STATUS_CONNECTING: &str = "Connecting...";
pub const ERROR_CANNOT_CONNECT: &str =
    "Cannot connect to the server. Check that it is running and restart the app.";
pub const ERROR_MESSAGE_PROCESSING: &str = "An error occurred while processing the message";

/// Capabilities the session is built from.
pub struct SessionParts {
    pub errors: ErrorBanner,
    pub connection: Arc<dyn MessageSender>,
    pub capture: Arc<dyn SpeechCapture>,
    pub player: Arc<dyn Player>,
    pub events: mpsc::UnboundedSender<AppEvent>,
    pub capture_config: CaptureConfig,
    pub voice_actor_id: String,
}

pub struct SessionController {
    notifier: Arc<dyn Notifier>,
    errors: ErrorBanner,
    player: Arc<dyn Player>,
    recording: RecordingController,
}

impl SessionController {
    pub fn new(parts: SessionParts) -> Self {
        let recording = RecordingController::new(
            parts.capture,
            parts.connection,
            parts.errors.clone(),
            parts.events,
            parts.capture_config,
            parts.voice_actor_id,
        );
        Self {
            notifier: parts.errors.notifier().clone(),
            errors: parts.errors,
            player: parts.player,
            recording,
        }
    }

    pub fn recording(&self) -> &RecordingController {
        &self.recording
    }

    /// Processes events one at a time until `Quit` or every sender is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<AppEvent>) {
        self.notifier.set_status(STATUS_CONNECTING);
        self.notifier.set_trigger_enabled(false);
        while let Some(event) = events.recv().await {
            if self.handle_event(event).is_break() {
                break;
            }
        }
        self.recording.stop();
        log::info!("[session] stopped");
    }

    pub fn handle_event(&mut self, event: AppEvent) -> ControlFlow<()> {
        match event {
            AppEvent::Connection(event) => self.on_connection(event),
            AppEvent::Capture(event) => self.recording.on_capture_event(event),
            AppEvent::TriggerToggle => self.recording.toggle(),
            AppEvent::HotkeyPush => self.recording.start(),
            AppEvent::HotkeyRelease => self.recording.stop(),
            AppEvent::SelectVoiceActor(id) => {
                self.recording.select_voice_actor(id.as_str());
                self.notifier.set_status(&format!("Voice actor: {}", id));
            }
            AppEvent::Replay => self.player.replay(),
            AppEvent::PlayUrl(url) => self.player.play(PlaybackRequest::proxied(url)),
            AppEvent::Quit => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn on_connection(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => {
                self.notifier.set_status(STATUS_CONNECTED);
                self.recording.set_enabled(true);
            }
            ConnectionEvent::Closed => {
                self.notifier.set_status(STATUS_DISCONNECTED);
                self.recording.set_enabled(false);
            }
            ConnectionEvent::Reconnecting {
                attempt,
                max,
                delay,
            } => {
                self.notifier.set_status(&format!(
                    "Reconnecting in {}s ({}/{})",
                    delay.as_secs(),
                    attempt,
                    max
                ));
            }
            ConnectionEvent::GaveUp => {
                self.notifier.set_status(STATUS_DISCONNECTED);
                self.errors.show(ERROR_CANNOT_CONNECT);
            }
            ConnectionEvent::Message(reply) => self.on_reply(reply),
            ConnectionEvent::Malformed(detail) => {
                log::error!("[session] message processing error: {}", detail);
                self.errors.show(ERROR_MESSAGE_PROCESSING);
                self.notifier.set_status(STATUS_READY);
            }
        }
    }

    fn on_reply(&self, reply: Reply) {
        match reply {
            Reply::Error(error) => self.errors.show(&error),
            Reply::Assistant { text, voice_url } => {
                self.notifier.append_message(&text, Speaker::Assistant);
                if let Some(url) = voice_url {
                    self.player.play(PlaybackRequest::direct(url));
                }
            }
        }
    }
}
