use crate::connection::MessageSender;
use crate::notifier::{ErrorBanner, Notifier, Speaker, LABEL_IDLE, LABEL_LISTENING};
use crate::protocol::OutboundMessage;
use crate::state::AppEvent;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const DEFAULT_LOCALE: &str = "ja-JP";
pub const DEFAULT_VOICE_ACTOR: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Listening,
    Recognized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub language: String,
    pub single_utterance: bool,
    pub interim_results: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            language: DEFAULT_LOCALE.into(),
            single_utterance: true,
            interim_results: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEventKind {
    Transcript(String),
    /// The engine stopped, with or without a result.
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureEvent {
    pub session: u64,
    pub kind: CaptureEventKind,
}

/// Handed to the capture engine on start; tags everything it reports with
/// the capture session it belongs to.
#[derive(Debug, Clone)]
pub struct CaptureReporter {
    session: u64,
    tx: mpsc::UnboundedSender<AppEvent>,
}

impl CaptureReporter {
    pub fn new(session: u64, tx: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn transcript(&self, text: impl Into<String>) {
        self.emit(CaptureEventKind::Transcript(text.into()));
    }

    pub fn ended(&self) {
        self.emit(CaptureEventKind::Ended);
    }

    fn emit(&self, kind: CaptureEventKind) {
        let _ = self.tx.send(AppEvent::Capture(CaptureEvent {
            session: self.session,
            kind,
        }));
    }
}

/// Speech-to-text engine. `stop` halts whatever `start` engaged; the engine
/// reports `Ended` through the reporter once it has wound down.
pub trait SpeechCapture: Send + Sync {
    fn start(&self, config: &CaptureConfig, reporter: CaptureReporter) -> Result<(), String>;
    fn stop(&self);
}

pub struct RecordingController {
    capture: Arc<dyn SpeechCapture>,
    connection: Arc<dyn MessageSender>,
    notifier: Arc<dyn Notifier>,
    errors: ErrorBanner,
    events: mpsc::UnboundedSender<AppEvent>,
    config: CaptureConfig,
    voice_actor_id: String,
    state: RecordingState,
    enabled: bool,
    /// Engine engaged and not yet reported `Ended`.
    capturing: bool,
    session: u64,
}

impl RecordingController {
    pub fn new(
        capture: Arc<dyn SpeechCapture>,
        connection: Arc<dyn MessageSender>,
        errors: ErrorBanner,
        events: mpsc::UnboundedSender<AppEvent>,
        config: CaptureConfig,
        voice_actor_id: impl Into<String>,
    ) -> Self {
        Self {
            capture,
            connection,
            notifier: errors.notifier().clone(),
            errors,
            events,
            config,
            voice_actor_id: voice_actor_id.into(),
            state: RecordingState::Idle,
            enabled: false,
            capturing: false,
            session: 0,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn voice_actor_id(&self) -> &str {
        &self.voice_actor_id
    }

    pub fn select_voice_actor(&mut self, id: impl Into<String>) {
        self.voice_actor_id = id.into();
        log::info!("[recording] voice actor set to {}", self.voice_actor_id);
    }

    pub fn toggle(&mut self) {
        match self.state {
            RecordingState::Idle => self.start(),
            _ => self.stop(),
        }
    }

    pub fn start(&mut self) {
        if self.state != RecordingState::Idle || self.capturing {
            return;
        }
        if !self.enabled || !self.connection.is_connected() {
            log::info!("[recording] ignoring trigger: not connected");
            return;
        }

        self.session += 1;
        let reporter = CaptureReporter::new(self.session, self.events.clone());
        match self.capture.start(&self.config, reporter) {
            Ok(()) => {
                log::info!("[recording] listening (session {})", self.session);
                self.state = RecordingState::Listening;
                self.capturing = true;
                self.notifier.set_trigger_label(LABEL_LISTENING);
            }
            Err(e) => {
                log::error!("[recording] capture failed to start: {}", e);
                self.notifier.set_trigger_label(LABEL_IDLE);
            }
        }
    }

    pub fn stop(&mut self) {
        if self.capturing {
            log::info!("[recording] stopping capture (session {})", self.session);
            self.capture.stop();
        }
    }

    /// Connection availability gates the trigger. Losing it halts any
    /// capture in progress.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.notifier.set_trigger_enabled(enabled);
        if !enabled {
            self.stop();
        }
    }

    pub fn on_capture_event(&mut self, event: CaptureEvent) {
        if event.session != self.session {
            log::debug!("[recording] ignoring event from stale session {}", event.session);
            return;
        }
        match event.kind {
            CaptureEventKind::Transcript(text) => {
                if self.state != RecordingState::Listening {
                    return;
                }
                self.state = RecordingState::Recognized;
                self.submit(&text);
                self.state = RecordingState::Idle;
            }
            CaptureEventKind::Ended => {
                self.capturing = false;
                if self.state == RecordingState::Listening {
                    log::info!("[recording] capture ended without a result");
                    self.state = RecordingState::Idle;
                }
                self.notifier.set_trigger_label(LABEL_IDLE);
            }
        }
    }

    fn submit(&self, text: &str) {
        log::info!("[recording] recognized: {}", text);
        let message = OutboundMessage::new(text, self.voice_actor_id.as_str());
        let sent = self.connection.send(&message);
        self.notifier.append_message(text, Speaker::User);
        if let Err(e) = sent {
            log::warn!("[recording] message not sent: {}", e);
            self.errors.show(&format!("Message was not sent: {}", e));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{FakeCapture, FakeSender};
    use super::*;
    use crate::notifier::fake::{FakeNotifier, Note};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Rig {
        notifier: Arc<FakeNotifier>,
        capture: Arc<FakeCapture>,
        sender: Arc<FakeSender>,
        recording: RecordingController,
        events: mpsc::UnboundedReceiver<AppEvent>,
    }

    fn rig(sender: FakeSender) -> Rig {
        let notifier = Arc::new(FakeNotifier::default());
        let capture = Arc::new(FakeCapture::default());
        let sender = Arc::new(sender);
        let (tx, events) = mpsc::unbounded_channel();
        let errors = ErrorBanner::new(notifier.clone(), Duration::from_secs(20));
        let mut recording = RecordingController::new(
            capture.clone(),
            sender.clone(),
            errors,
            tx,
            CaptureConfig::default(),
            DEFAULT_VOICE_ACTOR,
        );
        recording.set_enabled(true);
        Rig {
            notifier,
            capture,
            sender,
            recording,
            events,
        }
    }

    fn next_capture(events: &mut mpsc::UnboundedReceiver<AppEvent>) -> CaptureEvent {
        match events.try_recv() {
            Ok(AppEvent::Capture(event)) => event,
            other => panic!("expected capture event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn transcript_is_sent_with_voice_actor_and_echoed() {
        let mut r = rig(FakeSender::connected());
        r.recording.select_voice_actor("7");
        r.recording.start();
        assert_eq!(r.recording.state(), RecordingState::Listening);
        assert_eq!(r.notifier.last_label().as_deref(), Some(LABEL_LISTENING));

        let (config, reporter) = r.capture.started.lock().unwrap()[0].clone();
        assert_eq!(config.language, "ja-JP");
        assert!(config.single_utterance);
        assert!(!config.interim_results);

        reporter.transcript("konnichiwa");
        reporter.ended();
        let event = next_capture(&mut r.events);
        r.recording.on_capture_event(event);
        assert_eq!(r.recording.state(), RecordingState::Idle);
        assert_eq!(r.notifier.last_label().as_deref(), Some(LABEL_LISTENING));

        let event = next_capture(&mut r.events);
        r.recording.on_capture_event(event);
        assert_eq!(r.notifier.last_label().as_deref(), Some(LABEL_IDLE));

        assert_eq!(r.sender.sent(), vec![OutboundMessage::new("konnichiwa", "7")]);
        assert_eq!(
            r.notifier.messages(),
            vec![("konnichiwa".to_string(), Speaker::User)]
        );
    }

    #[tokio::test]
    async fn start_requires_a_connection() {
        let mut r = rig(FakeSender::default());
        r.recording.start();
        assert_eq!(r.recording.state(), RecordingState::Idle);
        assert_eq!(r.capture.starts(), 0);
        assert!(r.notifier.last_label().is_none());
    }

    #[tokio::test]
    async fn start_is_a_noop_while_listening() {
        let mut r = rig(FakeSender::connected());
        r.recording.start();
        r.recording.start();
        assert_eq!(r.capture.starts(), 1);
    }

    #[tokio::test]
    async fn label_reverts_when_capture_ends_without_result() {
        let mut r = rig(FakeSender::connected());
        r.recording.start();
        r.recording.stop();
        assert_eq!(r.capture.stops.load(Ordering::SeqCst), 1);
        assert_eq!(r.recording.state(), RecordingState::Listening);

        r.capture.last_reporter().ended();
        let event = next_capture(&mut r.events);
        r.recording.on_capture_event(event);
        assert_eq!(r.recording.state(), RecordingState::Idle);
        assert_eq!(r.notifier.last_label().as_deref(), Some(LABEL_IDLE));
        assert!(r.sender.sent().is_empty());
        assert!(r.notifier.errors().is_empty());
    }

    #[tokio::test]
    async fn failed_start_is_only_logged() {
        let mut r = rig(FakeSender::connected());
        r.capture.fail_start.store(true, Ordering::SeqCst);
        r.recording.start();
        assert_eq!(r.recording.state(), RecordingState::Idle);
        assert_eq!(r.notifier.last_label().as_deref(), Some(LABEL_IDLE));
        assert!(r.notifier.errors().is_empty());
    }

    #[tokio::test]
    async fn stale_session_events_are_ignored() {
        let mut r = rig(FakeSender::connected());
        r.recording.start();
        let old = r.capture.last_reporter();
        old.ended();
        r.recording.on_capture_event(next_capture(&mut r.events));

        r.recording.start();
        old.transcript("late");
        r.recording.on_capture_event(next_capture(&mut r.events));
        assert_eq!(r.recording.state(), RecordingState::Listening);
        assert!(r.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn refused_send_still_echoes_and_reports() {
        let mut r = rig(FakeSender::connected());
        r.recording.start();
        r.sender.connected.store(false, Ordering::SeqCst);

        r.capture.last_reporter().transcript("hello");
        r.recording.on_capture_event(next_capture(&mut r.events));
        assert_eq!(r.notifier.messages().len(), 1);
        assert_eq!(r.notifier.errors().len(), 1);
        assert!(r.notifier.errors()[0].contains("not connected"));
    }

    #[tokio::test]
    async fn disabling_halts_capture_and_disables_trigger() {
        let mut r = rig(FakeSender::connected());
        r.recording.start();
        r.recording.set_enabled(false);
        assert_eq!(r.capture.stops.load(Ordering::SeqCst), 1);
        assert!(r.notifier.notes().contains(&Note::Enabled(false)));
    }
}
