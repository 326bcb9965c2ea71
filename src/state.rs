use crate::connection::ConnectionEvent;
use crate::recording::CaptureEvent;

/// Everything the session loop reacts to. Background threads and tasks
/// (connection, capture, hotkey, console) all feed the same channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    TriggerToggle,
    HotkeyPush,
    HotkeyRelease,
    Connection(ConnectionEvent),
    Capture(CaptureEvent),
    SelectVoiceActor(String),
    Replay,
    PlayUrl(String),
    Quit,
}
