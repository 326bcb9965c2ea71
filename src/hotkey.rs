use crate::state::AppEvent;
use rdev::{listen, Event, EventType, Key};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

static LISTENER_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Maps a settings key name to the key(s) it covers. `Alt` matches both the
/// left and right Alt keys.
pub fn parse_key(name: &str) -> Option<Vec<Key>> {
    let keys = match name.trim().to_ascii_lowercase().as_str() {
        "alt" => vec![Key::Alt, Key::AltGr],
        "leftalt" => vec![Key::Alt],
        "rightalt" | "altgr" => vec![Key::AltGr],
        "ctrl" | "control" => vec![Key::ControlLeft, Key::ControlRight],
        "rightctrl" | "controlright" => vec![Key::ControlRight],
        "shift" => vec![Key::ShiftLeft, Key::ShiftRight],
        "f8" => vec![Key::F8],
        "f9" => vec![Key::F9],
        "f10" => vec![Key::F10],
        _ => return None,
    };
    Some(keys)
}

/// Press/release edge detection for the held trigger; auto-repeat presses
/// are swallowed.
#[derive(Debug)]
struct HoldTracker {
    keys: Vec<Key>,
    held: AtomicBool,
}

impl HoldTracker {
    fn new(keys: Vec<Key>) -> Self {
        Self {
            keys,
            held: AtomicBool::new(false),
        }
    }

    fn on_event(&self, event_type: &EventType) -> Option<AppEvent> {
        match event_type {
            EventType::KeyPress(key) if self.keys.contains(key) => {
                if self.held.swap(true, Ordering::SeqCst) {
                    return None;
                }
                Some(AppEvent::HotkeyPush)
            }
            EventType::KeyRelease(key) if self.keys.contains(key) => {
                if !self.held.swap(false, Ordering::SeqCst) {
                    return None;
                }
                Some(AppEvent::HotkeyRelease)
            }
            _ => None,
        }
    }
}

/// Starts the global key listener on its own thread. Holding the key starts
/// capture, releasing it stops capture.
pub fn start_listener(key_name: &str, event_tx: mpsc::UnboundedSender<AppEvent>) -> Result<(), String> {
    let keys = parse_key(key_name).ok_or_else(|| format!("Unknown hotkey '{}'", key_name))?;
    if LISTENER_ACTIVE.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    std::thread::Builder::new()
        .name("hotkey".into())
        .spawn(move || {
            let tracker = HoldTracker::new(keys);
            let callback = move |event: Event| {
                if let Some(app_event) = tracker.on_event(&event.event_type) {
                    log::debug!("[hotkey] {:?}", app_event);
                    let _ = event_tx.send(app_event);
                }
            };
            if let Err(e) = listen(callback) {
                log::error!("[hotkey] listener error: {:?}", e);
            }
            LISTENER_ACTIVE.store(false, Ordering::SeqCst);
        })
        .map_err(|e| {
            LISTENER_ACTIVE.store(false, Ordering::SeqCst);
            format!("Failed to spawn hotkey thread: {}", e)
        })?;
    Ok(())
}
