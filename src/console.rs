use crate::history::History;
use crate::notifier::{Notifier, Speaker};
use crate::settings::{self, Settings};
use crate::state::AppEvent;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

pub const HELP: &str = "commands: <enter>|t toggle recording, voice <id>, replay, play <url>, quit";

/// Terminal presentation of the conversation.
pub struct ConsoleNotifier {
    history: Option<History>,
    trigger_enabled: AtomicBool,
}

impl ConsoleNotifier {
    pub fn new(history: Option<History>) -> Self {
        Self {
            history,
            trigger_enabled: AtomicBool::new(false),
        }
    }
}

impl Notifier for ConsoleNotifier {
    fn set_status(&self, text: &str) {
        println!("[status] {}", text);
    }

    fn append_message(&self, text: &str, speaker: Speaker) {
        println!("{:>9}: {}", speaker.as_str(), text);
        if let Some(history) = &self.history {
            if let Err(e) = history.append(speaker, text) {
                log::warn!("[history] {}", e);
            }
        }
    }

    fn show_error(&self, text: &str) {
        eprintln!("[error] {}", text);
    }

    fn hide_error(&self) {
        log::debug!("[console] error banner hidden");
    }

    fn set_trigger_label(&self, label: &str) {
        println!("[mic] {}", label);
    }

    fn set_trigger_enabled(&self, enabled: bool) {
        if self.trigger_enabled.swap(enabled, Ordering::SeqCst) != enabled {
            println!("[mic] {}", if enabled { "available" } else { "unavailable" });
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Event(AppEvent),
    Help,
    Unknown(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    match (word.to_ascii_lowercase().as_str(), rest) {
        ("" | "t" | "talk", _) => Command::Event(AppEvent::TriggerToggle),
        ("voice", id) if !id.is_empty() => Command::Event(AppEvent::SelectVoiceActor(id.into())),
        ("replay" | "r", _) => Command::Event(AppEvent::Replay),
        ("play", url) if !url.is_empty() => Command::Event(AppEvent::PlayUrl(url.into())),
        ("quit" | "exit" | "q", _) => Command::Event(AppEvent::Quit),
        ("help" | "?", _) => Command::Help,
        _ => Command::Unknown(line.to_string()),
    }
}

/// Reads commands from stdin on its own thread. Voice actor changes are
/// persisted before being forwarded.
pub fn spawn_command_reader(
    events: mpsc::UnboundedSender<AppEvent>,
    mut settings: Settings,
) -> Result<(), String> {
    std::thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        log::error!("[console] stdin error: {}", e);
                        break;
                    }
                };
                let event = match parse_command(&line) {
                    Command::Event(event) => event,
                    Command::Help => {
                        println!("{}", HELP);
                        continue;
                    }
                    Command::Unknown(text) => {
                        println!("unknown command '{}'; {}", text, HELP);
                        continue;
                    }
                };
                if let AppEvent::SelectVoiceActor(id) = &event {
                    settings.voice_actor_id = id.clone();
                    if let Err(e) = settings::save(&settings) {
                        log::warn!("[console] {}", e);
                    }
                }
                let quit = matches!(event, AppEvent::Quit);
                if events.send(event).is_err() || quit {
                    return;
                }
            }
            // stdin closed: nothing more can be asked of the session.
            let _ = events.send(AppEvent::Quit);
        })
        .map_err(|e| format!("Failed to spawn console thread: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse() {
        assert_eq!(parse_command(""), Command::Event(AppEvent::TriggerToggle));
        assert_eq!(parse_command(" T "), Command::Event(AppEvent::TriggerToggle));
        assert_eq!(
            parse_command("voice 12"),
            Command::Event(AppEvent::SelectVoiceActor("12".into()))
        );
        assert_eq!(parse_command("replay"), Command::Event(AppEvent::Replay));
        assert_eq!(
            parse_command("play https://cdn.example.com/a.mp3?x=1"),
            Command::Event(AppEvent::PlayUrl("https://cdn.example.com/a.mp3?x=1".into()))
        );
        assert_eq!(parse_command("quit"), Command::Event(AppEvent::Quit));
        assert_eq!(parse_command("help"), Command::Help);
    }

    #[test]
    fn incomplete_commands_are_unknown() {
        assert_eq!(parse_command("voice"), Command::Unknown("voice".into()));
        assert_eq!(parse_command("play   "), Command::Unknown("play".into()));
        assert_eq!(parse_command("dance"), Command::Unknown("dance".into()));
    }

    #[test]
    fn messages_are_recorded_in_history() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::at(dir.path().join("history.jsonl"));
        let console = ConsoleNotifier::new(Some(history.clone()));
        console.append_message("hi", Speaker::User);
        console.append_message("hello", Speaker::Assistant);
        assert_eq!(history.recent(5).len(), 2);
    }
}
