use crate::connection::{RetryPolicy, MAX_RETRIES, RETRY_BACKOFF_MS};
use crate::notifier::ERROR_DISPLAY_MS;
use crate::recording::{DEFAULT_LOCALE, DEFAULT_VOICE_ACTOR};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_SERVER_HOST: &str = "VOICECHAT_SERVER_HOST";
pub const ENV_SERVER_PORT: &str = "VOICECHAT_SERVER_PORT";
pub const ENV_API_KEY: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_voice_actor_id")]
    pub voice_actor_id: String,
    /// Speech recognition locale, BCP 47.
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Empty means the system default input.
    #[serde(default)]
    pub mic_device: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    #[serde(default = "default_hotkey")]
    pub hotkey: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_error_display_ms")]
    pub error_display_ms: u64,
    #[serde(default = "default_true")]
    pub history_enabled: bool,
    /// Taken from the environment only; never written to disk.
    #[serde(default, skip_serializing)]
    pub api_key: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            server_port: default_server_port(),
            voice_actor_id: default_voice_actor_id(),
            locale: default_locale(),
            mic_device: String::new(),
            model: default_model(),
            transcription_model: default_transcription_model(),
            hotkey: default_hotkey(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            error_display_ms: default_error_display_ms(),
            history_enabled: true,
            api_key: String::new(),
        }
    }
}

impl Settings {
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.server_host, self.server_port)
    }

    pub fn proxy_base_url(&self) -> String {
        format!("http://{}:{}", self.server_host, self.server_port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn error_display(&self) -> Duration {
        Duration::from_millis(self.error_display_ms)
    }

    pub fn mic_device(&self) -> Option<&str> {
        Some(self.mic_device.as_str()).filter(|d| !d.trim().is_empty())
    }

    /// Applies environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup(ENV_SERVER_HOST).filter(|h| !h.trim().is_empty()) {
            self.server_host = host.trim().to_string();
        }
        if let Some(port) = lookup(ENV_SERVER_PORT) {
            match port.trim().parse::<u16>() {
                Ok(p) => self.server_port = p,
                Err(e) => log::warn!("[settings] ignoring {}={}: {}", ENV_SERVER_PORT, port, e),
            }
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.api_key = key.trim().to_string();
        }
    }
}

fn default_server_host() -> String {
    "localhost".into()
}
fn default_server_port() -> u16 {
    8000
}
fn default_voice_actor_id() -> String {
    DEFAULT_VOICE_ACTOR.into()
}
fn default_locale() -> String {
    DEFAULT_LOCALE.into()
}
fn default_model() -> String {
    "gpt-4o-realtime-preview".into()
}
fn default_transcription_model() -> String {
    "gpt-4o-mini-transcribe".into()
}
fn default_hotkey() -> String {
    "Alt".into()
}
fn default_max_retries() -> u32 {
    MAX_RETRIES
}
fn default_retry_backoff_ms() -> u64 {
    RETRY_BACKOFF_MS
}
fn default_error_display_ms() -> u64 {
    ERROR_DISPLAY_MS
}
fn default_true() -> bool {
    true
}

pub fn data_dir() -> Result<PathBuf, String> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("VoiceChat"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".voicechat"));
    }
    Err("Failed to resolve data directory".into())
}

pub fn settings_path() -> Result<PathBuf, String> {
    Ok(data_dir()?.join("settings.json"))
}

/// Loads settings from the default location and applies the environment.
pub fn load() -> Settings {
    let mut settings = match settings_path() {
        Ok(path) => load_from(&path),
        Err(_) => Settings::default(),
    };
    settings.apply_env(|name| std::env::var(name).ok());
    settings
}

pub fn load_from(path: &Path) -> Settings {
    match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            log::warn!("[settings] {} is invalid, using defaults: {}", path.display(), e);
            Settings::default()
        }),
        Err(_) => Settings::default(),
    }
}

pub fn save(settings: &Settings) -> Result<(), String> {
    save_to(&settings_path()?, settings)
}

pub fn save_to(path: &Path, settings: &Settings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    fs::write(path, json).map_err(|e| format!("Failed to write settings: {}", e))?;
    Ok(())
}
