pub mod openai;
pub mod session;

use serde_json::Value;

/// Events produced by parsing a provider's WebSocket messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Partial transcript text. Not forwarded; capture runs non-interim.
    TranscriptDelta(String),
    /// Final transcript text for the utterance.
    TranscriptFinal(String),
    /// Send a control message back through the WebSocket.
    SendControl(Value),
    /// Provider-level error.
    Error(String),
    /// Informational status (logged, not acted upon).
    Status(String),
    Ignore,
}

/// Everything needed to establish and configure a provider WebSocket connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Sent immediately after connecting.
    pub init_message: Option<Value>,
    /// Message type of each base64 audio chunk.
    pub append_type: String,
    /// Sent once the microphone has stopped.
    pub commit_message: Value,
    /// How long to wait for the final transcript after committing.
    pub final_wait_ms: u64,
    pub sample_rate: u32,
}

/// Settings passed to a provider to build its ConnectionConfig.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_key: String,
    pub model: String,
    pub transcription_model: String,
    /// BCP 47 locale, e.g. `ja-JP`.
    pub locale: String,
}

impl ProviderSettings {
    /// Primary language subtag: `ja-JP` -> `ja`.
    pub fn language(&self) -> String {
        self.locale
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase()
    }
}

pub trait SttProvider: Send + Sync {
    fn name(&self) -> &str;
    fn connection_config(&self, settings: &ProviderSettings) -> ConnectionConfig;
    fn parse_event(&self, text: &str) -> Vec<ProviderEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(locale: &str) -> ProviderSettings {
        ProviderSettings {
            api_key: String::new(),
            model: String::new(),
            transcription_model: String::new(),
            locale: locale.into(),
        }
    }

    #[test]
    fn language_is_primary_subtag() {
        assert_eq!(settings("ja-JP").language(), "ja");
        assert_eq!(settings("en_US").language(), "en");
        assert_eq!(settings("FR").language(), "fr");
    }
}
