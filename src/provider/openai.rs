use super::{ConnectionConfig, ProviderEvent, ProviderSettings, SttProvider};
use serde_json::{json, Value};

pub const SAMPLE_RATE: u32 = 24000;

pub struct OpenAiProvider;

impl SttProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "OpenAI Realtime"
    }

    fn connection_config(&self, settings: &ProviderSettings) -> ConnectionConfig {
        let url = format!("wss://api.openai.com/v1/realtime?model={}", settings.model);

        // Server VAD ends the utterance; no model response is requested.
        let init_message = json!({
            "type": "session.update",
            "session": {
                "type": "realtime",
                "audio": {
                    "input": {
                        "format": { "type": "audio/pcm", "rate": SAMPLE_RATE },
                        "noise_reduction": { "type": "near_field" },
                        "transcription": {
                            "model": settings.transcription_model,
                            "language": settings.language(),
                        },
                        "turn_detection": {
                            "type": "server_vad",
                            "threshold": 0.5,
                            "prefix_padding_ms": 300,
                            "silence_duration_ms": 500,
                            "create_response": false,
                        },
                    }
                },
            },
        });

        ConnectionConfig {
            url,
            headers: vec![("Authorization".into(), format!("Bearer {}", settings.api_key))],
            init_message: Some(init_message),
            append_type: "input_audio_buffer.append".into(),
            commit_message: json!({ "type": "input_audio_buffer.commit" }),
            final_wait_ms: 3000,
            sample_rate: SAMPLE_RATE,
        }
    }

    fn parse_event(&self, text: &str) -> Vec<ProviderEvent> {
        let event: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return vec![ProviderEvent::Error(format!("parse error: {}", e))],
        };

        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match event_type {
            "conversation.item.input_audio_transcription.delta" => {
                match event.get("delta").and_then(|d| d.as_str()) {
                    Some(delta) => vec![ProviderEvent::TranscriptDelta(delta.to_string())],
                    None => vec![ProviderEvent::Ignore],
                }
            }
            "conversation.item.input_audio_transcription.completed" => {
                let mut events = Vec::new();
                if let Some(transcript) = event.get("transcript").and_then(|t| t.as_str()) {
                    let trimmed = transcript.trim();
                    if !trimmed.is_empty() {
                        events.push(ProviderEvent::TranscriptFinal(trimmed.to_string()));
                    }
                }
                // Keep the server-side conversation empty.
                if let Some(item_id) = event.get("item_id").and_then(|v| v.as_str()) {
                    events.push(ProviderEvent::SendControl(json!({
                        "type": "conversation.item.delete",
                        "item_id": item_id,
                    })));
                }
                if events.is_empty() {
                    vec![ProviderEvent::Ignore]
                } else {
                    events
                }
            }
            "error" => {
                let code = event
                    .get("error")
                    .and_then(|e| e.get("code"))
                    .and_then(|c| c.as_str())
                    .unwrap_or("");
                // Committing after the server VAD already consumed the buffer.
                if code == "input_audio_buffer_commit_empty" {
                    return vec![ProviderEvent::Ignore];
                }
                let message = event
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("OpenAI error");
                vec![ProviderEvent::Error(message.to_string())]
            }
            "" => vec![ProviderEvent::Status(format!("event missing type: {}", event))],
            _ => vec![ProviderEvent::Status(event_type.to_string())],
        }
    }
}
