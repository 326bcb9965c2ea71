use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One recognized utterance sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    pub voice_actor_id: String,
}

impl OutboundMessage {
    pub fn new(text: impl Into<String>, voice_actor_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice_actor_id: voice_actor_id.into(),
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Raw inbound frame as the backend sends it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub voice_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// What an inbound frame means once validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Backend-reported failure, shown verbatim.
    Error(String),
    Assistant {
        text: String,
        voice_url: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame carries neither text nor error")]
    Empty,
}

impl InboundMessage {
    pub fn into_reply(self) -> Result<Reply, ProtocolError> {
        if let Some(error) = self.error.filter(|e| !e.is_empty()) {
            return Ok(Reply::Error(error));
        }
        match self.text {
            Some(text) => Ok(Reply::Assistant {
                text,
                voice_url: self.voice_url.filter(|u| !u.trim().is_empty()),
            }),
            None => Err(ProtocolError::Empty),
        }
    }
}

pub fn parse_frame(frame: &str) -> Result<Reply, ProtocolError> {
    let message: InboundMessage = serde_json::from_str(frame)?;
    message.into_reply()
}
