// Websocket frame encoding

use serde::{Deserialize, Serialize};

use crate::errors::FrameError;
use crate::models::{Provider, Realm};

/// Provider config accepted by websocket providers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebsocketConfig {
    #[serde(default)]
    pub max_frame_bytes: Option<usize>,
}

impl WebsocketConfig {
    /// Parse the provider's opaque config. A missing config is the default.
    pub fn from_provider(provider: &Provider) -> Result<Self, FrameError> {
        if provider.config.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(provider.config.clone())
            .map_err(|e| FrameError::InvalidConfig(e.to_string()))
    }

    /// Encode `{action, payload}` and enforce the size limit
    pub fn encode(&self, realm: &Realm) -> Result<String, FrameError> {
        let text = encode_frame(&realm.action, &realm.payload)?;
        match self.max_frame_bytes {
            Some(limit) if text.len() > limit => Err(FrameError::TooLarge {
                size: text.len(),
                limit,
            }),
            _ => Ok(text),
        }
    }
}

#[derive(Serialize)]
struct Frame<'a> {
    action: &'a str,
    payload: &'a serde_json::Value,
}

/// Serialize an action frame as sent to clients
pub fn encode_frame(action: &str, payload: &serde_json::Value) -> Result<String, FrameError> {
    serde_json::to_string(&Frame { action, payload }).map_err(|e| FrameError::Encode(e.to_string()))
}
