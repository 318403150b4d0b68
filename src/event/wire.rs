use super::{DataType, Event, EventTarget, Payload, Scope};
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// JSON shape shared by WebSocket messages, SSE data lines and `[` frames:
/// `{ name, scope, dataType, data, from? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub name: String,
    pub scope: Scope,
    pub data_type: DataType,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl WireMessage {
    /// Control message addressed to the receiving connection itself.
    pub fn control(name: &str, data_type: DataType, data: Value) -> Self {
        Self {
            name: name.to_string(),
            scope: Scope::SelfOnly,
            data_type,
            data,
            from: None,
        }
    }

    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> AppResult<Self> {
        serde_json::from_str(raw).map_err(|e| AppError::MalformedFrame(e.to_string()))
    }

    pub fn payload(&self) -> AppResult<Payload> {
        Payload::from_parts(self.data_type, self.data.clone())
    }

    pub fn is_status(&self) -> bool {
        self.data_type == DataType::Status
    }

    /// Rebuilds an event. The message shape carries no target key, so callers
    /// pass it explicitly (or leave it for context resolution).
    pub fn into_event(self, key: Option<String>, ttl: Duration) -> AppResult<Event> {
        let payload = Payload::from_parts(self.data_type, self.data)?;
        let mut event = Event::new(self.name, EventTarget::new(self.scope, key), payload)
            .with_ttl(ttl);
        event.from = self.from;
        Ok(event)
    }
}
