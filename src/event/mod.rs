//! Event envelope and its wire encodings.
//!
//! An [`Event`] is immutable once fired: a name, an [`EventTarget`] saying who
//! should receive it, a typed [`Payload`], the originating connection (so the
//! sender never gets its own event back) and an expiry after which queues
//! skip it.

pub mod frame;
pub mod target;
pub mod wire;

use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub use frame::{Frame, SerialMode};
pub use target::EventTarget;
pub use wire::WireMessage;

pub const DEFAULT_EVENT_TTL: Duration = Duration::from_secs(60);

/// Addressing mode of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Exactly one connection.
    #[serde(rename = "SELF")]
    SelfOnly,
    #[serde(rename = "CHANNEL")]
    Channel,
    #[serde(rename = "USER")]
    User,
    #[serde(rename = "WORLD")]
    World,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::SelfOnly => "SELF",
            Scope::Channel => "CHANNEL",
            Scope::User => "USER",
            Scope::World => "WORLD",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SELF" => Ok(Scope::SelfOnly),
            "CHANNEL" => Ok(Scope::Channel),
            "USER" => Ok(Scope::User),
            "WORLD" => Ok(Scope::World),
            other => Err(AppError::BadRequest(format!("unknown scope '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    String,
    Json,
    Status,
}

/// Status object carried by `STATUS` events and error frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(Value),
    Status(StatusPayload),
}

impl Payload {
    pub fn status(code: u16, message: Option<String>) -> Self {
        Payload::Status(StatusPayload { code, message })
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Payload::Text(_) => DataType::String,
            Payload::Json(_) => DataType::Json,
            Payload::Status(_) => DataType::Status,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Payload::Text(text) => Value::String(text.clone()),
            Payload::Json(value) => value.clone(),
            Payload::Status(status) => serde_json::json!({
                "code": status.code,
                "message": status.message,
            }),
        }
    }

    pub fn from_parts(data_type: DataType, data: Value) -> AppResult<Self> {
        match data_type {
            DataType::String => match data {
                Value::String(text) => Ok(Payload::Text(text)),
                Value::Null => Ok(Payload::Text(String::new())),
                other => Err(AppError::InvalidPayload(format!(
                    "STRING data must be a string, got {other}"
                ))),
            },
            DataType::Json => Ok(Payload::Json(data)),
            DataType::Status => serde_json::from_value::<StatusPayload>(data)
                .map(Payload::Status)
                .map_err(|e| AppError::InvalidPayload(format!("STATUS data: {e}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "EventRecord", try_from = "EventRecord")]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub target: EventTarget,
    pub payload: Payload,
    pub from: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl Into<String>, target: EventTarget, payload: Payload) -> Self {
        let created_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            target,
            payload,
            from: None,
            created_at,
            expires_at: created_at + chrono::Duration::seconds(DEFAULT_EVENT_TTL.as_secs() as i64),
        }
    }

    pub fn text(name: impl Into<String>, target: EventTarget, text: impl Into<String>) -> Self {
        Self::new(name, target, Payload::Text(text.into()))
    }

    pub fn json(name: impl Into<String>, target: EventTarget, value: Value) -> Self {
        Self::new(name, target, Payload::Json(value))
    }

    pub fn with_from(mut self, connection_id: impl Into<String>) -> Self {
        self.from = Some(connection_id.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        self.expires_at = self.created_at + ttl;
        self
    }

    /// True until a time-to-live other than [`DEFAULT_EVENT_TTL`] is set.
    pub fn has_default_ttl(&self) -> bool {
        self.expires_at - self.created_at
            == chrono::Duration::seconds(DEFAULT_EVENT_TTL.as_secs() as i64)
    }

    pub fn scope(&self) -> Scope {
        self.target.scope()
    }

    pub fn data_type(&self) -> DataType {
        self.payload.data_type()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn to_message(&self) -> WireMessage {
        WireMessage {
            name: self.name.clone(),
            scope: self.scope(),
            data_type: self.data_type(),
            data: self.payload.to_value(),
            from: self.from.clone(),
        }
    }
}

/// Flat serde form of an [`Event`], used when events cross process boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub name: String,
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub data_type: DataType,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<Event> for EventRecord {
    fn from(event: Event) -> Self {
        EventRecord {
            id: event.id,
            data_type: event.payload.data_type(),
            data: event.payload.to_value(),
            scope: event.target.scope(),
            key: event.target.key().map(str::to_string),
            name: event.name,
            from: event.from,
            created_at: event.created_at,
            expires_at: event.expires_at,
        }
    }
}

impl TryFrom<EventRecord> for Event {
    type Error = AppError;

    fn try_from(record: EventRecord) -> Result<Self, Self::Error> {
        Ok(Event {
            id: record.id,
            name: record.name,
            target: EventTarget::new(record.scope, record.key),
            payload: Payload::from_parts(record.data_type, record.data)?,
            from: record.from,
            created_at: record.created_at,
            expires_at: record.expires_at,
        })
    }
}
