//! Line frames used by the streaming, long-poll and legacy document
//! transports. The first character of a frame says what it is:
//!
//! | prefix      | meaning                                             |
//! |-------------|-----------------------------------------------------|
//! | `!<ms>`     | connected, heartbeat interval in milliseconds       |
//! | `?`         | clean server-initiated disconnect                   |
//! | `#`         | heartbeat                                           |
//! | `@`         | refresh: reopen the connection                      |
//! | `*`         | padding, ignored                                    |
//! | `\|<text>`  | string payload, sent as-is                          |
//! | `]<text>`   | string payload with `\n`, `\r` and `\\` escaped     |
//! | `[` `R` `r` `f` | serialized object for the negotiated deserializer |
//! | `<digits>`  | status code, optional space and message; implies disconnect |
//!
//! Frames are newline-delimited on the wire.

use super::{Event, WireMessage};
use crate::error::{AppError, AppResult};

pub const PROTOCOL_VERSION: u32 = 1;

/// Which client-side deserializer a serialized object frame targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialMode {
    Json,
    Rpc,
    DeRpc,
    Fast,
}

impl SerialMode {
    pub fn prefix(&self) -> char {
        match self {
            SerialMode::Json => '[',
            SerialMode::Rpc => 'R',
            SerialMode::DeRpc => 'r',
            SerialMode::Fast => 'f',
        }
    }

    pub fn from_prefix(prefix: char) -> Option<Self> {
        match prefix {
            '[' => Some(SerialMode::Json),
            'R' => Some(SerialMode::Rpc),
            'r' => Some(SerialMode::DeRpc),
            'f' => Some(SerialMode::Fast),
            _ => None,
        }
    }

    /// Picks the serializer for the `module`/`version` tokens sent by the client.
    pub fn negotiate(module: Option<&str>, version: Option<&str>) -> AppResult<Self> {
        if let Some(raw) = version.map(str::trim).filter(|v| !v.is_empty()) {
            let requested: u32 = raw
                .parse()
                .map_err(|_| AppError::BadRequest(format!("invalid protocol version '{raw}'")))?;
            if requested == 0 || requested > PROTOCOL_VERSION {
                return Err(AppError::BadRequest(format!(
                    "unsupported protocol version {requested}, server speaks {PROTOCOL_VERSION}"
                )));
            }
        }

        match module.map(|m| m.trim().to_ascii_lowercase()) {
            None => Ok(SerialMode::Json),
            Some(m) => match m.as_str() {
                "" | "json" => Ok(SerialMode::Json),
                "rpc" => Ok(SerialMode::Rpc),
                "de-rpc" | "derpc" => Ok(SerialMode::DeRpc),
                "fast" => Ok(SerialMode::Fast),
                other => Err(AppError::BadRequest(format!(
                    "no serializer for module '{other}'"
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connected { heartbeat_ms: u64 },
    Disconnect,
    Heartbeat,
    Refresh,
    Padding(usize),
    Text(String),
    Object { mode: SerialMode, body: String },
    Status { code: u16, message: Option<String> },
}

impl Frame {
    pub fn event(event: &Event, mode: SerialMode) -> AppResult<Self> {
        Ok(Frame::Object {
            mode,
            body: event.to_message().to_json()?,
        })
    }

    /// Decodes the message carried by an object frame.
    pub fn message(&self) -> Option<AppResult<WireMessage>> {
        match self {
            Frame::Object { body, .. } => Some(WireMessage::from_json(body)),
            _ => None,
        }
    }

    /// Status frames end the connection on the client side.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Disconnect | Frame::Status { .. })
    }

    pub fn encode(&self) -> String {
        match self {
            Frame::Connected { heartbeat_ms } => format!("!{heartbeat_ms}"),
            Frame::Disconnect => "?".to_string(),
            Frame::Heartbeat => "#".to_string(),
            Frame::Refresh => "@".to_string(),
            Frame::Padding(len) => format!("*{}", " ".repeat(*len)),
            Frame::Text(text) => {
                if needs_escape(text) {
                    format!("]{}", escape(text))
                } else {
                    format!("|{text}")
                }
            }
            Frame::Object { mode, body } => format!("{}{body}", mode.prefix()),
            Frame::Status { code, message } => match message {
                Some(message) => format!("{code} {}", message.replace(['\n', '\r'], " ")),
                None => code.to_string(),
            },
        }
    }

    pub fn encode_line(&self) -> String {
        let mut line = self.encode();
        line.push('\n');
        line
    }

    pub fn decode(line: &str) -> AppResult<Self> {
        let mut chars = line.chars();
        let Some(prefix) = chars.next() else {
            return Err(AppError::MalformedFrame("empty frame".into()));
        };
        let rest = chars.as_str();

        match prefix {
            '!' => rest
                .trim()
                .parse()
                .map(|heartbeat_ms| Frame::Connected { heartbeat_ms })
                .map_err(|_| AppError::MalformedFrame(format!("bad heartbeat '{rest}'"))),
            '?' => Ok(Frame::Disconnect),
            '#' => Ok(Frame::Heartbeat),
            '@' => Ok(Frame::Refresh),
            '*' => Ok(Frame::Padding(rest.len())),
            '|' => Ok(Frame::Text(rest.to_string())),
            ']' => Ok(Frame::Text(unescape(rest)?)),
            c if c.is_ascii_digit() => decode_status(line),
            c => match SerialMode::from_prefix(c) {
                Some(mode) => Ok(Frame::Object {
                    mode,
                    body: rest.to_string(),
                }),
                None => Err(AppError::MalformedFrame(format!("unknown frame prefix '{c}'"))),
            },
        }
    }
}

/// Splits a newline-delimited body into frames, skipping blank lines.
pub fn parse_frames(body: &str) -> AppResult<Vec<Frame>> {
    body.split('\n')
        .filter(|line| !line.is_empty())
        .map(Frame::decode)
        .collect()
}

fn decode_status(line: &str) -> AppResult<Frame> {
    let digits_end = line
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(line.len());
    let code = line[..digits_end]
        .parse()
        .map_err(|_| AppError::MalformedFrame(format!("bad status code in '{line}'")))?;
    let message = line[digits_end..]
        .strip_prefix(' ')
        .unwrap_or(&line[digits_end..]);
    Ok(Frame::Status {
        code,
        message: (!message.is_empty()).then(|| message.to_string()),
    })
}

fn needs_escape(text: &str) -> bool {
    text.contains(['\n', '\r', '\\'])
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

pub fn unescape(text: &str) -> AppResult<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                return Err(AppError::MalformedFrame(format!("bad escape '\\{other}'")))
            }
            None => return Err(AppError::MalformedFrame("dangling escape".into())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventTarget, Payload, Scope};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_control_frames() {
        assert_eq!(Frame::Connected { heartbeat_ms: 15000 }.encode(), "!15000");
        assert_eq!(Frame::Disconnect.encode(), "?");
        assert_eq!(Frame::Heartbeat.encode(), "#");
        assert_eq!(Frame::Refresh.encode(), "@");
        assert_eq!(Frame::decode("!250").unwrap(), Frame::Connected { heartbeat_ms: 250 });
        assert_eq!(Frame::decode("*    ").unwrap(), Frame::Padding(4));
        assert!(Frame::decode("!soon").is_err());
    }

    #[test]
    fn test_text_uses_plain_form_when_possible() {
        assert_eq!(Frame::Text("hello".into()).encode(), "|hello");
        assert_eq!(Frame::decode("|a|b").unwrap(), Frame::Text("a|b".into()));
    }

    #[test]
    fn test_text_escaping() {
        let text = "line1\nline2\r\\end";
        let encoded = Frame::Text(text.into()).encode();
        assert_eq!(encoded, "]line1\\nline2\\r\\\\end");
        assert!(!encoded.contains('\n'));
        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::Text(text.into()));
    }

    #[test]
    fn test_bad_escape_rejected() {
        assert!(Frame::decode("]oops\\t").is_err());
        assert!(Frame::decode("]oops\\").is_err());
    }

    #[test]
    fn test_status_frames() {
        assert_eq!(
            Frame::decode("401 session expired").unwrap(),
            Frame::Status {
                code: 401,
                message: Some("session expired".into())
            }
        );
        assert_eq!(
            Frame::decode("500").unwrap(),
            Frame::Status {
                code: 500,
                message: None
            }
        );
        assert!(Frame::decode("503 down").unwrap().is_terminal());
        assert_eq!(
            Frame::Status {
                code: 400,
                message: Some("a\nb".into())
            }
            .encode(),
            "400 a b"
        );
    }

    #[test]
    fn test_unknown_prefix_and_empty_frame() {
        assert!(matches!(Frame::decode("~x"), Err(AppError::MalformedFrame(_))));
        assert!(matches!(Frame::decode(""), Err(AppError::MalformedFrame(_))));
    }

    #[test]
    fn test_event_frame_round_trip() {
        let event = Event::json(
            "ping",
            EventTarget::world(),
            json!({"text": "multi\nline", "n": 2}),
        );
        let line = Frame::event(&event, SerialMode::Json).unwrap().encode_line();
        assert!(line.starts_with("[{"));
        assert_eq!(line.matches('\n').count(), 1);

        let frames = parse_frames(&line).unwrap();
        let message = frames[0].message().unwrap().unwrap();
        let decoded = message.into_event(None, Duration::from_secs(60)).unwrap();

        assert_eq!(decoded.name, "ping");
        assert_eq!(decoded.scope(), Scope::World);
        assert_eq!(decoded.data_type(), event.data_type());
        assert_eq!(decoded.payload, event.payload);
    }

    #[test]
    fn test_serialized_object_prefixes() {
        let event = Event::new("s", EventTarget::world(), Payload::Text("x".into()));
        for mode in [SerialMode::Rpc, SerialMode::DeRpc, SerialMode::Fast] {
            let encoded = Frame::event(&event, mode).unwrap().encode();
            assert!(encoded.starts_with(mode.prefix()));
            match Frame::decode(&encoded).unwrap() {
                Frame::Object { mode: decoded, .. } => assert_eq!(decoded, mode),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[test]
    fn test_negotiate_serializer() {
        assert_eq!(SerialMode::negotiate(None, None).unwrap(), SerialMode::Json);
        assert_eq!(SerialMode::negotiate(Some("RPC"), Some("1")).unwrap(), SerialMode::Rpc);
        assert!(SerialMode::negotiate(Some("protobuf"), None).is_err());
        assert!(SerialMode::negotiate(None, Some("2")).is_err());
        assert!(SerialMode::negotiate(None, Some("x")).is_err());
    }

    #[test]
    fn test_parse_frames_skips_blank_lines() {
        let frames = parse_frames("!1000\n\n#\n?\n").unwrap();
        assert_eq!(
            frames,
            vec![
                Frame::Connected { heartbeat_ms: 1000 },
                Frame::Heartbeat,
                Frame::Disconnect
            ]
        );
    }
}
