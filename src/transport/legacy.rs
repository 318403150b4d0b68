use super::{TransportAdapter, TransportKind};
use crate::error::AppResult;
use crate::event::{Event, Frame, SerialMode};
use bytes::Bytes;
use tracing::warn;

const COLLECT_SCRIPT: &str = "<script>(function(){var s=document.getElementsByTagName('script');\
while(s.length>1){s[0].parentNode.removeChild(s[0]);}})();</script>\n";

#[derive(Debug, Clone)]
pub struct LegacyOptions {
    pub domain: Option<String>,
    pub padding_bytes: usize,
    pub max_bytes: usize,
    pub collect_every: usize,
}

/// Accepts only plain host names so the value is safe inside a script.
fn valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

/// Script-safe JS string literal for a frame.
fn js_string(value: &str) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace("</", "<\\/")
}

/// Nested-document streaming for browsers without XHR streaming: the
/// response is an HTML document that grows by one `<script>` per frame and
/// hands each frame to the parent window.
///
/// The document is trimmed every `collect_every` frames, and once it passes
/// `max_bytes` the client is told to refresh so memory stays bounded.
pub struct LegacyAdapter {
    mode: SerialMode,
    options: LegacyOptions,
    written: usize,
    frames: usize,
}

impl LegacyAdapter {
    pub fn new(mode: SerialMode, options: LegacyOptions) -> Self {
        Self {
            mode,
            options,
            written: 0,
            frames: 0,
        }
    }

    fn wrap(&mut self, frame: &Frame) -> Bytes {
        let mut out = format!("<script>parent.c({});</script>\n", js_string(&frame.encode()));
        self.frames += 1;
        if self.frames % self.options.collect_every.max(1) == 0 {
            out.push_str(COLLECT_SCRIPT);
        }
        self.written += out.len();
        Bytes::from(out)
    }
}

impl TransportAdapter for LegacyAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Legacy
    }

    fn content_type(&self) -> &'static str {
        "text/html; charset=utf-8"
    }

    fn preamble(&mut self) -> Option<Bytes> {
        let mut head = String::from("<html><head>");
        if let Some(domain) = self.options.domain.as_deref() {
            if valid_domain(domain) {
                head.push_str(&format!("<script>document.domain='{domain}';</script>"));
            } else {
                warn!(domain = %domain, "ignoring invalid document domain");
            }
        }
        head.push_str("</head><body>\n");
        if self.options.padding_bytes > 0 {
            head.push_str("<!--");
            head.push_str(&" ".repeat(self.options.padding_bytes));
            head.push_str("-->\n");
        }
        self.written += head.len();
        Some(Bytes::from(head))
    }

    fn connected(&mut self, heartbeat_ms: u64) -> Bytes {
        self.wrap(&Frame::Connected { heartbeat_ms })
    }

    fn event(&mut self, event: &Event) -> AppResult<Bytes> {
        let frame = Frame::event(event, self.mode)?;
        Ok(self.wrap(&frame))
    }

    fn text(&mut self, text: &str) -> AppResult<Bytes> {
        Ok(self.wrap(&Frame::Text(text.to_string())))
    }

    fn heartbeat(&mut self) -> Bytes {
        self.wrap(&Frame::Heartbeat)
    }

    fn disconnect(&mut self) -> Option<Bytes> {
        Some(self.wrap(&Frame::Disconnect))
    }

    fn refresh(&mut self) -> Option<Bytes> {
        Some(self.wrap(&Frame::Refresh))
    }

    fn error(&mut self, code: u16, message: &str) -> Bytes {
        self.wrap(&Frame::Status {
            code,
            message: (!message.is_empty()).then(|| message.to_string()),
        })
    }

    fn needs_refresh(&self) -> bool {
        self.written >= self.options.max_bytes
    }
}
