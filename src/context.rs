use actix_web::dev::Payload;
use actix_web::{web, FromRequest, HttpRequest};
use futures::future::{ready, Ready};
use std::collections::HashMap;

pub const SESSION_HEADER: &str = "X-Session-Id";
pub const SESSION_COOKIE: &str = "push_session";
pub const USER_HEADER: &str = "X-User-Key";
pub const CHANNEL_HEADER: &str = "X-Push-Channel";
pub const CONNECTION_HEADER: &str = "X-Push-Connection";

/// Identity of the caller as far as the push layer is concerned.
///
/// Authentication happens upstream; these values are opaque keys used to
/// auto-fill event targets and to bind connections to sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub session_id: Option<String>,
    pub user_key: Option<String>,
    pub channel: Option<String>,
    pub connection_id: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl RequestContext {
    pub fn from_http(req: &HttpRequest) -> Self {
        let header = |name: &str| non_empty(req.headers().get(name).and_then(|v| v.to_str().ok()));
        let query = web::Query::<HashMap<String, String>>::from_query(req.query_string())
            .map(|q| q.into_inner())
            .unwrap_or_default();

        let session_id = header(SESSION_HEADER).or_else(|| {
            req.cookie(SESSION_COOKIE)
                .and_then(|c| non_empty(Some(c.value())))
        });

        Self {
            session_id,
            user_key: header(USER_HEADER),
            channel: non_empty(query.get("channel").map(String::as_str))
                .or_else(|| header(CHANNEL_HEADER)),
            connection_id: header(CONNECTION_HEADER),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user(mut self, user_key: impl Into<String>) -> Self {
        self.user_key = Some(user_key.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }
}

impl FromRequest for RequestContext {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Ok(RequestContext::from_http(req)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::cookie::Cookie;
    use actix_web::test::TestRequest;

    #[test]
    fn test_context_from_headers_and_query() {
        let req = TestRequest::get()
            .uri("/push?channel=abc")
            .insert_header((SESSION_HEADER, "s-1"))
            .insert_header((USER_HEADER, "alice"))
            .insert_header((CONNECTION_HEADER, "c-9"))
            .to_http_request();

        let ctx = RequestContext::from_http(&req);
        assert_eq!(ctx.session_id.as_deref(), Some("s-1"));
        assert_eq!(ctx.user_key.as_deref(), Some("alice"));
        assert_eq!(ctx.channel.as_deref(), Some("abc"));
        assert_eq!(ctx.connection_id.as_deref(), Some("c-9"));
    }

    #[test]
    fn test_session_from_cookie_and_blank_values() {
        let req = TestRequest::get()
            .uri("/push?channel=")
            .cookie(Cookie::new(SESSION_COOKIE, "cookie-session"))
            .insert_header((USER_HEADER, "  "))
            .to_http_request();

        let ctx = RequestContext::from_http(&req);
        assert_eq!(ctx.session_id.as_deref(), Some("cookie-session"));
        assert_eq!(ctx.user_key, None);
        assert_eq!(ctx.channel, None);
    }
}
