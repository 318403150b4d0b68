use crate::context::RequestContext;
use crate::error::{AppError, AppResult};
use crate::event::{DataType, Event, EventTarget, Payload, Scope};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Fire event request: the JSON message shape plus the target key.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FireEventRequest {
    pub name: String,
    pub scope: Scope,
    /// Channel, user key or connection id, depending on scope. Filled from
    /// the caller's context when absent.
    #[serde(default)]
    pub key: Option<String>,
    pub data_type: DataType,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl FireEventRequest {
    fn into_event(self, default_ttl: Duration) -> AppResult<Event> {
        if self.name.trim().is_empty() {
            return Err(AppError::BadRequest("event name must not be empty".into()));
        }
        let payload = Payload::from_parts(self.data_type, self.data)?;
        let ttl = self.ttl_secs.map(Duration::from_secs).unwrap_or(default_ttl);
        Ok(Event::new(self.name, EventTarget::new(self.scope, self.key), payload).with_ttl(ttl))
    }
}

/// Fire an event
///
/// POST /api/v1/events
pub async fn fire_event(
    state: web::Data<AppState>,
    ctx: RequestContext,
    req: web::Json<FireEventRequest>,
) -> AppResult<HttpResponse> {
    let event = req.into_inner().into_event(state.manager.event_ttl())?;
    let event_id = event.id;
    let scope = event.scope();

    let delivered = state.manager.fire_event(event, &ctx).await?;

    Ok(HttpResponse::Ok().json(json!({
        "event_id": event_id,
        "scope": scope,
        "delivered": delivered,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builds_event_with_key() {
        let req: FireEventRequest = serde_json::from_value(json!({
            "name": "chat",
            "scope": "CHANNEL",
            "key": "abc",
            "dataType": "STRING",
            "data": "hi"
        }))
        .unwrap();
        let event = req.into_event(Duration::from_secs(60)).unwrap();
        assert_eq!(event.target, EventTarget::channel("abc"));
        assert_eq!(event.payload, Payload::Text("hi".into()));
    }

    #[test]
    fn test_request_rejects_bad_payload_and_name() {
        let bad_payload: FireEventRequest = serde_json::from_value(json!({
            "name": "x",
            "scope": "WORLD",
            "dataType": "STATUS",
            "data": "not a status"
        }))
        .unwrap();
        assert!(bad_payload.into_event(Duration::from_secs(60)).is_err());

        let no_name: FireEventRequest = serde_json::from_value(json!({
            "name": " ",
            "scope": "WORLD",
            "dataType": "JSON",
        }))
        .unwrap();
        assert!(matches!(
            no_name.into_event(Duration::from_secs(60)),
            Err(AppError::BadRequest(_))
        ));
    }
}
