use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct EnqueueMessageRequest {
    pub message: String,
}

/// Queue a text message for a session's connection
///
/// POST /api/v1/sessions/{session_id}/messages
pub async fn enqueue_message(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: web::Json<EnqueueMessageRequest>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let pending = state
        .sessions
        .enqueue(&session_id, req.into_inner().message)?;

    Ok(HttpResponse::Accepted().json(json!({
        "session_id": session_id,
        "pending": pending,
    })))
}

/// Invalidate a session (logout)
///
/// DELETE /api/v1/sessions/{session_id}
pub async fn invalidate_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    if !state.sessions.invalidate(&session_id) {
        return Err(AppError::NotFound(format!("session {session_id}")));
    }

    Ok(HttpResponse::Ok().json(json!({
        "session_id": session_id,
        "invalidated": true,
    })))
}
