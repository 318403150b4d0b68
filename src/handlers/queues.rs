use crate::error::{AppError, AppResult};
use crate::event::{EventTarget, Scope};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

/// Optional target to count recipients for.
#[derive(Debug, Deserialize)]
pub struct RecipientQuery {
    pub scope: Option<Scope>,
    pub key: Option<String>,
}

/// Queues on every node, from the shared directory. With `scope` (and `key`
/// for keyed scopes) the response also carries the cluster-wide recipient
/// count for that target.
///
/// GET /api/v1/queues?scope=CHANNEL&key=abc
pub async fn combined_queues(
    state: web::Data<AppState>,
    query: web::Query<RecipientQuery>,
) -> AppResult<HttpResponse> {
    let nodes = state.manager.directory().node_map().await;
    let total: usize = nodes.values().map(Vec::len).sum();

    let mut body = json!({
        "node_id": state.manager.node_id(),
        "total": total,
        "nodes": nodes,
    });

    let query = query.into_inner();
    if let Some(scope) = query.scope {
        let target = EventTarget::new(scope, query.key);
        if !target.is_resolved() {
            return Err(AppError::BadRequest(format!("scope {scope} needs a key")));
        }
        body["recipients"] = json!(state.manager.count_recipients(&target).await);
    }

    Ok(HttpResponse::Ok().json(body))
}

/// Queues owned by this node
///
/// GET /api/v1/queues/local
pub async fn local_queues(state: web::Data<AppState>) -> HttpResponse {
    let queues = state.manager.queues();

    HttpResponse::Ok().json(json!({
        "node_id": state.manager.node_id(),
        "total": queues.len(),
        "sessions": state.sessions.len(),
        "queues": queues,
    }))
}
