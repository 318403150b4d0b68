//! Two in-process nodes sharing one directory store.

use actix_web::{test, web, App};
use bytes::Bytes;
use push_service::config::Config;
use push_service::context::RequestContext;
use push_service::event::{Event, EventTarget};
use push_service::handlers;
use push_service::push::{DirectoryStore, MemoryDirectoryStore};
use push_service::state::AppState;
use push_service::transport::{PushParams, TransportKind};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

fn node(node_id: &str, store: Arc<dyn DirectoryStore>) -> AppState {
    let config = Config {
        node_id: node_id.to_string(),
        ..Config::default()
    };
    AppState::local(config, store)
}

fn open(state: &AppState, connection: &str, channel: &str) -> mpsc::Receiver<Bytes> {
    let ctx = RequestContext::default()
        .with_connection(connection)
        .with_channel(channel);
    let (_, receiver) = state
        .hub
        .open(TransportKind::Streaming, &PushParams::default(), &ctx)
        .unwrap();
    receiver
}

#[actix_rt::test]
async fn test_combined_view_spans_nodes() {
    let store: Arc<dyn DirectoryStore> = Arc::new(MemoryDirectoryStore::new());
    let node_a = node("node-a", store.clone());
    let node_b = node("node-b", store.clone());

    let _a1 = open(&node_a, "a1", "lobby");
    let _a2 = open(&node_a, "a2", "ops");
    let _b1 = open(&node_b, "b1", "lobby");

    node_a.manager.sync_directory().await;
    node_b.manager.sync_directory().await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(node_a.clone()))
            .configure(handlers::register_routes),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/queues").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["node_id"], "node-a");
    assert_eq!(body["total"], 3);
    assert_eq!(body["nodes"]["node-a"].as_array().unwrap().len(), 2);
    assert_eq!(body["nodes"]["node-b"][0]["connection_id"], "b1");

    let combined = node_b.manager.combined_queues().await;
    let ids: Vec<_> = combined.iter().map(|q| q.connection_id.as_str()).collect();
    assert_eq!(ids, vec!["a1", "a2", "b1"]);

    assert_eq!(
        node_a
            .manager
            .count_recipients(&EventTarget::channel("lobby"))
            .await,
        2
    );

    let req = test::TestRequest::get()
        .uri("/api/v1/queues?scope=CHANNEL&key=lobby")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["recipients"], 2);

    let req = test::TestRequest::get()
        .uri("/api/v1/queues?scope=WORLD")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["recipients"], 3);

    let req = test::TestRequest::get()
        .uri("/api/v1/queues?scope=USER")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn test_withdrawn_node_leaves_the_directory() {
    let store: Arc<dyn DirectoryStore> = Arc::new(MemoryDirectoryStore::new());
    let node_a = node("node-a", store.clone());
    let node_b = node("node-b", store.clone());

    let _a1 = open(&node_a, "a1", "lobby");
    let _b1 = open(&node_b, "b1", "lobby");
    node_a.manager.sync_directory().await;
    node_b.manager.sync_directory().await;

    node_b.manager.close_all();
    node_b.manager.directory().withdraw().await;

    let combined = node_a.manager.combined_queues().await;
    assert_eq!(combined.len(), 1);
    assert_eq!(combined[0].node_id, "node-a");
}

#[actix_rt::test]
async fn test_local_delivery_stays_on_its_node() {
    let store: Arc<dyn DirectoryStore> = Arc::new(MemoryDirectoryStore::new());
    let node_a = node("node-a", store.clone());
    let node_b = node("node-b", store);

    let _a1 = open(&node_a, "a1", "lobby");
    let _b1 = open(&node_b, "b1", "lobby");

    let delivered = node_a
        .manager
        .fire_event(
            Event::text("hi", EventTarget::channel("lobby"), "x"),
            &RequestContext::default(),
        )
        .await
        .unwrap();
    assert_eq!(delivered, 1);
}
