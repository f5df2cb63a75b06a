use std::{sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use omnichat::{
    app::{build_state, router, AppState, Backends},
    channels::build_channel_registry,
    config::AppConfig,
    queue::{
        worker::{process_item, InboundHandler, Outcome},
        EventQueue, MemoryQueue,
    },
    store::MemoryStore,
    types::{Platform, Principal},
};
use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tower::ServiceExt;
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

const AGENT_TOKEN: &str = "agent-token";

struct TestApp {
    app: Router,
    state: Arc<AppState>,
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    zalo: MockServer,
}

async fn spawn_app() -> TestApp {
    let zalo = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3.0/oa/user/detail"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": 0,
            "data": { "display_name": "Lan", "avatar": "https://cdn.example/lan.png" },
        })))
        .mount(&zalo)
        .await;

    let config = AppConfig {
        enabled_platforms: vec![Platform::Zalo],
        upstream_timeout: Duration::from_secs(2),
        api_bases: omnichat::config::ApiBases {
            zalo: zalo.uri(),
            ..Default::default()
        },
        ..Default::default()
    };

    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let channel = store.insert_channel(1, Platform::Zalo, "oa-1", "tok", json!({}));
    store.add_channel_admin(channel.id, 10);
    store.insert_token(AGENT_TOKEN, Principal { user_id: 10, shop_id: 1 });

    let backends = Backends {
        store: store.clone(),
        queue: queue.clone(),
        jobs: queue.clone(),
        pool: None,
    };
    let registry = build_channel_registry(&config, reqwest::Client::new()).unwrap();
    let state = build_state(config, &backends, registry).unwrap();
    TestApp {
        app: router(state.clone()),
        state,
        store,
        queue,
        zalo,
    }
}

impl TestApp {
    async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    async fn webhook(&self, platform: &str, payload: Value) -> (StatusCode, Value) {
        self.call(
            Request::post(format!("/{platform}/webhook/receive"))
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
    }

    /// Drains the Zalo inbound topic through the real handler.
    async fn drain_inbound(&self) -> Vec<Outcome> {
        let handler = InboundHandler::new(self.state.orchestrator.clone());
        let items = self
            .queue
            .claim("inbound.zalo", "test", 10, Duration::from_secs(30))
            .await
            .unwrap();
        let mut outcomes = Vec::new();
        for item in &items {
            outcomes.push(
                process_item(self.queue.as_ref(), &handler, &self.state.config.queue, item)
                    .await
                    .unwrap(),
            );
        }
        outcomes
    }

    fn agent_socket(&self) -> UnboundedReceiver<String> {
        let (tx, rx) = unbounded_channel();
        self.state.hub.connect(10, tx).unwrap();
        rx
    }
}

fn user_text(message_id: &str, text: &str) -> Value {
    json!({
        "app_id": "app-1",
        "event_name": "user_send_text",
        "timestamp": "1700000000000",
        "sender": { "id": "u-1" },
        "recipient": { "id": "oa-1" },
        "message": { "msg_id": message_id, "text": text },
    })
}

fn frames(rx: &mut UnboundedReceiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).unwrap());
    }
    frames
}

#[tokio::test]
async fn webhook_message_reaches_agent_socket_once() {
    let app = spawn_app().await;
    let mut agent = app.agent_socket();

    let (status, body) = app.webhook("zalo", user_text("m-1", "hi")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queued"], 1);
    assert_eq!(app.drain_inbound().await, vec![Outcome::Done]);

    let received = frames(&mut agent);
    let events = received
        .iter()
        .map(|frame| frame["event"].as_str().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(events, vec!["newConversation", "receiveMessage"]);
    assert_eq!(received[1]["data"]["content"], "hi");
    let conversation_id = received[0]["data"]["id"].as_i64().unwrap();

    // The platform redelivers the same message.
    let (status, _) = app.webhook("zalo", user_text("m-1", "hi")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.drain_inbound().await, vec![Outcome::Done]);
    assert!(frames(&mut agent).is_empty());
    assert_eq!(app.store.message_count(conversation_id), 1);
}

#[tokio::test]
async fn agent_reply_is_sent_to_zalo() {
    let app = spawn_app().await;
    Mock::given(method("POST"))
        .and(path("/v3.0/oa/message/cs"))
        .and(body_partial_json(json!({ "recipient": { "user_id": "u-1" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": 0,
            "data": { "message_id": "zm-out-1" },
        })))
        .expect(1)
        .mount(&app.zalo)
        .await;
    let mut agent = app.agent_socket();

    app.webhook("zalo", user_text("m-1", "hi")).await;
    app.drain_inbound().await;
    let conversation_id = frames(&mut agent)[0]["data"]["id"].as_i64().unwrap();

    let (status, body) = app
        .call(
            Request::post("/chat/sms")
                .header("authorization", format!("Bearer {AGENT_TOKEN}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "conversationId": conversation_id, "content": "hello Lan" })
                        .to_string(),
                ))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["deliveryStatus"], "delivered");
    assert_eq!(body["externalId"], "zm-out-1");

    let (status, body) = app
        .call(
            Request::get(format!("/conversations/{conversation_id}/messages"))
                .header("authorization", format!("Bearer {AGENT_TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["messages"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn requests_without_token_are_unauthorized() {
    let app = spawn_app().await;
    let (status, body) = app
        .call(
            Request::post("/chat/sms")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "conversationId": 1, "content": "x" }).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn disabled_platform_has_no_webhook() {
    let app = spawn_app().await;
    let (status, _) = app.webhook("facebook", json!({ "object": "page" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_webhook_is_acknowledged_without_queueing() {
    let app = spawn_app().await;
    let (status, body) = app
        .call(
            Request::post("/zalo/webhook/receive")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queued"], 0);
    assert!(app.drain_inbound().await.is_empty());
}

#[tokio::test]
async fn health_reports_store_and_queues() {
    let app = spawn_app().await;
    let (status, body) = app
        .call(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert!(body["channelsMissingCredentials"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn dead_letters_are_visible_only_to_their_shop() {
    let app = spawn_app().await;
    app.store
        .insert_token("other-shop-token", Principal { user_id: 20, shop_id: 2 });

    app.webhook("zalo", user_text("m-1", "hi")).await;
    let items = app
        .queue
        .claim("inbound.zalo", "test", 10, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].shop_id, Some(1));
    app.queue.dead_letter(items[0].id, "gave up").await.unwrap();

    let get = |token: &str| {
        Request::get("/admin/dead-letters")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    };
    let requeue = |token: &str| {
        Request::post(format!("/admin/dead-letters/{}/requeue", items[0].id))
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = app.call(get("other-shop-token")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["items"].as_array().unwrap().is_empty());
    let (status, _) = app.call(requeue("other-shop-token")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = app.call(get(AGENT_TOKEN)).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
    let (status, body) = app.call(requeue(AGENT_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["item"]["status"], "pending");
}

#[tokio::test]
async fn health_degrades_when_channels_cannot_be_listed() {
    let app = spawn_app().await;
    app.store.break_channel_listing();
    let (status, body) = app
        .call(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ok"], false);
}
