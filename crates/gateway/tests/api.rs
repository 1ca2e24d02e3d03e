//! End-to-end tests of the session API against a scripted driver.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use {
    futures::StreamExt,
    serde_json::{Value, json},
    tokio::net::TcpListener,
};

use {
    campusline_broker::{
        AddressNormalizer, Broker, ClientDriver, DriverEvent, LifecycleSettings, PairingRenderer,
        testing::{ScriptedDriver, StartScript},
    },
    campusline_gateway::{AppState, build_gateway_app},
};

struct TestServer {
    base: String,
    driver: Arc<ScriptedDriver>,
    client: reqwest::Client,
}

impl TestServer {
    async fn start(script: StartScript) -> Self {
        let driver = Arc::new(ScriptedDriver::new(script));
        let broker = Broker::with_settings(
            AddressNormalizer::new("91", "@c.us"),
            PairingRenderer::new(2, 1),
            LifecycleSettings {
                auth_base_dir: PathBuf::from("/tmp/campusline-gateway-test-auth"),
                init_timeout: Duration::from_secs(5),
                logout_timeout: Duration::from_millis(200),
            },
            Arc::clone(&driver) as Arc<dyn ClientDriver>,
        );
        let app = build_gateway_app(AppState::new(Arc::new(broker)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            driver,
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }
}

fn ready_script() -> StartScript {
    StartScript::Ready {
        address: "919000000000@c.us".into(),
    }
}

#[tokio::test]
async fn health_reports_version() {
    let server = TestServer::start(ready_script()).await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn first_time_pairing_flow() {
    let server = TestServer::start(StartScript::PairingCode("2@token,key".into())).await;

    let (status, body) = server
        .post("/api/sessions/school-42/initialize", json!({}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "awaiting_pairing");
    let image = body["pairing_image"].as_str().unwrap();
    assert!(image.starts_with("data:image/png;base64,"));

    let (status, body) = server.get("/api/sessions/school-42/status").await;
    assert_eq!(status, 200);
    assert_eq!(body["connected"], false);
    assert_eq!(body["state"], "awaiting_pairing");

    server
        .driver
        .emit("school-42", DriverEvent::Ready {
            address: "919876543210@c.us".into(),
            display_name: Some("Front Office".into()),
        })
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (_, body) = server.get("/api/sessions/school-42/status").await;
    assert_eq!(body["connected"], true);
    assert_eq!(body["state"], "ready");
    assert_eq!(body["phone_address"], "919876543210@c.us");
    assert_eq!(body["display_name"], "Front Office");
    assert!(body["last_seen_at"].is_string());
    assert!(body["pairing_image"].is_null());

    let (_, body) = server.get("/api/sessions").await;
    assert_eq!(body["tenants"], json!(["school-42"]));
}

#[tokio::test]
async fn status_of_unknown_tenant_is_404() {
    let server = TestServer::start(ready_script()).await;
    let (status, body) = server.get("/api/sessions/nobody/status").await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn send_without_session_is_conflict() {
    let server = TestServer::start(ready_script()).await;
    let (status, body) = server
        .post(
            "/api/sessions/school-1/send",
            json!({"recipient": "9876543210", "text": "hi"}),
        )
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["code"], "not_connected");
    assert!(server.driver.sent().is_empty());
}

#[tokio::test]
async fn send_text_normalizes_recipient() {
    let server = TestServer::start(ready_script()).await;
    let (_, body) = server
        .post("/api/sessions/school-1/initialize", json!({}))
        .await;
    assert_eq!(body["status"], "ready");

    let (status, body) = server
        .post(
            "/api/sessions/school-1/send",
            json!({"recipient": "+91 98765 43210", "text": "PTM on Saturday"}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["recipient"], "919876543210@c.us");
    assert!(body["message_id"].is_string());
    assert_eq!(server.driver.sent()[0].to, "919876543210@c.us");
}

#[tokio::test]
async fn invalid_recipient_is_unprocessable() {
    let server = TestServer::start(ready_script()).await;
    server
        .post("/api/sessions/school-1/initialize", json!({}))
        .await;

    let (status, body) = server
        .post(
            "/api/sessions/school-1/send",
            json!({"recipient": "n/a", "text": "hi"}),
        )
        .await;
    assert_eq!(status, 422);
    assert_eq!(body["code"], "invalid_recipient");
}

#[tokio::test]
async fn send_media_routes() {
    let server = TestServer::start(ready_script()).await;
    server
        .post("/api/sessions/school-1/initialize", json!({}))
        .await;

    let (status, _) = server
        .post(
            "/api/sessions/school-1/send-media",
            json!({
                "recipient": "9876543210",
                "media_url": "https://cdn.example.com/circular.pdf",
                "caption": "Circular",
                "kind": "document",
            }),
        )
        .await;
    assert_eq!(status, 200);
    let media = server.driver.sent()[0].media.clone().unwrap();
    assert_eq!(media.caption.as_deref(), Some("Circular"));

    let (status, body) = server
        .post(
            "/api/sessions/school-1/send-media",
            json!({"recipient": "9876543210", "media_url": "ftp://example.com/x.png"}),
        )
        .await;
    assert_eq!(status, 502);
    assert_eq!(body["code"], "media_fetch_failed");
}

#[tokio::test]
async fn auth_failure_is_reported_in_body() {
    let server = TestServer::start(StartScript::AuthFailure("device unlinked".into())).await;
    let (status, body) = server
        .post("/api/sessions/school-3/initialize", json!({}))
        .await;
    assert_eq!(status, 401);
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "authentication_failed");
    assert!(body["message"].as_str().unwrap().contains("device unlinked"));
}

#[tokio::test]
async fn engine_startup_failure_is_unavailable() {
    let server =
        TestServer::start(StartScript::FailStartup("required runtime `node` not found".into()))
            .await;
    let (status, body) = server
        .post("/api/sessions/school-5/initialize", json!({}))
        .await;
    assert_eq!(status, 503);
    assert_eq!(body["code"], "engine_startup_failed");
}

#[tokio::test]
async fn disconnect_tears_down_once() {
    let server = TestServer::start(ready_script()).await;
    server
        .post("/api/sessions/school-1/initialize", json!({}))
        .await;

    let (status, body) = server
        .post("/api/sessions/school-1/disconnect", json!({}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(server.driver.destroyed(), 1);

    let (status, _) = server.get("/api/sessions/school-1/status").await;
    assert_eq!(status, 404);

    let (_, body) = server
        .post("/api/sessions/school-1/disconnect", json!({}))
        .await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn event_stream_carries_state_changes() {
    let server = TestServer::start(ready_script()).await;
    let resp = server
        .client
        .get(format!("{}/api/events?tenant_id=school-1", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let mut stream = resp.bytes_stream();

    server
        .post("/api/sessions/school-2/initialize", json!({}))
        .await;
    server
        .post("/api/sessions/school-1/initialize", json!({}))
        .await;

    let mut seen = String::new();
    let read = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = stream.next().await {
            seen.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if seen.contains("\"state\":\"ready\"") {
                break;
            }
        }
    })
    .await;
    assert!(read.is_ok(), "no ready event in {seen:?}");
    assert!(seen.contains("event: state_changed"));
    assert!(!seen.contains("school-2"), "filter leaked: {seen:?}");
}
