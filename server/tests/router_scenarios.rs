//! End-to-end scenarios that require the full router: echo round trip,
//! resize-source arbitration, multi-attachment input fairness, and
//! WebSocket origin rejection. Crash recovery lives in `crash_recovery.rs`
//! since it only exercises the manifest/restore path, not the router.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use tunnelforge::config::{AuthConfig, Config, CorsConfig, IpcConfig, LoggingConfig, ServerConfig, ShellConfig};
use tunnelforge::events::EventBus;
use tunnelforge::sessions::{self, session::ResizeSource, SessionManager};
use tunnelforge::state::AppState;

const API_KEY: &str = "test-api-key";

struct TestApp {
    client: reqwest::Client,
    base_url: String,
    state: AppState,
    _dir: tempfile::TempDir,
}

async fn spawn_app(allowed_origins: Vec<String>) -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    sessions::ensure_control_root(dir.path()).await.expect("control root");

    let config = Config {
        server: ServerConfig {
            control_root: dir.path().to_string_lossy().into_owned(),
            ..ServerConfig::default()
        },
        auth: AuthConfig { api_key: API_KEY.to_string() },
        shell: ShellConfig::default(),
        ipc: IpcConfig::default(),
        logging: LoggingConfig::default(),
        cors: CorsConfig { allowed_origins },
    };

    let events = EventBus::new();
    let session_manager = SessionManager::new(
        dir.path().to_path_buf(),
        events.clone(),
        config.server.max_sessions,
        config.server.session_buffer_size,
        config.ipc.socket_mode,
    );

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        sessions: session_manager,
        events,
        sse_connections: Arc::new(AtomicU32::new(0)),
    };

    let app = tunnelforge::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestApp {
        client: reqwest::Client::new(),
        base_url: format!("http://{addr}"),
        state,
        _dir: dir,
    }
}

async fn create_session(app: &TestApp, body: Value) -> String {
    let resp = app
        .client
        .post(format!("{}/sessions", app.base_url))
        .bearer_auth(API_KEY)
        .json(&body)
        .send()
        .await
        .expect("create session request");
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    let record: Value = resp.json().await.expect("create session body");
    record["id"].as_str().expect("session id").to_string()
}

/// (a) Echo round trip: `echo hi` produces `"hi"` on the session's SSE
/// output stream, and the session reports `exited(code=0)` shortly after.
#[tokio::test]
async fn echo_round_trip() {
    let app = spawn_app(Vec::new()).await;
    let id = create_session(&app, json!({"command": ["/bin/sh", "-c", "echo hi"]})).await;

    let resp = app
        .client
        .get(format!("{}/sessions/{id}/stream", app.base_url))
        .bearer_auth(API_KEY)
        .send()
        .await
        .expect("stream request");
    let mut stream = resp.bytes_stream();

    let saw_hi = tokio::time::timeout(Duration::from_secs(2), async {
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.expect("stream chunk"));
            if String::from_utf8_lossy(&collected).contains("hi") {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(saw_hi, "expected the output stream to contain \"hi\"");

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let resp = app
            .client
            .get(format!("{}/sessions/{id}", app.base_url))
            .bearer_auth(API_KEY)
            .send()
            .await
            .expect("get session");
        let record: Value = resp.json().await.expect("session body");
        if record["status"] == "exited" {
            assert_eq!(record["exitCode"], json!(0));
            return;
        }
        assert!(Instant::now() < deadline, "session did not exit within 2s");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// (b) Resize precedence: an `api` resize always wins arbitration against a
/// conflicting `terminal` resize arriving within the grace window.
#[tokio::test]
async fn resize_api_wins_over_conflicting_terminal_resize() {
    let app = spawn_app(Vec::new()).await;
    let id = create_session(&app, json!({"command": ["/bin/cat"], "cols": 80, "rows": 24})).await;

    let resp = app
        .client
        .post(format!("{}/sessions/{id}/resize", app.base_url))
        .bearer_auth(API_KEY)
        .json(&json!({"cols": 120, "rows": 40}))
        .send()
        .await
        .expect("resize request");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let session = app.state.sessions.get(&id).await.expect("session handle");
    let applied = session
        .resize(90, 30, ResizeSource::Terminal)
        .await
        .expect("terminal resize call");
    assert!(!applied, "a terminal resize within the grace window must lose to the prior api resize");

    let record = session.snapshot().await;
    assert_eq!(record.cols, 120);
    assert_eq!(record.rows, 40);
}

/// (d) Multi-attachment fairness: two WebSocket clients attached to the same
/// session have their input serialized in server-arrival order.
#[tokio::test]
async fn multi_attachment_input_is_serialized_by_arrival_order() {
    let app = spawn_app(Vec::new()).await;
    let id = create_session(&app, json!({"command": ["/bin/cat"]})).await;

    let addr = app.base_url.trim_start_matches("http://");
    let ws_url = format!("ws://{addr}/ws?session={id}");
    let (mut client_a, _) = tokio_tungstenite::connect_async(ws_url.clone()).await.expect("client A connects");
    let (mut client_b, _) = tokio_tungstenite::connect_async(ws_url).await.expect("client B connects");

    client_a
        .send(WsMessage::Text(json!({"type": "input", "data": "A"}).to_string().into()))
        .await
        .expect("client A send");
    client_b
        .send(WsMessage::Text(json!({"type": "input", "data": "B"}).to_string().into()))
        .await
        .expect("client B send");

    let session = app.state.sessions.get(&id).await.expect("session handle");
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let (_, records) = tunnelforge::recording::read_recording_log(&session.dir).await.expect("recording log");
        let inputs: Vec<String> = records
            .iter()
            .filter(|r| r.kind == 'i')
            .filter_map(|r| tunnelforge::recording::decode_payload(&r.value))
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .collect();
        if inputs.len() >= 2 {
            assert_eq!(inputs[0], "A");
            assert_eq!(inputs[1], "B");
            break;
        }
        assert!(Instant::now() < deadline, "expected both input records within 2s, saw {inputs:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// (f) Origin rejection: a `/ws` handshake from a disallowed `Origin` is
/// refused before the session is ever touched.
#[tokio::test]
async fn ws_handshake_rejected_for_disallowed_origin() {
    let app = spawn_app(vec!["https://allowed.example".to_string()]).await;
    let id = create_session(&app, json!({"command": ["/bin/cat"]})).await;

    let addr = app.base_url.trim_start_matches("http://");
    let url = format!("ws://{addr}/ws?session={id}");
    let mut request = url.into_client_request().expect("build request");
    request
        .headers_mut()
        .insert("Origin", "https://evil.example".parse().unwrap());

    let result = tokio_tungstenite::connect_async(request).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status().as_u16(), 403);
        }
        other => panic!("expected the handshake to be refused with 403, got {other:?}"),
    }
}
