//! Shared fixtures for end-to-end tests: a mock ARI REST server, a mock
//! Live API WebSocket server, and a PBX-side media client.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use ari_voice_bridge::config::{
    AriConfig, Config, ExternalMediaConfig, LiveApiConfig, VadSettings,
};

// ─── Mock ARI REST server ────────────────────────────────────

#[derive(Default)]
pub struct AriCalls {
    pub answers: AtomicU32,
    pub media_requests: AtomicU32,
    pub hangups: AtomicU32,
}

pub struct MockAriServer {
    pub base_url: String,
    pub calls: Arc<AriCalls>,
}

impl MockAriServer {
    pub async fn start() -> Self {
        let calls = Arc::new(AriCalls::default());
        let app = Router::new()
            .route(
                "/ari/channels/{id}/answer",
                post(|State(calls): State<Arc<AriCalls>>| async move {
                    calls.answers.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NO_CONTENT
                }),
            )
            .route(
                "/ari/channels/{id}/externalMedia",
                post(|State(calls): State<Arc<AriCalls>>| async move {
                    calls.media_requests.fetch_add(1, Ordering::SeqCst);
                    StatusCode::OK
                }),
            )
            .route(
                "/ari/channels/{id}",
                delete(|State(calls): State<Arc<AriCalls>>| async move {
                    calls.hangups.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NO_CONTENT
                }),
            )
            .with_state(calls.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url: format!("http://{addr}/ari"),
            calls,
        }
    }
}

// ─── Mock Live API server ────────────────────────────────────

pub struct MockLiveState {
    /// Every client event, in arrival order
    pub received: Mutex<Vec<Value>>,
    pub cancelled: Mutex<HashSet<String>>,
    /// How many audio deltas a response produces
    pub delta_count: usize,
    pub delta_gap: Duration,
    /// Drop the connection right after `response.create` (disconnect test)
    pub drop_after_create: AtomicBool,
}

impl MockLiveState {
    pub fn received_types(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.received_types()
            .iter()
            .filter(|t| t == &event_type)
            .count()
    }

    pub fn first_response_id(&self) -> Option<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .find(|v| v["type"] == "response.create")
            .and_then(|v| v["response"]["id"].as_str().map(str::to_string))
    }

    pub fn appended_bytes(&self) -> usize {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v["type"] == "input_audio_buffer.append")
            .filter_map(|v| v["input_audio_buffer"]["audio"].as_str())
            .filter_map(|audio| BASE64.decode(audio).ok())
            .map(|bytes| bytes.len())
            .sum()
    }
}

pub struct MockLiveApi {
    pub addr: SocketAddr,
    pub state: Arc<MockLiveState>,
}

impl MockLiveApi {
    pub async fn start(delta_count: usize, delta_gap: Duration) -> Self {
        let state = Arc::new(MockLiveState {
            received: Mutex::new(Vec::new()),
            cancelled: Mutex::new(HashSet::new()),
            delta_count,
            delta_gap,
            drop_after_create: AtomicBool::new(false),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        serve_connection(ws, state).await;
                    }
                });
            }
        });

        Self { addr, state }
    }
}

type WsSink = Arc<AsyncMutex<SplitSink<WebSocketStream<TcpStream>, Message>>>;

async fn serve_connection(ws: WebSocketStream<TcpStream>, state: Arc<MockLiveState>) {
    let (tx, mut rx) = ws.split();
    let tx: WsSink = Arc::new(AsyncMutex::new(tx));

    while let Some(Ok(msg)) = rx.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(event) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        let event_type = event["type"].as_str().unwrap_or("").to_string();
        state.received.lock().unwrap().push(event.clone());

        match event_type.as_str() {
            "setup" => {
                send(&tx, json!({"type": "session.created", "session": {"id": "mock-session"}}))
                    .await;
            }
            "input_audio_buffer.commit" => {
                send(&tx, json!({"type": "input_audio_buffer.committed"})).await;
            }
            "response.create" => {
                let id = event["response"]["id"].as_str().unwrap_or("r").to_string();
                if state.drop_after_create.load(Ordering::SeqCst) {
                    // Simulate transport loss mid-response
                    let _ = tx.lock().await.close().await;
                    break;
                }
                send(
                    &tx,
                    json!({"type": "response.created", "response": {"id": id.clone()}}),
                )
                .await;
                let tx = tx.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    stream_response(tx, state, id).await;
                });
            }
            "response.cancel" => {
                if let Some(id) = event["response"]["id"].as_str() {
                    state.cancelled.lock().unwrap().insert(id.to_string());
                }
            }
            _ => {}
        }
    }
}

async fn stream_response(tx: WsSink, state: Arc<MockLiveState>, id: String) {
    let chunk = BASE64.encode(vec![0x10u8; 640]);
    for _ in 0..state.delta_count {
        tokio::time::sleep(state.delta_gap).await;
        if state.cancelled.lock().unwrap().contains(&id) {
            return;
        }
        send(
            &tx,
            json!({
                "type": "response.audio.delta",
                "response": {"id": id.clone(), "output": {"audio": chunk.clone()}}
            }),
        )
        .await;
    }
    send(&tx, json!({"type": "response.audio.done", "response": {"id": id}})).await;
}

async fn send(tx: &WsSink, value: Value) {
    let _ = tx
        .lock()
        .await
        .send(Message::Text(value.to_string().into()))
        .await;
}

// ─── Config + event helpers ──────────────────────────────────

/// Bridge config wired to the mock servers, with fast VAD holds so tests do
/// not have to stream in real time.
pub fn test_config(ari: &MockAriServer, live: &MockLiveApi) -> Config {
    let mut config = Config::default();
    config.ari = AriConfig {
        base_url: ari.base_url.clone(),
        username: "test".into(),
        password: "test".into(),
        stasis_app: "voice-bridge-test".into(),
        rest_timeout_s: 2,
    };
    config.external_media = ExternalMediaConfig {
        host: "127.0.0.1".into(),
        port: 0,
    };
    config.live_api = LiveApiConfig {
        api_key: "test-key".into(),
        host: format!("127.0.0.1:{}", live.addr.port()),
        path: "ws/live".into(),
        insecure: true,
        ..Default::default()
    };
    config.vad = VadSettings {
        energy_threshold: 4000.0,
        noise_floor: 2000.0,
        speech_hold_s: 0.0,
        silence_hold_s: 0.05,
    };
    config.policy.ended_retention_s = 0;
    config
}

pub fn stasis_start(channel_id: &str, caller: &str) -> Value {
    json!({
        "type": "StasisStart",
        "application": "voice-bridge-test",
        "timestamp": "2024-05-01T10:00:00.000+0000",
        "channel": {
            "id": channel_id,
            "state": "Ring",
            "caller": {"number": caller, "name": "Test Caller"},
            "dialplan": {"context": "default", "exten": "1000"}
        }
    })
}

pub fn stasis_end(channel_id: &str) -> Value {
    json!({
        "type": "StasisEnd",
        "timestamp": "2024-05-01T10:01:00.000+0000",
        "channel": {"id": channel_id}
    })
}

/// 20 ms slin16 frame of constant amplitude.
pub fn frame(amplitude: i16) -> Vec<u8> {
    let mut out = Vec::with_capacity(640);
    for _ in 0..320 {
        out.extend_from_slice(&amplitude.to_le_bytes());
    }
    out
}

pub fn loud_frame() -> Vec<u8> {
    frame(9000)
}

pub fn quiet_frame() -> Vec<u8> {
    frame(40)
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F: FnMut() -> bool>(mut check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
