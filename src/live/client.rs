//! Streaming Live API client.
//!
//! Maintains one persistent duplex WebSocket to the Live API endpoint. All
//! outbound operations are serialized through a single writer task so
//! `append → commit → create_response` can never reorder; inbound frames are
//! demuxed by a reader task into typed [`LiveEvent`]s fanned out on a
//! broadcast channel. A heartbeat task pings the peer and declares the
//! connection dead when pongs stop arriving.
//!
//! The client never reconnects on its own: connection loss emits
//! [`LiveEvent::Disconnected`] and it is the owner's call what to do next.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LiveApiConfig;
use crate::error::{BridgeError, BridgeResult, LiveApiErrorKind};

use super::protocol::{parse_server_message, ClientEvent, ServerEvent, ServerMessage};

/// Typed events fanned out to subscribers.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// Setup acknowledged; the conversation session is live
    SessionActive,
    /// Server-side VAD detected the start of user speech
    SpeechStarted,
    /// Server-side VAD detected the end of user speech
    SpeechStopped,
    ResponseCreated {
        id: String,
    },
    /// One chunk of synthesized response audio
    AudioDelta {
        response_id: Option<String>,
        audio: Vec<u8>,
    },
    AudioDone {
        response_id: Option<String>,
    },
    TranscriptDelta {
        text: String,
    },
    TranscriptDone {
        text: String,
    },
    Error {
        kind: LiveApiErrorKind,
        code: String,
        message: String,
    },
    /// Transport lost; the client will not reconnect by itself
    Disconnected,
}

/// Conversation state mirrored client-side.
#[derive(Debug)]
struct LiveSession {
    id: String,
    active: bool,
    user_speaking: bool,
    /// Audio streamed since the last commit
    pending_input: Vec<u8>,
    current_response_id: Option<String>,
    transcript: String,
}

/// Snapshot of the current conversation for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct LiveSessionInfo {
    pub id: String,
    pub active: bool,
    pub user_speaking: bool,
    pub pending_input_bytes: usize,
    pub current_response_id: Option<String>,
}

struct ClientState {
    connected: AtomicBool,
    disconnect_emitted: AtomicBool,
    setup_acked: AtomicBool,
    session: Mutex<Option<LiveSession>>,
    paused_until: Mutex<Option<Instant>>,
    last_pong: Mutex<Instant>,
    last_audio_at: Mutex<Option<Instant>>,
}

pub struct LiveApiClient {
    outbound: mpsc::Sender<Message>,
    events: broadcast::Sender<LiveEvent>,
    state: Arc<ClientState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LiveApiClient {
    /// Connect to the Live API and send the setup envelope.
    pub async fn connect(config: LiveApiConfig) -> BridgeResult<Self> {
        let url = config.endpoint_url();
        info!(host = %config.host, "connecting to Live API");

        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| BridgeError::NetworkUnavailable(format!("Live API connect: {e}")))?;
        let (ws_tx, ws_rx) = ws.split();

        let (outbound, outbound_rx) = mpsc::channel::<Message>(256);
        let (events, _) = broadcast::channel(256);
        let state = Arc::new(ClientState {
            connected: AtomicBool::new(true),
            disconnect_emitted: AtomicBool::new(false),
            setup_acked: AtomicBool::new(false),
            session: Mutex::new(None),
            paused_until: Mutex::new(None),
            last_pong: Mutex::new(Instant::now()),
            last_audio_at: Mutex::new(None),
        });

        let client = Self {
            outbound,
            events: events.clone(),
            state: state.clone(),
            tasks: Mutex::new(Vec::new()),
        };

        let writer = tokio::spawn(Self::writer_loop(
            ws_tx,
            outbound_rx,
            state.clone(),
            events.clone(),
        ));
        let reader = tokio::spawn(Self::reader_loop(ws_rx, state.clone(), events.clone()));
        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            client.outbound.clone(),
            state.clone(),
            events.clone(),
            Duration::from_secs(config.ping_interval_s),
            Duration::from_secs(config.ping_timeout_s),
        ));
        client
            .tasks
            .lock()
            .unwrap()
            .extend([writer, reader, heartbeat]);

        client.send_event(&ClientEvent::setup(&config)).await?;
        info!("Live API setup sent");
        Ok(client)
    }

    /// Close the connection and stop all client tasks.
    pub async fn disconnect(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(None)).await;
        // Give the writer a moment to flush the close frame
        tokio::time::sleep(Duration::from_millis(20)).await;
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Some(session) = self.state.session.lock().unwrap().as_mut() {
            session.active = false;
        }
        info!("disconnected from Live API");
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Subscribe to the typed event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.events.subscribe()
    }

    /// Begin a conversation session over the connection.
    ///
    /// The session becomes active immediately if setup was already
    /// acknowledged, otherwise on the `setup_complete` / `session.created`
    /// event.
    pub fn start_conversation(&self) -> BridgeResult<String> {
        if !self.is_connected() {
            return Err(BridgeError::NetworkUnavailable(
                "not connected to Live API".into(),
            ));
        }
        let id = Uuid::new_v4().to_string();
        let session = LiveSession {
            id: id.clone(),
            active: self.state.setup_acked.load(Ordering::SeqCst),
            user_speaking: false,
            pending_input: Vec::new(),
            current_response_id: None,
            transcript: String::new(),
        };
        *self.state.session.lock().unwrap() = Some(session);
        info!(session_id = %id, "started Live API conversation");
        Ok(id)
    }

    /// End the current conversation session, if any.
    pub fn end_conversation(&self) {
        if let Some(session) = self.state.session.lock().unwrap().take() {
            info!(session_id = %session.id, "ended Live API conversation");
        }
    }

    /// When audio was last streamed to the server, if ever.
    pub fn last_audio_at(&self) -> Option<Instant> {
        *self.state.last_audio_at.lock().unwrap()
    }

    /// Whether the conversation is active (setup acknowledged).
    pub fn session_active(&self) -> bool {
        self.state
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.active)
            .unwrap_or(false)
    }

    pub fn session_info(&self) -> Option<LiveSessionInfo> {
        self.state
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| LiveSessionInfo {
                id: s.id.clone(),
                active: s.active,
                user_speaking: s.user_speaking,
                pending_input_bytes: s.pending_input.len(),
                current_response_id: s.current_response_id.clone(),
            })
    }

    /// Stream one audio frame into the server-side input buffer.
    pub async fn append_audio(&self, audio: &[u8]) -> BridgeResult<()> {
        self.ensure_ready()?;
        self.send_event(&ClientEvent::append_audio(audio)).await?;
        if let Some(session) = self.state.session.lock().unwrap().as_mut() {
            session.pending_input.extend_from_slice(audio);
        }
        *self.state.last_audio_at.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    /// Mark the end of the user turn; the server starts generating.
    pub async fn commit_input(&self) -> BridgeResult<()> {
        self.ensure_ready()?;
        self.send_event(&ClientEvent::CommitInput).await?;
        if let Some(session) = self.state.session.lock().unwrap().as_mut() {
            session.pending_input.clear();
        }
        debug!("input audio buffer committed");
        Ok(())
    }

    /// Discard the server-side input buffer.
    pub async fn clear_input(&self) -> BridgeResult<()> {
        self.ensure_ready()?;
        self.send_event(&ClientEvent::ClearInput).await?;
        if let Some(session) = self.state.session.lock().unwrap().as_mut() {
            session.pending_input.clear();
        }
        debug!("input audio buffer cleared");
        Ok(())
    }

    /// Request a response envelope under the given id.
    pub async fn create_response(&self, id: &str) -> BridgeResult<()> {
        self.ensure_ready()?;
        self.send_event(&ClientEvent::create_response(id)).await?;
        if let Some(session) = self.state.session.lock().unwrap().as_mut() {
            session.current_response_id = Some(id.to_string());
        }
        debug!(response_id = %id, "response requested");
        Ok(())
    }

    /// Abort generation of the given response.
    ///
    /// Idempotent: cancelling a response that is not current is a no-op.
    pub async fn cancel_response(&self, id: &str) -> BridgeResult<()> {
        let is_current = self
            .state
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.current_response_id.as_deref() == Some(id))
            .unwrap_or(false);
        if !is_current {
            debug!(response_id = %id, "cancel for non-current response ignored");
            return Ok(());
        }
        self.ensure_ready()?;
        self.send_event(&ClientEvent::cancel_response(id)).await?;
        if let Some(session) = self.state.session.lock().unwrap().as_mut() {
            session.current_response_id = None;
        }
        debug!(response_id = %id, "response cancelled");
        Ok(())
    }

    fn ensure_ready(&self) -> BridgeResult<()> {
        if !self.is_connected() {
            return Err(BridgeError::NetworkUnavailable(
                "not connected to Live API".into(),
            ));
        }
        if let Some(until) = *self.state.paused_until.lock().unwrap() {
            let now = Instant::now();
            if now < until {
                return Err(BridgeError::LiveApi {
                    kind: LiveApiErrorKind::RateLimit,
                    code: "rate_limited".into(),
                    message: format!(
                        "outbound paused for {} ms",
                        until.duration_since(now).as_millis()
                    ),
                });
            }
        }
        Ok(())
    }

    async fn send_event(&self, event: &ClientEvent) -> BridgeResult<()> {
        let text = serde_json::to_string(event)
            .map_err(|e| BridgeError::Internal(format!("serialize event: {e}")))?;
        self.outbound
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| BridgeError::NetworkUnavailable("Live API writer gone".into()))
    }

    async fn writer_loop(
        mut sink: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
        mut rx: mpsc::Receiver<Message>,
        state: Arc<ClientState>,
        events: broadcast::Sender<LiveEvent>,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() {
                warn!("Live API send failed; connection closed");
                mark_disconnected(&state, &events);
                break;
            }
            if closing {
                break;
            }
        }
    }

    async fn reader_loop(
        mut stream: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
        state: Arc<ClientState>,
        events: broadcast::Sender<LiveEvent>,
    ) {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    Self::demux(text.as_str(), &state, &events);
                }
                Ok(Message::Pong(_)) => {
                    *state.last_pong.lock().unwrap() = Instant::now();
                }
                Ok(Message::Close(_)) => {
                    info!("Live API closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Live API read error: {e}");
                    break;
                }
            }
        }
        mark_disconnected(&state, &events);
    }

    async fn heartbeat_loop(
        outbound: mpsc::Sender<Message>,
        state: Arc<ClientState>,
        events: broadcast::Sender<LiveEvent>,
        interval: Duration,
        timeout: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            if !state.connected.load(Ordering::SeqCst) {
                break;
            }
            let pong_age = state.last_pong.lock().unwrap().elapsed();
            if pong_age > interval + timeout {
                warn!(?pong_age, "Live API heartbeat timed out");
                mark_disconnected(&state, &events);
                break;
            }
            if outbound.send(Message::Ping(Vec::new().into())).await.is_err() {
                break;
            }
        }
    }

    /// Route one inbound event: update mirrored session state, then fan out.
    fn demux(text: &str, state: &ClientState, events: &broadcast::Sender<LiveEvent>) {
        let event = match parse_server_message(text) {
            Ok(ServerMessage::Event(event)) => event,
            Ok(ServerMessage::Unknown(event_type)) => {
                debug!(%event_type, "ignoring unknown Live API event");
                return;
            }
            Err(e) => {
                warn!("dropping malformed Live API message: {e}");
                return;
            }
        };

        let out = match event {
            ServerEvent::SetupComplete | ServerEvent::SessionCreated { .. } => {
                state.setup_acked.store(true, Ordering::SeqCst);
                if let Some(session) = state.session.lock().unwrap().as_mut() {
                    session.active = true;
                }
                info!("Live API session active");
                Some(LiveEvent::SessionActive)
            }
            ServerEvent::SpeechStarted => {
                if let Some(session) = state.session.lock().unwrap().as_mut() {
                    session.user_speaking = true;
                }
                Some(LiveEvent::SpeechStarted)
            }
            ServerEvent::SpeechStopped => {
                if let Some(session) = state.session.lock().unwrap().as_mut() {
                    session.user_speaking = false;
                }
                Some(LiveEvent::SpeechStopped)
            }
            ServerEvent::InputCommitted => {
                debug!("server acknowledged input commit");
                None
            }
            ServerEvent::InputCleared => {
                debug!("server acknowledged input clear");
                None
            }
            ServerEvent::ResponseCreated { response } => {
                if let Some(session) = state.session.lock().unwrap().as_mut() {
                    session.current_response_id = Some(response.id.clone());
                }
                Some(LiveEvent::ResponseCreated { id: response.id })
            }
            ServerEvent::AudioDelta { response } => match response.decode_audio() {
                Ok(audio) => Some(LiveEvent::AudioDelta {
                    response_id: response.id,
                    audio,
                }),
                Err(e) => {
                    warn!("dropping audio delta: {e}");
                    None
                }
            },
            ServerEvent::AudioDone { response } => Some(LiveEvent::AudioDone {
                response_id: response.and_then(|r| r.id),
            }),
            ServerEvent::TextDelta { response } => {
                let text = response.output.text.unwrap_or_default();
                if let Some(session) = state.session.lock().unwrap().as_mut() {
                    session.transcript.push_str(&text);
                }
                Some(LiveEvent::TranscriptDelta { text })
            }
            ServerEvent::TextDone { response } => {
                let final_text = response
                    .and_then(|r| r.output.text)
                    .unwrap_or_else(|| {
                        state
                            .session
                            .lock()
                            .unwrap()
                            .as_ref()
                            .map(|s| s.transcript.clone())
                            .unwrap_or_default()
                    });
                Some(LiveEvent::TranscriptDone { text: final_text })
            }
            ServerEvent::Error { error: payload } => {
                let kind = classify_error(&payload.code);
                error!(code = %payload.code, "Live API error: {}", payload.message);
                if kind == LiveApiErrorKind::RateLimit {
                    let pause = Duration::from_millis(payload.retry_after_ms.unwrap_or(1000));
                    *state.paused_until.lock().unwrap() = Some(Instant::now() + pause);
                    warn!(?pause, "pausing outbound Live API ops");
                }
                Some(LiveEvent::Error {
                    kind,
                    code: payload.code,
                    message: payload.message,
                })
            }
        };

        if let Some(event) = out {
            // A lagging subscriber is its own problem; the demux loop goes on
            let _ = events.send(event);
        }
    }
}

fn classify_error(code: &str) -> LiveApiErrorKind {
    if code.contains("rate_limit") {
        LiveApiErrorKind::RateLimit
    } else if code.contains("quota") {
        LiveApiErrorKind::Quota
    } else {
        LiveApiErrorKind::Model
    }
}

fn mark_disconnected(state: &ClientState, events: &broadcast::Sender<LiveEvent>) {
    state.connected.store(false, Ordering::SeqCst);
    if !state.disconnect_emitted.swap(true, Ordering::SeqCst) {
        if let Some(session) = state.session.lock().unwrap().as_mut() {
            session.active = false;
        }
        let _ = events.send(LiveEvent::Disconnected);
    }
}
