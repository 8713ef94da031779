//! External-media WebSocket server.
//!
//! The PBX opens one WebSocket per channel at
//! `/external_media/{channel_id}`; binary frames carry raw slin16 bytes with
//! no framing header, in both directions. Inbound frames go to the consumer
//! registered for the channel (the session's inbound-audio channel) in
//! arrival order. Outbound audio is staged in a bounded drop-oldest byte
//! ring per connection and drained by a writer task, so producers never
//! block on a slow socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::AudioBuffer;
use crate::config::{AudioSettings, ExternalMediaConfig};
use crate::error::{BridgeError, BridgeResult};

/// Outbound staging capacity: one second of slin16 audio.
const OUTBOUND_WATERMARK_BYTES: usize = 32000;

/// Connection lifecycle events delivered to the dispatcher.
#[derive(Debug, Clone)]
pub enum MediaControlEvent {
    ConnectionEstablished { channel_id: String },
    ConnectionLost { channel_id: String },
}

/// Per-connection byte counters for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MediaConnectionInfo {
    pub channel_id: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Milliseconds since the last inbound frame, if any arrived
    pub last_frame_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaServerStats {
    pub active_connections: usize,
    pub channels: Vec<String>,
}

struct Connection {
    /// Monotonically increasing id guarding against unregistering a
    /// connection that was already superseded
    conn_id: u64,
    outbound: Arc<AudioBuffer>,
    outbound_notify: Arc<Notify>,
    bytes_in: Arc<AtomicU64>,
    bytes_out: Arc<AtomicU64>,
    /// Milliseconds since server start of the newest inbound frame; 0 = none
    last_frame_ms: Arc<AtomicU64>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl Connection {
    fn abort_all(&self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

struct ServerShared {
    connections: Mutex<HashMap<String, Connection>>,
    consumers: Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    control: mpsc::Sender<MediaControlEvent>,
    chunk_bytes: usize,
    next_conn_id: AtomicU64,
    epoch: Instant,
}

pub struct ExternalMediaServer {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl ExternalMediaServer {
    /// Bind the listener and start serving. Returns the server handle and
    /// the control-event stream.
    pub async fn start(
        config: &ExternalMediaConfig,
        audio: AudioSettings,
    ) -> BridgeResult<(Self, mpsc::Receiver<MediaControlEvent>)> {
        let (control_tx, control_rx) = mpsc::channel(128);
        let shared = Arc::new(ServerShared {
            connections: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            control: control_tx,
            chunk_bytes: audio.chunk_bytes(),
            next_conn_id: AtomicU64::new(1),
            epoch: Instant::now(),
        });

        let app = Router::new()
            .route("/external_media/{channel_id}", get(ws_handler))
            .with_state(shared.clone());

        let addr = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::NetworkUnavailable(format!("bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BridgeError::Internal(e.to_string()))?;
        info!(%local_addr, "external media server listening");

        let serve_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("external media server exited: {e}");
            }
        });

        Ok((
            Self {
                shared,
                local_addr,
                serve_task: Mutex::new(Some(serve_task)),
            },
            control_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Route inbound frames for `channel_id` into `consumer`.
    ///
    /// Registered before the externalMedia REST call so no frames are lost
    /// when the PBX connects.
    pub fn register_consumer(&self, channel_id: &str, consumer: mpsc::Sender<Vec<u8>>) {
        self.shared
            .consumers
            .lock()
            .unwrap()
            .insert(channel_id.to_string(), consumer);
    }

    pub fn unregister_consumer(&self, channel_id: &str) {
        self.shared.consumers.lock().unwrap().remove(channel_id);
    }

    /// Queue audio for playback on a channel. Never blocks: when more than
    /// one second of audio is pending, the oldest bytes are dropped.
    pub fn send_audio_to_channel(&self, channel_id: &str, audio: &[u8]) -> BridgeResult<()> {
        let connections = self.shared.connections.lock().unwrap();
        let conn = connections
            .get(channel_id)
            .ok_or_else(|| BridgeError::SessionNotFound(format!("no media leg for {channel_id}")))?;
        conn.outbound.write(audio);
        conn.outbound_notify.notify_one();
        Ok(())
    }

    /// Drop any audio not yet written to the socket (interruption support).
    pub fn clear_outbound(&self, channel_id: &str) {
        if let Some(conn) = self.shared.connections.lock().unwrap().get(channel_id) {
            conn.outbound.clear();
        }
    }

    /// Close the media leg for a channel, if one is up.
    pub fn close_channel(&self, channel_id: &str) {
        if let Some(conn) = self.shared.connections.lock().unwrap().remove(channel_id) {
            conn.abort_all();
            debug!(%channel_id, "media connection closed");
        }
        self.unregister_consumer(channel_id);
    }

    pub fn connection_info(&self, channel_id: &str) -> Option<MediaConnectionInfo> {
        let connections = self.shared.connections.lock().unwrap();
        let conn = connections.get(channel_id)?;
        let last = conn.last_frame_ms.load(Ordering::Relaxed);
        Some(MediaConnectionInfo {
            channel_id: channel_id.to_string(),
            bytes_in: conn.bytes_in.load(Ordering::Relaxed),
            bytes_out: conn.bytes_out.load(Ordering::Relaxed),
            last_frame_age_ms: (last > 0).then(|| {
                (self.shared.epoch.elapsed().as_millis() as u64).saturating_sub(last)
            }),
        })
    }

    pub fn is_connected(&self, channel_id: &str) -> bool {
        self.shared
            .connections
            .lock()
            .unwrap()
            .contains_key(channel_id)
    }

    pub fn stats(&self) -> MediaServerStats {
        let connections = self.shared.connections.lock().unwrap();
        MediaServerStats {
            active_connections: connections.len(),
            channels: connections.keys().cloned().collect(),
        }
    }

    /// Stop the listener and close every connection.
    pub fn stop(&self) {
        if let Some(task) = self.serve_task.lock().unwrap().take() {
            task.abort();
        }
        let mut connections = self.shared.connections.lock().unwrap();
        for (_, conn) in connections.drain() {
            conn.abort_all();
        }
        self.shared.consumers.lock().unwrap().clear();
        info!("external media server stopped");
    }
}

async fn ws_handler(
    Path(channel_id): Path<String>,
    State(shared): State<Arc<ServerShared>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, channel_id, shared))
}

async fn handle_connection(socket: WebSocket, channel_id: String, shared: Arc<ServerShared>) {
    let conn_id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
    info!(%channel_id, conn_id, "media connection established");

    let (ws_tx, ws_rx) = socket.split();

    let outbound = Arc::new(AudioBuffer::new(OUTBOUND_WATERMARK_BYTES));
    let outbound_notify = Arc::new(Notify::new());
    let bytes_in = Arc::new(AtomicU64::new(0));
    let bytes_out = Arc::new(AtomicU64::new(0));
    let last_frame_ms = Arc::new(AtomicU64::new(0));

    let write_task = tokio::spawn(write_loop(
        ws_tx,
        outbound.clone(),
        outbound_notify.clone(),
        bytes_out.clone(),
        shared.chunk_bytes,
    ));

    let read_task = tokio::spawn(read_loop(
        ws_rx,
        channel_id.clone(),
        conn_id,
        shared.clone(),
        bytes_in.clone(),
        last_frame_ms.clone(),
    ));

    // At most one active socket per channel: a newcomer supersedes the
    // previous connection without signalling connection_lost for it.
    let previous = shared.connections.lock().unwrap().insert(
        channel_id.clone(),
        Connection {
            conn_id,
            outbound,
            outbound_notify,
            bytes_in,
            bytes_out,
            last_frame_ms,
            read_task,
            write_task,
        },
    );
    if let Some(previous) = previous {
        warn!(%channel_id, "superseding existing media connection");
        previous.abort_all();
    }

    let _ = shared
        .control
        .send(MediaControlEvent::ConnectionEstablished {
            channel_id: channel_id.clone(),
        })
        .await;
}

async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    channel_id: String,
    conn_id: u64,
    shared: Arc<ServerShared>,
    bytes_in: Arc<AtomicU64>,
    last_frame_ms: Arc<AtomicU64>,
) {
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
                last_frame_ms.store(
                    shared.epoch.elapsed().as_millis() as u64,
                    Ordering::Relaxed,
                );
                let consumer = shared.consumers.lock().unwrap().get(&channel_id).cloned();
                match consumer {
                    // Per-channel backpressure: this read loop alone slows
                    // down, preserving arrival order for the channel
                    Some(consumer) => {
                        if consumer.send(data.to_vec()).await.is_err() {
                            debug!(%channel_id, "consumer gone, ending media read loop");
                            break;
                        }
                    }
                    None => debug!(%channel_id, "inbound frame with no consumer"),
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // Unregister only if this connection is still the registered one; abort
    // just the writer half; this task ends on its own
    let mut lost = false;
    {
        let mut connections = shared.connections.lock().unwrap();
        if connections
            .get(&channel_id)
            .map(|c| c.conn_id == conn_id)
            .unwrap_or(false)
        {
            if let Some(conn) = connections.remove(&channel_id) {
                conn.write_task.abort();
            }
            lost = true;
        }
    }
    if lost {
        info!(%channel_id, "media connection lost");
        let _ = shared
            .control
            .send(MediaControlEvent::ConnectionLost { channel_id })
            .await;
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    outbound: Arc<AudioBuffer>,
    notify: Arc<Notify>,
    bytes_out: Arc<AtomicU64>,
    chunk_bytes: usize,
) {
    loop {
        let mut chunk = outbound.read(chunk_bytes);
        if chunk.is_empty() {
            // Flush a sub-chunk tail before sleeping
            chunk = outbound.read_all();
        }
        if chunk.is_empty() {
            notify.notified().await;
            continue;
        }
        let len = chunk.len() as u64;
        if ws_tx.send(Message::Binary(chunk.into())).await.is_err() {
            break;
        }
        bytes_out.fetch_add(len, Ordering::Relaxed);
    }
}
