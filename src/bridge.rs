//! ARI dispatcher and cross-component coordinator.
//!
//! One [`VoiceBridge`] owns the session manager, the Live API client, the
//! external-media server, and the ARI REST client, and wires them together:
//!
//! ```text
//! PBX ──ARI events──▶ handle_ari_event ──REST──▶ PBX (answer/externalMedia/hangup)
//! PBX ──WS frames──▶ media server ──▶ per-session pipeline (VAD) ──▶ Live API
//! Live API ──audio deltas──▶ media server ──WS frames──▶ PBX
//! ```
//!
//! Components never hold references into each other's state: they exchange
//! channel ids and go through the dispatcher, which is the only writer of
//! the session map (via the session manager) and the per-session runtimes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ari::{parse_ari_event, AriChannel, AriEvent, AriRestClient, ParsedAriEvent};
use crate::audio::{AudioBuffer, AudioPipeline, PipelineEvent, SAMPLE_WIDTH};
use crate::config::{Config, LiveErrorPolicy, TurnDetectionMode};
use crate::error::{BridgeError, BridgeResult, ErrorEvent};
use crate::live::{LiveApiClient, LiveEvent, LiveSessionInfo};
use crate::media::{ExternalMediaServer, MediaConnectionInfo, MediaControlEvent, MediaServerStats};
use crate::session::{
    CallDirection, EndReason, SessionManager, SessionState, SessionStats, SessionSummary,
};

/// Audio buffered per session while Live API setup is still pending: 500 ms.
const PRE_SETUP_BUFFER_BYTES: usize = 16000;

/// Soft budget for one ARI event handler.
const EVENT_HANDLER_BUDGET: Duration = Duration::from_secs(5);

/// Cadence of the session sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Structured result of handling one ARI event.
#[derive(Debug, Clone, Serialize)]
pub struct EventOutcome {
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Handled,
    Ignored,
    Error,
}

impl EventOutcome {
    fn handled(action: &str) -> Self {
        Self {
            status: EventStatus::Handled,
            action: Some(action.to_string()),
            message: None,
        }
    }

    fn ignored(message: impl Into<String>) -> Self {
        Self {
            status: EventStatus::Ignored,
            action: None,
            message: Some(message.into()),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: EventStatus::Error,
            action: None,
            message: Some(message.into()),
        }
    }
}

/// Process-wide counters.
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub rest_failures: AtomicU64,
    pub dropped_pre_setup_bytes: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub malformed_frames: u64,
    pub rest_failures: u64,
    pub dropped_pre_setup_bytes: u64,
}

impl BridgeMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            rest_failures: self.rest_failures.load(Ordering::Relaxed),
            dropped_pre_setup_bytes: self.dropped_pre_setup_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Messages from per-session pipeline tasks to the control pump.
#[derive(Debug)]
enum ControlMessage {
    SpeechStarted {
        channel_id: String,
    },
    SpeechStopped {
        channel_id: String,
        duration: Duration,
        buffered_bytes: usize,
    },
}

/// Per-session task handles and response bookkeeping.
struct SessionRuntime {
    session_id: String,
    pipeline_task: JoinHandle<()>,
    /// Bytes of assistant audio forwarded for the in-flight response
    response_audio_bytes: u64,
    /// Set when the server-side VAD reported speech_started (server mode)
    server_speech_started_at: Option<Instant>,
}

/// Aggregated view served by `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub is_running: bool,
    pub active_calls: usize,
    pub calls: Vec<String>,
    pub session_stats: SessionStats,
    pub live_api: LiveApiStatus,
    pub external_media: MediaServerStats,
    pub metrics: MetricsSnapshot,
    pub config: ConfigEcho,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveApiStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<LiveSessionInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigEcho {
    pub stasis_app: String,
    pub external_media_host: String,
    pub external_media_port: u16,
    pub audio_format: &'static str,
    pub sample_rate: u32,
}

/// Per-call view served by `GET /calls/{channel_id}`.
#[derive(Debug, Clone, Serialize)]
pub struct CallInfo {
    pub session: SessionSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_media: Option<MediaConnectionInfo>,
}

pub struct VoiceBridge {
    config: Arc<Config>,
    sessions: Arc<SessionManager>,
    live: Arc<LiveApiClient>,
    media: Arc<ExternalMediaServer>,
    rest: AriRestClient,
    metrics: Arc<BridgeMetrics>,
    errors: broadcast::Sender<ErrorEvent>,
    control_tx: mpsc::Sender<ControlMessage>,
    runtimes: Mutex<HashMap<String, SessionRuntime>>,
    /// response id → channel owning it, recorded at create_response time
    active_responses: Mutex<HashMap<String, String>>,
    /// Channel that most recently streamed audio to the Live API; server-VAD
    /// events (which carry no channel) apply to it
    live_focus: Mutex<Option<String>>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VoiceBridge {
    /// Validate config, connect the Live API (startup fails if it is
    /// unreachable), start the media server, and spawn the event pumps.
    pub async fn start(config: Config) -> BridgeResult<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);

        let live = Arc::new(LiveApiClient::connect(config.live_api.clone()).await?);
        let (media, media_events) =
            ExternalMediaServer::start(&config.external_media, config.audio).await?;
        let rest = AriRestClient::new(config.ari.clone())?;

        let (control_tx, control_rx) = mpsc::channel(256);
        let (errors, _) = broadcast::channel(256);

        let bridge = Arc::new(Self {
            config,
            sessions: Arc::new(SessionManager::new()),
            live,
            media: Arc::new(media),
            rest,
            metrics: Arc::new(BridgeMetrics::default()),
            errors,
            control_tx,
            runtimes: Mutex::new(HashMap::new()),
            active_responses: Mutex::new(HashMap::new()),
            live_focus: Mutex::new(None),
            running: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        });

        let pumps = [
            tokio::spawn(Self::control_pump(bridge.clone(), control_rx)),
            tokio::spawn(Self::media_pump(bridge.clone(), media_events)),
            tokio::spawn(Self::live_pump(bridge.clone())),
            tokio::spawn(Self::sweeper(bridge.clone())),
        ];
        bridge.tasks.lock().unwrap().extend(pumps);

        info!("voice bridge started");
        Ok(bridge)
    }

    /// Global shutdown: end every call, stop the media listener, disconnect
    /// the Live API, stop the pumps.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping voice bridge");
        for channel_id in self.sessions.live_channels() {
            self.end_call(&channel_id, EndReason::Shutdown).await;
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.media.stop();
        self.live.disconnect().await;
        info!("voice bridge stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.errors.subscribe()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn metrics(&self) -> &BridgeMetrics {
        &self.metrics
    }

    // ─── ARI ingress ─────────────────────────────────────────

    /// Handle one inbound ARI event object.
    ///
    /// Handler failures are captured and returned as an error outcome; they
    /// never propagate out of the dispatcher.
    pub async fn handle_ari_event(self: &Arc<Self>, event: serde_json::Value) -> EventOutcome {
        let parsed = match parse_ari_event(event) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("rejecting ARI event: {e}");
                return EventOutcome::error(e.to_string());
            }
        };
        let event = match parsed {
            ParsedAriEvent::Recognized(event) => event,
            ParsedAriEvent::Unrecognized(event_type) => {
                debug!(%event_type, "ignoring ARI event");
                return EventOutcome::ignored(format!("unhandled event type: {event_type}"));
            }
        };

        match tokio::time::timeout(EVENT_HANDLER_BUDGET, self.dispatch(event)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("ARI event handler exceeded its budget");
                EventOutcome::error("handler timed out".to_string())
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, event: AriEvent) -> EventOutcome {
        match event {
            AriEvent::StasisStart { channel, .. } => match self.handle_stasis_start(&channel).await
            {
                Ok(session_id) => EventOutcome {
                    message: Some(session_id),
                    ..EventOutcome::handled("call_started")
                },
                Err(e) => {
                    error!(channel_id = %channel.id, "StasisStart failed: {e}");
                    self.emit_error(&e, Some(&channel.id));
                    EventOutcome::error(e.to_string())
                }
            },
            AriEvent::StasisEnd { channel, .. } => {
                self.end_call(&channel.id, EndReason::Hangup).await;
                EventOutcome::handled("call_ended")
            }
            AriEvent::ChannelHangupRequest { channel, .. } => {
                info!(channel_id = %channel.id, "hangup requested");
                self.end_call(&channel.id, EndReason::Hangup).await;
                EventOutcome::handled("hangup_processed")
            }
            AriEvent::ChannelStateChange { channel, .. } => {
                let new_state = channel.state.clone();
                match self.sessions.with_session(&channel.id, |session| {
                    session.channel_state = new_state;
                }) {
                    Ok(()) => EventOutcome::handled("state_updated"),
                    Err(_) => EventOutcome::ignored("no session for channel"),
                }
            }
        }
    }

    /// StasisStart: allocate the session and its pipeline, drive the PBX
    /// REST calls, and begin the Live API conversation.
    async fn handle_stasis_start(self: &Arc<Self>, channel: &AriChannel) -> BridgeResult<String> {
        let channel_id = channel.id.clone();
        let now = Instant::now();
        info!(
            %channel_id,
            caller = %channel.caller_number(),
            called = %channel.called_number(),
            "call started"
        );

        let session_id = self.sessions.create_session(
            &channel_id,
            &channel.caller_number(),
            &channel.called_number(),
            CallDirection::Inbound,
            now,
        );
        self.spawn_session_runtime(&channel_id, &session_id);

        // REST failures are logged but do not kill the session: some PBXs
        // answer implicitly and the media leg may still arrive
        if self.config.policy.auto_answer_calls {
            if let Err(e) = self.rest.answer(&channel_id).await {
                self.metrics.rest_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%channel_id, "answer failed: {e}");
                self.emit_error(&e, Some(&channel_id));
            }
        }
        if let Err(e) = self
            .rest
            .start_external_media(&channel_id, &self.config.external_media)
            .await
        {
            self.metrics.rest_failures.fetch_add(1, Ordering::Relaxed);
            warn!(%channel_id, "externalMedia failed: {e}");
            self.emit_error(&e, Some(&channel_id));
        }

        self.live.start_conversation()?;
        self.sessions
            .transition(&channel_id, SessionState::Active, Instant::now())?;
        Ok(session_id)
    }

    /// Create the inbound-audio channel and pipeline task for a session and
    /// register it with the media server before the PBX can connect.
    fn spawn_session_runtime(self: &Arc<Self>, channel_id: &str, session_id: &str) {
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(64);
        self.media.register_consumer(channel_id, audio_tx);

        let pipeline_task = tokio::spawn(Self::pipeline_loop(
            self.clone(),
            channel_id.to_string(),
            audio_rx,
        ));

        let previous = self.runtimes.lock().unwrap().insert(
            channel_id.to_string(),
            SessionRuntime {
                session_id: session_id.to_string(),
                pipeline_task,
                response_audio_bytes: 0,
                server_speech_started_at: None,
            },
        );
        if let Some(previous) = previous {
            previous.pipeline_task.abort();
        }
    }

    /// Per-session pipeline task: VAD every inbound frame, forward it to the
    /// Live API (buffering up to 500 ms until setup is acknowledged), and
    /// report speech edges to the control pump.
    async fn pipeline_loop(
        bridge: Arc<Self>,
        channel_id: String,
        mut audio_rx: mpsc::Receiver<Vec<u8>>,
    ) {
        let mut pipeline = AudioPipeline::new(bridge.config.audio, bridge.config.vad);
        let pre_setup = AudioBuffer::new(PRE_SETUP_BUFFER_BYTES);
        let mut live_warned = false;

        while let Some(frame) = audio_rx.recv().await {
            let now = Instant::now();
            bridge.metrics.frames_in.fetch_add(1, Ordering::Relaxed);

            let malformed = frame.is_empty() || frame.len() % SAMPLE_WIDTH != 0;
            let (_result, edge) = pipeline.process_input(&frame, now);
            if malformed {
                bridge.metrics.malformed_frames.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            *bridge.live_focus.lock().unwrap() = Some(channel_id.clone());

            if bridge.live.session_active() {
                // Flush audio held back while setup was pending, in order
                let held = pre_setup.read_all();
                if !held.is_empty() {
                    debug!(%channel_id, bytes = held.len(), "flushing pre-setup audio");
                    if let Err(e) = bridge.live.append_audio(&held).await {
                        debug!(%channel_id, "pre-setup flush failed: {e}");
                    }
                }
                if let Err(e) = bridge.live.append_audio(&frame).await {
                    if !live_warned {
                        warn!(%channel_id, "audio forward failed: {e}");
                        live_warned = true;
                    }
                } else {
                    live_warned = false;
                }
            } else {
                let before = pre_setup.size();
                pre_setup.write(&frame);
                let dropped = (before + frame.len()).saturating_sub(pre_setup.capacity());
                if dropped > 0 {
                    bridge
                        .metrics
                        .dropped_pre_setup_bytes
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                }
            }

            let message = match edge {
                Some(PipelineEvent::SpeechStarted) => Some(ControlMessage::SpeechStarted {
                    channel_id: channel_id.clone(),
                }),
                Some(PipelineEvent::SpeechStopped { duration }) => {
                    let buffered = pipeline.uncommitted_audio();
                    pipeline.mark_committed();
                    Some(ControlMessage::SpeechStopped {
                        channel_id: channel_id.clone(),
                        duration,
                        buffered_bytes: buffered,
                    })
                }
                None => None,
            };
            if let Some(message) = message {
                if bridge.control_tx.send(message).await.is_err() {
                    break;
                }
            }
        }
        debug!(%channel_id, "pipeline task ended");
    }

    // ─── Event pumps ─────────────────────────────────────────

    /// Drives the session state machine from local VAD edges.
    async fn control_pump(bridge: Arc<Self>, mut rx: mpsc::Receiver<ControlMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                ControlMessage::SpeechStarted { channel_id } => {
                    if bridge.config.policy.turn_detection == TurnDetectionMode::Client {
                        bridge.on_user_speech_started(&channel_id).await;
                    }
                }
                ControlMessage::SpeechStopped {
                    channel_id,
                    duration,
                    buffered_bytes,
                } => {
                    if bridge.config.policy.turn_detection == TurnDetectionMode::Client {
                        bridge
                            .on_user_speech_stopped(&channel_id, duration, buffered_bytes)
                            .await;
                    }
                }
            }
        }
    }

    /// Tracks media connections and losses.
    async fn media_pump(bridge: Arc<Self>, mut rx: mpsc::Receiver<MediaControlEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                MediaControlEvent::ConnectionEstablished { channel_id } => {
                    let now = Instant::now();
                    let _ = bridge.sessions.with_session(&channel_id, |session| {
                        session.media_connected = true;
                        session.touch(now);
                    });
                    // The call is live once audio can flow
                    if bridge.sessions.state_of(&channel_id) == Some(SessionState::Active) {
                        let _ = bridge
                            .sessions
                            .transition(&channel_id, SessionState::WaitingForInput, now);
                    }
                }
                MediaControlEvent::ConnectionLost { channel_id } => {
                    if bridge
                        .sessions
                        .state_of(&channel_id)
                        .map(|s| !s.is_terminal())
                        .unwrap_or(false)
                    {
                        warn!(%channel_id, "media connection lost, ending call");
                        bridge.end_call(&channel_id, EndReason::Error).await;
                    }
                }
            }
        }
    }

    /// Routes Live API events: response audio to the owning channel,
    /// server-VAD edges to the focused session, errors to observers.
    async fn live_pump(bridge: Arc<Self>) {
        let mut events = bridge.live.subscribe();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "live event pump lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                LiveEvent::SessionActive => {
                    debug!("live session active");
                }
                LiveEvent::SpeechStarted => {
                    if bridge.config.policy.turn_detection == TurnDetectionMode::Server {
                        if let Some(channel_id) = bridge.focused_channel() {
                            if let Some(runtime) =
                                bridge.runtimes.lock().unwrap().get_mut(&channel_id)
                            {
                                runtime.server_speech_started_at = Some(Instant::now());
                            }
                            bridge.on_user_speech_started(&channel_id).await;
                        }
                    }
                }
                LiveEvent::SpeechStopped => {
                    if bridge.config.policy.turn_detection == TurnDetectionMode::Server {
                        if let Some(channel_id) = bridge.focused_channel() {
                            let duration = bridge
                                .runtimes
                                .lock()
                                .unwrap()
                                .get_mut(&channel_id)
                                .and_then(|r| r.server_speech_started_at.take())
                                .map(|t| t.elapsed())
                                .unwrap_or_default();
                            let buffered = bridge
                                .live
                                .session_info()
                                .map(|s| s.pending_input_bytes)
                                .unwrap_or(0);
                            bridge
                                .on_user_speech_stopped(&channel_id, duration, buffered)
                                .await;
                        }
                    }
                }
                LiveEvent::ResponseCreated { id } => {
                    // Bind server-initiated responses to the focused channel
                    let mut responses = bridge.active_responses.lock().unwrap();
                    if !responses.contains_key(&id) {
                        if let Some(channel_id) = bridge.focused_channel() {
                            responses.insert(id, channel_id);
                        }
                    }
                }
                LiveEvent::AudioDelta { response_id, audio } => {
                    bridge.on_audio_delta(response_id, audio).await;
                }
                LiveEvent::AudioDone { response_id } => {
                    bridge.on_audio_done(response_id).await;
                }
                LiveEvent::TranscriptDelta { .. } => {}
                LiveEvent::TranscriptDone { text } => {
                    debug!(%text, "assistant transcript");
                }
                LiveEvent::Error {
                    kind,
                    code,
                    message,
                } => {
                    let err = BridgeError::LiveApi {
                        kind,
                        code,
                        message,
                    };
                    let channel = bridge.focused_channel();
                    bridge.emit_error(&err, channel.as_deref());
                }
                LiveEvent::Disconnected => {
                    bridge.on_live_disconnected().await;
                }
            }
        }
    }

    /// Periodic sweep: call-duration ceiling, missing-media deadline, and
    /// eviction of retained ended sessions.
    async fn sweeper(bridge: Arc<Self>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let policy = &bridge.config.policy;
            let outcome = bridge.sessions.sweep(
                Instant::now(),
                Duration::from_secs(policy.max_call_duration_s),
                Duration::from_secs(policy.media_wait_timeout_s),
                Duration::from_secs(policy.ended_retention_s),
            );
            for channel_id in outcome.timed_out {
                warn!(%channel_id, "call exceeded max duration");
                bridge.emit_error(
                    &BridgeError::TimeoutExceeded(format!(
                        "call exceeded {} s",
                        policy.max_call_duration_s
                    )),
                    Some(&channel_id),
                );
                bridge.end_call(&channel_id, EndReason::TimeoutExceeded).await;
            }
            for channel_id in outcome.media_overdue {
                warn!(%channel_id, "no external media within deadline");
                bridge.emit_error(
                    &BridgeError::NetworkUnavailable(format!(
                        "no external media within {} s",
                        policy.media_wait_timeout_s
                    )),
                    Some(&channel_id),
                );
                bridge.end_call(&channel_id, EndReason::Error).await;
            }
            for channel_id in outcome.evicted {
                debug!(%channel_id, "evicted ended session");
            }
        }
    }

    // ─── Conversation flow ───────────────────────────────────

    async fn on_user_speech_started(&self, channel_id: &str) {
        let state = match self.sessions.state_of(channel_id) {
            Some(state) if !state.is_terminal() => state,
            _ => return,
        };
        let _ = self.sessions.with_session(channel_id, |session| {
            session.user_speaking = true;
        });
        debug!(%channel_id, ?state, "user speech started");

        match state {
            SessionState::GeneratingResponse | SessionState::PlayingResponse => {
                if self.config.policy.enable_interruption_handling {
                    self.handle_interruption(channel_id).await;
                } else {
                    debug!(%channel_id, "interruption handling disabled, letting response play");
                }
            }
            SessionState::Active | SessionState::WaitingForInput => {
                let _ = self.sessions.transition(
                    channel_id,
                    SessionState::ProcessingAudio,
                    Instant::now(),
                );
            }
            _ => {}
        }
    }

    async fn on_user_speech_stopped(
        &self,
        channel_id: &str,
        duration: Duration,
        buffered_bytes: usize,
    ) {
        let state = match self.sessions.state_of(channel_id) {
            Some(state) if !state.is_terminal() => state,
            _ => return,
        };
        let _ = self.sessions.with_session(channel_id, |session| {
            session.user_speaking = false;
        });
        if state != SessionState::ProcessingAudio {
            return;
        }
        if buffered_bytes == 0 {
            debug!(%channel_id, "speech stopped with no audio since last commit");
            let _ = self.sessions.transition(
                channel_id,
                SessionState::WaitingForInput,
                Instant::now(),
            );
            return;
        }

        info!(%channel_id, ?duration, "user turn complete, requesting response");
        self.sessions
            .record_user_turn(channel_id, duration, None)
            .ok();

        if let Err(e) = self.live.commit_input().await {
            warn!(%channel_id, "commit failed: {e}");
            self.emit_error(&e, Some(channel_id));
            return;
        }

        let response_id = Uuid::new_v4().to_string();
        self.active_responses
            .lock()
            .unwrap()
            .insert(response_id.clone(), channel_id.to_string());
        let now = Instant::now();
        let _ = self.sessions.with_session(channel_id, |session| {
            session.processing = true;
            session.current_response_id = Some(response_id.clone());
            session.response_requested_at = Some(now);
        });

        if let Err(e) = self.live.create_response(&response_id).await {
            warn!(%channel_id, "create_response failed: {e}");
            self.emit_error(&e, Some(channel_id));
            self.active_responses.lock().unwrap().remove(&response_id);
            return;
        }
        let _ = self
            .sessions
            .transition(channel_id, SessionState::GeneratingResponse, now);
    }

    /// User spoke over the assistant: cancel the response, drop queued
    /// playback, and go back to collecting the user's audio.
    async fn handle_interruption(&self, channel_id: &str) {
        let response_id = self
            .sessions
            .with_session(channel_id, |session| session.current_response_id.clone())
            .ok()
            .flatten();
        info!(%channel_id, ?response_id, "user interruption");

        if let Some(response_id) = &response_id {
            if let Err(e) = self.live.cancel_response(response_id).await {
                warn!(%channel_id, "cancel_response failed: {e}");
            }
            self.active_responses.lock().unwrap().remove(response_id);
        }
        self.media.clear_outbound(channel_id);

        let now = Instant::now();
        let _ = self.sessions.with_session(channel_id, |session| {
            session.metrics.interruptions += 1;
            session.current_response_id = None;
            session.assistant_speaking = false;
            session.processing = false;
        });
        if let Some(runtime) = self.runtimes.lock().unwrap().get_mut(channel_id) {
            runtime.response_audio_bytes = 0;
        }
        let _ = self
            .sessions
            .transition(channel_id, SessionState::ProcessingAudio, now);
    }

    async fn on_audio_delta(&self, response_id: Option<String>, audio: Vec<u8>) {
        let Some(channel_id) = self.resolve_response_channel(response_id.as_deref()) else {
            debug!("dropping audio delta with no owning channel");
            return;
        };

        // Deltas for a cancelled response are dropped, not played
        let current = self
            .sessions
            .with_session(&channel_id, |session| session.current_response_id.clone())
            .ok()
            .flatten();
        if let (Some(delta_id), Some(current_id)) = (response_id.as_deref(), current.as_deref()) {
            if delta_id != current_id {
                debug!(%channel_id, delta_id, "dropping stale audio delta");
                return;
            }
        } else if current.is_none() {
            debug!(%channel_id, "dropping audio delta, no current response");
            return;
        }

        let now = Instant::now();
        if self.sessions.state_of(&channel_id) == Some(SessionState::GeneratingResponse) {
            let latency = self
                .sessions
                .with_session(&channel_id, |session| {
                    session.assistant_speaking = true;
                    session.response_requested_at.take().map(|at| now - at)
                })
                .ok()
                .flatten();
            if let Some(latency) = latency {
                let _ = self.sessions.with_session(&channel_id, |session| {
                    session.metrics.record_latency(latency);
                });
            }
            let _ = self
                .sessions
                .transition(&channel_id, SessionState::PlayingResponse, now);
        }

        if let Err(e) = self.media.send_audio_to_channel(&channel_id, &audio) {
            debug!(%channel_id, "cannot play response audio: {e}");
            return;
        }
        self.metrics.frames_out.fetch_add(1, Ordering::Relaxed);
        if let Some(runtime) = self.runtimes.lock().unwrap().get_mut(&channel_id) {
            runtime.response_audio_bytes += audio.len() as u64;
        }
    }

    async fn on_audio_done(&self, response_id: Option<String>) {
        let Some(channel_id) = self.resolve_response_channel(response_id.as_deref()) else {
            return;
        };
        if let Some(response_id) = &response_id {
            self.active_responses.lock().unwrap().remove(response_id);
        }

        let audio_bytes = self
            .runtimes
            .lock()
            .unwrap()
            .get_mut(&channel_id)
            .map(|runtime| std::mem::take(&mut runtime.response_audio_bytes))
            .unwrap_or(0);
        let duration = Duration::from_secs_f64(
            audio_bytes as f64 / (self.config.audio.sample_rate as f64 * SAMPLE_WIDTH as f64),
        );
        info!(%channel_id, ?duration, "assistant turn complete");
        self.sessions
            .record_assistant_turn(&channel_id, duration)
            .ok();

        let now = Instant::now();
        let _ = self.sessions.with_session(&channel_id, |session| {
            session.assistant_speaking = false;
            session.processing = false;
            session.current_response_id = None;
        });
        if matches!(
            self.sessions.state_of(&channel_id),
            Some(SessionState::PlayingResponse) | Some(SessionState::GeneratingResponse)
        ) {
            let _ = self
                .sessions
                .transition(&channel_id, SessionState::WaitingForInput, now);
        }
    }

    async fn on_live_disconnected(&self) {
        warn!("Live API disconnected");
        let err = BridgeError::NetworkUnavailable("Live API disconnected".into());
        for channel_id in self.sessions.live_channels() {
            self.emit_error(&err, Some(&channel_id));
        }
        match self.config.policy.live_error_policy {
            LiveErrorPolicy::Terminate => {
                for channel_id in self.sessions.live_channels() {
                    self.end_call(&channel_id, EndReason::Error).await;
                }
            }
            LiveErrorPolicy::Keep => {
                info!("keeping sessions; awaiting external reconnect");
            }
        }
    }

    /// Which channel owns a response id; falls back to the focused channel
    /// for deltas without an id.
    fn resolve_response_channel(&self, response_id: Option<&str>) -> Option<String> {
        match response_id {
            Some(id) => self.active_responses.lock().unwrap().get(id).cloned(),
            None => self.focused_channel(),
        }
    }

    fn focused_channel(&self) -> Option<String> {
        self.live_focus.lock().unwrap().clone()
    }

    // ─── Teardown ────────────────────────────────────────────

    /// End a call and release everything attached to it. Idempotent.
    pub async fn end_call(&self, channel_id: &str, reason: EndReason) {
        let runtime = self.runtimes.lock().unwrap().remove(channel_id);
        let response_id = self
            .sessions
            .with_session(channel_id, |session| session.current_response_id.clone())
            .ok()
            .flatten();

        if let Some(response_id) = &response_id {
            let _ = self.live.cancel_response(response_id).await;
            self.active_responses.lock().unwrap().remove(response_id);
        }

        let summary = self.sessions.end_session(channel_id, reason, Instant::now());

        if let Some(runtime) = runtime {
            runtime.pipeline_task.abort();
            debug!(%channel_id, session_id = %runtime.session_id, "session runtime stopped");
        }
        self.media.close_channel(channel_id);

        {
            let mut focus = self.live_focus.lock().unwrap();
            if focus.as_deref() == Some(channel_id) {
                *focus = None;
            }
        }
        self.active_responses
            .lock()
            .unwrap()
            .retain(|_, ch| ch != channel_id);

        // The shared conversation ends with the last call
        if summary.is_some() && self.sessions.live_channels().is_empty() {
            self.live.end_conversation();
        }

        // Terminating for cause must also release the PBX leg
        if summary.is_some()
            && matches!(reason, EndReason::TimeoutExceeded | EndReason::Error)
        {
            if let Err(e) = self.rest.hangup(channel_id).await {
                self.metrics.rest_failures.fetch_add(1, Ordering::Relaxed);
                debug!(%channel_id, "hangup failed: {e}");
            }
        }
    }

    fn emit_error(&self, err: &BridgeError, channel_id: Option<&str>) {
        if !err.is_failure() {
            return;
        }
        let mut event = ErrorEvent::from_error(err);
        if let Some(channel_id) = channel_id {
            let session_id = self
                .sessions
                .with_session(channel_id, |session| session.session_id.clone())
                .ok();
            event = event.with_channel(channel_id);
            if let Some(session_id) = session_id {
                event = event.with_session(session_id);
            }
        }
        let _ = self.errors.send(event);
    }

    // ─── Status surface ──────────────────────────────────────

    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            is_running: self.is_running(),
            active_calls: self.sessions.stats().active_sessions,
            calls: self.sessions.live_channels(),
            session_stats: self.sessions.stats(),
            live_api: LiveApiStatus {
                connected: self.live.is_connected(),
                session: self.live.session_info(),
            },
            external_media: self.media.stats(),
            metrics: self.metrics.snapshot(),
            config: ConfigEcho {
                stasis_app: self.config.ari.stasis_app.clone(),
                external_media_host: self.config.external_media.host.clone(),
                external_media_port: self.config.external_media.port,
                audio_format: "slin16",
                sample_rate: self.config.audio.sample_rate,
            },
        }
    }

    pub fn call_info(&self, channel_id: &str) -> Option<CallInfo> {
        let session = self.sessions.summary(channel_id, Instant::now())?;
        Some(CallInfo {
            session,
            external_media: self.media.connection_info(channel_id),
        })
    }

    /// Local address of the external-media listener (useful when bound to
    /// an ephemeral port).
    pub fn media_addr(&self) -> std::net::SocketAddr {
        self.media.local_addr()
    }
}
