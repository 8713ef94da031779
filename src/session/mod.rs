//! Call sessions: per-call state machine, conversation turns, and metrics.

pub mod manager;

pub use manager::{SessionLifecycleEvent, SessionManager, SessionStats, SweepOutcome};

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};

/// Per-call state machine.
///
/// `Ended` is terminal; every transition is timestamped and transitions out
/// of `Ended` are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created on StasisStart, REST setup in flight
    Initializing,
    /// Channel answered and media leg requested
    Active,
    /// Waiting for caller audio
    WaitingForInput,
    /// Caller is speaking; audio streams to the Live API
    ProcessingAudio,
    /// Turn committed; the Live API is generating
    GeneratingResponse,
    /// Response audio is playing to the caller
    PlayingResponse,
    /// Terminal
    Ended,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
    System,
}

/// Why a session reached `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Hangup,
    TimeoutExceeded,
    Error,
    Shutdown,
}

/// One contiguous contribution by a speaker.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub id: String,
    pub speaker: Speaker,
    #[serde(flatten)]
    pub payload: TurnPayload,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "content_type", rename_all = "snake_case")]
pub enum TurnPayload {
    Audio { duration_ms: u64 },
    Text { content: String },
}

/// Counters kept per session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionMetrics {
    pub user_turns: u32,
    pub assistant_turns: u32,
    pub total_audio_secs: f64,
    pub interruptions: u32,
    /// Mean time from input commit to first response audio, in milliseconds
    pub mean_response_latency_ms: Option<u64>,
    #[serde(skip)]
    latency_total: Duration,
    #[serde(skip)]
    latency_samples: u32,
}

impl SessionMetrics {
    pub fn record_latency(&mut self, latency: Duration) {
        self.latency_total += latency;
        self.latency_samples += 1;
        self.mean_response_latency_ms =
            Some((self.latency_total / self.latency_samples).as_millis() as u64);
    }

    pub fn total_turns(&self) -> u32 {
        self.user_turns + self.assistant_turns
    }
}

/// One active (or recently ended) call.
#[derive(Debug)]
pub struct CallSession {
    pub session_id: String,
    pub channel_id: String,
    pub caller_number: String,
    pub called_number: String,
    pub direction: CallDirection,
    pub state: SessionState,
    /// Raw channel state as reported by ChannelStateChange
    pub channel_state: Option<String>,
    pub created_at: DateTime<Utc>,
    started: Instant,
    pub last_activity: Instant,
    pub user_speaking: bool,
    pub assistant_speaking: bool,
    pub processing: bool,
    pub current_response_id: Option<String>,
    pub turns: Vec<ConversationTurn>,
    pub metrics: SessionMetrics,
    pub end_reason: Option<EndReason>,
    /// Whether the external-media leg ever connected
    pub media_connected: bool,
    /// Commit time of the turn awaiting its first audio delta
    pub response_requested_at: Option<Instant>,
    state_history: Vec<(SessionState, Instant)>,
    ended_at: Option<Instant>,
}

impl CallSession {
    pub fn new(
        channel_id: impl Into<String>,
        caller_number: impl Into<String>,
        called_number: impl Into<String>,
        direction: CallDirection,
        now: Instant,
    ) -> Self {
        let state = SessionState::Initializing;
        Self {
            session_id: Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            caller_number: caller_number.into(),
            called_number: called_number.into(),
            direction,
            state,
            channel_state: None,
            created_at: Utc::now(),
            started: now,
            last_activity: now,
            user_speaking: false,
            assistant_speaking: false,
            processing: false,
            current_response_id: None,
            turns: Vec::new(),
            metrics: SessionMetrics::default(),
            end_reason: None,
            media_connected: false,
            response_requested_at: None,
            state_history: vec![(state, now)],
            ended_at: None,
        }
    }

    /// Move to `new_state`, recording the transition timestamp.
    pub fn transition(&mut self, new_state: SessionState, now: Instant) -> BridgeResult<()> {
        if self.state.is_terminal() {
            return Err(BridgeError::Internal(format!(
                "session {} is ended; cannot transition to {new_state:?}",
                self.session_id
            )));
        }
        if self.state == new_state {
            return Ok(());
        }
        self.state = new_state;
        self.state_history.push((new_state, now));
        self.last_activity = now;
        if new_state == SessionState::Ended {
            self.ended_at = Some(now);
        }
        Ok(())
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.started)
    }

    pub fn ended_for(&self, now: Instant) -> Option<Duration> {
        self.ended_at.map(|at| now.duration_since(at))
    }

    /// Timestamped transition history, oldest first.
    pub fn state_history(&self) -> &[(SessionState, Instant)] {
        &self.state_history
    }

    pub fn record_turn(&mut self, speaker: Speaker, payload: TurnPayload, confidence: Option<f32>) {
        if let TurnPayload::Audio { duration_ms } = payload {
            self.metrics.total_audio_secs += duration_ms as f64 / 1000.0;
        }
        match speaker {
            Speaker::User => self.metrics.user_turns += 1,
            Speaker::Assistant => self.metrics.assistant_turns += 1,
            Speaker::System => {}
        }
        self.turns.push(ConversationTurn {
            id: Uuid::new_v4().to_string(),
            speaker,
            payload,
            started_at: Utc::now(),
            confidence,
        });
    }

    pub fn summary(&self, now: Instant) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            channel_id: self.channel_id.clone(),
            caller_number: self.caller_number.clone(),
            called_number: self.called_number.clone(),
            direction: self.direction,
            state: self.state,
            channel_state: self.channel_state.clone(),
            created_at: self.created_at,
            duration_secs: self.age(now).as_secs_f64(),
            end_reason: self.end_reason,
            total_turns: self.metrics.total_turns(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Serializable view of a session for status endpoints and lifecycle events.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub channel_id: String,
    pub caller_number: String,
    pub called_number: String,
    pub direction: CallDirection,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub duration_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    pub total_turns: u32,
    pub metrics: SessionMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> CallSession {
        CallSession::new("ch-1", "+15551234", "1000", CallDirection::Inbound, Instant::now())
    }

    #[test]
    fn test_initial_state() {
        let s = session();
        assert_eq!(s.state, SessionState::Initializing);
        assert!(s.end_reason.is_none());
        assert!(!s.session_id.is_empty());
    }

    #[test]
    fn test_transitions_record_history() {
        let mut s = session();
        let now = Instant::now();
        s.transition(SessionState::Active, now).unwrap();
        s.transition(SessionState::WaitingForInput, now).unwrap();
        assert_eq!(s.state, SessionState::WaitingForInput);
        assert_eq!(s.state_history().len(), 3);
    }

    #[test]
    fn test_no_transition_out_of_ended() {
        let mut s = session();
        let now = Instant::now();
        s.transition(SessionState::Ended, now).unwrap();
        let err = s.transition(SessionState::Active, now).unwrap_err();
        assert!(matches!(err, BridgeError::Internal(_)));
        assert_eq!(s.state, SessionState::Ended);
    }

    #[test]
    fn test_self_transition_is_noop() {
        let mut s = session();
        let now = Instant::now();
        s.transition(SessionState::Active, now).unwrap();
        s.transition(SessionState::Active, now).unwrap();
        assert_eq!(s.state_history().len(), 2);
    }

    #[test]
    fn test_turn_recording_updates_metrics() {
        let mut s = session();
        s.record_turn(
            Speaker::User,
            TurnPayload::Audio { duration_ms: 1500 },
            Some(0.9),
        );
        s.record_turn(
            Speaker::Assistant,
            TurnPayload::Audio { duration_ms: 2000 },
            None,
        );
        assert_eq!(s.metrics.user_turns, 1);
        assert_eq!(s.metrics.assistant_turns, 1);
        assert!((s.metrics.total_audio_secs - 3.5).abs() < 1e-9);
        assert_eq!(s.turns.len(), 2);
    }

    #[test]
    fn test_latency_mean() {
        let mut m = SessionMetrics::default();
        m.record_latency(Duration::from_millis(100));
        m.record_latency(Duration::from_millis(300));
        assert_eq!(m.mean_response_latency_ms, Some(200));
    }
}
