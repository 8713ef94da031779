//! Session manager: exclusive owner of the active-session map.
//!
//! Everything else holds channel ids and calls back through these methods;
//! no component keeps a reference into a session. Lifecycle transitions fan
//! out on a broadcast channel for observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, BridgeResult};

use super::{
    CallDirection, CallSession, EndReason, SessionState, SessionSummary, Speaker, TurnPayload,
};

#[derive(Debug, Clone)]
pub enum SessionLifecycleEvent {
    Created {
        session_id: String,
        channel_id: String,
    },
    Ended {
        summary: SessionSummary,
    },
}

/// Aggregate counters for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub total_created: u64,
    pub total_ended: u64,
}

/// What the periodic sweep found.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Channels past `max_call_duration`
    pub timed_out: Vec<String>,
    /// Channels whose media leg never arrived within the wait window
    pub media_overdue: Vec<String>,
    /// Ended sessions evicted from the map
    pub evicted: Vec<String>,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, CallSession>>,
    lifecycle: broadcast::Sender<SessionLifecycleEvent>,
    total_created: AtomicU64,
    total_ended: AtomicU64,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        let (lifecycle, _) = broadcast::channel(64);
        Self {
            sessions: Mutex::new(HashMap::new()),
            lifecycle,
            total_created: AtomicU64::new(0),
            total_ended: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionLifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Create a session for a channel. At most one session exists per
    /// channel id: any live predecessor is ended first.
    pub fn create_session(
        &self,
        channel_id: &str,
        caller_number: &str,
        called_number: &str,
        direction: CallDirection,
        now: Instant,
    ) -> String {
        if let Some(summary) = self.end_session(channel_id, EndReason::Hangup, now) {
            warn!(
                %channel_id,
                old_session = %summary.session_id,
                "replacing existing session for channel"
            );
        }
        let session = CallSession::new(channel_id, caller_number, called_number, direction, now);
        let session_id = session.session_id.clone();
        self.sessions
            .lock()
            .unwrap()
            .insert(channel_id.to_string(), session);
        self.total_created.fetch_add(1, Ordering::Relaxed);
        info!(%channel_id, %session_id, "session created");
        let _ = self.lifecycle.send(SessionLifecycleEvent::Created {
            session_id: session_id.clone(),
            channel_id: channel_id.to_string(),
        });
        session_id
    }

    /// End a session, recording the reason. Idempotent: ending an unknown or
    /// already-ended session returns `None`.
    pub fn end_session(
        &self,
        channel_id: &str,
        reason: EndReason,
        now: Instant,
    ) -> Option<SessionSummary> {
        let summary = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions.get_mut(channel_id)?;
            if session.state.is_terminal() {
                return None;
            }
            session.end_reason = Some(reason);
            session.current_response_id = None;
            session.user_speaking = false;
            session.assistant_speaking = false;
            session.processing = false;
            // Ending a live session cannot fail: the state is not terminal
            let _ = session.transition(SessionState::Ended, now);
            session.summary(now)
        };
        self.total_ended.fetch_add(1, Ordering::Relaxed);
        info!(
            %channel_id,
            session_id = %summary.session_id,
            ?reason,
            turns = summary.total_turns,
            "session ended"
        );
        let _ = self.lifecycle.send(SessionLifecycleEvent::Ended {
            summary: summary.clone(),
        });
        Some(summary)
    }

    /// Run `f` against the session for `channel_id`.
    pub fn with_session<R>(
        &self,
        channel_id: &str,
        f: impl FnOnce(&mut CallSession) -> R,
    ) -> BridgeResult<R> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(channel_id)
            .ok_or_else(|| BridgeError::SessionNotFound(channel_id.to_string()))?;
        Ok(f(session))
    }

    pub fn transition(
        &self,
        channel_id: &str,
        new_state: SessionState,
        now: Instant,
    ) -> BridgeResult<()> {
        self.with_session(channel_id, |session| {
            debug!(%channel_id, from = ?session.state, to = ?new_state, "state transition");
            session.transition(new_state, now)
        })?
    }

    pub fn state_of(&self, channel_id: &str) -> Option<SessionState> {
        self.sessions
            .lock()
            .unwrap()
            .get(channel_id)
            .map(|s| s.state)
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(channel_id)
    }

    /// Channel ids of sessions not yet ended.
    pub fn live_channels(&self) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| !s.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn record_user_turn(
        &self,
        channel_id: &str,
        duration: Duration,
        confidence: Option<f32>,
    ) -> BridgeResult<()> {
        self.with_session(channel_id, |session| {
            session.record_turn(
                Speaker::User,
                TurnPayload::Audio {
                    duration_ms: duration.as_millis() as u64,
                },
                confidence,
            );
        })
    }

    pub fn record_assistant_turn(&self, channel_id: &str, duration: Duration) -> BridgeResult<()> {
        self.with_session(channel_id, |session| {
            session.record_turn(
                Speaker::Assistant,
                TurnPayload::Audio {
                    duration_ms: duration.as_millis() as u64,
                },
                None,
            );
        })
    }

    pub fn summary(&self, channel_id: &str, now: Instant) -> Option<SessionSummary> {
        self.sessions
            .lock()
            .unwrap()
            .get(channel_id)
            .map(|s| s.summary(now))
    }

    pub fn all_summaries(&self, now: Instant) -> Vec<SessionSummary> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .map(|s| s.summary(now))
            .collect()
    }

    pub fn stats(&self) -> SessionStats {
        let active = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| !s.state.is_terminal())
            .count();
        SessionStats {
            active_sessions: active,
            total_created: self.total_created.load(Ordering::Relaxed),
            total_ended: self.total_ended.load(Ordering::Relaxed),
        }
    }

    /// Periodic sweep: find calls past their deadline, calls whose media leg
    /// never arrived, and evict ended sessions past the retention window.
    ///
    /// The caller (the dispatcher) performs the actual teardown for the
    /// returned channels so hangup and media cleanup go through one path.
    pub fn sweep(
        &self,
        now: Instant,
        max_call_duration: Duration,
        media_wait: Duration,
        ended_retention: Duration,
    ) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut sessions = self.sessions.lock().unwrap();

        for (channel_id, session) in sessions.iter() {
            if session.state.is_terminal() {
                continue;
            }
            if session.age(now) > max_call_duration {
                outcome.timed_out.push(channel_id.clone());
            } else if !session.media_connected && session.age(now) > media_wait {
                outcome.media_overdue.push(channel_id.clone());
            }
        }

        sessions.retain(|channel_id, session| {
            let evict = session
                .ended_for(now)
                .map(|for_time| for_time > ended_retention)
                .unwrap_or(false);
            if evict {
                outcome.evicted.push(channel_id.clone());
            }
            !evict
        });

        outcome
    }
}
