//! Error types for the voice bridge
//!
//! Library code returns [`BridgeError`]; the binary edge wraps it in
//! `anyhow`. Observers (metrics, tests) receive structured [`ErrorEvent`]s
//! on the dispatcher's error channel rather than parsing log lines.

use serde::Serialize;
use thiserror::Error;

/// Sub-classification of Live-API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveApiErrorKind {
    /// Server asked us to slow down; outbound ops pause for the indicated duration.
    RateLimit,
    /// Account quota exhausted.
    Quota,
    /// Model-side generation failure.
    Model,
}

/// All error kinds produced by the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid audio format: {0}")]
    AudioFormatInvalid(String),

    #[error("live api error ({kind:?}): [{code}] {message}")]
    LiveApi {
        kind: LiveApiErrorKind,
        code: String,
        message: String,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("timeout exceeded: {0}")]
    TimeoutExceeded(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Cancellation is cooperative shutdown, never a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, BridgeError::Cancelled)
    }

    /// Stable kind tag for structured error events.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::ConfigInvalid(_) => "config_invalid",
            BridgeError::NetworkUnavailable(_) => "network_unavailable",
            BridgeError::ProtocolViolation(_) => "protocol_violation",
            BridgeError::AudioFormatInvalid(_) => "audio_format_invalid",
            BridgeError::LiveApi { kind, .. } => match kind {
                LiveApiErrorKind::RateLimit => "live_api_rate_limit",
                LiveApiErrorKind::Quota => "live_api_quota",
                LiveApiErrorKind::Model => "live_api_model",
            },
            BridgeError::SessionNotFound(_) => "session_not_found",
            BridgeError::TimeoutExceeded(_) => "timeout_exceeded",
            BridgeError::Cancelled => "cancelled",
            BridgeError::Internal(_) => "internal",
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Structured error surfaced to internal observers.
///
/// The only external surface is the PBX (a failed session manifests as a
/// hangup); everything else sees these events.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub kind: String,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

impl ErrorEvent {
    pub fn from_error(err: &BridgeError) -> Self {
        let code = match err {
            BridgeError::LiveApi { code, .. } => code.clone(),
            other => other.kind().to_string(),
        };
        Self {
            kind: err.kind().to_string(),
            code,
            message: err.to_string(),
            session_id: None,
            channel_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }
}
