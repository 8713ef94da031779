//! ARI event model.
//!
//! Events arrive as JSON objects tagged by `type`. The four call-lifecycle
//! types the dispatcher acts on are modeled as a tagged enum; everything
//! else parses to [`ParsedAriEvent::Unrecognized`] so new PBX event types
//! never break ingestion. A payload that names a known type but fails to
//! deserialize is a real protocol violation and is reported as such.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AriEvent {
    /// A call entered the Stasis application
    StasisStart {
        #[serde(default)]
        application: Option<String>,
        #[serde(default)]
        timestamp: Option<String>,
        channel: AriChannel,
    },
    /// The call left the application
    StasisEnd {
        #[serde(default)]
        timestamp: Option<String>,
        channel: AriChannel,
    },
    ChannelStateChange {
        #[serde(default)]
        timestamp: Option<String>,
        channel: AriChannel,
    },
    ChannelHangupRequest {
        #[serde(default)]
        timestamp: Option<String>,
        #[serde(default)]
        cause: Option<i64>,
        channel: AriChannel,
    },
}

const KNOWN_EVENT_TYPES: &[&str] = &[
    "StasisStart",
    "StasisEnd",
    "ChannelStateChange",
    "ChannelHangupRequest",
];

#[derive(Debug, Clone, Deserialize)]
pub struct AriChannel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub caller: Option<CallerInfo>,
    #[serde(default)]
    pub dialplan: Option<DialplanInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallerInfo {
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DialplanInfo {
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub exten: Option<String>,
}

impl AriChannel {
    pub fn caller_number(&self) -> String {
        self.caller
            .as_ref()
            .and_then(|c| c.number.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn called_number(&self) -> String {
        self.dialplan
            .as_ref()
            .and_then(|d| d.exten.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

/// Outcome of parsing one inbound event object.
#[derive(Debug, Clone)]
pub enum ParsedAriEvent {
    Recognized(AriEvent),
    /// Valid event of a type the dispatcher does not act on
    Unrecognized(String),
}

/// Parse an ARI event object.
pub fn parse_ari_event(value: Value) -> BridgeResult<ParsedAriEvent> {
    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::ProtocolViolation("ARI event without type".into()))?
        .to_string();

    if !KNOWN_EVENT_TYPES.contains(&event_type.as_str()) {
        return Ok(ParsedAriEvent::Unrecognized(event_type));
    }

    serde_json::from_value(value)
        .map(ParsedAriEvent::Recognized)
        .map_err(|e| BridgeError::ProtocolViolation(format!("malformed {event_type}: {e}")))
}
