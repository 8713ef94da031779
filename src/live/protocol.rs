//! Live API wire protocol.
//!
//! Text frames carry JSON objects tagged by `type`. Audio travels
//! base64-encoded inside `input_audio_buffer.append` (caller → API) and
//! `response.audio.delta` (API → caller). Unknown inbound types are
//! surfaced as [`ServerMessage::Unknown`] so the demux loop can log and
//! ignore them without breaking on protocol additions.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LiveApiConfig;
use crate::error::{BridgeError, BridgeResult};

// ─── Caller → API ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "setup")]
    Setup { setup: SetupPayload },
    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { input_audio_buffer: AudioPayload },
    #[serde(rename = "input_audio_buffer.commit")]
    CommitInput,
    #[serde(rename = "input_audio_buffer.clear")]
    ClearInput,
    #[serde(rename = "response.create")]
    CreateResponse { response: ResponseRef },
    #[serde(rename = "response.cancel")]
    CancelResponse { response: ResponseRef },
}

impl ClientEvent {
    pub fn append_audio(audio: &[u8]) -> Self {
        ClientEvent::AppendAudio {
            input_audio_buffer: AudioPayload {
                audio: BASE64.encode(audio),
            },
        }
    }

    pub fn create_response(id: impl Into<String>) -> Self {
        ClientEvent::CreateResponse {
            response: ResponseRef { id: id.into() },
        }
    }

    pub fn cancel_response(id: impl Into<String>) -> Self {
        ClientEvent::CancelResponse {
            response: ResponseRef { id: id.into() },
        }
    }

    /// Setup envelope declaring model, voice, audio formats, system
    /// instruction, turn detection, and tool config.
    pub fn setup(config: &LiveApiConfig) -> Self {
        ClientEvent::Setup {
            setup: SetupPayload {
                model: config.model.clone(),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: config.voice.clone(),
                            },
                        },
                    },
                },
                system_instruction: SystemInstruction {
                    parts: vec![TextPart {
                        text: config.system_instruction.clone(),
                    }],
                },
                tools: Vec::new(),
                tool_config: ToolConfig {
                    function_calling_config: FunctionCallingConfig {
                        mode: "AUTO".to_string(),
                    },
                },
                turn_detection: TurnDetection::default(),
                input_audio_config: AudioIoConfig::pcm16(),
                output_audio_config: AudioIoConfig::pcm16(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: SystemInstruction,
    pub tools: Vec<Value>,
    pub tool_config: ToolConfig,
    pub turn_detection: TurnDetection,
    pub input_audio_config: AudioIoConfig,
    pub output_audio_config: AudioIoConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolConfig {
    pub function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionCallingConfig {
    pub mode: String,
}

/// Server-side VAD parameters for the setup envelope.
#[derive(Debug, Clone, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioIoConfig {
    pub encoding: String,
    pub sample_rate_hertz: u32,
}

impl AudioIoConfig {
    pub fn pcm16() -> Self {
        Self {
            encoding: "pcm16".to_string(),
            sample_rate_hertz: 16000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioPayload {
    /// base64-encoded slin16 bytes
    pub audio: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRef {
    pub id: String,
}

// ─── API → caller ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "setup_complete")]
    SetupComplete,
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: Option<SessionInfoPayload>,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "input_audio_buffer.committed")]
    InputCommitted,
    #[serde(rename = "input_audio_buffer.cleared")]
    InputCleared,
    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseRef },
    #[serde(rename = "response.audio.delta")]
    AudioDelta { response: ResponsePayload },
    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response: Option<ResponseIdPayload>,
    },
    #[serde(rename = "response.text.delta")]
    TextDelta { response: ResponsePayload },
    #[serde(rename = "response.text.done")]
    TextDone {
        #[serde(default)]
        response: Option<ResponsePayload>,
    },
    #[serde(rename = "error")]
    Error { error: ErrorPayload },
}

/// Tag strings of all [`ServerEvent`] variants; a payload that names one of
/// these but fails to deserialize is a protocol violation, not a benign
/// unknown.
const KNOWN_SERVER_TYPES: &[&str] = &[
    "setup_complete",
    "session.created",
    "input_audio_buffer.speech_started",
    "input_audio_buffer.speech_stopped",
    "input_audio_buffer.committed",
    "input_audio_buffer.cleared",
    "response.created",
    "response.audio.delta",
    "response.audio.done",
    "response.text.delta",
    "response.text.done",
    "error",
];

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfoPayload {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseIdPayload {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponsePayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub output: OutputPayload,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputPayload {
    /// base64 audio in `response.audio.delta`
    #[serde(default)]
    pub audio: Option<String>,
    /// transcript text in `response.text.*`
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPayload {
    #[serde(default = "default_error_code")]
    pub code: String,
    #[serde(default)]
    pub message: String,
    /// Pause hint accompanying rate-limit errors
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}

fn default_error_code() -> String {
    "unknown".to_string()
}

impl ResponsePayload {
    /// Decode the base64 audio payload, if present.
    pub fn decode_audio(&self) -> BridgeResult<Vec<u8>> {
        let encoded = self
            .output
            .audio
            .as_deref()
            .ok_or_else(|| BridgeError::ProtocolViolation("audio delta without audio".into()))?;
        BASE64
            .decode(encoded)
            .map_err(|e| BridgeError::ProtocolViolation(format!("bad base64 audio: {e}")))
    }
}

/// A parsed inbound message: a recognized event or a forward-compatible
/// unknown.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Event(ServerEvent),
    Unknown(String),
}

/// Parse one inbound text frame.
pub fn parse_server_message(text: &str) -> BridgeResult<ServerMessage> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| BridgeError::ProtocolViolation(format!("invalid JSON: {e}")))?;
    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::ProtocolViolation("message without type".into()))?
        .to_string();

    if !KNOWN_SERVER_TYPES.contains(&event_type.as_str()) {
        return Ok(ServerMessage::Unknown(event_type));
    }

    serde_json::from_value(value)
        .map(ServerMessage::Event)
        .map_err(|e| BridgeError::ProtocolViolation(format!("malformed {event_type}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_audio_encodes_base64() {
        let event = ClientEvent::append_audio(&[0x01, 0x02, 0x03]);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "input_audio_buffer.append");
        assert_eq!(json["input_audio_buffer"]["audio"], "AQID");
    }

    #[test]
    fn test_unit_ops_serialize_to_bare_type() {
        let json = serde_json::to_value(ClientEvent::CommitInput).unwrap();
        assert_eq!(json, serde_json::json!({"type": "input_audio_buffer.commit"}));
    }

    #[test]
    fn test_setup_envelope_shape() {
        let config = LiveApiConfig {
            model: "live-voice-1".into(),
            voice: "Puck".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(ClientEvent::setup(&config)).unwrap();
        assert_eq!(json["type"], "setup");
        assert_eq!(json["setup"]["model"], "live-voice-1");
        assert_eq!(
            json["setup"]["generation_config"]["speech_config"]["voice_config"]
                ["prebuilt_voice_config"]["voice_name"],
            "Puck"
        );
        assert_eq!(json["setup"]["turn_detection"]["type"], "server_vad");
        assert_eq!(json["setup"]["input_audio_config"]["encoding"], "pcm16");
        assert_eq!(json["setup"]["output_audio_config"]["sample_rate_hertz"], 16000);
    }

    #[test]
    fn test_parse_audio_delta() {
        let text = r#"{"type":"response.audio.delta","response":{"id":"r1","output":{"audio":"AAAA"}}}"#;
        match parse_server_message(text).unwrap() {
            ServerMessage::Event(ServerEvent::AudioDelta { response }) => {
                assert_eq!(response.id.as_deref(), Some("r1"));
                assert_eq!(response.decode_audio().unwrap(), vec![0, 0, 0]);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_event() {
        let text = r#"{"type":"error","error":{"code":"rate_limit_exceeded","message":"slow down","retry_after_ms":250}}"#;
        match parse_server_message(text).unwrap() {
            ServerMessage::Event(ServerEvent::Error { error }) => {
                assert_eq!(error.code, "rate_limit_exceeded");
                assert_eq!(error.retry_after_ms, Some(250));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_forward_compatible() {
        let text = r#"{"type":"response.function_call.delta","whatever":1}"#;
        match parse_server_message(text).unwrap() {
            ServerMessage::Unknown(t) => assert_eq!(t, "response.function_call.delta"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_missing_type_is_violation() {
        assert!(parse_server_message(r#"{"foo":1}"#).is_err());
        assert!(parse_server_message("not json").is_err());
    }

    #[test]
    fn test_malformed_known_type_is_violation() {
        // response.created requires a response object
        assert!(parse_server_message(r#"{"type":"response.created"}"#).is_err());
    }
}
