//! Configuration management
//!
//! Loads bridge configuration from a TOML file with environment-variable
//! overrides for deployment settings (ARI credentials, Live API key, bind
//! addresses). Every field has a default, so a minimal config file (or none
//! at all, plus a handful of environment variables) is enough to start.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BridgeError, BridgeResult};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// ARI REST + Stasis application settings
    #[serde(default)]
    pub ari: AriConfig,
    /// External-media WebSocket listener settings
    #[serde(default)]
    pub external_media: ExternalMediaConfig,
    /// Control API bind settings
    #[serde(default)]
    pub http: HttpConfig,
    /// Audio pipeline shape
    #[serde(default)]
    pub audio: AudioSettings,
    /// Voice-activity-detection tuning
    #[serde(default)]
    pub vad: VadSettings,
    /// Live API credentials and identity
    #[serde(default)]
    pub live_api: LiveApiConfig,
    /// Call policy knobs
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AriConfig {
    /// Base URL of the PBX's ARI REST interface
    #[serde(default = "default_ari_base_url")]
    pub base_url: String,
    #[serde(default = "default_ari_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Stasis application name routed via the PBX dialplan
    #[serde(default = "default_stasis_app")]
    pub stasis_app: String,
    /// Per-REST-call timeout
    #[serde(default = "default_rest_timeout_s")]
    pub rest_timeout_s: u64,
}

fn default_ari_base_url() -> String {
    "http://localhost:8088/ari".to_string()
}

fn default_ari_username() -> String {
    "asterisk".to_string()
}

fn default_stasis_app() -> String {
    "voice-bridge".to_string()
}

fn default_rest_timeout_s() -> u64 {
    10
}

impl Default for AriConfig {
    fn default() -> Self {
        Self {
            base_url: default_ari_base_url(),
            username: default_ari_username(),
            password: String::new(),
            stasis_app: default_stasis_app(),
            rest_timeout_s: default_rest_timeout_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalMediaConfig {
    /// Host the PBX connects to for the media leg
    #[serde(default = "default_media_host")]
    pub host: String,
    #[serde(default = "default_media_port")]
    pub port: u16,
}

fn default_media_host() -> String {
    "127.0.0.1".to_string()
}

fn default_media_port() -> u16 {
    8090
}

impl Default for ExternalMediaConfig {
    fn default() -> Self {
        Self {
            host: default_media_host(),
            port: default_media_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_media_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_port() -> u16 {
    8000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_media_host(),
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Sample rate in Hz; the whole pipeline speaks slin16 at 16 kHz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Frame size in samples (20 ms at 16 kHz)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Per-session buffer capacity in samples (100 ms)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_chunk_size() -> usize {
    320
}

fn default_buffer_size() -> usize {
    1600
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            chunk_size: default_chunk_size(),
            buffer_size: default_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VadSettings {
    /// RMS energy a frame must exceed to count as speech
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold: f32,
    /// RMS floor below which frames are always treated as noise
    #[serde(default = "default_noise_floor")]
    pub noise_floor: f32,
    /// Seconds of sustained speech before `speech_started`
    #[serde(default = "default_speech_hold_s")]
    pub speech_hold_s: f64,
    /// Seconds of sustained silence before `speech_stopped`
    #[serde(default = "default_silence_hold_s")]
    pub silence_hold_s: f64,
}

fn default_energy_threshold() -> f32 {
    4000.0
}

fn default_noise_floor() -> f32 {
    2000.0
}

fn default_speech_hold_s() -> f64 {
    0.02
}

fn default_silence_hold_s() -> f64 {
    0.5
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            energy_threshold: default_energy_threshold(),
            noise_floor: default_noise_floor(),
            speech_hold_s: default_speech_hold_s(),
            silence_hold_s: default_silence_hold_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveApiConfig {
    /// API key; usually supplied via `LIVE_API_KEY`
    #[serde(default)]
    pub api_key: String,
    /// Endpoint host, e.g. `generativelanguage.googleapis.com`
    #[serde(default = "default_live_host")]
    pub host: String,
    /// Endpoint path under the host
    #[serde(default = "default_live_path")]
    pub path: String,
    /// Use `ws://` instead of `wss://` (local mock endpoints)
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "default_live_model")]
    pub model: String,
    #[serde(default = "default_live_voice")]
    pub voice: String,
    /// System instruction sent in the setup envelope
    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,
    /// WebSocket ping cadence
    #[serde(default = "default_ping_interval_s")]
    pub ping_interval_s: u64,
    /// Grace period past the cadence before the peer counts as dead
    #[serde(default = "default_ping_timeout_s")]
    pub ping_timeout_s: u64,
}

fn default_live_host() -> String {
    "generativelanguage.googleapis.com".to_string()
}

fn default_live_path() -> String {
    "ws/live".to_string()
}

fn default_live_model() -> String {
    "live-voice-1".to_string()
}

fn default_live_voice() -> String {
    "Puck".to_string()
}

fn default_system_instruction() -> String {
    "You are a helpful voice assistant on a phone call. Respond naturally and \
     conversationally. Keep responses concise but helpful."
        .to_string()
}

fn default_ping_interval_s() -> u64 {
    30
}

fn default_ping_timeout_s() -> u64 {
    10
}

impl Default for LiveApiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            host: default_live_host(),
            path: default_live_path(),
            insecure: false,
            model: default_live_model(),
            voice: default_live_voice(),
            system_instruction: default_system_instruction(),
            ping_interval_s: default_ping_interval_s(),
            ping_timeout_s: default_ping_timeout_s(),
        }
    }
}

impl LiveApiConfig {
    /// Full WebSocket URL including the key query parameter.
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.insecure { "ws" } else { "wss" };
        format!(
            "{}://{}/{}?key={}",
            scheme,
            self.host,
            self.path.trim_start_matches('/'),
            self.api_key
        )
    }
}

/// Which side detects end of user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetectionMode {
    /// Local energy VAD commits the buffer and requests the response
    Client,
    /// The Live API's server-side VAD events drive the turn
    Server,
}

/// What to do with a session when the Live API connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveErrorPolicy {
    /// End the session and hang up the channel
    Terminate,
    /// Keep the session; an external supervisor may reconnect
    Keep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Answer inbound calls automatically on StasisStart
    #[serde(default = "default_true")]
    pub auto_answer_calls: bool,
    /// Hard ceiling on call duration
    #[serde(default = "default_max_call_duration_s")]
    pub max_call_duration_s: u64,
    /// Cancel the assistant's response when the caller talks over it
    #[serde(default = "default_true")]
    pub enable_interruption_handling: bool,
    #[serde(default = "default_turn_detection")]
    pub turn_detection: TurnDetectionMode,
    #[serde(default = "default_live_error_policy")]
    pub live_error_policy: LiveErrorPolicy,
    /// Seconds to wait for the external-media leg before giving up on a call
    #[serde(default = "default_media_wait_timeout_s")]
    pub media_wait_timeout_s: u64,
    /// Seconds an ended session is retained for stats before eviction
    #[serde(default = "default_ended_retention_s")]
    pub ended_retention_s: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_call_duration_s() -> u64 {
    3600
}

fn default_turn_detection() -> TurnDetectionMode {
    TurnDetectionMode::Client
}

fn default_live_error_policy() -> LiveErrorPolicy {
    LiveErrorPolicy::Terminate
}

fn default_media_wait_timeout_s() -> u64 {
    10
}

fn default_ended_retention_s() -> u64 {
    60
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            auto_answer_calls: true,
            max_call_duration_s: default_max_call_duration_s(),
            enable_interruption_handling: true,
            turn_detection: default_turn_detection(),
            live_error_policy: default_live_error_policy(),
            media_wait_timeout_s: default_media_wait_timeout_s(),
            ended_retention_s: default_ended_retention_s(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ari: AriConfig::default(),
            external_media: ExternalMediaConfig::default(),
            http: HttpConfig::default(),
            audio: AudioSettings::default(),
            vad: VadSettings::default(),
            live_api: LiveApiConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                toml::from_str(&contents).context("Failed to parse config file")?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables take precedence over file values so deployments
    /// can keep credentials out of the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ARI_BASE_URL") {
            self.ari.base_url = v;
        }
        if let Ok(v) = std::env::var("ARI_USERNAME") {
            self.ari.username = v;
        }
        if let Ok(v) = std::env::var("ARI_PASSWORD") {
            self.ari.password = v;
        }
        if let Ok(v) = std::env::var("STASIS_APP") {
            self.ari.stasis_app = v;
        }
        if let Ok(v) = std::env::var("EXTERNAL_MEDIA_HOST") {
            self.external_media.host = v;
        }
        if let Ok(v) = std::env::var("EXTERNAL_MEDIA_PORT") {
            if let Ok(port) = v.parse() {
                self.external_media.port = port;
            }
        }
        if let Ok(v) = std::env::var("LIVE_API_KEY") {
            self.live_api.api_key = v;
        }
        if let Ok(v) = std::env::var("LIVE_API_MODEL") {
            self.live_api.model = v;
        }
        if let Ok(v) = std::env::var("LIVE_API_VOICE") {
            self.live_api.voice = v;
        }
    }

    /// Validate the shape the rest of the system assumes.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.ari.base_url.is_empty() {
            return Err(BridgeError::ConfigInvalid("ari.base_url is empty".into()));
        }
        url::Url::parse(&self.ari.base_url)
            .map_err(|e| BridgeError::ConfigInvalid(format!("ari.base_url: {e}")))?;
        if self.live_api.api_key.is_empty() {
            return Err(BridgeError::ConfigInvalid(
                "live_api.api_key is empty (set LIVE_API_KEY)".into(),
            ));
        }
        if self.audio.sample_rate != 16000 {
            return Err(BridgeError::ConfigInvalid(format!(
                "audio.sample_rate must be 16000 for slin16, got {}",
                self.audio.sample_rate
            )));
        }
        if self.audio.chunk_size == 0 || self.audio.buffer_size < self.audio.chunk_size {
            return Err(BridgeError::ConfigInvalid(
                "audio.buffer_size must be >= audio.chunk_size > 0".into(),
            ));
        }
        if self.vad.speech_hold_s < 0.0 || self.vad.silence_hold_s < 0.0 {
            return Err(BridgeError::ConfigInvalid(
                "vad hold times must be non-negative".into(),
            ));
        }
        if self.policy.max_call_duration_s == 0 {
            return Err(BridgeError::ConfigInvalid(
                "policy.max_call_duration_s must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_pipeline_shape() {
        let config = Config::default();
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.chunk_size, 320);
        assert_eq!(config.audio.buffer_size, 1600);
        assert_eq!(config.vad.energy_threshold, 4000.0);
        assert_eq!(config.vad.noise_floor, 2000.0);
        assert_eq!(config.policy.max_call_duration_s, 3600);
        assert_eq!(config.policy.turn_detection, TurnDetectionMode::Client);
        assert!(config.policy.auto_answer_calls);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[ari]\nbase_url = \"http://pbx:8088/ari\"\n\n[vad]\nenergy_threshold = 2500.0"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.ari.base_url, "http://pbx:8088/ari");
        assert_eq!(config.vad.energy_threshold, 2500.0);
        // Untouched sections fall back to defaults
        assert_eq!(config.external_media.port, 8090);
        assert_eq!(config.vad.silence_hold_s, 0.5);
    }

    #[test]
    fn test_validate_rejects_missing_key() {
        let config = Config {
            live_api: LiveApiConfig {
                api_key: String::new(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BridgeError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_sample_rate() {
        let mut config = Config::default();
        config.live_api.api_key = "k".into();
        config.audio.sample_rate = 8000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_url() {
        let live = LiveApiConfig {
            api_key: "secret".into(),
            host: "example.com".into(),
            path: "/ws/live".into(),
            insecure: true,
            ..Default::default()
        };
        assert_eq!(live.endpoint_url(), "ws://example.com/ws/live?key=secret");
    }
}
