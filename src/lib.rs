//! ARI Voice Bridge
//!
//! A real-time voice-assistant bridge between a SIP/PBX telephony platform
//! (Asterisk-style REST Interface) and a bidirectional streaming LLM
//! ("Live API") speaking 16-bit linear PCM at 16 kHz:
//! - ARI event dispatcher and per-call session state machine
//! - External-media audio pipeline with energy VAD and bounded buffers
//! - Streaming Live API client with interruption handling
//! - Control API for the ARI event feed and operator status
//!
//! # Example
//!
//! ```ignore
//! use ari_voice_bridge::bridge::VoiceBridge;
//! use ari_voice_bridge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     let bridge = VoiceBridge::start(config).await?;
//!     ari_voice_bridge::server::serve(bridge, "127.0.0.1", 8000).await
//! }
//! ```

pub mod ari;
pub mod audio;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod live;
pub mod media;
pub mod server;
pub mod session;

pub use bridge::{EventOutcome, EventStatus, VoiceBridge};
pub use config::Config;
pub use error::{BridgeError, BridgeResult, ErrorEvent};
pub use session::{SessionManager, SessionState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
