//! External-media transport: the per-channel WebSocket audio server the PBX
//! connects to.

pub mod server;

pub use server::{ExternalMediaServer, MediaConnectionInfo, MediaControlEvent, MediaServerStats};
