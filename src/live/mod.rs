//! Live API integration: wire protocol types and the streaming client.

pub mod client;
pub mod protocol;

pub use client::{LiveApiClient, LiveEvent, LiveSessionInfo};
pub use protocol::{ClientEvent, ServerEvent, ServerMessage};
