//! ARI integration: the inbound event model and the outbound REST client.

pub mod events;
pub mod rest;

pub use events::{parse_ari_event, AriChannel, AriEvent, ParsedAriEvent};
pub use rest::AriRestClient;
