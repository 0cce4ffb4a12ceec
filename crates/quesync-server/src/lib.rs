//! Real-time communication server core: voice session relay, channel
//! state machine and the chunked file-transfer responder.

pub mod channels;
pub mod config;
pub mod registry;
pub mod relay;
pub mod store;
pub mod transfer;
