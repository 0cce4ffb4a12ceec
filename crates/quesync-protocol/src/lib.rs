//! Wire types and packet codec for the quesync real-time server.
//!
//! Two packet families exist on the wire:
//! - text packets: `QUESYNC|<3-digit type id>|<json payload>`, carried over
//!   the length-prefixed stream transport (see [`wire`]);
//! - the fixed-size binary OTP packet used to bind a voice session to a
//!   datagram endpoint (see [`otp`]).

pub mod error;
pub mod events;
pub mod otp;
pub mod types;
pub mod wire;
