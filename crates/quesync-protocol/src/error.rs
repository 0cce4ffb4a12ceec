use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-visible failure taxonomy.
///
/// These are the typed failures surfaced to peers in [`crate::wire::Packet::Error`]
/// and returned by the stateful server components. They describe the kind of
/// failure, not its mechanism; transport-level detail stays in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    #[error("file not found")]
    FileNotFound,
    #[error("channel not found")]
    ChannelNotFound,
    #[error("user is not connected to voice")]
    VoiceNotConnected,
    #[error("a call is already active in the channel")]
    CallAlreadyActive,
    #[error("user is not a member of the channel")]
    NotMember,
    #[error("session is not authenticated")]
    NotAuthenticated,
    #[error("requested amount exceeds the maximum")]
    LimitExceeded,
    #[error("empty file")]
    EmptyFile,
    #[error("invalid input")]
    InvalidInput,
    #[error("transient I/O failure")]
    TransientIo,
}

/// Errors produced by the packet codec and stream framing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes (max {max})", max = crate::wire::MAX_FRAME_SIZE)]
    FrameTooLarge(usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
