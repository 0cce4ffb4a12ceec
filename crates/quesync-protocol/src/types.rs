use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique user identifier, assigned by the account service.
pub type UserId = Uuid;

/// Channel identifier. A channel may host at most one active call.
pub type ChannelId = Uuid;

/// Voice session identifier, stable per user across rejoins.
pub type SessionId = Uuid;

/// Call record identifier.
pub type CallId = Uuid;

/// Server-assigned file identifier, immutable once created.
pub type FileId = Uuid;

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Metadata for a file known to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: FileId,
    pub name: String,
    /// Authoritative byte size; reconstruction truncates to this.
    pub size: u64,
    pub uploader_id: UserId,
}

/// A fixed-size segment of a file, addressed by index.
///
/// Every chunk on the wire carries exactly the configured chunk size of
/// data; the final chunk of a file is zero-padded and truncated at
/// reconstruction time using [`FileInfo::size`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub index: u64,
    pub data: Vec<u8>,
}

/// Connection phase of a call participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoicePhase {
    /// Invited but not yet joined; swept to `Disconnected` on timeout.
    Pending,
    Connected,
    Disconnected,
}

/// A participant's voice state within an active call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceState {
    pub phase: VoicePhase,
    pub muted: bool,
    pub deafened: bool,
    /// Unix timestamp of the last phase transition.
    pub changed_at: u64,
}

impl VoiceState {
    pub fn pending() -> Self {
        Self {
            phase: VoicePhase::Pending,
            muted: false,
            deafened: false,
            changed_at: unix_now(),
        }
    }

    pub fn connected(muted: bool, deafened: bool) -> Self {
        Self {
            phase: VoicePhase::Connected,
            muted,
            deafened,
            changed_at: unix_now(),
        }
    }

    /// Transition to a new phase, stamping the transition time.
    /// Mute/deafen flags are preserved.
    pub fn set_phase(&mut self, phase: VoicePhase) {
        self.phase = phase;
        self.changed_at = unix_now();
    }
}

/// A call record, persisted by the call store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub caller_id: UserId,
    pub channel_id: ChannelId,
    pub start_date: u64,
    pub end_date: Option<u64>,
    /// Whether the user querying call history took part in this call.
    #[serde(default)]
    pub joined: bool,
}

/// An active call plus the voice state of every participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDetails {
    pub call: Call,
    pub voice_states: HashMap<UserId, VoiceState>,
}
