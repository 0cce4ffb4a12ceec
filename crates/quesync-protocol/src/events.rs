use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, FileId, UserId, VoiceState};

/// Notifications pushed to users through the event-delivery collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A participant's voice state changed in a channel the target is in.
    VoiceStateChanged {
        channel_id: ChannelId,
        user_id: UserId,
        state: VoiceState,
    },
    /// The call in the channel ended.
    CallEnded { channel_id: ChannelId },
    /// Cumulative transfer progress for a file; `bytes == size` on completion.
    FileTransferProgress { file_id: FileId, bytes: u64 },
}

/// Event-delivery collaborator: one operation, fire-and-forget.
///
/// How an event reaches the target user (control connection, queue, ...)
/// is outside the core; implementations must not block.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: Event, target: UserId);
}

/// An [`EventSink`] that records deliveries in memory. Used by tests and
/// available to embedders that batch deliveries themselves.
#[derive(Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<(Event, UserId)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(Event, UserId)> {
        match self.delivered.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        }
    }

    pub fn snapshot(&self) -> Vec<(Event, UserId)> {
        match self.delivered.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl EventSink for MemorySink {
    fn deliver(&self, event: Event, target: UserId) {
        if let Ok(mut guard) = self.delivered.lock() {
            guard.push((event, target));
        }
    }
}
