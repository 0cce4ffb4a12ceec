use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ProtocolError};
use crate::events::Event;
use crate::types::*;

/// Leading identifier of every text packet.
pub const PACKET_IDENTIFIER: &str = "QUESYNC";

/// Field delimiter within the text framing.
pub const PACKET_DELIMITER: char = '|';

/// Maximum stream frame size. Chunk payloads are JSON-encoded byte arrays,
/// so a frame can be several times the raw chunk size.
pub const MAX_FRAME_SIZE: u32 = 1_048_576;

/// Numeric packet type ids, zero-padded to three digits on the wire.
/// Requests are 0-99, responses 200-399, errors 400, voice 500s, events 800.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketType {
    SessionAuth = 5,
    GetFileInfo = 30,
    UploadFile = 31,
    DownloadFile = 32,
    FileChunk = 33,
    FileChunkAck = 34,
    Authenticated = 200,
    FileInfo = 220,
    FileUploadInitiated = 221,
    FileDownloadInitiated = 222,
    Error = 400,
    Voice = 500,
    VoiceParticipant = 501,
    Event = 800,
}

impl PacketType {
    fn from_id(id: u16) -> Option<Self> {
        match id {
            5 => Some(Self::SessionAuth),
            30 => Some(Self::GetFileInfo),
            31 => Some(Self::UploadFile),
            32 => Some(Self::DownloadFile),
            33 => Some(Self::FileChunk),
            34 => Some(Self::FileChunkAck),
            200 => Some(Self::Authenticated),
            220 => Some(Self::FileInfo),
            221 => Some(Self::FileUploadInitiated),
            222 => Some(Self::FileDownloadInitiated),
            400 => Some(Self::Error),
            500 => Some(Self::Voice),
            501 => Some(Self::VoiceParticipant),
            800 => Some(Self::Event),
            _ => None,
        }
    }
}

/// A decoded text packet.
///
/// Wire format: `QUESYNC|<3-digit zero-padded type id>|<json payload>`.
/// The type id is read once and dispatched to exactly one payload decoder;
/// anything malformed decodes to `None` rather than failing.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Presented on the file-transfer connection before any other packet.
    SessionAuth { session_id: SessionId },
    Authenticated,
    GetFileInfo { file_id: FileId },
    FileInfo { file: FileInfo },
    UploadFile { name: String, size: u64 },
    FileUploadInitiated { file: FileInfo },
    DownloadFile { file_id: FileId },
    FileDownloadInitiated { file: FileInfo },
    FileChunk { file_id: FileId, chunk: FileChunk },
    /// Acknowledges a chunk; `next_index` is the next *missing* index.
    FileChunkAck { file_id: FileId, next_index: u64, done: bool },
    Error { kind: ErrorKind },
    /// Inner plaintext of an inbound encrypted voice datagram.
    Voice { user_id: UserId, channel_id: ChannelId, data: Vec<u8> },
    /// Inner plaintext of a relayed voice datagram.
    VoiceParticipant { user_id: UserId, data: Vec<u8> },
    Event { event: Event },
}

// Payload shapes. Kept separate from `Packet` so the json schema is explicit
// and the enum itself stays free of serde attributes.
#[derive(Serialize, Deserialize)]
struct SessionAuthPayload {
    session_id: SessionId,
}

#[derive(Serialize, Deserialize)]
struct FileIdPayload {
    file_id: FileId,
}

#[derive(Serialize, Deserialize)]
struct FilePayload {
    file: FileInfo,
}

#[derive(Serialize, Deserialize)]
struct UploadFilePayload {
    name: String,
    size: u64,
}

#[derive(Serialize, Deserialize)]
struct FileChunkPayload {
    file_id: FileId,
    chunk: FileChunk,
}

#[derive(Serialize, Deserialize)]
struct FileChunkAckPayload {
    file_id: FileId,
    next_index: u64,
    done: bool,
}

#[derive(Serialize, Deserialize)]
struct ErrorPayload {
    error: ErrorKind,
}

#[derive(Serialize, Deserialize)]
struct VoicePayload {
    user_id: UserId,
    channel_id: ChannelId,
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct VoiceParticipantPayload {
    user_id: UserId,
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct EventPayload {
    event: Event,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::SessionAuth { .. } => PacketType::SessionAuth,
            Packet::Authenticated => PacketType::Authenticated,
            Packet::GetFileInfo { .. } => PacketType::GetFileInfo,
            Packet::FileInfo { .. } => PacketType::FileInfo,
            Packet::UploadFile { .. } => PacketType::UploadFile,
            Packet::FileUploadInitiated { .. } => PacketType::FileUploadInitiated,
            Packet::DownloadFile { .. } => PacketType::DownloadFile,
            Packet::FileDownloadInitiated { .. } => PacketType::FileDownloadInitiated,
            Packet::FileChunk { .. } => PacketType::FileChunk,
            Packet::FileChunkAck { .. } => PacketType::FileChunkAck,
            Packet::Error { .. } => PacketType::Error,
            Packet::Voice { .. } => PacketType::Voice,
            Packet::VoiceParticipant { .. } => PacketType::VoiceParticipant,
            Packet::Event { .. } => PacketType::Event,
        }
    }

    /// Encode into `QUESYNC|nnn|<json>` bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self {
            Packet::SessionAuth { session_id } => {
                serde_json::to_string(&SessionAuthPayload { session_id: *session_id })?
            }
            Packet::Authenticated => "{}".to_string(),
            Packet::GetFileInfo { file_id } => {
                serde_json::to_string(&FileIdPayload { file_id: *file_id })?
            }
            Packet::FileInfo { file } => {
                serde_json::to_string(&FilePayload { file: file.clone() })?
            }
            Packet::UploadFile { name, size } => serde_json::to_string(&UploadFilePayload {
                name: name.clone(),
                size: *size,
            })?,
            Packet::FileUploadInitiated { file } => {
                serde_json::to_string(&FilePayload { file: file.clone() })?
            }
            Packet::DownloadFile { file_id } => {
                serde_json::to_string(&FileIdPayload { file_id: *file_id })?
            }
            Packet::FileDownloadInitiated { file } => {
                serde_json::to_string(&FilePayload { file: file.clone() })?
            }
            Packet::FileChunk { file_id, chunk } => serde_json::to_string(&FileChunkPayload {
                file_id: *file_id,
                chunk: chunk.clone(),
            })?,
            Packet::FileChunkAck { file_id, next_index, done } => {
                serde_json::to_string(&FileChunkAckPayload {
                    file_id: *file_id,
                    next_index: *next_index,
                    done: *done,
                })?
            }
            Packet::Error { kind } => serde_json::to_string(&ErrorPayload { error: *kind })?,
            Packet::Voice { user_id, channel_id, data } => {
                serde_json::to_string(&VoicePayload {
                    user_id: *user_id,
                    channel_id: *channel_id,
                    data: data.clone(),
                })?
            }
            Packet::VoiceParticipant { user_id, data } => {
                serde_json::to_string(&VoiceParticipantPayload {
                    user_id: *user_id,
                    data: data.clone(),
                })?
            }
            Packet::Event { event } => serde_json::to_string(&EventPayload {
                event: event.clone(),
            })?,
        };

        let header = format!(
            "{}{}{:03}{}",
            PACKET_IDENTIFIER,
            PACKET_DELIMITER,
            self.packet_type() as u16,
            PACKET_DELIMITER
        );

        let mut buf = Vec::with_capacity(header.len() + payload.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(payload.as_bytes());
        Ok(buf)
    }

    /// Decode a text packet. Returns `None` for anything that is not a
    /// well-formed packet of a known type, so callers can fall through to
    /// other packet families.
    pub fn decode(data: &[u8]) -> Option<Packet> {
        let text = std::str::from_utf8(data).ok()?;

        // QUESYNC | nnn | payload
        let rest = text.strip_prefix(PACKET_IDENTIFIER)?;
        let rest = rest.strip_prefix(PACKET_DELIMITER)?;
        let (id_field, payload) = rest.split_once(PACKET_DELIMITER)?;
        if id_field.len() != 3 || !id_field.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let id: u16 = id_field.parse().ok()?;
        let packet_type = PacketType::from_id(id)?;

        match packet_type {
            PacketType::SessionAuth => {
                let p: SessionAuthPayload = serde_json::from_str(payload).ok()?;
                Some(Packet::SessionAuth { session_id: p.session_id })
            }
            PacketType::Authenticated => Some(Packet::Authenticated),
            PacketType::GetFileInfo => {
                let p: FileIdPayload = serde_json::from_str(payload).ok()?;
                Some(Packet::GetFileInfo { file_id: p.file_id })
            }
            PacketType::FileInfo => {
                let p: FilePayload = serde_json::from_str(payload).ok()?;
                Some(Packet::FileInfo { file: p.file })
            }
            PacketType::UploadFile => {
                let p: UploadFilePayload = serde_json::from_str(payload).ok()?;
                Some(Packet::UploadFile { name: p.name, size: p.size })
            }
            PacketType::FileUploadInitiated => {
                let p: FilePayload = serde_json::from_str(payload).ok()?;
                Some(Packet::FileUploadInitiated { file: p.file })
            }
            PacketType::DownloadFile => {
                let p: FileIdPayload = serde_json::from_str(payload).ok()?;
                Some(Packet::DownloadFile { file_id: p.file_id })
            }
            PacketType::FileDownloadInitiated => {
                let p: FilePayload = serde_json::from_str(payload).ok()?;
                Some(Packet::FileDownloadInitiated { file: p.file })
            }
            PacketType::FileChunk => {
                let p: FileChunkPayload = serde_json::from_str(payload).ok()?;
                Some(Packet::FileChunk { file_id: p.file_id, chunk: p.chunk })
            }
            PacketType::FileChunkAck => {
                let p: FileChunkAckPayload = serde_json::from_str(payload).ok()?;
                Some(Packet::FileChunkAck {
                    file_id: p.file_id,
                    next_index: p.next_index,
                    done: p.done,
                })
            }
            PacketType::Error => {
                let p: ErrorPayload = serde_json::from_str(payload).ok()?;
                Some(Packet::Error { kind: p.error })
            }
            PacketType::Voice => {
                let p: VoicePayload = serde_json::from_str(payload).ok()?;
                Some(Packet::Voice {
                    user_id: p.user_id,
                    channel_id: p.channel_id,
                    data: p.data,
                })
            }
            PacketType::VoiceParticipant => {
                let p: VoiceParticipantPayload = serde_json::from_str(payload).ok()?;
                Some(Packet::VoiceParticipant { user_id: p.user_id, data: p.data })
            }
            PacketType::Event => {
                let p: EventPayload = serde_json::from_str(payload).ok()?;
                Some(Packet::Event { event: p.event })
            }
        }
    }
}

/// Encode a packet into a length-prefixed stream frame.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    let payload = packet.encode()?;
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Attempt to extract one complete length-prefixed frame from a byte buffer.
///
/// Returns `Ok(Some(payload))` if a complete frame is available,
/// `Ok(None)` if more data is needed, or `Err` if the frame is oversized.
/// Advances the buffer past the consumed frame.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE as usize {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    if buf.len() < 4 + length {
        return Ok(None);
    }

    buf.advance(4);
    let payload = buf.split_to(length).to_vec();
    Ok(Some(payload))
}
