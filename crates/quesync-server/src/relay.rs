use std::net::SocketAddr;
use std::sync::Arc;

use quesync_crypto::{open, seal};
use quesync_protocol::otp::OtpPacket;
use quesync_protocol::wire::Packet;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace, warn};

use crate::channels::VoiceChannels;
use crate::registry::VoiceRegistry;

/// Largest voice datagram accepted off the socket.
const MAX_DATAGRAM_SIZE: usize = 2048;

/// What happened to one inbound voice datagram. Every drop path is named
/// so the loop can log it and tests can assert on it.
#[derive(Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// An OTP binding packet; `bound` is false for an unknown token.
    OtpBound { bound: bool },
    /// Source address has no bound session.
    UnknownEndpoint,
    /// Integrity check or decryption failed.
    AuthFailed,
    /// Decrypted bytes were not a voice packet.
    Malformed,
    /// Sender is not connected to the embedded channel's call.
    NotParticipant,
    /// Valid packet with no audio payload.
    Silent,
    /// Re-encrypted and fanned out; recipients that could not be resolved
    /// were skipped.
    Relayed {
        forwards: Vec<(SocketAddr, Vec<u8>)>,
        skipped: usize,
    },
}

/// Process one datagram. Pure with respect to the socket: the caller
/// performs the returned sends.
pub fn handle_datagram(
    data: &[u8],
    src: SocketAddr,
    registry: &VoiceRegistry,
    channels: &VoiceChannels,
) -> RelayOutcome {
    // The binary OTP family and the text family share no discriminator, so
    // the OTP shape is tried first; its fixed length and header make a
    // false positive impossible.
    if let Some(otp) = OtpPacket::decode(data) {
        let bound = registry.bind_endpoint(&otp.otp, src);
        return RelayOutcome::OtpBound { bound };
    }

    let Some(session_id) = registry.session_by_endpoint(src) else {
        return RelayOutcome::UnknownEndpoint;
    };
    let Some(keys) = registry.keys_for(session_id) else {
        return RelayOutcome::UnknownEndpoint;
    };

    let Ok(plaintext) = open(&keys, data) else {
        return RelayOutcome::AuthFailed;
    };

    let Some(Packet::Voice { user_id, channel_id, data: payload }) = Packet::decode(&plaintext)
    else {
        return RelayOutcome::Malformed;
    };

    // The bound session is authoritative for the sender's identity; a
    // mismatched embedded user id is treated as not-a-participant.
    let sender = registry.user_of(session_id);
    if sender != Some(user_id) || !channels.is_participant(channel_id, user_id) {
        return RelayOutcome::NotParticipant;
    }

    if payload.is_empty() {
        return RelayOutcome::Silent;
    }

    let mut forwards = Vec::new();
    let mut skipped = 0;
    for participant in channels.connected_participants(channel_id) {
        if participant == user_id {
            continue;
        }
        let resolved = registry
            .session_of(participant)
            .and_then(|sid| Some((registry.endpoint_for(sid)?, registry.keys_for(sid)?)));
        let Some((endpoint, recipient_keys)) = resolved else {
            skipped += 1;
            continue;
        };

        let relayed = Packet::VoiceParticipant { user_id, data: payload.clone() };
        let sealed = relayed
            .encode()
            .ok()
            .and_then(|bytes| seal(&recipient_keys, &bytes).ok());
        match sealed {
            Some(bytes) => forwards.push((endpoint, bytes)),
            None => skipped += 1,
        }
    }

    RelayOutcome::Relayed { forwards, skipped }
}

/// UDP receive/forward loop. Sends are fire-and-forget; a failed forward
/// never stalls the loop.
pub async fn run_relay_loop(
    socket: Arc<UdpSocket>,
    registry: Arc<VoiceRegistry>,
    channels: Arc<VoiceChannels>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(e) => {
                error!("UDP recv error: {}", e);
                continue;
            }
        };

        match handle_datagram(&buf[..len], src, &registry, &channels) {
            RelayOutcome::Relayed { forwards, skipped } => {
                if skipped > 0 {
                    trace!(%src, skipped, "unresolvable relay recipients");
                }
                for (addr, bytes) in forwards {
                    if let Err(e) = socket.send_to(&bytes, addr).await {
                        trace!(%addr, "voice forward failed: {}", e);
                    }
                }
            }
            RelayOutcome::OtpBound { bound: true } => {
                debug!(%src, "voice endpoint bound");
            }
            RelayOutcome::OtpBound { bound: false } => {
                warn!(%src, "rejected unknown OTP token");
            }
            RelayOutcome::UnknownEndpoint => trace!(%src, "datagram from unbound endpoint"),
            RelayOutcome::AuthFailed => warn!(%src, "voice packet failed authentication"),
            RelayOutcome::Malformed => warn!(%src, "malformed voice packet"),
            RelayOutcome::NotParticipant => debug!(%src, "voice from non-participant"),
            RelayOutcome::Silent => {}
        }
    }
}
