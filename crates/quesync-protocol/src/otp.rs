//! The fixed-size binary OTP packet.
//!
//! A client binds its datagram endpoint to a voice session by sending this
//! packet as its first UDP datagram. It is the only non-text packet on the
//! wire, so the relay trial-decodes it before anything else.

/// Token length in bytes.
pub const OTP_SIZE: usize = 64;

/// ASCII header preceding the token.
pub const OTP_HEADER: &[u8; 12] = b"QUESYNC|OTP|";

/// Total packet length. Anything else is rejected outright.
pub const OTP_PACKET_SIZE: usize = OTP_HEADER.len() + OTP_SIZE;

/// A one-time token binding a voice session to an observed endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpPacket {
    pub otp: [u8; OTP_SIZE],
}

impl OtpPacket {
    pub fn new(otp: [u8; OTP_SIZE]) -> Self {
        Self { otp }
    }

    /// Encode into the fixed 76-byte layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(OTP_PACKET_SIZE);
        buf.extend_from_slice(OTP_HEADER);
        buf.extend_from_slice(&self.otp);
        buf
    }

    /// Decode; `None` unless the buffer is exactly 76 bytes with the
    /// expected header.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != OTP_PACKET_SIZE {
            return None;
        }
        if &data[..OTP_HEADER.len()] != OTP_HEADER {
            return None;
        }
        let mut otp = [0u8; OTP_SIZE];
        otp.copy_from_slice(&data[OTP_HEADER.len()..]);
        Some(Self { otp })
    }
}
