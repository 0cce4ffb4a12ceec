//! Per-session symmetric encryption for voice datagrams.
//!
//! Each voice session carries two independent 256-bit keys: an encryption
//! key and an integrity key. A sealed datagram is
//!
//! ```text
//! [nonce: 12] [AES-256-GCM ciphertext + 16-byte tag] [HMAC-SHA256: 32]
//! ```
//!
//! where the trailing HMAC (under the integrity key) covers nonce and
//! ciphertext and is verified before any decryption is attempted. Keys are
//! regenerated on every session (re)establishment and never persisted.

use hmac::{Hmac, Mac};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const AES_KEY_SIZE: usize = 32;
pub const HMAC_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const GCM_TAG_SIZE: usize = 16;
pub const MAC_SIZE: usize = 32;

/// Fixed sealing overhead on top of the plaintext length.
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + GCM_TAG_SIZE + MAC_SIZE;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("system RNG failure")]
    Rng,
    #[error("encryption failed")]
    Seal,
    #[error("sealed payload too short")]
    TooShort,
    #[error("integrity verification failed")]
    Verify,
    #[error("decryption failed")]
    Open,
}

/// Per-session key material, owned exclusively by the voice session
/// registry. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionInfo {
    pub aes_key: [u8; AES_KEY_SIZE],
    pub hmac_key: [u8; HMAC_KEY_SIZE],
}

impl EncryptionInfo {
    /// Generate fresh random key material.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut aes_key = [0u8; AES_KEY_SIZE];
        let mut hmac_key = [0u8; HMAC_KEY_SIZE];
        rng.fill(&mut aes_key).map_err(|_| CryptoError::Rng)?;
        rng.fill(&mut hmac_key).map_err(|_| CryptoError::Rng)?;
        Ok(Self { aes_key, hmac_key })
    }
}

impl std::fmt::Debug for EncryptionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("EncryptionInfo(..)")
    }
}

/// Fill a fixed-size buffer with random bytes (OTP tokens, nonces).
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let rng = SystemRandom::new();
    let mut buf = [0u8; N];
    rng.fill(&mut buf).map_err(|_| CryptoError::Rng)?;
    Ok(buf)
}

fn aead_key(keys: &EncryptionInfo) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&AES_256_GCM, &keys.aes_key).map_err(|_| CryptoError::Seal)?;
    Ok(LessSafeKey::new(unbound))
}

fn mac(keys: &EncryptionInfo, data: &[u8]) -> Result<HmacSha256, CryptoError> {
    HmacSha256::new_from_slice(&keys.hmac_key).map_err(|_| CryptoError::Verify)
        .map(|mut h| {
            h.update(data);
            h
        })
}

/// Seal a plaintext for the given session keys.
pub fn seal(keys: &EncryptionInfo, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce_bytes: [u8; NONCE_SIZE] = random_bytes()?;

    let mut in_out = plaintext.to_vec();
    aead_key(keys)?
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Seal)?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + in_out.len() + MAC_SIZE);
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);

    let tag = mac(keys, &sealed)?.finalize().into_bytes();
    sealed.extend_from_slice(&tag);
    Ok(sealed)
}

/// Open a sealed payload: verify the outer HMAC first, then decrypt.
pub fn open(keys: &EncryptionInfo, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(CryptoError::TooShort);
    }

    let (body, tag) = sealed.split_at(sealed.len() - MAC_SIZE);
    mac(keys, body)?
        .verify_slice(tag)
        .map_err(|_| CryptoError::Verify)?;

    let (nonce_bytes, ciphertext) = body.split_at(NONCE_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(nonce_bytes);

    let mut in_out = ciphertext.to_vec();
    let plaintext = aead_key(keys)?
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Open)?;

    Ok(plaintext.to_vec())
}
