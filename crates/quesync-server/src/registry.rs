use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use quesync_crypto::{random_bytes, CryptoError, EncryptionInfo};
use quesync_protocol::error::ErrorKind;
use quesync_protocol::otp::OTP_SIZE;
use quesync_protocol::types::{SessionId, UserId};
use tracing::debug;
use uuid::Uuid;

pub type OtpToken = [u8; OTP_SIZE];

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<UserId, SessionId>,
    session_users: HashMap<SessionId, UserId>,
    session_keys: HashMap<SessionId, EncryptionInfo>,
    otps: HashMap<OtpToken, SessionId>,
    endpoints: HashMap<SessionId, SocketAddr>,
    endpoint_sessions: HashMap<SocketAddr, SessionId>,
}

/// Voice session registry: session ids, per-session key material, pending
/// OTP tokens and bound datagram endpoints.
///
/// Owns all of its maps behind one lock; no other component touches them.
#[derive(Default)]
pub struct VoiceRegistry {
    inner: Mutex<RegistryInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl VoiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or refresh) the voice session for a user.
    ///
    /// The session id is stable across repeated calls for the same user;
    /// key material is regenerated every time, so a rejoining client never
    /// reuses old keys.
    pub fn create_session(
        &self,
        user_id: UserId,
    ) -> Result<(SessionId, EncryptionInfo), CryptoError> {
        let keys = EncryptionInfo::generate()?;
        let mut inner = lock(&self.inner);
        let session_id = match inner.sessions.get(&user_id) {
            Some(existing) => *existing,
            None => {
                let id = Uuid::new_v4();
                inner.sessions.insert(user_id, id);
                inner.session_users.insert(id, user_id);
                id
            }
        };
        inner.session_keys.insert(session_id, keys.clone());
        debug!(%user_id, %session_id, "voice session established");
        Ok((session_id, keys))
    }

    /// Issue a fresh single-use OTP for endpoint binding. Previously issued
    /// unconsumed tokens for the same session stay valid.
    pub fn generate_otp(&self, session_id: SessionId) -> Result<OtpToken, ErrorKind> {
        let mut inner = lock(&self.inner);
        if !inner.session_keys.contains_key(&session_id) {
            return Err(ErrorKind::VoiceNotConnected);
        }
        let token: OtpToken = random_bytes().map_err(|_| ErrorKind::TransientIo)?;
        inner.otps.insert(token, session_id);
        Ok(token)
    }

    /// Bind the source address of an OTP datagram to its session, consuming
    /// the token. Unknown tokens are a no-op.
    pub fn bind_endpoint(&self, otp: &OtpToken, addr: SocketAddr) -> bool {
        let mut inner = lock(&self.inner);
        match inner.otps.remove(otp) {
            Some(session_id) => {
                if let Some(old) = inner.endpoints.insert(session_id, addr) {
                    inner.endpoint_sessions.remove(&old);
                }
                inner.endpoint_sessions.insert(addr, session_id);
                debug!(%session_id, %addr, "voice endpoint bound");
                true
            }
            None => false,
        }
    }

    /// Tear down a user's voice session: endpoint, keys and any pending
    /// OTPs are all removed.
    pub fn delete_session(&self, user_id: UserId) -> Result<(), ErrorKind> {
        let mut inner = lock(&self.inner);
        let session_id = inner
            .sessions
            .remove(&user_id)
            .ok_or(ErrorKind::VoiceNotConnected)?;
        inner.session_users.remove(&session_id);
        inner.session_keys.remove(&session_id);
        if let Some(addr) = inner.endpoints.remove(&session_id) {
            inner.endpoint_sessions.remove(&addr);
        }
        inner.otps.retain(|_, sid| *sid != session_id);
        debug!(%user_id, %session_id, "voice session deleted");
        Ok(())
    }

    pub fn session_by_endpoint(&self, addr: SocketAddr) -> Option<SessionId> {
        lock(&self.inner).endpoint_sessions.get(&addr).copied()
    }

    pub fn session_of(&self, user_id: UserId) -> Option<SessionId> {
        lock(&self.inner).sessions.get(&user_id).copied()
    }

    pub fn user_of(&self, session_id: SessionId) -> Option<UserId> {
        lock(&self.inner).session_users.get(&session_id).copied()
    }

    pub fn keys_for(&self, session_id: SessionId) -> Option<EncryptionInfo> {
        lock(&self.inner).session_keys.get(&session_id).cloned()
    }

    pub fn endpoint_for(&self, session_id: SessionId) -> Option<SocketAddr> {
        lock(&self.inner).endpoints.get(&session_id).copied()
    }
}
