use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use quesync_protocol::error::ErrorKind;
use quesync_protocol::types::{Call, CallId, ChannelId, UserId};

/// Upper bound on `amount` accepted by [`CallStore::channel_calls`].
pub const MAX_CALLS_AMOUNT: u64 = 100;

/// Persistence collaborator for call records and channel membership.
///
/// The production backend is a database; the channel state machine only
/// goes through this trait. Operations are synchronous so the state machine
/// can invoke them inside its own critical sections.
pub trait CallStore: Send + Sync {
    fn create_call(&self, call: &Call) -> Result<(), ErrorKind>;
    fn close_call(&self, call_id: CallId, end_date: u64) -> Result<(), ErrorKind>;
    fn add_participant(&self, call_id: CallId, user_id: UserId) -> Result<(), ErrorKind>;
    /// Call history for a channel, newest first, paginated.
    fn channel_calls(
        &self,
        channel_id: ChannelId,
        amount: u64,
        offset: u64,
    ) -> Result<Vec<Call>, ErrorKind>;
    fn user_joined_call(&self, call_id: CallId, user_id: UserId) -> Result<bool, ErrorKind>;
    fn channel_exists(&self, channel_id: ChannelId) -> Result<bool, ErrorKind>;
    fn is_member(&self, channel_id: ChannelId, user_id: UserId) -> Result<bool, ErrorKind>;
}

#[derive(Default)]
struct MemoryStoreInner {
    calls: HashMap<CallId, Call>,
    /// Insertion order, newest last.
    call_order: Vec<CallId>,
    participants: HashMap<CallId, HashSet<UserId>>,
    channels: HashMap<ChannelId, HashSet<UserId>>,
}

/// In-memory [`CallStore`] for tests and standalone runs.
#[derive(Default)]
pub struct MemoryCallStore {
    inner: Mutex<MemoryStoreInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel and its members.
    pub fn seed_channel(&self, channel_id: ChannelId, members: &[UserId]) {
        lock(&self.inner)
            .channels
            .insert(channel_id, members.iter().copied().collect());
    }

    pub fn call(&self, call_id: CallId) -> Option<Call> {
        lock(&self.inner).calls.get(&call_id).cloned()
    }
}

impl CallStore for MemoryCallStore {
    fn create_call(&self, call: &Call) -> Result<(), ErrorKind> {
        let mut inner = lock(&self.inner);
        inner.calls.insert(call.id, call.clone());
        inner.call_order.push(call.id);
        inner
            .participants
            .entry(call.id)
            .or_default()
            .insert(call.caller_id);
        Ok(())
    }

    fn close_call(&self, call_id: CallId, end_date: u64) -> Result<(), ErrorKind> {
        let mut inner = lock(&self.inner);
        match inner.calls.get_mut(&call_id) {
            Some(call) => {
                call.end_date = Some(end_date);
                Ok(())
            }
            None => Err(ErrorKind::InvalidInput),
        }
    }

    fn add_participant(&self, call_id: CallId, user_id: UserId) -> Result<(), ErrorKind> {
        let mut inner = lock(&self.inner);
        if !inner.calls.contains_key(&call_id) {
            return Err(ErrorKind::InvalidInput);
        }
        inner.participants.entry(call_id).or_default().insert(user_id);
        Ok(())
    }

    fn channel_calls(
        &self,
        channel_id: ChannelId,
        amount: u64,
        offset: u64,
    ) -> Result<Vec<Call>, ErrorKind> {
        let inner = lock(&self.inner);
        let calls: Vec<Call> = inner
            .call_order
            .iter()
            .rev()
            .filter_map(|id| inner.calls.get(id))
            .filter(|call| call.channel_id == channel_id)
            .skip(offset as usize)
            .take(amount as usize)
            .cloned()
            .collect();
        Ok(calls)
    }

    fn user_joined_call(&self, call_id: CallId, user_id: UserId) -> Result<bool, ErrorKind> {
        let inner = lock(&self.inner);
        Ok(inner
            .participants
            .get(&call_id)
            .is_some_and(|p| p.contains(&user_id)))
    }

    fn channel_exists(&self, channel_id: ChannelId) -> Result<bool, ErrorKind> {
        Ok(lock(&self.inner).channels.contains_key(&channel_id))
    }

    fn is_member(&self, channel_id: ChannelId, user_id: UserId) -> Result<bool, ErrorKind> {
        let inner = lock(&self.inner);
        Ok(inner
            .channels
            .get(&channel_id)
            .is_some_and(|members| members.contains(&user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quesync_protocol::types::unix_now;
    use uuid::Uuid;

    fn call(channel_id: ChannelId, caller_id: UserId) -> Call {
        Call {
            id: Uuid::new_v4(),
            caller_id,
            channel_id,
            start_date: unix_now(),
            end_date: None,
            joined: false,
        }
    }

    #[test]
    fn create_and_close_call() {
        let store = MemoryCallStore::new();
        let c = call(Uuid::new_v4(), Uuid::new_v4());
        store.create_call(&c).unwrap();
        store.close_call(c.id, 42).unwrap();
        assert_eq!(store.call(c.id).unwrap().end_date, Some(42));
    }

    #[test]
    fn close_unknown_call_fails() {
        let store = MemoryCallStore::new();
        assert!(store.close_call(Uuid::new_v4(), 1).is_err());
    }

    #[test]
    fn caller_counts_as_participant() {
        let store = MemoryCallStore::new();
        let caller = Uuid::new_v4();
        let c = call(Uuid::new_v4(), caller);
        store.create_call(&c).unwrap();
        assert!(store.user_joined_call(c.id, caller).unwrap());
        assert!(!store.user_joined_call(c.id, Uuid::new_v4()).unwrap());
    }

    #[test]
    fn channel_calls_newest_first_paginated() {
        let store = MemoryCallStore::new();
        let channel = Uuid::new_v4();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let c = call(channel, Uuid::new_v4());
            ids.push(c.id);
            store.create_call(&c).unwrap();
        }
        // Noise in another channel.
        store.create_call(&call(Uuid::new_v4(), Uuid::new_v4())).unwrap();

        let page = store.channel_calls(channel, 2, 1).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[3]);
        assert_eq!(page[1].id, ids[2]);
    }

    #[test]
    fn membership_checks() {
        let store = MemoryCallStore::new();
        let channel = Uuid::new_v4();
        let member = Uuid::new_v4();
        store.seed_channel(channel, &[member]);
        assert!(store.channel_exists(channel).unwrap());
        assert!(!store.channel_exists(Uuid::new_v4()).unwrap());
        assert!(store.is_member(channel, member).unwrap());
        assert!(!store.is_member(channel, Uuid::new_v4()).unwrap());
    }
}
