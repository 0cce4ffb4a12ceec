use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use quesync_protocol::error::ErrorKind;
use quesync_protocol::events::{Event, EventSink};
use quesync_protocol::types::{
    unix_now, Call, CallDetails, ChannelId, UserId, VoicePhase, VoiceState,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{CallStore, MAX_CALLS_AMOUNT};

/// Invited participants who never join are disconnected after this long.
pub const MAX_PENDING_SECS: u64 = 30;

/// Cadence of the background pending sweep.
pub const SWEEP_INTERVAL_MS: u64 = 500;

#[derive(Default)]
struct ChannelsInner {
    /// Channels with an active call.
    channels: HashMap<ChannelId, CallDetails>,
    /// Which channel each connected user is in. At most one entry per user.
    joined: HashMap<UserId, ChannelId>,
}

/// Voice channel state machine: one active call per channel, participant
/// voice states, and the pending-invite timeout sweep.
///
/// Call records persist through the [`CallStore`]; state change
/// notifications go out through the [`EventSink`].
pub struct VoiceChannels {
    inner: Mutex<ChannelsInner>,
    store: Arc<dyn CallStore>,
    sink: Arc<dyn EventSink>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Targets of a voice-state broadcast: every Connected participant except
/// the acting user.
fn connected_others(details: &CallDetails, acting: UserId) -> Vec<UserId> {
    details
        .voice_states
        .iter()
        .filter(|(uid, state)| **uid != acting && state.phase == VoicePhase::Connected)
        .map(|(uid, _)| *uid)
        .collect()
}

impl VoiceChannels {
    pub fn new(store: Arc<dyn CallStore>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Mutex::new(ChannelsInner::default()),
            store,
            sink,
        }
    }

    /// Start a call in a channel. The caller joins immediately; invitees
    /// are seeded `Pending` and swept if they never answer.
    pub fn start_channel(
        &self,
        caller: UserId,
        channel_id: ChannelId,
        invitees: &[UserId],
    ) -> Result<CallDetails, ErrorKind> {
        if !self.store.channel_exists(channel_id)? {
            return Err(ErrorKind::ChannelNotFound);
        }

        let mut inner = lock(&self.inner);
        if inner.channels.contains_key(&channel_id) {
            return Err(ErrorKind::CallAlreadyActive);
        }

        let call = Call {
            id: Uuid::new_v4(),
            caller_id: caller,
            channel_id,
            start_date: unix_now(),
            end_date: None,
            joined: false,
        };
        self.store.create_call(&call)?;

        let mut voice_states = HashMap::new();
        voice_states.insert(caller, VoiceState::connected(false, false));
        for invitee in invitees {
            if *invitee != caller {
                voice_states.insert(*invitee, VoiceState::pending());
            }
        }

        let details = CallDetails { call, voice_states };
        inner.channels.insert(channel_id, details.clone());
        inner.joined.insert(caller, channel_id);
        info!(%caller, %channel_id, call_id = %details.call.id, "call started");
        Ok(details)
    }

    /// Join the active call in a channel, implicitly leaving any other
    /// channel first.
    pub fn join(
        &self,
        user: UserId,
        channel_id: ChannelId,
        muted: bool,
        deafened: bool,
    ) -> Result<CallDetails, ErrorKind> {
        let (snapshot, events) = {
            let mut inner = lock(&self.inner);

            let mut events = Vec::new();
            if let Some(current) = inner.joined.get(&user).copied() {
                if current == channel_id {
                    return Err(ErrorKind::CallAlreadyActive);
                }
                events.extend(Self::leave_locked(&mut inner, &*self.store, user, current)?);
            }

            let details = inner
                .channels
                .get_mut(&channel_id)
                .ok_or(ErrorKind::ChannelNotFound)?;
            self.store.add_participant(details.call.id, user)?;

            let state = VoiceState::connected(muted, deafened);
            details.voice_states.insert(user, state);
            for target in connected_others(details, user) {
                events.push((
                    Event::VoiceStateChanged { channel_id, user_id: user, state },
                    target,
                ));
            }
            let snapshot = details.clone();
            inner.joined.insert(user, channel_id);
            (snapshot, events)
        };

        for (event, target) in events {
            self.sink.deliver(event, target);
        }
        debug!(%user, %channel_id, "joined call");
        Ok(snapshot)
    }

    /// Leave the channel the user is connected to. The last connected
    /// participant leaving ends the call.
    pub fn leave(&self, user: UserId) -> Result<(), ErrorKind> {
        let events = {
            let mut inner = lock(&self.inner);
            let channel_id = inner
                .joined
                .get(&user)
                .copied()
                .ok_or(ErrorKind::VoiceNotConnected)?;
            Self::leave_locked(&mut inner, &*self.store, user, channel_id)?
        };
        for (event, target) in events {
            self.sink.deliver(event, target);
        }
        Ok(())
    }

    /// Shared leave path; the caller already holds the lock and has
    /// verified membership. Returns the events to deliver.
    fn leave_locked(
        inner: &mut ChannelsInner,
        store: &dyn CallStore,
        user: UserId,
        channel_id: ChannelId,
    ) -> Result<Vec<(Event, UserId)>, ErrorKind> {
        inner.joined.remove(&user);
        let Some(details) = inner.channels.get_mut(&channel_id) else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        if let Some(state) = details.voice_states.get_mut(&user) {
            state.set_phase(VoicePhase::Disconnected);
            let state = *state;
            for target in connected_others(details, user) {
                events.push((
                    Event::VoiceStateChanged { channel_id, user_id: user, state },
                    target,
                ));
            }
        }

        let any_connected = details
            .voice_states
            .values()
            .any(|s| s.phase == VoicePhase::Connected);
        if !any_connected {
            let call_id = details.call.id;
            for target in details.voice_states.keys() {
                if *target != user {
                    events.push((Event::CallEnded { channel_id }, *target));
                }
            }
            store.close_call(call_id, unix_now())?;
            inner.channels.remove(&channel_id);
            info!(%channel_id, %call_id, "call ended");
        }
        Ok(events)
    }

    /// Update a connected participant's mute/deafen flags and broadcast
    /// the new state. Idempotent.
    pub fn set_mute_deafen(
        &self,
        user: UserId,
        muted: bool,
        deafened: bool,
    ) -> Result<(), ErrorKind> {
        let events = {
            let mut inner = lock(&self.inner);
            let channel_id = inner
                .joined
                .get(&user)
                .copied()
                .ok_or(ErrorKind::VoiceNotConnected)?;
            let details = inner
                .channels
                .get_mut(&channel_id)
                .ok_or(ErrorKind::VoiceNotConnected)?;
            let state = details
                .voice_states
                .get_mut(&user)
                .ok_or(ErrorKind::VoiceNotConnected)?;
            state.muted = muted;
            state.deafened = deafened;
            let state = *state;
            connected_others(details, user)
                .into_iter()
                .map(|target| {
                    (
                        Event::VoiceStateChanged { channel_id, user_id: user, state },
                        target,
                    )
                })
                .collect::<Vec<_>>()
        };
        for (event, target) in events {
            self.sink.deliver(event, target);
        }
        Ok(())
    }

    /// Snapshot of every participant's voice state in the channel's call.
    pub fn voice_states(
        &self,
        channel_id: ChannelId,
    ) -> Result<HashMap<UserId, VoiceState>, ErrorKind> {
        let inner = lock(&self.inner);
        inner
            .channels
            .get(&channel_id)
            .map(|details| details.voice_states.clone())
            .ok_or(ErrorKind::ChannelNotFound)
    }

    /// Whether the user is a connected participant of the channel's call.
    pub fn is_participant(&self, channel_id: ChannelId, user: UserId) -> bool {
        let inner = lock(&self.inner);
        inner
            .channels
            .get(&channel_id)
            .and_then(|details| details.voice_states.get(&user))
            .is_some_and(|state| state.phase == VoicePhase::Connected)
    }

    /// Connected participants of the channel's call.
    pub fn connected_participants(&self, channel_id: ChannelId) -> Vec<UserId> {
        let inner = lock(&self.inner);
        inner
            .channels
            .get(&channel_id)
            .map(|details| {
                details
                    .voice_states
                    .iter()
                    .filter(|(_, state)| state.phase == VoicePhase::Connected)
                    .map(|(uid, _)| *uid)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Disconnect invitees whose invitation timed out. Returns how many
    /// were swept; each transitions at most once.
    pub fn sweep_pending(&self, now: u64) -> usize {
        let mut swept = 0;
        let events = {
            let mut inner = lock(&self.inner);
            let mut events = Vec::new();
            for (channel_id, details) in inner.channels.iter_mut() {
                let expired: Vec<UserId> = details
                    .voice_states
                    .iter()
                    .filter(|(_, state)| {
                        state.phase == VoicePhase::Pending
                            && now.saturating_sub(state.changed_at) >= MAX_PENDING_SECS
                    })
                    .map(|(uid, _)| *uid)
                    .collect();
                for user in expired {
                    if let Some(state) = details.voice_states.get_mut(&user) {
                        state.set_phase(VoicePhase::Disconnected);
                        let state = *state;
                        swept += 1;
                        for target in connected_others(details, user) {
                            events.push((
                                Event::VoiceStateChanged {
                                    channel_id: *channel_id,
                                    user_id: user,
                                    state,
                                },
                                target,
                            ));
                        }
                        debug!(%user, %channel_id, "pending invite timed out");
                    }
                }
            }
            events
        };
        for (event, target) in events {
            self.sink.deliver(event, target);
        }
        swept
    }

    /// Background loop driving [`sweep_pending`](Self::sweep_pending).
    pub async fn run_sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(SWEEP_INTERVAL_MS));
        loop {
            ticker.tick().await;
            self.sweep_pending(unix_now());
        }
    }

    /// Paginated call history for a channel, each record annotated with
    /// whether the requesting user took part.
    pub fn channel_calls(
        &self,
        user: UserId,
        channel_id: ChannelId,
        amount: u64,
        offset: u64,
    ) -> Result<Vec<Call>, ErrorKind> {
        if amount > MAX_CALLS_AMOUNT {
            return Err(ErrorKind::LimitExceeded);
        }
        if !self.store.channel_exists(channel_id)? {
            return Err(ErrorKind::ChannelNotFound);
        }
        if !self.store.is_member(channel_id, user)? {
            return Err(ErrorKind::NotMember);
        }
        let mut calls = self.store.channel_calls(channel_id, amount, offset)?;
        for call in &mut calls {
            call.joined = self.store.user_joined_call(call.id, user)?;
        }
        Ok(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCallStore;
    use quesync_protocol::events::MemorySink;

    struct Fixture {
        channels: VoiceChannels,
        store: Arc<MemoryCallStore>,
        sink: Arc<MemorySink>,
        channel_id: ChannelId,
        users: Vec<UserId>,
    }

    fn fixture(member_count: usize) -> Fixture {
        let store = Arc::new(MemoryCallStore::new());
        let sink = Arc::new(MemorySink::new());
        let channel_id = Uuid::new_v4();
        let users: Vec<UserId> = (0..member_count).map(|_| Uuid::new_v4()).collect();
        store.seed_channel(channel_id, &users);
        let channels = VoiceChannels::new(store.clone(), sink.clone());
        Fixture { channels, store, sink, channel_id, users }
    }

    #[test]
    fn start_channel_seeds_states() {
        let f = fixture(3);
        let details = f
            .channels
            .start_channel(f.users[0], f.channel_id, &f.users[1..])
            .unwrap();

        assert_eq!(details.voice_states.len(), 3);
        assert_eq!(
            details.voice_states[&f.users[0]].phase,
            VoicePhase::Connected
        );
        assert_eq!(details.voice_states[&f.users[1]].phase, VoicePhase::Pending);
        assert_eq!(details.voice_states[&f.users[2]].phase, VoicePhase::Pending);
        assert!(f.store.call(details.call.id).is_some());
    }

    #[test]
    fn second_call_in_channel_rejected() {
        let f = fixture(2);
        f.channels
            .start_channel(f.users[0], f.channel_id, &f.users[1..])
            .unwrap();
        assert_eq!(
            f.channels
                .start_channel(f.users[1], f.channel_id, &[])
                .unwrap_err(),
            ErrorKind::CallAlreadyActive
        );
    }

    #[test]
    fn start_in_unknown_channel_rejected() {
        let f = fixture(1);
        assert_eq!(
            f.channels
                .start_channel(f.users[0], Uuid::new_v4(), &[])
                .unwrap_err(),
            ErrorKind::ChannelNotFound
        );
    }

    #[test]
    fn join_broadcasts_to_connected_only() {
        let f = fixture(3);
        f.channels
            .start_channel(f.users[0], f.channel_id, &f.users[1..])
            .unwrap();
        f.sink.take();

        f.channels.join(f.users[1], f.channel_id, true, false).unwrap();

        // Only the caller is connected; the pending invitee gets nothing.
        let events = f.sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, f.users[0]);
        match &events[0].0 {
            Event::VoiceStateChanged { user_id, state, .. } => {
                assert_eq!(*user_id, f.users[1]);
                assert_eq!(state.phase, VoicePhase::Connected);
                assert!(state.muted);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn join_without_call_rejected() {
        let f = fixture(1);
        assert_eq!(
            f.channels
                .join(f.users[0], f.channel_id, false, false)
                .unwrap_err(),
            ErrorKind::ChannelNotFound
        );
    }

    #[test]
    fn join_moves_user_between_channels() {
        let store = Arc::new(MemoryCallStore::new());
        let sink = Arc::new(MemorySink::new());
        let channel_a = Uuid::new_v4();
        let channel_b = Uuid::new_v4();
        let alone = Uuid::new_v4();
        let mover = Uuid::new_v4();
        store.seed_channel(channel_a, &[alone, mover]);
        store.seed_channel(channel_b, &[alone, mover]);
        let channels = VoiceChannels::new(store.clone(), sink.clone());

        let call_a = channels.start_channel(mover, channel_a, &[]).unwrap().call;
        channels.start_channel(alone, channel_b, &[]).unwrap();
        sink.take();

        channels.join(mover, channel_b, false, false).unwrap();

        // Leaving channel A ended its call (mover was the only one there).
        assert!(store.call(call_a.id).unwrap().end_date.is_some());
        assert!(channels.voice_states(channel_a).is_err());
        assert!(channels.is_participant(channel_b, mover));
    }

    #[test]
    fn rejoining_same_channel_rejected() {
        let f = fixture(2);
        f.channels
            .start_channel(f.users[0], f.channel_id, &[])
            .unwrap();
        assert_eq!(
            f.channels
                .join(f.users[0], f.channel_id, false, false)
                .unwrap_err(),
            ErrorKind::CallAlreadyActive
        );
    }

    #[test]
    fn last_leave_ends_call() {
        let f = fixture(3);
        let details = f
            .channels
            .start_channel(f.users[0], f.channel_id, &f.users[1..])
            .unwrap();
        f.channels.join(f.users[1], f.channel_id, false, false).unwrap();
        f.sink.take();

        f.channels.leave(f.users[0]).unwrap();
        let events = f.sink.take();
        // Disconnect broadcast to the one remaining connected participant.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, f.users[1]);

        f.channels.leave(f.users[1]).unwrap();
        let events = f.sink.take();
        // No connected participants remain: CallEnded to every non-acting
        // participant, including the swept-later pending invitee.
        assert!(events
            .iter()
            .all(|(event, _)| matches!(event, Event::CallEnded { .. })));
        let mut targets: Vec<UserId> = events.iter().map(|(_, t)| *t).collect();
        targets.sort();
        let mut expected = vec![f.users[0], f.users[2]];
        expected.sort();
        assert_eq!(targets, expected);

        assert!(f.store.call(details.call.id).unwrap().end_date.is_some());
        assert!(f.channels.voice_states(f.channel_id).is_err());
    }

    #[test]
    fn leave_without_join_rejected() {
        let f = fixture(1);
        assert_eq!(
            f.channels.leave(f.users[0]).unwrap_err(),
            ErrorKind::VoiceNotConnected
        );
    }

    #[test]
    fn mute_deafen_updates_and_broadcasts() {
        let f = fixture(2);
        f.channels
            .start_channel(f.users[0], f.channel_id, &f.users[1..])
            .unwrap();
        f.channels.join(f.users[1], f.channel_id, false, false).unwrap();
        f.sink.take();

        f.channels.set_mute_deafen(f.users[0], true, true).unwrap();
        let states = f.channels.voice_states(f.channel_id).unwrap();
        assert!(states[&f.users[0]].muted);
        assert!(states[&f.users[0]].deafened);

        let events = f.sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, f.users[1]);
    }

    #[test]
    fn sweep_disconnects_expired_pending_once() {
        let f = fixture(3);
        f.channels
            .start_channel(f.users[0], f.channel_id, &f.users[1..])
            .unwrap();
        f.sink.take();

        // Not expired yet.
        assert_eq!(f.channels.sweep_pending(unix_now()), 0);

        let later = unix_now() + MAX_PENDING_SECS + 1;
        assert_eq!(f.channels.sweep_pending(later), 2);
        let states = f.channels.voice_states(f.channel_id).unwrap();
        assert_eq!(states[&f.users[1]].phase, VoicePhase::Disconnected);
        assert_eq!(states[&f.users[2]].phase, VoicePhase::Disconnected);

        // One broadcast per swept invitee, to the lone connected caller.
        let events = f.sink.take();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|(_, target)| *target == f.users[0]));

        // Already disconnected: sweeping again is a no-op.
        assert_eq!(f.channels.sweep_pending(later + 100), 0);
        assert!(f.sink.take().is_empty());
    }

    #[test]
    fn channel_calls_guards_and_annotates() {
        let f = fixture(2);
        let outsider = Uuid::new_v4();

        let details = f
            .channels
            .start_channel(f.users[0], f.channel_id, &[])
            .unwrap();
        f.channels.leave(f.users[0]).unwrap();

        assert_eq!(
            f.channels
                .channel_calls(f.users[0], f.channel_id, MAX_CALLS_AMOUNT + 1, 0)
                .unwrap_err(),
            ErrorKind::LimitExceeded
        );
        assert_eq!(
            f.channels
                .channel_calls(f.users[0], Uuid::new_v4(), 10, 0)
                .unwrap_err(),
            ErrorKind::ChannelNotFound
        );
        assert_eq!(
            f.channels
                .channel_calls(outsider, f.channel_id, 10, 0)
                .unwrap_err(),
            ErrorKind::NotMember
        );

        let calls = f
            .channels
            .channel_calls(f.users[0], f.channel_id, 10, 0)
            .unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, details.call.id);
        assert!(calls[0].joined);

        let calls = f
            .channels
            .channel_calls(f.users[1], f.channel_id, 10, 0)
            .unwrap();
        assert!(!calls[0].joined);
    }
}
