//! Session stickiness
//!
//! Two in-memory tables, both safe to lose:
//!
//! - bindings pin a caller's route key (a conversation or session id) to the
//!   exact channel, endpoint and credential that last served it
//! - affinity remembers the channel that last served each user and prefers it
//!   among channels of equal priority

use std::time::Duration;

use conduit_core::{Candidate, ChannelId, CredentialId, EndpointId, UserId};
use dashmap::DashMap;
use jiff::Timestamp;

/// Where a route key was last served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub channel_id: ChannelId,
    pub endpoint_id: EndpointId,
    pub credential_id: CredentialId,
    pub until: Timestamp,
}

impl Binding {
    pub fn matches(&self, candidate: &Candidate) -> bool {
        self.channel_id == candidate.channel_id
            && self.endpoint_id == candidate.endpoint_id
            && self.credential_id == candidate.credential_id
    }
}

/// Route-key bindings and per-user channel affinity
///
/// A zero TTL turns the corresponding table off.
#[derive(Debug)]
pub struct AffinityTracker {
    bindings: DashMap<(UserId, String), Binding>,
    channels: DashMap<UserId, (ChannelId, Timestamp)>,
    binding_ttl: Duration,
    affinity_ttl: Duration,
}

impl AffinityTracker {
    pub fn new(binding_ttl: Duration, affinity_ttl: Duration) -> Self {
        Self {
            bindings: DashMap::new(),
            channels: DashMap::new(),
            binding_ttl,
            affinity_ttl,
        }
    }

    /// Tracker with both tables off
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Live binding for a route key; expired ones are dropped on the way
    pub fn binding(&self, user_id: UserId, route_key: &str, now: Timestamp) -> Option<Binding> {
        let key = (user_id, route_key.to_owned());
        let binding = *self.bindings.get(&key)?;
        if binding.until > now {
            return Some(binding);
        }
        self.bindings.remove_if(&key, |_, b| b.until <= now);
        None
    }

    pub fn bind(&self, user_id: UserId, route_key: &str, candidate: &Candidate, now: Timestamp) {
        if self.binding_ttl.is_zero() {
            return;
        }
        let binding = Binding {
            channel_id: candidate.channel_id,
            endpoint_id: candidate.endpoint_id,
            credential_id: candidate.credential_id,
            until: conduit_core::time::add(now, self.binding_ttl),
        };
        self.bindings.insert((user_id, route_key.to_owned()), binding);
    }

    pub fn unbind(&self, user_id: UserId, route_key: &str) -> bool {
        self.bindings.remove(&(user_id, route_key.to_owned())).is_some()
    }

    /// Channel that last served `user_id`, while the affinity lasts
    pub fn channel_for(&self, user_id: UserId, now: Timestamp) -> Option<ChannelId> {
        self.channels
            .get(&user_id)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0)
    }

    pub fn touch(&self, user_id: UserId, channel_id: ChannelId, now: Timestamp) {
        if self.affinity_ttl.is_zero() {
            return;
        }
        let until = conduit_core::time::add(now, self.affinity_ttl);
        self.channels.insert(user_id, (channel_id, until));
    }

    /// Drop expired entries, returning how many were removed
    pub fn sweep(&self, now: Timestamp) -> usize {
        let before = self.len();
        self.bindings.retain(|_, b| b.until > now);
        self.channels.retain(|_, (_, until)| *until > now);
        before.saturating_sub(self.len())
    }

    pub fn len(&self) -> usize {
        self.bindings.len() + self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
