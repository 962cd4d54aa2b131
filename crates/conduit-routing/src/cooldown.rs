//! Per-process cooldown tracking for channels and credentials
//!
//! Entries are in-memory only and safe to lose: a restarted process simply
//! rediscovers a failing upstream on its next attempt.
//!
//! Besides resume times the tracker keeps a failure score per channel, reset
//! by the next success, and a trial mark for every channel it cooled. Once
//! such a channel's cooldown lapses, one request at a time may claim the
//! trial and try it; the others keep away until the claim expires or the
//! trial reports back.

use std::time::Duration;

use conduit_core::{Candidate, ChannelId};
use dashmap::DashMap;
use jiff::Timestamp;

/// What the executor observed about a failed attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Failure {
    /// Upstream status, `None` for connect and timeout failures
    pub status: Option<u16>,
    /// The failure implicates the whole channel (unreachable host, timeout)
    pub channel_wide: bool,
    /// Upstream-supplied resume time (rate-limit reset)
    pub retry_at: Option<Timestamp>,
}

impl Failure {
    pub const fn status(status: u16) -> Self {
        Self {
            status: Some(status),
            channel_wide: false,
            retry_at: None,
        }
    }

    pub const fn network() -> Self {
        Self {
            status: None,
            channel_wide: true,
            retry_at: None,
        }
    }

    #[must_use]
    pub const fn retry_at(mut self, at: Option<Timestamp>) -> Self {
        self.retry_at = at;
        self
    }
}

const DEFAULT_TRIAL_CLAIM_TTL: Duration = Duration::from_secs(30);

/// Resume times keyed by credential key and by channel id
#[derive(Debug)]
pub struct CooldownTracker {
    credentials: DashMap<String, Timestamp>,
    channels: DashMap<ChannelId, Timestamp>,
    /// Failures since the channel last succeeded
    fail_scores: DashMap<ChannelId, u32>,
    /// Channels owed a trial; `Some` while a request holds the claim
    trials: DashMap<ChannelId, Option<Timestamp>>,
    base: Duration,
    trial_claim_ttl: Duration,
}

impl CooldownTracker {
    pub fn new(base: Duration) -> Self {
        Self {
            credentials: DashMap::new(),
            channels: DashMap::new(),
            fail_scores: DashMap::new(),
            trials: DashMap::new(),
            base,
            trial_claim_ttl: DEFAULT_TRIAL_CLAIM_TTL,
        }
    }

    #[must_use]
    pub const fn with_trial_claim_ttl(mut self, ttl: Duration) -> Self {
        self.trial_claim_ttl = ttl;
        self
    }

    pub fn is_credential_cooling(&self, key: &str, now: Timestamp) -> bool {
        self.credentials.get(key).is_some_and(|until| *until > now)
    }

    pub fn is_channel_cooling(&self, channel_id: ChannelId, now: Timestamp) -> bool {
        self.channels.get(&channel_id).is_some_and(|until| *until > now)
    }

    pub fn channel_cooldown(&self, channel_id: ChannelId) -> Option<Timestamp> {
        self.channels.get(&channel_id).map(|until| *until)
    }

    pub fn fail_score(&self, channel_id: ChannelId) -> u32 {
        self.fail_scores.get(&channel_id).map_or(0, |score| *score)
    }

    /// Whether another request currently holds the channel's trial
    pub fn is_trial_claimed(&self, channel_id: ChannelId, now: Timestamp) -> bool {
        self.trials
            .get(&channel_id)
            .is_some_and(|claim| claim.is_some_and(|until| until > now))
    }

    /// Take the right to send the first request to a recovering channel
    ///
    /// Channels not owed a trial are always granted. A lapsed claim can be
    /// taken over.
    pub fn try_claim_trial(&self, channel_id: ChannelId, now: Timestamp) -> bool {
        let Some(mut claim) = self.trials.get_mut(&channel_id) else {
            return true;
        };
        if claim.is_some_and(|until| until > now) {
            return false;
        }
        *claim = Some(conduit_core::time::add(now, self.trial_claim_ttl));
        tracing::debug!(channel_id, "channel trial claimed");
        true
    }

    /// Cooldown length for a failure on `candidate`: the group's own
    /// duration or the base, doubled for 429
    pub fn duration_for(&self, candidate: &Candidate, failure: &Failure) -> Duration {
        let base = candidate.cooldown.unwrap_or(self.base);
        if failure.status == Some(429) {
            base.saturating_mul(2)
        } else {
            base
        }
    }

    /// Cool the candidate's credential, and its channel when the failure is
    /// channel-wide on an auto-ban channel or no sibling credential is left
    ///
    /// Returns the credential's resume time.
    pub fn record_failure(
        &self,
        candidate: &Candidate,
        failure: &Failure,
        channel_credential_keys: &[String],
        now: Timestamp,
    ) -> Timestamp {
        let mut until = conduit_core::time::add(now, self.duration_for(candidate, failure));
        if let Some(retry_at) = failure.retry_at
            && retry_at > until
        {
            until = retry_at;
        }

        let key = candidate.credential_key();
        extend(&self.credentials, key.clone(), until);
        *self.fail_scores.entry(candidate.channel_id).or_insert(0) += 1;
        // The attempt was the trial, if one was owed; a renewed cooldown owes another
        self.trials.remove(&candidate.channel_id);

        if candidate.auto_ban && failure.channel_wide {
            self.cool_channel(candidate.channel_id, until);
            tracing::warn!(
                channel_id = candidate.channel_id,
                status = ?failure.status,
                until = %until,
                "channel cooled after channel-wide failure"
            );
            return until;
        }

        let earliest_sibling = channel_credential_keys
            .iter()
            .map(|k| self.credentials.get(k).map(|t| *t).filter(|t| *t > now))
            .try_fold(Timestamp::MAX, |acc, t| t.map(|t| acc.min(t)));
        if let Some(resume) = earliest_sibling
            && !channel_credential_keys.is_empty()
        {
            self.cool_channel(candidate.channel_id, resume);
            tracing::info!(
                channel_id = candidate.channel_id,
                until = %resume,
                "every credential cooling, channel cooled"
            );
        }

        tracing::debug!(credential = %key, status = ?failure.status, until = %until, "credential cooled");
        until
    }

    /// A success proves the channel healthy again
    pub fn record_success(&self, candidate: &Candidate) {
        self.channels.remove(&candidate.channel_id);
        self.credentials.remove(&candidate.credential_key());
        self.fail_scores.remove(&candidate.channel_id);
        if self.trials.remove(&candidate.channel_id).is_some() {
            tracing::info!(channel_id = candidate.channel_id, "channel recovered");
        }
    }

    /// Lift a channel cooldown by hand
    pub fn clear_channel(&self, channel_id: ChannelId) -> bool {
        self.fail_scores.remove(&channel_id);
        self.trials.remove(&channel_id);
        self.channels.remove(&channel_id).is_some()
    }

    pub fn clear_credential(&self, key: &str) -> bool {
        self.credentials.remove(key).is_some()
    }

    fn cool_channel(&self, channel_id: ChannelId, until: Timestamp) {
        extend(&self.channels, channel_id, until);
        self.trials.insert(channel_id, None);
    }

    /// Drop expired entries, returning how many were removed
    ///
    /// Trial marks and fail scores outlive the cooldown and stay.
    pub fn sweep(&self, now: Timestamp) -> usize {
        let before = self.credentials.len() + self.channels.len();
        self.credentials.retain(|_, until| *until > now);
        self.channels.retain(|_, until| *until > now);
        before.saturating_sub(self.credentials.len() + self.channels.len())
    }

    pub fn len(&self) -> usize {
        self.credentials.len() + self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Insert or push back an entry, never shortening an existing cooldown
fn extend<K: Eq + std::hash::Hash>(map: &DashMap<K, Timestamp>, key: K, until: Timestamp) {
    map.entry(key)
        .and_modify(|existing| {
            if until > *existing {
                *existing = until;
            }
        })
        .or_insert(until);
}
