//! Candidate selection over a snapshot

use std::sync::Arc;

use conduit_core::{Candidate, ChannelId, ChannelKind, UserId};
use jiff::Timestamp;
use rand::Rng;

use crate::affinity::Binding;
use crate::snapshot::{ChannelEntry, GroupEntry};
use crate::{AffinityTracker, CooldownTracker, Failure, RoutingError, Snapshot};

/// Optional narrowing applied on top of group entitlement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constraints {
    /// Only channels of this kind
    pub kind: Option<ChannelKind>,
    /// Only this channel
    pub channel_id: Option<ChannelId>,
}

/// The caller behind a selection, for stickiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session<'a> {
    pub user_id: UserId,
    /// Caller-chosen conversation key; pins the conversation to one credential
    pub route_key: Option<&'a str>,
}

/// Orders channels and hands out failover iterators
#[derive(Debug, Clone)]
pub struct Scheduler {
    cooldowns: Arc<CooldownTracker>,
    affinity: Arc<AffinityTracker>,
}

impl Scheduler {
    pub const fn new(cooldowns: Arc<CooldownTracker>, affinity: Arc<AffinityTracker>) -> Self {
        Self { cooldowns, affinity }
    }

    pub fn cooldowns(&self) -> &Arc<CooldownTracker> {
        &self.cooldowns
    }

    pub fn affinity(&self) -> &Arc<AffinityTracker> {
        &self.affinity
    }

    /// Resolve `model` for a caller entitled to `groups`
    ///
    /// Channels are ordered promoted first, then by priority descending.
    /// Within a priority the session's affinity channel leads when it has
    /// not failed since its last success, then channels with fewer recent
    /// failures, then a fresh random draw per call. Each channel then
    /// expands lazily into its endpoints and credentials.
    ///
    /// A live route-key binding whose credential is still eligible is tried
    /// before all of that; a binding gone stale is dropped.
    ///
    /// # Errors
    ///
    /// - [`RoutingError::NoUsableGroup`] when no entitled group is enabled
    /// - [`RoutingError::ModelUnavailable`] when no channel serves the model
    /// - [`RoutingError::AllCoolingDown`] when every serving channel is cooling
    pub fn select(
        &self,
        snapshot: Arc<Snapshot>,
        groups: &[String],
        model: &str,
        constraints: Constraints,
        session: Option<Session<'_>>,
        now: Timestamp,
    ) -> Result<CandidateIter, RoutingError> {
        let mut usable: Vec<&GroupEntry> = Vec::with_capacity(groups.len());
        for name in groups {
            if let Some(group) = snapshot.group(name)
                && !usable.iter().any(|g| g.name == group.name)
            {
                usable.push(group);
            }
        }
        if usable.is_empty() {
            return Err(RoutingError::NoUsableGroup {
                groups: groups.to_vec(),
            });
        }

        let preferred = session
            .and_then(|s| self.affinity.channel_for(s.user_id, now))
            .filter(|id| self.cooldowns.fail_score(*id) == 0);

        let mut serving = 0_usize;
        let mut rng = rand::rng();
        let mut ordered: Vec<Rank> = Vec::new();
        for group in usable {
            for entry in &group.channels {
                let channel = &entry.channel;
                if constraints.kind.is_some_and(|k| k != channel.kind)
                    || constraints.channel_id.is_some_and(|id| id != channel.id)
                    || entry.upstream_model(model).is_none()
                {
                    continue;
                }
                serving += 1;
                if self.cooldowns.is_channel_cooling(channel.id, now)
                    || self.cooldowns.is_trial_claimed(channel.id, now)
                {
                    continue;
                }
                ordered.push(Rank {
                    promotion: channel.promotion,
                    priority: channel.priority,
                    preferred: preferred == Some(channel.id),
                    fail_score: self.cooldowns.fail_score(channel.id),
                    tiebreak: rng.random(),
                    channel_id: channel.id,
                });
            }
        }

        if serving == 0 {
            return Err(RoutingError::ModelUnavailable { model: model.to_owned() });
        }
        if ordered.is_empty() {
            return Err(RoutingError::AllCoolingDown { model: model.to_owned() });
        }

        ordered.sort_by(|a, b| {
            b.promotion
                .cmp(&a.promotion)
                .then(b.priority.cmp(&a.priority))
                .then(b.preferred.cmp(&a.preferred))
                .then(a.fail_score.cmp(&b.fail_score))
                .then(a.tiebreak.cmp(&b.tiebreak))
        });
        let channels: Vec<ChannelId> = ordered.into_iter().map(|r| r.channel_id).collect();

        let pinned = session.and_then(|s| {
            let route_key = s.route_key?;
            let binding = self.affinity.binding(s.user_id, route_key, now)?;
            let pin = self.pin(&snapshot, &channels, binding, now);
            if pin.is_none() {
                self.affinity.unbind(s.user_id, route_key);
                tracing::debug!(
                    user_id = s.user_id,
                    channel_id = binding.channel_id,
                    credential_id = binding.credential_id,
                    "route binding no longer eligible, dropped"
                );
            }
            pin
        });

        Ok(CandidateIter {
            channels,
            snapshot,
            cooldowns: Arc::clone(&self.cooldowns),
            model: model.to_owned(),
            now,
            channel: 0,
            endpoint: 0,
            credential: 0,
            pinned,
            pin_pending: pinned.is_some(),
            admitted: Vec::new(),
        })
    }

    /// Where a binding sits in the snapshot, if its credential may still serve
    fn pin(&self, snapshot: &Snapshot, channels: &[ChannelId], binding: Binding, now: Timestamp) -> Option<Pin> {
        if !channels.contains(&binding.channel_id) || self.cooldowns.fail_score(binding.channel_id) > 0 {
            return None;
        }
        let entry = snapshot.channel(binding.channel_id)?;
        let (endpoint, credential) = entry.position(binding.endpoint_id, binding.credential_id)?;
        let cred = &entry.endpoints[endpoint].credentials[credential];
        let persisted_cooling = cred.cooldown_until.is_some_and(|until| until > now);
        if persisted_cooling || self.cooldowns.is_credential_cooling(&cred.key, now) {
            return None;
        }
        Some(Pin {
            channel_id: binding.channel_id,
            endpoint,
            credential,
        })
    }

    /// Apply cooldown for a failed attempt
    pub fn report_failure(&self, snapshot: &Snapshot, candidate: &Candidate, failure: &Failure, now: Timestamp) {
        let keys = snapshot.credential_keys(candidate.channel_id);
        self.cooldowns.record_failure(candidate, failure, &keys, now);
    }

    /// Clear the candidate's cooldowns and remember it for the session
    pub fn report_success(&self, candidate: &Candidate, session: Option<Session<'_>>, now: Timestamp) {
        self.cooldowns.record_success(candidate);
        if let Some(session) = session {
            self.affinity.touch(session.user_id, candidate.channel_id, now);
            if let Some(route_key) = session.route_key {
                self.affinity.bind(session.user_id, route_key, candidate, now);
            }
        }
    }
}

#[derive(Debug)]
struct Rank {
    promotion: bool,
    priority: i32,
    preferred: bool,
    fail_score: u32,
    tiebreak: u64,
    channel_id: ChannelId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pin {
    channel_id: ChannelId,
    endpoint: usize,
    credential: usize,
}

/// Lazily materialized failover order
///
/// Cooldowns are re-checked on every step, so a channel cooled by an earlier
/// attempt of the same request is skipped from then on. A channel owed a
/// trial after its cooldown is entered only if this iterator wins the claim.
#[derive(Debug)]
pub struct CandidateIter {
    snapshot: Arc<Snapshot>,
    cooldowns: Arc<CooldownTracker>,
    channels: Vec<ChannelId>,
    model: String,
    now: Timestamp,
    channel: usize,
    endpoint: usize,
    credential: usize,
    /// Bound credential, yielded ahead of the ordered walk and skipped in it
    pinned: Option<Pin>,
    pin_pending: bool,
    /// Channels entered so far and whether the trial claim allowed it
    admitted: Vec<(ChannelId, bool)>,
}

impl CandidateIter {
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    /// Channel ids in attempt order
    pub fn channel_order(&self) -> &[ChannelId] {
        &self.channels
    }

    /// Whether the bound credential leads this iteration
    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    fn admit(&mut self, channel_id: ChannelId) -> bool {
        if let Some((_, admitted)) = self.admitted.iter().find(|(id, _)| *id == channel_id) {
            return *admitted;
        }
        let admitted = self.cooldowns.try_claim_trial(channel_id, self.now);
        self.admitted.push((channel_id, admitted));
        admitted
    }

    fn pinned_candidate(&mut self) -> Option<Candidate> {
        let pin = self.pinned?;
        let entry = self.snapshot.channel(pin.channel_id).cloned()?;
        if self.cooldowns.is_channel_cooling(pin.channel_id, self.now) || !self.admit(pin.channel_id) {
            return None;
        }
        self.make(&entry, pin.endpoint, pin.credential)
    }

    fn advance_channel(&mut self) {
        self.channel += 1;
        self.endpoint = 0;
        self.credential = 0;
    }

    fn make(&self, entry: &ChannelEntry, endpoint: usize, credential: usize) -> Option<Candidate> {
        let group = self.snapshot.group(&entry.channel.group)?;
        let endpoint = entry.endpoints.get(endpoint)?;
        let credential = endpoint.credentials.get(credential)?;
        Some(Candidate {
            channel_id: entry.channel.id,
            channel_kind: entry.channel.kind,
            group: Arc::clone(&group.name),
            group_multiplier: group.multiplier,
            cooldown: group.cooldown,
            auto_ban: entry.channel.auto_ban,
            endpoint_id: endpoint.endpoint.id,
            base_url: endpoint.endpoint.base_url.clone(),
            credential_id: credential.id,
            secret: Arc::clone(&credential.secret),
            upstream_model: entry.upstream_model(&self.model)?,
        })
    }
}

impl Iterator for CandidateIter {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        if self.pin_pending {
            self.pin_pending = false;
            match self.pinned_candidate() {
                Some(candidate) => return Some(candidate),
                None => self.pinned = None,
            }
        }
        loop {
            let channel_id = *self.channels.get(self.channel)?;
            let Some(entry) = self.snapshot.channel(channel_id).cloned() else {
                self.advance_channel();
                continue;
            };
            if self.cooldowns.is_channel_cooling(channel_id, self.now) {
                self.advance_channel();
                continue;
            }
            let Some(endpoint) = entry.endpoints.get(self.endpoint) else {
                self.advance_channel();
                continue;
            };
            let Some(credential) = endpoint.credentials.get(self.credential) else {
                self.endpoint += 1;
                self.credential = 0;
                continue;
            };

            let (endpoint_idx, credential_idx) = (self.endpoint, self.credential);
            self.credential += 1;

            let here = Pin {
                channel_id,
                endpoint: endpoint_idx,
                credential: credential_idx,
            };
            let persisted_cooling = credential.cooldown_until.is_some_and(|until| until > self.now);
            if self.pinned == Some(here)
                || persisted_cooling
                || self.cooldowns.is_credential_cooling(&credential.key, self.now)
            {
                continue;
            }
            if !self.admit(channel_id) {
                self.advance_channel();
                continue;
            }
            if let Some(candidate) = self.make(&entry, endpoint_idx, credential_idx) {
                return Some(candidate);
            }
        }
    }
}
