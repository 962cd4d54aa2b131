//! Indexed, immutable view of the routing graph

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::{
    ChannelGroup, ChannelId, CredentialId, CredentialSecret, EndpointId, Multiplier, RoutingGraph,
    UpstreamChannel, UpstreamEndpoint,
};
use jiff::Timestamp;

/// Routing data prepared for selection
///
/// Disabled groups, channels and credentials are dropped at build time;
/// endpoints and credentials are pre-sorted into dispatch order.
#[derive(Debug)]
pub struct Snapshot {
    groups: HashMap<String, GroupEntry>,
    channels: HashMap<ChannelId, Arc<ChannelEntry>>,
    built_at: Timestamp,
}

#[derive(Debug)]
pub(crate) struct GroupEntry {
    pub name: Arc<str>,
    pub multiplier: Multiplier,
    pub cooldown: Option<Duration>,
    pub channels: Vec<Arc<ChannelEntry>>,
}

#[derive(Debug)]
pub(crate) struct ChannelEntry {
    pub channel: UpstreamChannel,
    pub endpoints: Vec<EndpointEntry>,
    /// Enabled public model -> upstream model
    pub models: HashMap<String, String>,
    /// Whether any model row exists, enabled or not
    pub has_catalog: bool,
}

impl ChannelEntry {
    /// Upstream model id for `model`, if this channel serves it
    pub fn upstream_model(&self, model: &str) -> Option<String> {
        if let Some(upstream) = self.models.get(model) {
            return Some(upstream.clone());
        }
        (self.channel.passthrough_models || !self.has_catalog).then(|| model.to_owned())
    }

    /// Dispatch-order indices of a credential under one of this channel's endpoints
    pub fn position(&self, endpoint_id: EndpointId, credential_id: CredentialId) -> Option<(usize, usize)> {
        let endpoint = self.endpoints.iter().position(|e| e.endpoint.id == endpoint_id)?;
        let credential = self.endpoints[endpoint]
            .credentials
            .iter()
            .position(|c| c.id == credential_id)?;
        Some((endpoint, credential))
    }

    pub fn credential_keys(&self) -> impl Iterator<Item = &str> {
        self.endpoints
            .iter()
            .flat_map(|e| e.credentials.iter().map(|c| c.key.as_str()))
    }
}

#[derive(Debug)]
pub(crate) struct EndpointEntry {
    pub endpoint: UpstreamEndpoint,
    pub credentials: Vec<CredentialEntry>,
}

#[derive(Debug)]
pub(crate) struct CredentialEntry {
    pub id: CredentialId,
    pub key: String,
    pub secret: Arc<CredentialSecret>,
    /// Persisted account cooldown
    pub cooldown_until: Option<Timestamp>,
}

impl Snapshot {
    pub fn build(graph: RoutingGraph, built_at: Timestamp) -> Self {
        let RoutingGraph {
            groups,
            channels,
            endpoints,
            credentials,
            models,
        } = graph;

        let group_rows: HashMap<String, ChannelGroup> = groups.into_iter().map(|g| (g.name.clone(), g)).collect();

        let mut creds_by_endpoint: HashMap<i64, Vec<CredentialEntry>> = HashMap::new();
        for credential in credentials.into_iter().filter(|c| c.enabled) {
            creds_by_endpoint
                .entry(credential.endpoint_id)
                .or_default()
                .push(CredentialEntry {
                    id: credential.id,
                    key: credential.key(),
                    secret: Arc::new(credential.secret),
                    cooldown_until: credential.cooldown_until,
                });
        }

        let mut endpoints_by_channel: HashMap<ChannelId, Vec<EndpointEntry>> = HashMap::new();
        for endpoint in endpoints {
            let mut credentials = creds_by_endpoint.remove(&endpoint.id).unwrap_or_default();
            credentials.sort_by(|a, b| b.id.cmp(&a.id));
            endpoints_by_channel
                .entry(endpoint.channel_id)
                .or_default()
                .push(EndpointEntry { endpoint, credentials });
        }

        let mut models_by_channel: HashMap<ChannelId, (HashMap<String, String>, bool)> = HashMap::new();
        for model in models {
            let entry = models_by_channel.entry(model.channel_id).or_default();
            entry.1 = true;
            if model.enabled {
                entry.0.insert(model.public_model, model.upstream_model);
            }
        }

        let mut out = Self {
            groups: HashMap::new(),
            channels: HashMap::new(),
            built_at,
        };

        for channel in channels.into_iter().filter(|c| c.enabled) {
            let group_row = group_rows.get(&channel.group);
            if group_row.is_some_and(|g| !g.enabled) {
                continue;
            }

            let mut endpoints = endpoints_by_channel.remove(&channel.id).unwrap_or_default();
            endpoints.sort_by(|a, b| {
                b.endpoint
                    .priority
                    .cmp(&a.endpoint.priority)
                    .then(b.endpoint.id.cmp(&a.endpoint.id))
            });
            let (models, has_catalog) = models_by_channel.remove(&channel.id).unwrap_or_default();

            let group = out.groups.entry(channel.group.clone()).or_insert_with(|| GroupEntry {
                name: Arc::from(channel.group.as_str()),
                multiplier: group_row.map_or(Multiplier::ONE, |g| g.price_multiplier),
                cooldown: group_row.and_then(|g| g.cooldown),
                channels: Vec::new(),
            });
            let entry = Arc::new(ChannelEntry {
                channel,
                endpoints,
                models,
                has_catalog,
            });
            group.channels.push(Arc::clone(&entry));
            out.channels.insert(entry.channel.id, entry);
        }

        out
    }

    pub const fn built_at(&self) -> Timestamp {
        self.built_at
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Whether `channel_id` is present and selectable
    pub fn has_channel(&self, channel_id: ChannelId) -> bool {
        self.channels.contains_key(&channel_id)
    }

    /// Price multiplier of a group that has at least one selectable channel
    pub fn group_multiplier(&self, name: &str) -> Option<Multiplier> {
        self.groups.get(name).map(|g| g.multiplier)
    }

    pub(crate) fn group(&self, name: &str) -> Option<&GroupEntry> {
        self.groups.get(name)
    }

    pub(crate) fn channel(&self, id: ChannelId) -> Option<&Arc<ChannelEntry>> {
        self.channels.get(&id)
    }

    /// Keys of every enabled credential under a channel
    pub fn credential_keys(&self, channel_id: ChannelId) -> Vec<String> {
        self.channels
            .get(&channel_id)
            .map(|c| c.credential_keys().map(str::to_owned).collect())
            .unwrap_or_default()
    }
}
