use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::routing::credential_key;
use crate::{ChannelId, ChannelKind, CredentialId, CredentialSecret, EndpointId, Multiplier};

/// One dispatchable (channel, endpoint, credential) triple
///
/// Selection, cooldown and billing only read the ids, group and multiplier.
/// The executor is the sole consumer of `secret` and `base_url`.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub channel_id: ChannelId,
    pub channel_kind: ChannelKind,
    /// Winning group for this attempt
    pub group: Arc<str>,
    pub group_multiplier: Multiplier,
    /// Group-configured cooldown, if any
    pub cooldown: Option<Duration>,
    pub auto_ban: bool,
    pub endpoint_id: EndpointId,
    pub base_url: Url,
    pub credential_id: CredentialId,
    pub secret: Arc<CredentialSecret>,
    /// Model id to send upstream
    pub upstream_model: String,
}

impl Candidate {
    pub fn credential_key(&self) -> String {
        credential_key(self.secret.kind(), self.credential_id)
    }
}
