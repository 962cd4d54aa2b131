//! Routing graph records as persisted by the store
//!
//! Groups own channels, channels own endpoints, endpoints own credentials,
//! and channel models map public model ids onto a channel's upstream ids.

use std::time::Duration;

use jiff::Timestamp;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{ChannelId, CredentialId, EndpointId, Multiplier};

/// Group used when a plan or route names none
pub const DEFAULT_GROUP: &str = "default";

/// Upstream API family
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelKind {
    OpenaiCompatible,
    Anthropic,
    CodexOauth,
}

/// Named routing and pricing tier
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelGroup {
    pub name: String,
    pub enabled: bool,
    pub price_multiplier: Multiplier,
    /// Overrides the scheduler's base credential cooldown
    pub cooldown: Option<Duration>,
}

impl ChannelGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            price_multiplier: Multiplier::ONE,
            cooldown: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamChannel {
    pub id: ChannelId,
    pub kind: ChannelKind,
    pub group: String,
    pub priority: i32,
    pub enabled: bool,
    /// Promoted channels are tried before every non-promoted one
    pub promotion: bool,
    /// Cool the whole channel on channel-wide failures
    pub auto_ban: bool,
    /// Serve any requested model under its public id
    pub passthrough_models: bool,
}

impl UpstreamChannel {
    pub fn new(id: ChannelId, kind: ChannelKind, group: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            group: group.into(),
            priority: 0,
            enabled: true,
            promotion: false,
            auto_ban: false,
            passthrough_models: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEndpoint {
    pub id: EndpointId,
    pub channel_id: ChannelId,
    pub base_url: Url,
    pub priority: i32,
}

/// Secret material, shaped by the channel kind it authenticates against
#[derive(Debug, Clone)]
pub enum CredentialSecret {
    OpenaiCompatible {
        api_key: SecretString,
        organization: Option<String>,
    },
    Anthropic {
        api_key: SecretString,
    },
    CodexOauth {
        access_token: SecretString,
        account_id: String,
    },
}

impl CredentialSecret {
    pub const fn kind(&self) -> ChannelKind {
        match self {
            Self::OpenaiCompatible { .. } => ChannelKind::OpenaiCompatible,
            Self::Anthropic { .. } => ChannelKind::Anthropic,
            Self::CodexOauth { .. } => ChannelKind::CodexOauth,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub id: CredentialId,
    pub endpoint_id: EndpointId,
    pub enabled: bool,
    pub secret: CredentialSecret,
    /// Persisted account-level cooldown (codex accounts hitting usage caps)
    pub cooldown_until: Option<Timestamp>,
}

impl Credential {
    /// Stable key used by cooldown and admission maps: `<kind>:<id>`
    pub fn key(&self) -> String {
        credential_key(self.secret.kind(), self.id)
    }
}

pub(crate) fn credential_key(kind: ChannelKind, id: CredentialId) -> String {
    format!("{kind}:{id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelModel {
    pub channel_id: ChannelId,
    pub public_model: String,
    pub upstream_model: String,
    pub enabled: bool,
}

/// Raw routing rows, as returned by one store read
#[derive(Debug, Clone, Default)]
pub struct RoutingGraph {
    pub groups: Vec<ChannelGroup>,
    pub channels: Vec<UpstreamChannel>,
    pub endpoints: Vec<UpstreamEndpoint>,
    pub credentials: Vec<Credential>,
    pub models: Vec<ChannelModel>,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn kind_round_trips_snake_case() {
        assert_eq!(ChannelKind::OpenaiCompatible.to_string(), "openai_compatible");
        assert_eq!(ChannelKind::from_str("codex_oauth").unwrap(), ChannelKind::CodexOauth);
    }

    #[test]
    fn credential_key_uses_secret_kind() {
        let cred = Credential {
            id: 7,
            endpoint_id: 1,
            enabled: true,
            secret: CredentialSecret::Anthropic {
                api_key: SecretString::from("sk-ant"),
            },
            cooldown_until: None,
        };
        assert_eq!(cred.key(), "anthropic:7");
    }
}
