//! Tenant and routing rows seeded straight into a store

use conduit_core::{
    ChannelGroup, ChannelId, ChannelKind, Credential, CredentialSecret, Multiplier, UpstreamChannel, UpstreamEndpoint,
    UsdMicros,
};
use conduit_gateway::{GatewayRequest, UpstreamRequest};
use conduit_routing::Constraints;
use conduit_store::{ModelPricing, Store, TokenRecord, User};
use secrecy::SecretString;

pub const RAW_TOKEN: &str = "sk-integration";
pub const MODEL: &str = "gpt-4o";

/// User 1 with token 1 in group `default`, `gpt-4o` at $10/1M input tokens
pub async fn seed_tenant(store: &dyn Store, balance: UsdMicros) -> anyhow::Result<()> {
    store.upsert_channel_group(ChannelGroup::new("default")).await?;
    store
        .upsert_user(User {
            id: 1,
            main_group: "default".to_owned(),
            enabled: true,
        })
        .await?;
    store
        .upsert_token(TokenRecord {
            id: 1,
            user_id: 1,
            token_hash: conduit_auth::sha256_hex(RAW_TOKEN),
            enabled: true,
            groups: vec!["default".to_owned()],
            expires_at: None,
        })
        .await?;
    store
        .upsert_model_pricing(ModelPricing {
            model: MODEL.to_owned(),
            input_per_million: UsdMicros::from_usd(10.0),
            output_per_million: UsdMicros::ZERO,
            cache_input_per_million: UsdMicros::ZERO,
            cache_output_per_million: UsdMicros::ZERO,
        })
        .await?;
    store.credit_balance(1, balance).await?;
    Ok(())
}

/// OpenAI-compatible channel in `default` with one endpoint (`id * 10`) and
/// one credential (`id * 100`, key `sk-<credential id>`)
pub async fn add_channel(store: &dyn Store, id: ChannelId, priority: i32, base_url: &str) -> anyhow::Result<()> {
    let mut channel = UpstreamChannel::new(id, ChannelKind::OpenaiCompatible, "default");
    channel.priority = priority;
    store.upsert_channel(channel).await?;
    store
        .upsert_endpoint(UpstreamEndpoint {
            id: id * 10,
            channel_id: id,
            base_url: base_url.parse()?,
            priority: 0,
        })
        .await?;
    store
        .upsert_credential(Credential {
            id: id * 100,
            endpoint_id: id * 10,
            enabled: true,
            secret: CredentialSecret::OpenaiCompatible {
                api_key: SecretString::from(format!("sk-{}", id * 100)),
                organization: None,
            },
            cooldown_until: None,
        })
        .await?;
    Ok(())
}

pub async fn set_group_multiplier(store: &dyn Store, name: &str, multiplier: f64) -> anyhow::Result<()> {
    let mut group = ChannelGroup::new(name);
    group.price_multiplier = Multiplier::from_f64(multiplier);
    store.upsert_channel_group(group).await?;
    Ok(())
}

/// Non-streaming chat completion for `gpt-4o`
pub fn chat_request(request_id: &str) -> GatewayRequest {
    let body = serde_json::json!({
        "model": MODEL,
        "messages": [{"role": "user", "content": "Hello"}]
    });
    GatewayRequest {
        request_id: request_id.to_owned(),
        model: MODEL.to_owned(),
        upstream: UpstreamRequest::post("/v1/chat/completions", body.to_string().into_bytes()),
        stream: false,
        input_tokens: None,
        max_output_tokens: None,
        constraints: Constraints::default(),
        route_key: None,
    }
}
