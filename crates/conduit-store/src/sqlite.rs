//! SQLite backend
//!
//! Every call opens its own connection on the blocking pool. WAL mode lets
//! several gateway processes on one host share the database file, and the
//! ledger writes run inside `BEGIN IMMEDIATE` so concurrent reservations
//! against one balance serialize on the write lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::time::{from_millis, to_millis};
use conduit_core::{
    ChannelGroup, ChannelId, ChannelKind, ChannelModel, Credential, CredentialId, CredentialSecret, Multiplier,
    RoutingGraph, SubscriptionId, TokenId, UpstreamChannel, UpstreamEndpoint, UsageEventId, UserId, UsdMicros,
};
use jiff::Timestamp;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::types::{check_windows, settle};
use crate::{
    ActiveSubscription, CommitUsage, Funding, MainGroup, ModelPricing, ReserveUsage, Result, RetentionReport, Store,
    StoreError, Subscription, SubscriptionPlan, TokenAuth, TokenCounts, TokenRecord, UsageDetails, UsageEvent,
    UsageRollup, UsageState, User, WindowUsage, normalize_invalidation_key, resolve_groups,
};

const DAY_MS: i64 = 86_400_000;

const EVENT_COLUMNS: &str = "id, request_id, user_id, token_id, model, funding, subscription_id, state, \
     input_tokens, cached_input_tokens, output_tokens, cached_output_tokens, reserved_usd_micros, \
     committed_usd_micros, reserve_expires_at_ms, created_at_ms, updated_at_ms, channel_id, endpoint_id, \
     credential_id, route_group, status_code, latency_ms, error_class";

const SUBSCRIPTION_COLUMNS: &str = "s.id, s.user_id, s.plan_id, s.start_at_ms, s.end_at_ms, p.id, p.name, \
     p.group_name, p.price_multiplier, p.limit_5h_micros, p.limit_1d_micros, p.limit_7d_micros, p.limit_30d_micros";

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and ensure the schema
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be
    /// created
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: path.into() };
        store
            .with_conn(|conn| {
                init_schema(conn)?;
                Ok(())
            })
            .await?;
        tracing::debug!(path = %store.path.display(), "sqlite store ready");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut conn = open_connection(&path)?;
            f(&mut conn)
        })
        .await?
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        r"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        ",
    )?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS channel_groups (
            name TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL,
            price_multiplier INTEGER NOT NULL,
            cooldown_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY,
            kind TEXT NOT NULL,
            group_name TEXT NOT NULL,
            priority INTEGER NOT NULL,
            enabled INTEGER NOT NULL,
            promotion INTEGER NOT NULL,
            auto_ban INTEGER NOT NULL,
            passthrough_models INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS endpoints (
            id INTEGER PRIMARY KEY,
            channel_id INTEGER NOT NULL REFERENCES channels(id),
            base_url TEXT NOT NULL,
            priority INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS credentials (
            id INTEGER PRIMARY KEY,
            endpoint_id INTEGER NOT NULL REFERENCES endpoints(id),
            enabled INTEGER NOT NULL,
            kind TEXT NOT NULL,
            secret TEXT NOT NULL,
            organization TEXT,
            account_id TEXT,
            cooldown_until_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS channel_models (
            channel_id INTEGER NOT NULL REFERENCES channels(id),
            public_model TEXT NOT NULL,
            upstream_model TEXT NOT NULL,
            enabled INTEGER NOT NULL,
            PRIMARY KEY (channel_id, public_model)
        );

        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            main_group TEXT NOT NULL,
            enabled INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS main_groups (
            name TEXT PRIMARY KEY,
            subgroups TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tokens (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL,
            token_hash TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL,
            groups TEXT NOT NULL,
            expires_at_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS cache_invalidation (
            key TEXT PRIMARY KEY,
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS model_pricing (
            model TEXT PRIMARY KEY,
            input_micros INTEGER NOT NULL,
            output_micros INTEGER NOT NULL,
            cache_input_micros INTEGER NOT NULL,
            cache_output_micros INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS balances (
            user_id INTEGER PRIMARY KEY,
            balance_micros INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS subscription_plans (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            group_name TEXT NOT NULL,
            price_multiplier INTEGER NOT NULL,
            limit_5h_micros INTEGER NOT NULL,
            limit_1d_micros INTEGER NOT NULL,
            limit_7d_micros INTEGER NOT NULL,
            limit_30d_micros INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS subscriptions (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL,
            plan_id INTEGER NOT NULL REFERENCES subscription_plans(id),
            start_at_ms INTEGER NOT NULL,
            end_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_subscriptions_user ON subscriptions(user_id, end_at_ms);

        CREATE TABLE IF NOT EXISTS usage_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL UNIQUE,
            user_id INTEGER NOT NULL,
            token_id INTEGER NOT NULL,
            model TEXT,
            funding TEXT NOT NULL,
            subscription_id INTEGER,
            state TEXT NOT NULL,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            cached_input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cached_output_tokens INTEGER NOT NULL DEFAULT 0,
            reserved_usd_micros INTEGER NOT NULL,
            committed_usd_micros INTEGER,
            reserve_expires_at_ms INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            channel_id INTEGER,
            endpoint_id INTEGER,
            credential_id INTEGER,
            route_group TEXT,
            status_code INTEGER,
            latency_ms INTEGER,
            error_class TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_usage_events_state_expiry
            ON usage_events(state, reserve_expires_at_ms);
        CREATE INDEX IF NOT EXISTS idx_usage_events_subscription
            ON usage_events(subscription_id, state, created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_usage_events_user ON usage_events(user_id, id);

        CREATE TABLE IF NOT EXISTS usage_rollups (
            day_ms INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            model TEXT NOT NULL,
            requests INTEGER NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            cached_input_tokens INTEGER NOT NULL,
            cached_output_tokens INTEGER NOT NULL,
            committed_usd_micros INTEGER NOT NULL,
            PRIMARY KEY (day_ms, user_id, model)
        );
        ",
    )?;
    Ok(())
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::from(message))
}

fn join_list(items: &[String]) -> String {
    items.join(",")
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn duration_to_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn ms_to_duration(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelGroup> {
    Ok(ChannelGroup {
        name: row.get(0)?,
        enabled: row.get(1)?,
        price_multiplier: Multiplier::from_millionths(row.get(2)?),
        cooldown: row.get::<_, Option<i64>>(3)?.map(ms_to_duration),
    })
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<UpstreamChannel> {
    let kind: String = row.get(1)?;
    let kind: ChannelKind = kind
        .parse()
        .map_err(|_| conversion_error(1, format!("unknown channel kind {kind}")))?;
    Ok(UpstreamChannel {
        id: row.get(0)?,
        kind,
        group: row.get(2)?,
        priority: row.get(3)?,
        enabled: row.get(4)?,
        promotion: row.get(5)?,
        auto_ban: row.get(6)?,
        passthrough_models: row.get(7)?,
    })
}

fn endpoint_from_row(row: &Row<'_>) -> rusqlite::Result<UpstreamEndpoint> {
    let base_url: String = row.get(2)?;
    Ok(UpstreamEndpoint {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        base_url: Url::parse(&base_url).map_err(|e| conversion_error(2, e.to_string()))?,
        priority: row.get(3)?,
    })
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    let kind: String = row.get(3)?;
    let secret = SecretString::from(row.get::<_, String>(4)?);
    let secret = match kind.parse::<ChannelKind>() {
        Ok(ChannelKind::OpenaiCompatible) => CredentialSecret::OpenaiCompatible {
            api_key: secret,
            organization: row.get(5)?,
        },
        Ok(ChannelKind::Anthropic) => CredentialSecret::Anthropic { api_key: secret },
        Ok(ChannelKind::CodexOauth) => CredentialSecret::CodexOauth {
            access_token: secret,
            account_id: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        },
        Err(_) => return Err(conversion_error(3, format!("unknown credential kind {kind}"))),
    };
    Ok(Credential {
        id: row.get(0)?,
        endpoint_id: row.get(1)?,
        enabled: row.get(2)?,
        secret,
        cooldown_until: row.get::<_, Option<i64>>(7)?.map(from_millis),
    })
}

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelModel> {
    Ok(ChannelModel {
        channel_id: row.get(0)?,
        public_model: row.get(1)?,
        upstream_model: row.get(2)?,
        enabled: row.get(3)?,
    })
}

fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<ActiveSubscription> {
    Ok(ActiveSubscription {
        subscription: Subscription {
            id: row.get(0)?,
            user_id: row.get(1)?,
            plan_id: row.get(2)?,
            start_at: from_millis(row.get(3)?),
            end_at: from_millis(row.get(4)?),
        },
        plan: SubscriptionPlan {
            id: row.get(5)?,
            name: row.get(6)?,
            group: row.get(7)?,
            price_multiplier: Multiplier::from_millionths(row.get(8)?),
            limit_5h: UsdMicros::from_micros(row.get(9)?),
            limit_1d: UsdMicros::from_micros(row.get(10)?),
            limit_7d: UsdMicros::from_micros(row.get(11)?),
            limit_30d: UsdMicros::from_micros(row.get(12)?),
        },
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<UsageEvent> {
    let funding: String = row.get(5)?;
    let funding = Funding::from_parts(&funding, row.get(6)?)
        .ok_or_else(|| conversion_error(5, format!("unknown funding {funding}")))?;
    let state: String = row.get(7)?;
    let state: UsageState = state
        .parse()
        .map_err(|_| conversion_error(7, format!("unknown usage state {state}")))?;
    Ok(UsageEvent {
        id: row.get(0)?,
        request_id: row.get(1)?,
        user_id: row.get(2)?,
        token_id: row.get(3)?,
        model: row.get(4)?,
        funding,
        state,
        tokens: TokenCounts {
            input: row.get(8)?,
            cached_input: row.get(9)?,
            output: row.get(10)?,
            cached_output: row.get(11)?,
        },
        reserved_usd: UsdMicros::from_micros(row.get(12)?),
        committed_usd: row.get::<_, Option<i64>>(13)?.map(UsdMicros::from_micros),
        reserve_expires_at: from_millis(row.get(14)?),
        created_at: from_millis(row.get(15)?),
        updated_at: from_millis(row.get(16)?),
        details: UsageDetails {
            channel_id: row.get(17)?,
            endpoint_id: row.get(18)?,
            credential_id: row.get(19)?,
            route_group: row.get(20)?,
            status_code: row.get::<_, Option<i64>>(21)?.and_then(|c| u16::try_from(c).ok()),
            latency_ms: row.get(22)?,
            error_class: row.get(23)?,
        },
    })
}

fn load_subscription(conn: &Connection, id: SubscriptionId) -> Result<Option<ActiveSubscription>> {
    let sql = format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions s JOIN subscription_plans p ON p.id = s.plan_id \
         WHERE s.id = ?1"
    );
    Ok(conn.query_row(&sql, params![id], subscription_from_row).optional()?)
}

fn load_event(conn: &Connection, id: UsageEventId) -> Result<Option<UsageEvent>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM usage_events WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], event_from_row).optional()?)
}

fn load_reserved_event(conn: &Connection, id: UsageEventId) -> Result<UsageEvent> {
    let event = load_event(conn, id)?.ok_or_else(|| StoreError::not_found("usage event", id))?;
    if event.state != UsageState::Reserved {
        return Err(StoreError::InvalidState { id, state: event.state });
    }
    Ok(event)
}

fn window_usage(
    conn: &Connection,
    subscription_id: SubscriptionId,
    since: Timestamp,
    now: Timestamp,
) -> Result<WindowUsage> {
    let (committed, reserved): (i64, i64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN state = 'committed' AND created_at_ms >= ?2
                THEN COALESCE(committed_usd_micros, 0) ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN state = 'reserved' AND reserve_expires_at_ms >= ?3
                THEN reserved_usd_micros ELSE 0 END), 0)
         FROM usage_events WHERE subscription_id = ?1",
        params![subscription_id, to_millis(since), to_millis(now)],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(WindowUsage {
        committed: UsdMicros::from_micros(committed),
        reserved: UsdMicros::from_micros(reserved),
    })
}

fn read_balance(conn: &Connection, user_id: UserId) -> Result<UsdMicros> {
    let micros: Option<i64> = conn
        .query_row(
            "SELECT balance_micros FROM balances WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(UsdMicros::from_micros(micros.unwrap_or(0)))
}

fn add_balance(conn: &Connection, user_id: UserId, delta: UsdMicros) -> Result<()> {
    conn.execute(
        "INSERT INTO balances (user_id, balance_micros) VALUES (?1, ?2)
         ON CONFLICT(user_id) DO UPDATE SET balance_micros = balance_micros + excluded.balance_micros",
        params![user_id, delta.micros()],
    )?;
    Ok(())
}

/// Mark a reservation finalized without charge, returning its hold
fn release_event(
    conn: &Connection,
    event: &UsageEvent,
    state: UsageState,
    details: Option<&UsageDetails>,
    now: Timestamp,
) -> Result<()> {
    let details = details.unwrap_or(&event.details);
    conn.execute(
        "UPDATE usage_events SET state = ?2, committed_usd_micros = 0, updated_at_ms = ?3,
            channel_id = ?4, endpoint_id = ?5, credential_id = ?6, route_group = ?7, status_code = ?8,
            latency_ms = ?9, error_class = ?10
         WHERE id = ?1 AND state = 'reserved'",
        params![
            event.id,
            state.as_ref(),
            to_millis(now),
            details.channel_id,
            details.endpoint_id,
            details.credential_id,
            details.route_group,
            details.status_code.map(i64::from),
            details.latency_ms,
            details.error_class,
        ],
    )?;
    if event.funding == Funding::Balance {
        add_balance(conn, event.user_id, event.reserved_usd)?;
    }
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn routing_graph(&self) -> Result<RoutingGraph> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let graph = {
                let groups = tx
                    .prepare("SELECT name, enabled, price_multiplier, cooldown_ms FROM channel_groups ORDER BY name")?
                    .query_map([], group_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let channels = tx
                    .prepare(
                        "SELECT id, kind, group_name, priority, enabled, promotion, auto_ban, passthrough_models
                         FROM channels ORDER BY id",
                    )?
                    .query_map([], channel_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let endpoints = tx
                    .prepare("SELECT id, channel_id, base_url, priority FROM endpoints ORDER BY id")?
                    .query_map([], endpoint_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let credentials = tx
                    .prepare(
                        "SELECT id, endpoint_id, enabled, kind, secret, organization, account_id, cooldown_until_ms
                         FROM credentials ORDER BY id",
                    )?
                    .query_map([], credential_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let models = tx
                    .prepare(
                        "SELECT channel_id, public_model, upstream_model, enabled
                         FROM channel_models ORDER BY channel_id, public_model",
                    )?
                    .query_map([], model_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                RoutingGraph {
                    groups,
                    channels,
                    endpoints,
                    credentials,
                    models,
                }
            };
            tx.commit()?;
            Ok(graph)
        })
        .await
    }

    async fn channel_group(&self, name: &str) -> Result<Option<ChannelGroup>> {
        let name = name.to_owned();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT name, enabled, price_multiplier, cooldown_ms FROM channel_groups WHERE name = ?1",
                    params![name],
                    group_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn upsert_channel_group(&self, group: ChannelGroup) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO channel_groups (name, enabled, price_multiplier, cooldown_ms) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET enabled = excluded.enabled,
                    price_multiplier = excluded.price_multiplier, cooldown_ms = excluded.cooldown_ms",
                params![
                    group.name,
                    group.enabled,
                    group.price_multiplier.millionths(),
                    group.cooldown.map(duration_to_ms),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn upsert_channel(&self, channel: UpstreamChannel) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO channels (id, kind, group_name, priority, enabled, promotion, auto_ban, passthrough_models)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, group_name = excluded.group_name,
                    priority = excluded.priority, enabled = excluded.enabled, promotion = excluded.promotion,
                    auto_ban = excluded.auto_ban, passthrough_models = excluded.passthrough_models",
                params![
                    channel.id,
                    channel.kind.as_ref(),
                    channel.group,
                    channel.priority,
                    channel.enabled,
                    channel.promotion,
                    channel.auto_ban,
                    channel.passthrough_models,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_channel_enabled(&self, id: ChannelId, enabled: bool) -> Result<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute("UPDATE channels SET enabled = ?2 WHERE id = ?1", params![id, enabled])?;
            if changed == 0 {
                return Err(StoreError::not_found("channel", id));
            }
            Ok(())
        })
        .await
    }

    async fn upsert_endpoint(&self, endpoint: UpstreamEndpoint) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO endpoints (id, channel_id, base_url, priority) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET channel_id = excluded.channel_id, base_url = excluded.base_url,
                    priority = excluded.priority",
                params![
                    endpoint.id,
                    endpoint.channel_id,
                    endpoint.base_url.as_str(),
                    endpoint.priority
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn upsert_credential(&self, credential: Credential) -> Result<()> {
        self.with_conn(move |conn| {
            let (secret, organization, account_id) = match &credential.secret {
                CredentialSecret::OpenaiCompatible { api_key, organization } => {
                    (api_key.expose_secret().to_owned(), organization.clone(), None)
                }
                CredentialSecret::Anthropic { api_key } => (api_key.expose_secret().to_owned(), None, None),
                CredentialSecret::CodexOauth {
                    access_token,
                    account_id,
                } => (access_token.expose_secret().to_owned(), None, Some(account_id.clone())),
            };
            conn.execute(
                "INSERT INTO credentials
                    (id, endpoint_id, enabled, kind, secret, organization, account_id, cooldown_until_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET endpoint_id = excluded.endpoint_id, enabled = excluded.enabled,
                    kind = excluded.kind, secret = excluded.secret, organization = excluded.organization,
                    account_id = excluded.account_id, cooldown_until_ms = excluded.cooldown_until_ms",
                params![
                    credential.id,
                    credential.endpoint_id,
                    credential.enabled,
                    credential.secret.kind().as_ref(),
                    secret,
                    organization,
                    account_id,
                    credential.cooldown_until.map(to_millis),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_credential_enabled(&self, id: CredentialId, enabled: bool) -> Result<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute("UPDATE credentials SET enabled = ?2 WHERE id = ?1", params![id, enabled])?;
            if changed == 0 {
                return Err(StoreError::not_found("credential", id));
            }
            Ok(())
        })
        .await
    }

    async fn set_credential_cooldown(&self, id: CredentialId, until: Option<Timestamp>) -> Result<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE credentials SET cooldown_until_ms = ?2 WHERE id = ?1",
                params![id, until.map(to_millis)],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("credential", id));
            }
            Ok(())
        })
        .await
    }

    async fn upsert_channel_model(&self, model: ChannelModel) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO channel_models (channel_id, public_model, upstream_model, enabled)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(channel_id, public_model) DO UPDATE SET upstream_model = excluded.upstream_model,
                    enabled = excluded.enabled",
                params![model.channel_id, model.public_model, model.upstream_model, model.enabled],
            )?;
            Ok(())
        })
        .await
    }

    async fn token_auth_by_hash(&self, token_hash: &str, now: Timestamp) -> Result<Option<TokenAuth>> {
        let token_hash = token_hash.to_owned();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT t.id, t.user_id, t.groups, g.subgroups, t.expires_at_ms
                     FROM tokens t
                     JOIN users u ON u.id = t.user_id
                     LEFT JOIN main_groups g ON g.name = u.main_group
                     WHERE t.token_hash = ?1 AND t.enabled = 1 AND u.enabled = 1
                        AND (t.expires_at_ms IS NULL OR t.expires_at_ms > ?2)",
                    params![token_hash, to_millis(now)],
                    |row| {
                        Ok((
                            row.get::<_, TokenId>(0)?,
                            row.get::<_, UserId>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<i64>>(4)?,
                        ))
                    },
                )
                .optional()?;
            Ok(row.map(|(token_id, user_id, groups, subgroups, expires_at_ms)| {
                let subgroups = subgroups.as_deref().map(split_list);
                TokenAuth {
                    token_id,
                    user_id,
                    groups: resolve_groups(&split_list(&groups), subgroups.as_deref()),
                    expires_at: expires_at_ms.map(from_millis),
                }
            }))
        })
        .await
    }

    async fn upsert_user(&self, user: User) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (id, main_group, enabled) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET main_group = excluded.main_group, enabled = excluded.enabled",
                params![user.id, user.main_group, user.enabled],
            )?;
            Ok(())
        })
        .await
    }

    async fn upsert_main_group(&self, group: MainGroup) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO main_groups (name, subgroups) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET subgroups = excluded.subgroups",
                params![group.name, join_list(&group.subgroups)],
            )?;
            Ok(())
        })
        .await
    }

    async fn upsert_token(&self, token: TokenRecord) -> Result<()> {
        self.with_conn(move |conn| {
            let owner: Option<TokenId> = conn
                .query_row(
                    "SELECT id FROM tokens WHERE token_hash = ?1",
                    params![token.token_hash],
                    |row| row.get(0),
                )
                .optional()?;
            if owner.is_some_and(|id| id != token.id) {
                return Err(StoreError::Invalid("token hash already registered".to_owned()));
            }
            conn.execute(
                "INSERT INTO tokens (id, user_id, token_hash, enabled, groups, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET user_id = excluded.user_id, token_hash = excluded.token_hash,
                    enabled = excluded.enabled, groups = excluded.groups, expires_at_ms = excluded.expires_at_ms",
                params![
                    token.id,
                    token.user_id,
                    token.token_hash,
                    token.enabled,
                    join_list(&token.groups),
                    token.expires_at.map(to_millis),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_token_enabled(&self, id: TokenId, enabled: bool) -> Result<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute("UPDATE tokens SET enabled = ?2 WHERE id = ?1", params![id, enabled])?;
            if changed == 0 {
                return Err(StoreError::not_found("token", id));
            }
            Ok(())
        })
        .await
    }

    async fn cache_invalidation_versions(&self, keys: &[&str]) -> Result<HashMap<String, i64>> {
        let keys = keys
            .iter()
            .map(|key| normalize_invalidation_key(key).map(str::to_owned))
            .collect::<Result<Vec<_>>>()?;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached("SELECT version FROM cache_invalidation WHERE key = ?1")?;
            let mut out = HashMap::with_capacity(keys.len());
            for key in keys {
                let version: Option<i64> = stmt.query_row(params![key], |row| row.get(0)).optional()?;
                if let Some(version) = version {
                    out.insert(key, version);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn bump_cache_invalidation_version(&self, key: &str) -> Result<i64> {
        let key = normalize_invalidation_key(key)?.to_owned();
        self.with_conn(move |conn| {
            let version = conn.query_row(
                "INSERT INTO cache_invalidation (key, version) VALUES (?1, 1)
                 ON CONFLICT(key) DO UPDATE SET version = version + 1
                 RETURNING version",
                params![key],
                |row| row.get(0),
            )?;
            Ok(version)
        })
        .await
    }

    async fn model_pricing(&self, model: &str) -> Result<Option<ModelPricing>> {
        let model = model.to_owned();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT model, input_micros, output_micros, cache_input_micros, cache_output_micros
                     FROM model_pricing WHERE model = ?1",
                    params![model],
                    |row| {
                        Ok(ModelPricing {
                            model: row.get(0)?,
                            input_per_million: UsdMicros::from_micros(row.get(1)?),
                            output_per_million: UsdMicros::from_micros(row.get(2)?),
                            cache_input_per_million: UsdMicros::from_micros(row.get(3)?),
                            cache_output_per_million: UsdMicros::from_micros(row.get(4)?),
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn upsert_model_pricing(&self, pricing: ModelPricing) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO model_pricing (model, input_micros, output_micros, cache_input_micros, cache_output_micros)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(model) DO UPDATE SET input_micros = excluded.input_micros,
                    output_micros = excluded.output_micros, cache_input_micros = excluded.cache_input_micros,
                    cache_output_micros = excluded.cache_output_micros",
                params![
                    pricing.model,
                    pricing.input_per_million.micros(),
                    pricing.output_per_million.micros(),
                    pricing.cache_input_per_million.micros(),
                    pricing.cache_output_per_million.micros(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn balance(&self, user_id: UserId) -> Result<UsdMicros> {
        self.with_conn(move |conn| read_balance(conn, user_id)).await
    }

    async fn credit_balance(&self, user_id: UserId, amount: UsdMicros) -> Result<UsdMicros> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            add_balance(&tx, user_id, amount)?;
            let balance = read_balance(&tx, user_id)?;
            tx.commit()?;
            Ok(balance)
        })
        .await
    }

    async fn upsert_subscription_plan(&self, plan: SubscriptionPlan) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO subscription_plans
                    (id, name, group_name, price_multiplier, limit_5h_micros, limit_1d_micros, limit_7d_micros,
                     limit_30d_micros)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, group_name = excluded.group_name,
                    price_multiplier = excluded.price_multiplier, limit_5h_micros = excluded.limit_5h_micros,
                    limit_1d_micros = excluded.limit_1d_micros, limit_7d_micros = excluded.limit_7d_micros,
                    limit_30d_micros = excluded.limit_30d_micros",
                params![
                    plan.id,
                    plan.name,
                    plan.group,
                    plan.price_multiplier.millionths(),
                    plan.limit_5h.micros(),
                    plan.limit_1d.micros(),
                    plan.limit_7d.micros(),
                    plan.limit_30d.micros(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn upsert_subscription(&self, subscription: Subscription) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO subscriptions (id, user_id, plan_id, start_at_ms, end_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET user_id = excluded.user_id, plan_id = excluded.plan_id,
                    start_at_ms = excluded.start_at_ms, end_at_ms = excluded.end_at_ms",
                params![
                    subscription.id,
                    subscription.user_id,
                    subscription.plan_id,
                    to_millis(subscription.start_at),
                    to_millis(subscription.end_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn subscription(&self, id: SubscriptionId) -> Result<Option<ActiveSubscription>> {
        self.with_conn(move |conn| load_subscription(conn, id)).await
    }

    async fn active_subscriptions(&self, user_id: UserId, now: Timestamp) -> Result<Vec<ActiveSubscription>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions s JOIN subscription_plans p ON p.id = s.plan_id
                 WHERE s.user_id = ?1 AND s.start_at_ms <= ?2 AND s.end_at_ms > ?2
                 ORDER BY s.end_at_ms, s.id"
            );
            let rows = conn
                .prepare(&sql)?
                .query_map(params![user_id, to_millis(now)], subscription_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn subscription_window_usage(
        &self,
        subscription_id: SubscriptionId,
        since: Timestamp,
        now: Timestamp,
    ) -> Result<WindowUsage> {
        self.with_conn(move |conn| window_usage(conn, subscription_id, since, now))
            .await
    }

    async fn reserve_usage(&self, reserve: ReserveUsage) -> Result<UsageEventId> {
        if reserve.reserved_usd.is_negative() {
            return Err(StoreError::Invalid("reserved amount must not be negative".to_owned()));
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing: Option<UsageEventId> = tx
                .query_row(
                    "SELECT id FROM usage_events WHERE request_id = ?1",
                    params![reserve.request_id],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Err(StoreError::DuplicateRequest(reserve.request_id));
            }

            match reserve.funding {
                Funding::Free => {}
                Funding::Balance => {
                    let balance = read_balance(&tx, reserve.user_id)?;
                    if balance < reserve.reserved_usd {
                        return Err(StoreError::InsufficientBalance {
                            balance,
                            required: reserve.reserved_usd,
                        });
                    }
                    add_balance(&tx, reserve.user_id, UsdMicros::ZERO - reserve.reserved_usd)?;
                }
                Funding::Subscription(id) => {
                    let active = load_subscription(&tx, id)?.ok_or_else(|| StoreError::not_found("subscription", id))?;
                    check_windows(&active, reserve.reserved_usd, reserve.now, |since| {
                        Ok(window_usage(&tx, id, since, reserve.now)?.total())
                    })?;
                }
            }

            tx.execute(
                "INSERT INTO usage_events
                    (request_id, user_id, token_id, model, funding, subscription_id, state, reserved_usd_micros,
                     reserve_expires_at_ms, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'reserved', ?7, ?8, ?9, ?9)",
                params![
                    reserve.request_id,
                    reserve.user_id,
                    reserve.token_id,
                    reserve.model,
                    reserve.funding.as_str(),
                    reserve.funding.subscription_id(),
                    reserve.reserved_usd.micros(),
                    to_millis(reserve.reserve_expires_at),
                    to_millis(reserve.now),
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn commit_usage(&self, commit: CommitUsage) -> Result<UsdMicros> {
        if commit.committed_usd.is_negative() {
            return Err(StoreError::Invalid("committed amount must not be negative".to_owned()));
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let event = load_reserved_event(&tx, commit.id)?;

            let effective = if event.funding == Funding::Balance {
                let settlement = settle(event.reserved_usd, commit.committed_usd, read_balance(&tx, event.user_id)?);
                add_balance(&tx, event.user_id, settlement.balance_delta)?;
                settlement.effective
            } else {
                commit.committed_usd
            };

            let details = &commit.details;
            tx.execute(
                "UPDATE usage_events SET state = 'committed', committed_usd_micros = ?2,
                    input_tokens = ?3, cached_input_tokens = ?4, output_tokens = ?5, cached_output_tokens = ?6,
                    updated_at_ms = ?7, channel_id = ?8, endpoint_id = ?9, credential_id = ?10,
                    route_group = ?11, status_code = ?12, latency_ms = ?13, error_class = ?14
                 WHERE id = ?1 AND state = 'reserved'",
                params![
                    commit.id,
                    effective.micros(),
                    commit.tokens.input,
                    commit.tokens.cached_input,
                    commit.tokens.output,
                    commit.tokens.cached_output,
                    to_millis(commit.now),
                    details.channel_id,
                    details.endpoint_id,
                    details.credential_id,
                    details.route_group,
                    details.status_code.map(i64::from),
                    details.latency_ms,
                    details.error_class,
                ],
            )?;
            tx.commit()?;
            Ok(effective)
        })
        .await
    }

    async fn void_usage(&self, id: UsageEventId, details: UsageDetails, now: Timestamp) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let event = load_reserved_event(&tx, id)?;
            release_event(&tx, &event, UsageState::Void, Some(&details), now)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn expire_reserved_usage(&self, before: Timestamp) -> Result<u64> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let overdue = {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM usage_events
                     WHERE state = 'reserved' AND reserve_expires_at_ms < ?1"
                );
                tx.prepare(&sql)?
                    .query_map(params![to_millis(before)], event_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            for event in &overdue {
                release_event(&tx, event, UsageState::Expired, None, before)?;
            }
            tx.commit()?;
            Ok(overdue.len() as u64)
        })
        .await
    }

    async fn usage_event(&self, id: UsageEventId) -> Result<Option<UsageEvent>> {
        self.with_conn(move |conn| load_event(conn, id)).await
    }

    async fn usage_events_for_user(&self, user_id: UserId) -> Result<Vec<UsageEvent>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {EVENT_COLUMNS} FROM usage_events WHERE user_id = ?1 ORDER BY id");
            let events = conn
                .prepare(&sql)?
                .query_map(params![user_id], event_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
        .await
    }

    async fn roll_up_usage(&self, before: Timestamp) -> Result<RetentionReport> {
        self.with_conn(move |conn| {
            let before_ms = to_millis(before);
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO usage_rollups
                    (day_ms, user_id, model, requests, input_tokens, output_tokens, cached_input_tokens,
                     cached_output_tokens, committed_usd_micros)
                 SELECT (created_at_ms / ?2) * ?2, user_id, COALESCE(model, ''), COUNT(*), SUM(input_tokens),
                    SUM(output_tokens), SUM(cached_input_tokens), SUM(cached_output_tokens),
                    SUM(COALESCE(committed_usd_micros, 0))
                 FROM usage_events
                 WHERE state = 'committed' AND created_at_ms < ?1
                 GROUP BY 1, 2, 3
                 ON CONFLICT(day_ms, user_id, model) DO UPDATE SET
                    requests = requests + excluded.requests,
                    input_tokens = input_tokens + excluded.input_tokens,
                    output_tokens = output_tokens + excluded.output_tokens,
                    cached_input_tokens = cached_input_tokens + excluded.cached_input_tokens,
                    cached_output_tokens = cached_output_tokens + excluded.cached_output_tokens,
                    committed_usd_micros = committed_usd_micros + excluded.committed_usd_micros",
                params![before_ms, DAY_MS],
            )?;
            let committed: i64 = tx.query_row(
                "SELECT COUNT(*) FROM usage_events WHERE state = 'committed' AND created_at_ms < ?1",
                params![before_ms],
                |row| row.get(0),
            )?;
            let deleted = tx.execute(
                "DELETE FROM usage_events WHERE state != 'reserved' AND created_at_ms < ?1",
                params![before_ms],
            )?;
            tx.commit()?;
            Ok(RetentionReport {
                rolled_up: u64::try_from(committed).unwrap_or(0),
                deleted: deleted as u64,
            })
        })
        .await
    }

    async fn usage_rollups(&self, user_id: UserId) -> Result<Vec<UsageRollup>> {
        self.with_conn(move |conn| {
            let rollups = conn
                .prepare(
                    "SELECT day_ms, user_id, model, requests, input_tokens, output_tokens, cached_input_tokens,
                        cached_output_tokens, committed_usd_micros
                     FROM usage_rollups WHERE user_id = ?1 ORDER BY day_ms, model",
                )?
                .query_map(params![user_id], |row| {
                    Ok(UsageRollup {
                        day: from_millis(row.get(0)?),
                        user_id: row.get(1)?,
                        model: row.get(2)?,
                        requests: row.get(3)?,
                        input_tokens: row.get(4)?,
                        output_tokens: row.get(5)?,
                        cached_input_tokens: row.get(6)?,
                        cached_output_tokens: row.get(7)?,
                        committed_usd: UsdMicros::from_micros(row.get(8)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rollups)
        })
        .await
    }
}
