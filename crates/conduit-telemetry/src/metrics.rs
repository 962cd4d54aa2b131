//! Gateway counters

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Meter};

pub const RESERVATIONS: &str = "conduit.usage.reservations";
pub const COMMITS: &str = "conduit.usage.commits";
pub const VOIDS: &str = "conduit.usage.voids";
pub const EXPIRATIONS: &str = "conduit.usage.expirations";
pub const CHARGED_MICROS: &str = "conduit.usage.charged";
pub const FAILOVERS: &str = "conduit.upstream.failovers";
pub const CACHE_INVALIDATIONS: &str = "conduit.cache.invalidations";
pub const POLLER_ERRORS: &str = "conduit.cache.poller_errors";
pub const ADMISSION_REJECTIONS: &str = "conduit.admission.rejections";

/// Counters recorded along the request path and by background jobs
///
/// Without an installed meter provider every instrument is a no-op.
#[derive(Clone)]
pub struct GatewayMetrics {
    reservations: Counter<u64>,
    commits: Counter<u64>,
    voids: Counter<u64>,
    expirations: Counter<u64>,
    charged: Counter<u64>,
    failovers: Counter<u64>,
    cache_invalidations: Counter<u64>,
    poller_errors: Counter<u64>,
    admission_rejections: Counter<u64>,
}

impl GatewayMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            reservations: meter
                .u64_counter(RESERVATIONS)
                .with_description("Usage events written in the reserved state")
                .build(),
            commits: meter
                .u64_counter(COMMITS)
                .with_description("Usage events committed")
                .build(),
            voids: meter.u64_counter(VOIDS).with_description("Usage events voided").build(),
            expirations: meter
                .u64_counter(EXPIRATIONS)
                .with_description("Reservations expired by the sweep")
                .build(),
            charged: meter
                .u64_counter(CHARGED_MICROS)
                .with_unit("uUSD")
                .with_description("Committed charges in micro-USD")
                .build(),
            failovers: meter
                .u64_counter(FAILOVERS)
                .with_description("Upstream attempts after the first within one request")
                .build(),
            cache_invalidations: meter
                .u64_counter(CACHE_INVALIDATIONS)
                .with_description("Local cache purges by key")
                .build(),
            poller_errors: meter
                .u64_counter(POLLER_ERRORS)
                .with_description("Invalidation poll cycles skipped on store errors")
                .build(),
            admission_rejections: meter
                .u64_counter(ADMISSION_REJECTIONS)
                .with_description("Requests rejected before any upstream call")
                .build(),
        }
    }

    /// Instruments on the global meter provider
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter("conduit"))
    }

    pub fn reservation(&self, funding: &'static str) {
        self.reservations.add(1, &[KeyValue::new("funding", funding)]);
    }

    pub fn commit(&self, charged_micros: i64) {
        self.commits.add(1, &[]);
        if let Ok(micros) = u64::try_from(charged_micros) {
            self.charged.add(micros, &[]);
        }
    }

    pub fn void(&self, reason: &'static str) {
        self.voids.add(1, &[KeyValue::new("reason", reason)]);
    }

    pub fn expired(&self, count: u64) {
        if count > 0 {
            self.expirations.add(count, &[]);
        }
    }

    pub fn failover(&self) {
        self.failovers.add(1, &[]);
    }

    pub fn cache_invalidation(&self, key: &str, source: &'static str) {
        self.cache_invalidations.add(
            1,
            &[KeyValue::new("key", key.to_owned()), KeyValue::new("source", source)],
        );
    }

    pub fn poller_error(&self) {
        self.poller_errors.add(1, &[]);
    }

    pub fn admission_rejection(&self, kind: &'static str) {
        self.admission_rejections.add(1, &[KeyValue::new("kind", kind)]);
    }
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics").finish_non_exhaustive()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::global()
    }
}
