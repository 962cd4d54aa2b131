use std::time::Duration;

use serde::Deserialize;
use url::Url;

/// OTLP exporter configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExporterConfig {
    /// OTLP endpoint URL
    pub endpoint: Url,
    #[serde(default)]
    pub protocol: ExportProtocol,
    /// Metric export interval
    #[serde(default = "default_export_interval", deserialize_with = "crate::duration::deserialize")]
    pub export_interval: Duration,
}

/// OTLP export protocol
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportProtocol {
    #[default]
    Grpc,
    HttpProto,
}

const fn default_export_interval() -> Duration {
    Duration::from_secs(30)
}
