use std::path::Path;
use std::time::Duration;

use secrecy::ExposeSecret;

use crate::Config;

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a placeholder cannot be
    /// resolved, TOML parsing fails, or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
        Self::from_toml(&raw)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Same as [`Config::load`], minus the file read
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let expanded =
            crate::env::expand_env(raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self = toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending field
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_invalidation()?;
        self.validate_billing()?;
        self.validate_scheduler()?;
        self.validate_tasks()?;
        self.validate_server()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_invalidation(&self) -> anyhow::Result<()> {
        let inv = &self.invalidation;
        if !(0.0..1.0).contains(&inv.jitter) {
            anyhow::bail!("invalidation.jitter must be in [0, 1), got {}", inv.jitter);
        }
        if inv.enabled && inv.poll_interval.is_zero() {
            anyhow::bail!("invalidation.poll_interval must be greater than 0 when the poller is enabled");
        }
        if !inv.enabled && !self.snapshot.ttl.is_zero() {
            tracing::warn!(
                ttl = ?self.snapshot.ttl,
                "invalidation poller disabled: other processes' changes are only seen when the snapshot expires"
            );
        }
        Ok(())
    }

    fn validate_billing(&self) -> anyhow::Result<()> {
        let billing = &self.billing;
        if !billing.default_reserve_usd.is_finite() || billing.default_reserve_usd < 0.0 {
            anyhow::bail!("billing.default_reserve_usd must be a non-negative amount");
        }
        if billing.reserve_ttl.is_zero() {
            anyhow::bail!("billing.reserve_ttl must be greater than 0");
        }
        if billing.default_max_output_tokens < 0 {
            anyhow::bail!("billing.default_max_output_tokens must not be negative");
        }
        if billing.pay_as_you_go_multiplier <= 0.0 {
            tracing::warn!(
                multiplier = billing.pay_as_you_go_multiplier,
                "billing.pay_as_you_go_multiplier is not positive, treating it as 1"
            );
        }
        Ok(())
    }

    fn validate_scheduler(&self) -> anyhow::Result<()> {
        if self.scheduler.cooldown.is_zero() {
            anyhow::bail!("scheduler.cooldown must be greater than 0");
        }
        if self.scheduler.trial_claim_ttl.is_zero() {
            anyhow::bail!("scheduler.trial_claim_ttl must be greater than 0");
        }
        Ok(())
    }

    fn validate_tasks(&self) -> anyhow::Result<()> {
        let tasks = &self.tasks;
        let named = [
            ("tasks.usage_sweep_interval", tasks.usage_sweep_interval),
            ("tasks.usage_sweep_timeout", tasks.usage_sweep_timeout),
            ("tasks.cooldown_sweep_interval", tasks.cooldown_sweep_interval),
            ("tasks.retention.interval", tasks.retention.interval),
        ];
        for (name, value) in named {
            if value == Duration::ZERO {
                anyhow::bail!("{name} must be greater than 0");
            }
        }
        if tasks.retention.enabled && tasks.retention.horizon < Duration::from_secs(60 * 60) {
            anyhow::bail!("tasks.retention.horizon must be at least 1h");
        }
        Ok(())
    }

    fn validate_server(&self) -> anyhow::Result<()> {
        if let Some(ref secret) = self.server.internal_secret
            && secret.expose_secret().is_empty()
        {
            anyhow::bail!("server.internal_secret must not be empty when set");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> anyhow::Result<()> {
        if let Some(ref telemetry) = self.telemetry
            && !(0.0..=1.0).contains(&telemetry.sampling_rate)
        {
            anyhow::bail!("telemetry.sampling_rate must be between 0.0 and 1.0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::{BillingMode, LogFormat, StoreConfig};

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.snapshot.ttl, Duration::from_secs(5));
        assert_eq!(config.invalidation.poll_interval, Duration::from_secs(1));
        assert!((config.invalidation.jitter - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.limits.max_inflight_per_token, 8);
        assert_eq!(config.limits.max_sse_per_token, 4);
        assert_eq!(config.limits.max_inflight_per_credential, 16);
        assert_eq!(config.billing.mode, BillingMode::Hybrid);
        assert_eq!(config.billing.reserve_ttl, Duration::from_secs(150));
        assert_eq!(config.auth.token_cache_capacity, 50_000);
        assert_eq!(config.tasks.retention.horizon, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(config.scheduler.binding_ttl, Duration::from_secs(3600));
        assert_eq!(config.scheduler.affinity_ttl, Duration::from_secs(1800));
        assert_eq!(config.scheduler.trial_claim_ttl, Duration::from_secs(30));
    }

    #[test]
    fn parses_full_file() {
        let raw = r#"
            [server]
            listen_address = "127.0.0.1:8080"
            internal_secret = "s3cret"

            [store]
            kind = "sqlite"
            path = "/tmp/conduit.db"

            [snapshot]
            ttl = "0s"

            [invalidation]
            poll_interval = "500ms"
            jitter = 0.1

            [billing]
            mode = "pay_as_you_go"
            pay_as_you_go_multiplier = 1.5

            [scheduler]
            cooldown = "1m"
            binding_ttl = "0s"

            [tasks.retention]
            horizon = "7d"

            [telemetry]
            log_format = "json"
        "#;
        let config = Config::from_toml(raw).unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: "/tmp/conduit.db".into()
            }
        );
        assert!(config.snapshot.ttl.is_zero());
        assert_eq!(config.invalidation.poll_interval, Duration::from_millis(500));
        assert_eq!(config.billing.mode, BillingMode::PayAsYouGo);
        assert_eq!(config.scheduler.cooldown, Duration::from_secs(60));
        assert!(config.scheduler.binding_ttl.is_zero());
        assert_eq!(config.tasks.retention.horizon, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.telemetry.unwrap().log_format, LogFormat::Json);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Config::from_toml("[snapshot]\nttl = \"1s\"\nsize = 3").unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn jitter_out_of_range_is_rejected() {
        let err = Config::from_toml("[invalidation]\njitter = 1.5").unwrap_err();
        assert!(err.to_string().contains("invalidation.jitter"));
    }

    #[test]
    fn zero_trial_claim_ttl_is_rejected() {
        let err = Config::from_toml("[scheduler]\ntrial_claim_ttl = \"0s\"").unwrap_err();
        assert!(err.to_string().contains("scheduler.trial_claim_ttl"));
    }

    #[test]
    fn empty_internal_secret_is_rejected() {
        let err = Config::from_toml("[server]\ninternal_secret = \"\"").unwrap_err();
        assert!(err.to_string().contains("internal_secret"));
    }

    #[test]
    fn short_retention_horizon_is_rejected() {
        let err = Config::from_toml("[tasks.retention]\nhorizon = \"5m\"").unwrap_err();
        assert!(err.to_string().contains("horizon"));
    }

    #[test]
    fn load_expands_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[store]\nkind = \"sqlite\"\npath = \"{{{{ env.CONDUIT_TEST_DB }}}}\"").unwrap();

        temp_env::with_var("CONDUIT_TEST_DB", Some("/data/gw.db"), || {
            let config = Config::load(file.path()).unwrap();
            assert_eq!(
                config.store,
                StoreConfig::Sqlite {
                    path: "/data/gw.db".into()
                }
            );
        });
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load(Path::new("/nonexistent/conduit.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
