use anyhow::Context;
use breaker::BreakerParams;
use dns_resolver::DnsParams;
use redis_conn::RedisParams;
use serde::Deserialize;
use smtp_client::{PoolParams, ProbeParams, SmtpClientTimeouts};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use throttle::{IpBlockerParams, Tier};
use validator::{RiskParams, ValidatorParams, VerdictCacheParams};

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    #[serde(default = "ListenerConfig::default_listen")]
    pub listen: String,
    #[serde(default = "ListenerConfig::default_hostname")]
    pub hostname: String,
}

impl ListenerConfig {
    fn default_listen() -> String {
        "127.0.0.1:8000".to_string()
    }

    fn default_hostname() -> String {
        gethostname::gethostname()
            .to_str()
            .unwrap_or("localhost")
            .to_string()
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            hostname: Self::default_hostname(),
        }
    }
}

/// The `[smtp]` section: pool and probe knobs in one place, the way
/// operators think about them.
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SmtpConfig {
    #[serde(default = "SmtpConfig::default_port")]
    pub port: u16,
    #[serde(default)]
    pub timeouts: SmtpClientTimeouts,
    #[serde(default = "SmtpConfig::default_max_per_host")]
    pub max_per_host: usize,
    #[serde(default = "SmtpConfig::default_max_lifetime", with = "duration_serde")]
    pub max_lifetime: Duration,
    #[serde(
        default = "SmtpConfig::default_cleanup_interval",
        with = "duration_serde"
    )]
    pub cleanup_interval: Duration,
    #[serde(default = "SmtpConfig::default_wait_timeout", with = "duration_serde")]
    pub wait_timeout: Duration,
    #[serde(default = "SmtpConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "SmtpConfig::default_retry_delay", with = "duration_serde")]
    pub retry_delay: Duration,
    #[serde(default = "SmtpConfig::default_from_address")]
    pub from_address: String,
    /// Domain for EHLO. Defaults to the machine hostname.
    #[serde(default)]
    pub ehlo_domain: Option<String>,
}

impl SmtpConfig {
    fn default_port() -> u16 {
        25
    }
    fn default_max_per_host() -> usize {
        10
    }
    fn default_max_lifetime() -> Duration {
        Duration::from_secs(3600)
    }
    fn default_cleanup_interval() -> Duration {
        Duration::from_secs(300)
    }
    fn default_wait_timeout() -> Duration {
        Duration::from_secs(30)
    }
    fn default_max_retries() -> u32 {
        3
    }
    fn default_retry_delay() -> Duration {
        Duration::from_secs(1)
    }
    fn default_from_address() -> String {
        "verify@example.com".to_string()
    }

    pub fn pool_params(&self, hostname: &str) -> PoolParams {
        PoolParams {
            max_per_host: self.max_per_host,
            max_lifetime: self.max_lifetime,
            cleanup_interval: self.cleanup_interval,
            wait_timeout: self.wait_timeout,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            ehlo_domain: self
                .ehlo_domain
                .clone()
                .unwrap_or_else(|| hostname.to_string()),
            timeouts: self.timeouts,
        }
    }

    pub fn probe_params(&self) -> ProbeParams {
        ProbeParams {
            from_address: self.from_address.clone(),
            port: self.port,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            timeouts: SmtpClientTimeouts::default(),
            max_per_host: Self::default_max_per_host(),
            max_lifetime: Self::default_max_lifetime(),
            cleanup_interval: Self::default_cleanup_interval(),
            wait_timeout: Self::default_wait_timeout(),
            max_retries: Self::default_max_retries(),
            retry_delay: Self::default_retry_delay(),
            from_address: Self::default_from_address(),
            ehlo_domain: None,
        }
    }
}

/// The `[rate_limit]` section. Tier quotas are written as strings
/// (`basic = "100/h"`) and merged over the defaults.
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "RateLimitConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "RateLimitConfig::default_fallback_limit")]
    pub fallback_limit: u64,
    #[serde(default)]
    pub tiers: HashMap<String, String>,
}

impl RateLimitConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_fallback_limit() -> u64 {
        10
    }

    pub fn limiter_params(&self) -> anyhow::Result<throttle::RateLimiterParams> {
        let tiers = throttle::TierTable::from_strings(&self.tiers)
            .map_err(|err| anyhow::anyhow!("invalid [rate_limit.tiers]: {err}"))?;
        Ok(throttle::RateLimiterParams {
            enabled: self.enabled,
            fallback_limit: self.fallback_limit,
            tiers,
        })
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            fallback_limit: Self::default_fallback_limit(),
            tiers: HashMap::new(),
        }
    }
}

/// Static API keys for deployments without a shared key store. Each
/// entry maps a key to its tier.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default)]
    pub static_keys: HashMap<String, Tier>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub dns: DnsParams,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub redis: Option<RedisParams>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub ip_blocker: IpBlockerParams,
    #[serde(default)]
    pub breaker: BreakerParams,
    #[serde(default)]
    pub verdict_cache: VerdictCacheParams,
    #[serde(default)]
    pub validator: ValidatorParams,
    #[serde(default)]
    pub risk: RiskParams,
    #[serde(default)]
    pub audit: crate::audit::AuditParams,
}

impl Config {
    /// Load from a TOML file. A missing file yields the built-in
    /// defaults only when `require_file` is false (the default path
    /// case); an explicitly named file must exist.
    pub fn load(path: &Path, require_file: bool) -> anyhow::Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !require_file => {
                tracing::warn!(
                    "config file {} not found, using defaults",
                    path.display()
                );
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading config file {}", path.display()))
            }
        };
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.verdict_cache.validate()?;
        self.rate_limit.limiter_params().map(|_| ())?;
        if self.smtp.max_per_host == 0 {
            anyhow::bail!("smtp.max_per_host must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.listener.listen, "127.0.0.1:8000");
        assert_eq!(config.smtp.port, 25);
        assert_eq!(config.dns.shard_count, 16);
        assert!(config.redis.is_none());
    }

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r#"
[listener]
listen = "0.0.0.0:8080"
hostname = "validator-1.internal"

[dns]
timeout = "3s"
cache_ttl = "10m"
nameservers = ["192.0.2.53:53", "192.0.2.54:53"]

[smtp]
port = 2525
max_per_host = 4
max_lifetime = "30m"
from_address = "probe@mail.internal"

[redis]
node = "redis://127.0.0.1:6379/0"

[auth.static_keys]
dev-key = "unlimited"

[rate_limit]
fallback_limit = 5
tiers = { basic = "200/h" }

[ip_blocker]
max_failures = 3

[breaker]
failure_threshold = 4

[verdict_cache]
ttl = "2h"
negative_ttl = "10m"

[validator]
batch_size = 25

[audit]
max_file_size = 1000000
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.dns.nameservers.len(), 2);
        assert_eq!(config.smtp.probe_params().port, 2525);
        assert_eq!(
            config.smtp.pool_params("h").ehlo_domain,
            "h".to_string()
        );
        assert_eq!(
            config.auth.static_keys.get("dev-key"),
            Some(&Tier::Unlimited)
        );
        let limiter = config.rate_limit.limiter_params().unwrap();
        assert_eq!(limiter.tiers.basic.limit, 200);
        assert_eq!(limiter.tiers.pro.limit, 1000);
    }

    #[test]
    fn bad_ttl_ordering_is_rejected() {
        let config: Config = toml::from_str(
            r#"
[verdict_cache]
ttl = "1m"
negative_ttl = "1h"
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("[listener]\nlisten_addr = \"x\"").is_err());
    }
}
