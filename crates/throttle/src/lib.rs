//! Tenant metering: tiered sliding-window rate limits over a shared
//! redis store, plus an IP failure ledger with timed blocks.
//!
//! When the backing store is unreachable the limiter fails open through
//! an in-memory window with a reduced limit, so a redis outage degrades
//! capacity instead of taking the service down or letting traffic run
//! unmetered.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod blocker;
pub mod limiter;
mod window;

pub use blocker::{IpBlocker, IpBlockerParams};
pub use limiter::{RateLimitDecision, RateLimiter, RateLimiterParams};

/// A tenant tier. Every API key resolves to one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Basic,
    Pro,
    Enterprise,
    Unlimited,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
            Self::Unlimited => "unlimited",
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            "unlimited" => Ok(Self::Unlimited),
            other => Err(format!("unknown tier `{other}`")),
        }
    }
}

/// A quota expressed as `limit/period`, parsed from strings like
/// `100/h`, `1_000/hour` or `50/m`.
#[derive(Eq, PartialEq, Clone, Copy, Serialize, Deserialize, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct TierSpec {
    pub limit: u64,
    /// Window, in seconds
    pub window: u64,
}

impl std::fmt::Debug for TierSpec {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", String::from(*self))
    }
}

impl From<TierSpec> for String {
    fn from(spec: TierSpec) -> String {
        let period = match spec.window {
            86400 => "d",
            3600 => "h",
            60 => "m",
            1 => "s",
            secs => return format!("{}/{secs}s", spec.limit),
        };
        format!("{}/{period}", spec.limit)
    }
}

impl TryFrom<String> for TierSpec {
    type Error = String;
    fn try_from(s: String) -> Result<Self, String> {
        Self::try_from(s.as_str())
    }
}

impl TryFrom<&str> for TierSpec {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        let (limit, period) = s
            .split_once('/')
            .ok_or_else(|| format!("expected 'limit/period', got {s}"))?;

        let window = match period {
            "h" | "hr" | "hour" => 3600,
            "m" | "min" | "minute" => 60,
            "s" | "sec" | "second" => 1,
            "d" | "day" => 86400,
            invalid => return Err(format!("unknown period quantity {invalid}")),
        };

        // Allow "1_000/hr" and "1,000/hr" for more readable config
        let limit: String = limit
            .chars()
            .filter(|c| !matches!(c, '_' | ','))
            .collect();
        let limit = limit
            .parse::<u64>()
            .map_err(|err| format!("invalid limit '{limit}': {err}"))?;

        if limit == 0 {
            return Err(format!("invalid tier spec `{s}`: limit must be greater than 0"));
        }

        Ok(Self { limit, window })
    }
}

/// Per-tier quotas. `unlimited` never consults the table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TierTable {
    #[serde(default = "TierTable::default_basic")]
    pub basic: TierSpec,
    #[serde(default = "TierTable::default_pro")]
    pub pro: TierSpec,
    #[serde(default = "TierTable::default_enterprise")]
    pub enterprise: TierSpec,
}

impl TierTable {
    fn default_basic() -> TierSpec {
        TierSpec {
            limit: 100,
            window: 3600,
        }
    }
    fn default_pro() -> TierSpec {
        TierSpec {
            limit: 1000,
            window: 3600,
        }
    }
    fn default_enterprise() -> TierSpec {
        TierSpec {
            limit: 10000,
            window: 3600,
        }
    }

    pub fn spec(&self, tier: Tier) -> Option<TierSpec> {
        match tier {
            Tier::Basic => Some(self.basic),
            Tier::Pro => Some(self.pro),
            Tier::Enterprise => Some(self.enterprise),
            Tier::Unlimited => None,
        }
    }

    /// Parse from config strings, eg: `{basic = "100/h", pro = "1000/h"}`.
    pub fn from_strings(specs: &HashMap<String, String>) -> Result<Self, String> {
        let mut table = Self::default();
        for (tier, spec) in specs {
            let spec = TierSpec::try_from(spec.as_str())?;
            match tier.parse::<Tier>()? {
                Tier::Basic => table.basic = spec,
                Tier::Pro => table.pro = spec,
                Tier::Enterprise => table.enterprise = spec,
                Tier::Unlimited => {
                    return Err("the unlimited tier cannot carry a quota".to_string())
                }
            }
        }
        Ok(table)
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            basic: Self::default_basic(),
            pro: Self::default_pro(),
            enterprise: Self::default_enterprise(),
        }
    }
}

pub(crate) fn epoch_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tier_spec_parse() {
        assert_eq!(
            TierSpec::try_from("100/hr").unwrap(),
            TierSpec {
                limit: 100,
                window: 3600
            }
        );
        assert_eq!(
            TierSpec::try_from("1_0,0/hour").unwrap(),
            TierSpec {
                limit: 100,
                window: 3600
            }
        );
        assert_eq!(
            TierSpec::try_from("100/our").unwrap_err(),
            "unknown period quantity our".to_string()
        );
        assert!(TierSpec::try_from("three/hour").unwrap_err().starts_with("invalid limit"));
        assert!(TierSpec::try_from("0/h").unwrap_err().contains("greater than 0"));
    }

    #[test]
    fn tier_spec_round_trips_through_serde() {
        let spec: TierSpec = serde_json::from_str(r#""5000/h""#).unwrap();
        assert_eq!(spec.limit, 5000);
        assert_eq!(serde_json::to_string(&spec).unwrap(), r#""5000/h""#);
    }

    #[test]
    fn default_tiers_match_published_quotas() {
        let table = TierTable::default();
        assert_eq!(table.spec(Tier::Basic).unwrap().limit, 100);
        assert_eq!(table.spec(Tier::Pro).unwrap().limit, 1000);
        assert_eq!(table.spec(Tier::Enterprise).unwrap().limit, 10000);
        assert_eq!(table.spec(Tier::Unlimited), None);
    }

    #[test]
    fn tier_table_from_strings() {
        let mut specs = HashMap::new();
        specs.insert("basic".to_string(), "200/h".to_string());
        let table = TierTable::from_strings(&specs).unwrap();
        assert_eq!(table.basic.limit, 200);
        assert_eq!(table.pro.limit, 1000);

        let mut specs = HashMap::new();
        specs.insert("unlimited".to_string(), "1/h".to_string());
        assert!(TierTable::from_strings(&specs).is_err());
    }
}
