//! The verdict store: a JSON value per `(normalized, options)` key,
//! held in redis when configured so every node shares decisions, or in
//! a local TTL cache otherwise. Positive verdicts live longer than
//! negative ones so a transient "no" does not stick for a day.
use crate::verdict::Verdict;
use redis_conn::{cmd, RedisConnection};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use ttl_cache::TtlCache;

static VERDICT_CACHE_HIT: LazyLock<prometheus::IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "verdict_cache_hit",
        "validations answered from the verdict cache"
    )
    .unwrap()
});
static VERDICT_CACHE_MISS: LazyLock<prometheus::IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "verdict_cache_miss",
        "validations that had to run the pipeline"
    )
    .unwrap()
});

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct VerdictCacheParams {
    #[serde(default = "VerdictCacheParams::default_ttl", with = "duration_serde")]
    pub ttl: Duration,
    #[serde(
        default = "VerdictCacheParams::default_negative_ttl",
        with = "duration_serde"
    )]
    pub negative_ttl: Duration,
}

impl VerdictCacheParams {
    fn default_ttl() -> Duration {
        Duration::from_secs(3600)
    }
    fn default_negative_ttl() -> Duration {
        Duration::from_secs(300)
    }

    /// Negative verdicts must age out faster than positive ones.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.negative_ttl >= self.ttl {
            anyhow::bail!(
                "verdict_cache.negative_ttl ({:?}) must be shorter than ttl ({:?})",
                self.negative_ttl,
                self.ttl
            );
        }
        Ok(())
    }
}

impl Default for VerdictCacheParams {
    fn default() -> Self {
        Self {
            ttl: Self::default_ttl(),
            negative_ttl: Self::default_negative_ttl(),
        }
    }
}

pub struct VerdictCache {
    params: VerdictCacheParams,
    redis: Option<RedisConnection>,
    memory: TtlCache<String, Verdict>,
}

impl VerdictCache {
    pub fn new(params: VerdictCacheParams, redis: Option<RedisConnection>) -> Self {
        Self {
            params,
            redis,
            memory: TtlCache::new("verdict", 64 * 1024),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Verdict> {
        let found = match &self.redis {
            Some(redis) => {
                let mut get = cmd("GET");
                get.arg(key);
                match redis.query(get).await {
                    Ok(redis_conn::RedisValue::BulkString(bytes)) => {
                        match serde_json::from_slice::<Verdict>(&bytes) {
                            Ok(verdict) => Some(verdict),
                            Err(err) => {
                                tracing::warn!("discarding unparseable cached verdict: {err}");
                                None
                            }
                        }
                    }
                    Ok(_) => None,
                    Err(err) => {
                        tracing::warn!("verdict cache read failed: {err:#}");
                        None
                    }
                }
            }
            None => self.memory.get(&key.to_string()),
        };

        if found.is_some() {
            VERDICT_CACHE_HIT.inc();
        } else {
            VERDICT_CACHE_MISS.inc();
        }
        found
    }

    pub async fn put(&self, key: &str, verdict: &Verdict) {
        let ttl = if verdict.is_valid {
            self.params.ttl
        } else {
            self.params.negative_ttl
        };

        match &self.redis {
            Some(redis) => {
                let json = match serde_json::to_string(verdict) {
                    Ok(json) => json,
                    Err(err) => {
                        tracing::error!("failed to serialize verdict for cache: {err}");
                        return;
                    }
                };
                let mut setex = cmd("SETEX");
                setex.arg(key).arg(ttl.as_secs()).arg(json);
                if let Err(err) = redis.query(setex).await {
                    tracing::warn!("verdict cache write failed: {err:#}");
                }
            }
            None => {
                self.memory
                    .insert(key.to_string(), verdict.clone(), Instant::now() + ttl);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::verdict::{ValidationType, Verdict};

    #[test]
    fn ttl_ordering_is_enforced() {
        let params = VerdictCacheParams {
            ttl: Duration::from_secs(60),
            negative_ttl: Duration::from_secs(60),
        };
        assert!(params.validate().is_err());
        assert!(VerdictCacheParams::default().validate().is_ok());
    }

    #[tokio::test]
    async fn memory_round_trip_returns_copies() {
        let cache = VerdictCache::new(VerdictCacheParams::default(), None);
        let verdict = Verdict::invalid("user@example.com", ValidationType::Mx, "No MX");
        cache.put("k", &verdict).await;

        let first = cache.get("k").await.unwrap();
        let second = cache.get("k").await.unwrap();
        assert_eq!(first, verdict);
        assert_eq!(second, verdict);
    }

    #[tokio::test]
    async fn negative_verdicts_use_shorter_ttl() {
        let cache = VerdictCache::new(
            VerdictCacheParams {
                ttl: Duration::from_secs(60),
                negative_ttl: Duration::from_millis(10),
            },
            None,
        );
        let verdict = Verdict::invalid("user@example.com", ValidationType::Mx, "No MX");
        cache.put("k", &verdict).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("k").await.is_none());
    }
}
