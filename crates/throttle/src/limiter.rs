use crate::window::MemoryWindow;
use crate::{epoch_seconds, Tier, TierTable};
use redis_conn::RedisConnection;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;

static RATE_LIMIT_EXCEEDED: LazyLock<prometheus::IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "rate_limit_exceeded_total",
        "requests denied by the rate limiter, per tier",
        &["tier"]
    )
    .unwrap()
});
static RATE_LIMIT_FALLBACK: LazyLock<prometheus::IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "rate_limit_backend_fallback_total",
        "rate limit checks that fell back to the in-memory window \
         because the backing store failed"
    )
    .unwrap()
});

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RateLimiterParams {
    #[serde(default = "RateLimiterParams::default_enabled")]
    pub enabled: bool,
    /// Reduced per-window limit applied when the backing store is
    /// unreachable and the limiter fails open through local memory.
    #[serde(default = "RateLimiterParams::default_fallback_limit")]
    pub fallback_limit: u64,
    #[serde(default)]
    pub tiers: TierTable,
}

impl RateLimiterParams {
    fn default_enabled() -> bool {
        true
    }
    fn default_fallback_limit() -> u64 {
        10
    }
}

impl Default for RateLimiterParams {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            fallback_limit: Self::default_fallback_limit(),
            tiers: TierTable::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub tier: Tier,
    /// Requests counted in the current window, this one included.
    pub current: u64,
    /// The effective limit after the batch multiplier.
    pub limit: u64,
}

/// Sliding-window limiter keyed by API key. One instance per process.
pub struct RateLimiter {
    params: RateLimiterParams,
    redis: Option<RedisConnection>,
    memory: MemoryWindow,
}

impl RateLimiter {
    pub fn new(params: RateLimiterParams, redis: Option<RedisConnection>) -> Self {
        Self {
            params,
            redis,
            memory: MemoryWindow::new(),
        }
    }

    /// Account one request (scaled by `multiplier` for batches) against
    /// the key's quota. Unlimited tier short-circuits without touching
    /// any store.
    pub async fn check(&self, api_key: &str, tier: Tier, multiplier: f64) -> RateLimitDecision {
        let Some(spec) = self.params.tiers.spec(tier) else {
            return RateLimitDecision {
                allowed: true,
                tier,
                current: 0,
                limit: u64::MAX,
            };
        };
        if !self.params.enabled {
            return RateLimitDecision {
                allowed: true,
                tier,
                current: 0,
                limit: spec.limit,
            };
        }

        let adjusted_limit = ((spec.limit as f64) * multiplier.max(1.0)) as u64;
        let key = format!("rate_limit:{api_key}");
        let now = epoch_seconds();

        let current = match &self.redis {
            Some(redis) => match self.count_in_redis(redis, &key, now, spec.window).await {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!("rate limit backend failed, failing open: {err:#}");
                    RATE_LIMIT_FALLBACK.inc();
                    let fallback_limit =
                        ((self.params.fallback_limit as f64) * multiplier.max(1.0)) as u64;
                    let current = self.memory.hit(&key, now, spec.window);
                    return self.decide(api_key, tier, current, fallback_limit);
                }
            },
            None => self.memory.hit(&key, now, spec.window),
        };

        self.decide(api_key, tier, current, adjusted_limit)
    }

    /// One atomic transaction on the key's timestamp set: add the new
    /// stamp, prune everything older than the window, read the size,
    /// and refresh the key's TTL.
    async fn count_in_redis(
        &self,
        redis: &RedisConnection,
        key: &str,
        now: f64,
        window_secs: u64,
    ) -> anyhow::Result<u64> {
        let member = format!("{now}:{}", Uuid::new_v4());
        let horizon = now - window_secs as f64;

        let mut pipe = redis_conn::Pipeline::new();
        pipe.atomic();
        pipe.cmd("ZADD").arg(key).arg(now).arg(&member);
        pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg("-inf").arg(horizon);
        pipe.cmd("ZCARD").arg(key);
        pipe.cmd("EXPIRE").arg(key).arg(window_secs);

        let values: Vec<i64> = redis.pipeline(&pipe).await?;
        let count = values
            .get(2)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("short reply from rate limit transaction"))?;
        Ok(count.max(0) as u64)
    }

    fn decide(
        &self,
        api_key: &str,
        tier: Tier,
        current: u64,
        limit: u64,
    ) -> RateLimitDecision {
        let allowed = current <= limit;
        if !allowed {
            tracing::warn!("rate limit exceeded for API key {api_key}");
            RATE_LIMIT_EXCEEDED
                .with_label_values(&[tier.as_str()])
                .inc();
        }
        RateLimitDecision {
            allowed,
            tier,
            current,
            limit,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimiterParams::default(), None)
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let limiter = limiter();
        for i in 1..=100 {
            let decision = limiter.check("key-1", Tier::Basic, 1.0).await;
            assert!(decision.allowed, "request {i} should pass");
        }
        let decision = limiter.check("key-1", Tier::Basic, 1.0).await;
        assert!(!decision.allowed);
        assert_eq!(decision.current, 101);
        assert_eq!(decision.limit, 100);
    }

    #[tokio::test]
    async fn keys_do_not_interfere() {
        let limiter = limiter();
        for _ in 0..100 {
            limiter.check("busy", Tier::Basic, 1.0).await;
        }
        assert!(!limiter.check("busy", Tier::Basic, 1.0).await.allowed);
        assert!(limiter.check("quiet", Tier::Basic, 1.0).await.allowed);
    }

    #[tokio::test]
    async fn unlimited_tier_bypasses_accounting() {
        let limiter = limiter();
        for _ in 0..1000 {
            let decision = limiter.check("vip", Tier::Unlimited, 1.0).await;
            assert!(decision.allowed);
            assert_eq!(decision.current, 0);
        }
    }

    #[tokio::test]
    async fn batch_multiplier_scales_the_limit() {
        let limiter = limiter();
        // a batch of 50 counts one hit against a 50x limit
        let decision = limiter.check("batcher", Tier::Basic, 50.0).await;
        assert!(decision.allowed);
        assert_eq!(decision.limit, 5000);
    }

    #[tokio::test]
    async fn disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(
            RateLimiterParams {
                enabled: false,
                ..RateLimiterParams::default()
            },
            None,
        );
        for _ in 0..500 {
            assert!(limiter.check("key", Tier::Basic, 1.0).await.allowed);
        }
    }
}
