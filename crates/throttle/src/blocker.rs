use redis_conn::{cmd, RedisConnection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

static BLOCKED_IPS: LazyLock<prometheus::IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "ip_blocker_blocks_total",
        "IP addresses blocked for repeated auth failures"
    )
    .unwrap()
});

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct IpBlockerParams {
    /// Failures inside the window before the IP is blocked.
    #[serde(default = "IpBlockerParams::default_max_failures")]
    pub max_failures: u32,
    #[serde(
        default = "IpBlockerParams::default_failure_window",
        with = "duration_serde"
    )]
    pub failure_window: Duration,
    #[serde(
        default = "IpBlockerParams::default_block_duration",
        with = "duration_serde"
    )]
    pub block_duration: Duration,
}

impl IpBlockerParams {
    fn default_max_failures() -> u32 {
        5
    }
    fn default_failure_window() -> Duration {
        Duration::from_secs(300)
    }
    fn default_block_duration() -> Duration {
        Duration::from_secs(3600)
    }
}

impl Default for IpBlockerParams {
    fn default() -> Self {
        Self {
            max_failures: Self::default_max_failures(),
            failure_window: Self::default_failure_window(),
            block_duration: Self::default_block_duration(),
        }
    }
}

struct Ledger {
    fail_count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

/// Tracks failed authentications per client IP and blocks repeat
/// offenders for a fixed period. Successful authentication does not
/// clear the counter; entries age out of the window naturally.
pub struct IpBlocker {
    params: IpBlockerParams,
    redis: Option<RedisConnection>,
    memory: parking_lot::Mutex<HashMap<IpAddr, Ledger>>,
}

impl IpBlocker {
    pub fn new(params: IpBlockerParams, redis: Option<RedisConnection>) -> Self {
        Self {
            params,
            redis,
            memory: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_blocked(&self, ip: IpAddr) -> bool {
        if let Some(redis) = &self.redis {
            let mut check = cmd("EXISTS");
            check.arg(format!("blocked_ip:{ip}"));
            match redis.query(check).await {
                Ok(value) => {
                    return matches!(value, redis_conn::RedisValue::Int(n) if n > 0);
                }
                Err(err) => {
                    tracing::warn!("ip blocker backend failed, using memory ledger: {err:#}");
                }
            }
        }

        let now = Instant::now();
        self.memory
            .lock()
            .get(&ip)
            .and_then(|ledger| ledger.blocked_until)
            .map(|until| until > now)
            .unwrap_or(false)
    }

    /// Record one failed authentication attempt from `ip`, blocking it
    /// when the failure budget inside the window is spent.
    pub async fn record_failure(&self, ip: IpAddr) {
        if let Some(redis) = &self.redis {
            match self.record_failure_redis(redis, ip).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!("ip blocker backend failed, using memory ledger: {err:#}");
                }
            }
        }
        self.record_failure_memory(ip);
    }

    async fn record_failure_redis(
        &self,
        redis: &RedisConnection,
        ip: IpAddr,
    ) -> anyhow::Result<()> {
        let key = format!("failed_attempts:{ip}");
        let mut incr = cmd("INCR");
        incr.arg(&key);
        let count = match redis.query(incr).await? {
            redis_conn::RedisValue::Int(n) => n,
            other => anyhow::bail!("unexpected INCR reply: {other:?}"),
        };

        if count == 1 {
            let mut expire = cmd("EXPIRE");
            expire
                .arg(&key)
                .arg(self.params.failure_window.as_secs());
            redis.query(expire).await?;
        }

        if count >= i64::from(self.params.max_failures) {
            let mut block = cmd("SETEX");
            block
                .arg(format!("blocked_ip:{ip}"))
                .arg(self.params.block_duration.as_secs())
                .arg("1");
            redis.query(block).await?;
            BLOCKED_IPS.inc();
            tracing::warn!("blocked IP address for abuse: {ip}");
        }
        Ok(())
    }

    fn record_failure_memory(&self, ip: IpAddr) {
        let now = Instant::now();
        let mut memory = self.memory.lock();
        let ledger = memory.entry(ip).or_insert(Ledger {
            fail_count: 0,
            window_start: now,
            blocked_until: None,
        });

        if now.duration_since(ledger.window_start) > self.params.failure_window {
            ledger.fail_count = 0;
            ledger.window_start = now;
        }
        ledger.fail_count += 1;

        if ledger.fail_count >= self.params.max_failures {
            ledger.blocked_until = Some(now + self.params.block_duration);
            BLOCKED_IPS.inc();
            tracing::warn!("blocked IP address for abuse: {ip}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn blocker(params: IpBlockerParams) -> IpBlocker {
        IpBlocker::new(params, None)
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    #[tokio::test]
    async fn blocks_after_max_failures() {
        let blocker = blocker(IpBlockerParams::default());
        for _ in 0..4 {
            blocker.record_failure(ip(1)).await;
            assert!(!blocker.is_blocked(ip(1)).await);
        }
        blocker.record_failure(ip(1)).await;
        assert!(blocker.is_blocked(ip(1)).await);
        // other clients are unaffected
        assert!(!blocker.is_blocked(ip(2)).await);
    }

    #[tokio::test]
    async fn block_expires() {
        let blocker = blocker(IpBlockerParams {
            max_failures: 1,
            block_duration: Duration::from_millis(20),
            ..IpBlockerParams::default()
        });
        blocker.record_failure(ip(3)).await;
        assert!(blocker.is_blocked(ip(3)).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocker.is_blocked(ip(3)).await);
    }

    #[tokio::test]
    async fn failures_outside_window_do_not_accumulate() {
        let blocker = blocker(IpBlockerParams {
            max_failures: 2,
            failure_window: Duration::from_millis(10),
            ..IpBlockerParams::default()
        });
        blocker.record_failure(ip(4)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        blocker.record_failure(ip(4)).await;
        assert!(!blocker.is_blocked(ip(4)).await);
    }
}
