//! Per-endpoint circuit breaker.
//!
//! Each endpoint tracks consecutive failures; at the configured threshold
//! the circuit opens and calls are rejected without touching the endpoint.
//! After `recovery_timeout` the next caller moves the circuit to half-open,
//! where a bounded number of probes may be in flight at once. Any half-open
//! success closes the circuit; any failure re-opens it.
//!
//! Outcomes are recorded through a [`BreakerPermit`]: dropping the permit
//! without recording anything (a cancelled caller) releases the half-open
//! slot but counts neither success nor failure.
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use thiserror::Error;

static STATE_GAUGE: LazyLock<prometheus::IntGaugeVec> = LazyLock::new(|| {
    prometheus::register_int_gauge_vec!(
        "circuit_breaker_state",
        "Current state of circuit breaker (0=open, 1=half-open, 2=closed)",
        &["endpoint"]
    )
    .unwrap()
});
static FAILURES: LazyLock<prometheus::IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "circuit_breaker_failures_total",
        "Number of failures tracked by circuit breaker",
        &["endpoint"]
    )
    .unwrap()
});
static TRIPS: LazyLock<prometheus::IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "circuit_breaker_trips_total",
        "Number of times circuit breaker has been tripped",
        &["endpoint"]
    )
    .unwrap()
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakerError {
    #[error("circuit breaker for {endpoint} is open, retry after {retry_after:?}")]
    Open {
        endpoint: String,
        retry_after: Duration,
    },
    #[error("circuit breaker for {endpoint} is half-open and at max in-flight probes")]
    AtCapacity { endpoint: String },
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct BreakerParams {
    #[serde(default = "BreakerParams::default_failure_threshold")]
    pub failure_threshold: usize,
    #[serde(
        default = "BreakerParams::default_recovery_timeout",
        with = "duration_serde"
    )]
    pub recovery_timeout: Duration,
    #[serde(default = "BreakerParams::default_half_open_max")]
    pub half_open_max: usize,
}

impl BreakerParams {
    fn default_failure_threshold() -> usize {
        5
    }
    fn default_recovery_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_half_open_max() -> usize {
        3
    }
}

impl Default for BreakerParams {
    fn default() -> Self {
        Self {
            failure_threshold: Self::default_failure_threshold(),
            recovery_timeout: Self::default_recovery_timeout(),
            half_open_max: Self::default_half_open_max(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Open,
    HalfOpen,
    Closed,
}

impl BreakerState {
    fn gauge_value(self) -> i64 {
        match self {
            Self::Open => 0,
            Self::HalfOpen => 1,
            Self::Closed => 2,
        }
    }
}

struct Inner {
    state: BreakerState,
    failure_count: usize,
    opened_at: Option<Instant>,
    half_open_in_flight: usize,
}

pub struct CircuitBreaker {
    endpoint: String,
    params: BreakerParams,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new<S: Into<String>>(endpoint: S, params: BreakerParams) -> Self {
        let endpoint = endpoint.into();
        STATE_GAUGE
            .with_label_values(&[endpoint.as_str()])
            .set(BreakerState::Closed.gauge_value());
        Self {
            endpoint,
            params,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Ask to pass through the breaker. On success the returned permit
    /// must be resolved with `success()` or `failure()`; dropping it
    /// unresolved only releases the half-open slot.
    pub fn permit(self: &Arc<Self>) -> Result<BreakerPermit, BreakerError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                if elapsed < self.params.recovery_timeout {
                    return Err(BreakerError::Open {
                        endpoint: self.endpoint.clone(),
                        retry_after: self.params.recovery_timeout - elapsed,
                    });
                }
                self.enter_half_open(&mut inner);
                inner.half_open_in_flight += 1;
                Ok(BreakerPermit {
                    breaker: self.clone(),
                    holds_half_open_slot: true,
                    resolved: false,
                })
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight >= self.params.half_open_max {
                    return Err(BreakerError::AtCapacity {
                        endpoint: self.endpoint.clone(),
                    });
                }
                inner.half_open_in_flight += 1;
                Ok(BreakerPermit {
                    breaker: self.clone(),
                    holds_half_open_slot: true,
                    resolved: false,
                })
            }
            BreakerState::Closed => Ok(BreakerPermit {
                breaker: self.clone(),
                holds_half_open_slot: false,
                resolved: false,
            }),
        }
    }

    /// Run `fut` behind the breaker, recording its outcome.
    pub async fn call<T, E, Fut>(self: &Arc<Self>, fut: Fut) -> Result<Result<T, E>, BreakerError>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut permit = self.permit()?;
        let result = fut.await;
        match &result {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        Ok(result)
    }

    fn enter_open(&self, inner: &mut Inner) {
        if inner.state != BreakerState::Open {
            TRIPS.with_label_values(&[self.endpoint.as_str()]).inc();
            tracing::warn!("circuit breaker for {} is now OPEN", self.endpoint);
        }
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        STATE_GAUGE
            .with_label_values(&[self.endpoint.as_str()])
            .set(BreakerState::Open.gauge_value());
    }

    fn enter_half_open(&self, inner: &mut Inner) {
        inner.state = BreakerState::HalfOpen;
        inner.half_open_in_flight = 0;
        STATE_GAUGE
            .with_label_values(&[self.endpoint.as_str()])
            .set(BreakerState::HalfOpen.gauge_value());
        tracing::info!("circuit breaker for {} is now HALF-OPEN", self.endpoint);
    }

    fn enter_closed(&self, inner: &mut Inner) {
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.half_open_in_flight = 0;
        inner.opened_at = None;
        STATE_GAUGE
            .with_label_values(&[self.endpoint.as_str()])
            .set(BreakerState::Closed.gauge_value());
        tracing::info!("circuit breaker for {} is now CLOSED", self.endpoint);
    }

    fn record_success(&self, held_slot: bool) {
        let mut inner = self.inner.lock();
        if held_slot && inner.half_open_in_flight > 0 {
            inner.half_open_in_flight -= 1;
        }
        if inner.state == BreakerState::HalfOpen {
            self.enter_closed(&mut inner);
        }
        inner.failure_count = 0;
    }

    fn record_failure(&self, held_slot: bool) {
        let mut inner = self.inner.lock();
        if held_slot && inner.half_open_in_flight > 0 {
            inner.half_open_in_flight -= 1;
        }
        inner.failure_count += 1;
        FAILURES.with_label_values(&[self.endpoint.as_str()]).inc();
        if inner.state == BreakerState::HalfOpen
            || inner.failure_count >= self.params.failure_threshold
        {
            self.enter_open(&mut inner);
        }
    }

    fn release_slot(&self) {
        let mut inner = self.inner.lock();
        if inner.half_open_in_flight > 0 {
            inner.half_open_in_flight -= 1;
        }
    }
}

pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    holds_half_open_slot: bool,
    resolved: bool,
}

impl BreakerPermit {
    pub fn success(&mut self) {
        if !self.resolved {
            self.resolved = true;
            self.breaker.record_success(self.holds_half_open_slot);
        }
    }

    pub fn failure(&mut self) {
        if !self.resolved {
            self.resolved = true;
            self.breaker.record_failure(self.holds_half_open_slot);
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved && self.holds_half_open_slot {
            self.breaker.release_slot();
        }
    }
}

/// Hands out one breaker per endpoint, creating on first use.
pub struct BreakerRegistry {
    params: BreakerParams,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(params: BreakerParams) -> Self {
        Self {
            params,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.params)))
            .clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick_params() -> BreakerParams {
        BreakerParams {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(50),
            half_open_max: 1,
        }
    }

    async fn failing_call(breaker: &Arc<CircuitBreaker>) -> Result<Result<(), &'static str>, BreakerError> {
        breaker.call(async { Err::<(), _>("boom") }).await
    }

    #[tokio::test]
    async fn trips_open_at_threshold() {
        let breaker = Arc::new(CircuitBreaker::new("test-trip", quick_params()));
        for _ in 0..3 {
            failing_call(&breaker).await.unwrap().unwrap_err();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // While open and before recovery, the wrapped op must not run.
        let ran = AtomicUsize::new(0);
        let outcome = breaker
            .call(async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await;
        assert!(matches!(outcome, Err(BreakerError::Open { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recovers_through_half_open() {
        let breaker = Arc::new(CircuitBreaker::new("test-recover", quick_params()));
        for _ in 0..3 {
            failing_call(&breaker).await.unwrap().unwrap_err();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        // First call after the recovery window probes and closes on success.
        breaker
            .call(async { Ok::<(), &'static str>(()) })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = Arc::new(CircuitBreaker::new("test-reopen", quick_params()));
        for _ in 0..3 {
            failing_call(&breaker).await.unwrap().unwrap_err();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        failing_call(&breaker).await.unwrap().unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn half_open_bounds_in_flight() {
        let breaker = Arc::new(CircuitBreaker::new("test-capacity", quick_params()));
        for _ in 0..3 {
            failing_call(&breaker).await.unwrap().unwrap_err();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let probe = breaker.permit().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Second concurrent probe exceeds half_open_max=1.
        assert!(matches!(
            breaker.permit(),
            Err(BreakerError::AtCapacity { .. })
        ));

        // Dropping the probe unresolved (caller cancelled) frees the slot
        // without closing or re-opening the circuit.
        drop(probe);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        let mut probe = breaker.permit().unwrap();
        probe.success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn registry_reuses_instances() {
        let registry = BreakerRegistry::new(quick_params());
        let a = registry.get_or_create("mx1.example.com:25");
        let b = registry.get_or_create("mx1.example.com:25");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
