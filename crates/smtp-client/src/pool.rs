//! Persistent SMTP connections keyed by `host:port`.
//!
//! Borrowed connections are exclusively owned until returned. Release
//! health-checks with NOOP and puts the connection back on the idle
//! list; a failed check discards it. Dropping a [`PooledConnection`]
//! without releasing (an error path or a cancelled task) also discards,
//! so the per-host count can never leak.
use crate::client::{ClientError, SmtpClient};
use crate::types::SmtpClientTimeouts;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::timeout;

const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(30);

static POOL_SIZE: LazyLock<prometheus::IntGaugeVec> = LazyLock::new(|| {
    prometheus::register_int_gauge_vec!(
        "smtp_pool_connections",
        "number of SMTP connections currently owned by the pool, per host",
        &["host"]
    )
    .unwrap()
});
static CONNECTION_ERRORS: LazyLock<prometheus::IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "smtp_connection_errors_total",
        "SMTP connection errors, per host and kind",
        &["host", "kind"]
    )
    .unwrap()
});

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("SMTP pool for {host_key} exhausted after waiting {waited:?}")]
    Exhausted { host_key: String, waited: Duration },
    #[error("failed to connect to {host_key}: {error}")]
    Connect { host_key: String, error: String },
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PoolParams {
    #[serde(default = "PoolParams::default_max_per_host")]
    pub max_per_host: usize,
    #[serde(
        default = "PoolParams::default_max_lifetime",
        with = "duration_serde"
    )]
    pub max_lifetime: Duration,
    #[serde(
        default = "PoolParams::default_cleanup_interval",
        with = "duration_serde"
    )]
    pub cleanup_interval: Duration,
    #[serde(
        default = "PoolParams::default_wait_timeout",
        with = "duration_serde"
    )]
    pub wait_timeout: Duration,
    #[serde(
        default = "PoolParams::default_retry_delay",
        with = "duration_serde"
    )]
    pub retry_delay: Duration,
    #[serde(default = "PoolParams::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "PoolParams::default_ehlo_domain")]
    pub ehlo_domain: String,
    #[serde(default)]
    pub timeouts: SmtpClientTimeouts,
}

impl PoolParams {
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
    fn default_retry_delay() -> Duration {
        Duration::from_secs(1)
    }
    fn default_max_retries() -> u32 {
        3
    }
    fn default_ehlo_domain() -> String {
        "localhost".to_string()
    }
}

impl Default for PoolParams {
    fn default() -> Self {
        Self {
            max_per_host: Self::default_max_per_host(),
            max_lifetime: Self::default_max_lifetime(),
            cleanup_interval: Self::default_cleanup_interval(),
            wait_timeout: Self::default_wait_timeout(),
            retry_delay: Self::default_retry_delay(),
            max_retries: Self::default_max_retries(),
            ehlo_domain: Self::default_ehlo_domain(),
            timeouts: SmtpClientTimeouts::default(),
        }
    }
}

struct ConnState {
    client: SmtpClient,
    opened_at: Instant,
    last_used: Instant,
    failed_count: u32,
}

struct HostState {
    idle: Vec<ConnState>,
    /// idle plus borrowed
    total: usize,
}

struct HostSlot {
    host_key: String,
    state: Mutex<HostState>,
    notify: Notify,
}

impl HostSlot {
    /// Drop one owned connection and wake a waiter.
    fn forget_connection(&self) {
        let mut state = self.state.lock();
        if state.total > 0 {
            state.total -= 1;
        }
        POOL_SIZE
            .with_label_values(&[self.host_key.as_str()])
            .set(state.total as i64);
        self.notify.notify_one();
    }
}

struct PoolInner {
    params: PoolParams,
    hosts: Mutex<HashMap<String, Arc<HostSlot>>>,
    shutdown: Notify,
    stopping: AtomicBool,
}

/// The connection pool. Clone-cheap; share one per process.
#[derive(Clone)]
pub struct SmtpConnectionPool {
    inner: Arc<PoolInner>,
}

impl SmtpConnectionPool {
    pub fn new(params: PoolParams) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                params,
                hosts: Mutex::new(HashMap::new()),
                shutdown: Notify::new(),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    pub fn params(&self) -> &PoolParams {
        &self.inner.params
    }

    /// Launch the background reaper. Call once after construction;
    /// `shutdown` stops it.
    pub fn start_reaper(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(pool.inner.params.cleanup_interval) => {
                        pool.reap().await;
                    }
                    _ = pool.inner.shutdown.notified() => {
                        break;
                    }
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
        self.close_all().await;
    }

    /// Borrow a connection for `host:port`, opening one if the host is
    /// under its cap, or waiting for a release otherwise.
    pub async fn borrow(&self, host: &str, port: u16) -> Result<PooledConnection, PoolError> {
        let host_key = format!("{host}:{port}");
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(PoolError::Exhausted {
                host_key,
                waited: Duration::ZERO,
            });
        }
        let slot = self.slot(&host_key);
        let started = Instant::now();

        enum Action {
            Candidate(ConnState),
            Open,
            Wait,
        }

        loop {
            let action = {
                let mut state = slot.state.lock();
                if let Some(conn) = state.idle.pop() {
                    Action::Candidate(conn)
                } else if state.total < self.inner.params.max_per_host {
                    // Reserve the slot before the (slow) connect so a
                    // burst of borrowers cannot overshoot the cap.
                    state.total += 1;
                    POOL_SIZE
                        .with_label_values(&[host_key.as_str()])
                        .set(state.total as i64);
                    Action::Open
                } else {
                    Action::Wait
                }
            };

            match action {
                Action::Candidate(mut conn) => {
                    if self.is_valid(&mut conn).await {
                        conn.last_used = Instant::now();
                        return Ok(PooledConnection {
                            conn: Some(conn),
                            slot: slot.clone(),
                        });
                    }
                    slot.forget_connection();
                }
                Action::Open => match self.open_connection(host, port, &host_key).await {
                    Ok(client) => {
                        let now = Instant::now();
                        return Ok(PooledConnection {
                            conn: Some(ConnState {
                                client,
                                opened_at: now,
                                last_used: now,
                                failed_count: 0,
                            }),
                            slot: slot.clone(),
                        });
                    }
                    Err(err) => {
                        slot.forget_connection();
                        return Err(err);
                    }
                },
                Action::Wait => {
                    let waited = started.elapsed();
                    let Some(remaining) =
                        self.inner.params.wait_timeout.checked_sub(waited)
                    else {
                        return Err(PoolError::Exhausted { host_key, waited });
                    };
                    if timeout(remaining, slot.notify.notified()).await.is_err() {
                        return Err(PoolError::Exhausted {
                            host_key,
                            waited: started.elapsed(),
                        });
                    }
                }
            }
        }
    }

    /// A connection is reusable iff it is still connected, young
    /// enough, not failed out, and answers NOOP.
    async fn is_valid(&self, conn: &mut ConnState) -> bool {
        if !conn.client.is_connected()
            || conn.failed_count >= self.inner.params.max_retries
            || conn.opened_at.elapsed() > self.inner.params.max_lifetime
        {
            return false;
        }
        match conn.client.noop().await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!("pooled connection health check failed: {err}");
                conn.failed_count += 1;
                false
            }
        }
    }

    /// TCP connect, 220 banner, EHLO (HELO fallback), with exponential
    /// backoff across attempts. Only transport errors and transient
    /// rejections are retried.
    async fn open_connection(
        &self,
        host: &str,
        port: u16,
        host_key: &str,
    ) -> Result<SmtpClient, PoolError> {
        let params = &self.inner.params;
        let mut delay = params.retry_delay;
        let mut last_error = None;

        for attempt in 0..params.max_retries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(delay.min(MAX_CONNECT_BACKOFF)).await;
                delay = delay.saturating_mul(2);
            }

            match self.dial(host, port).await {
                Ok(client) => return Ok(client),
                Err(err) => {
                    CONNECTION_ERRORS
                        .with_label_values(&[host_key, error_kind(&err)])
                        .inc();
                    tracing::warn!(
                        "SMTP connection attempt {} failed for {host_key}: {err}",
                        attempt + 1
                    );
                    let transient = err.is_transient();
                    last_error = Some(err);
                    if !transient {
                        break;
                    }
                }
            }
        }

        Err(PoolError::Connect {
            host_key: host_key.to_string(),
            error: last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no connection attempts were made".to_string()),
        })
    }

    async fn dial(&self, host: &str, port: u16) -> Result<SmtpClient, ClientError> {
        let params = &self.inner.params;
        let addr = tokio::net::lookup_host((host, port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ClientError::ReadError {
                command: None,
                error: format!("no address found for {host}"),
            })?;

        let mut client = SmtpClient::connect(addr, host, params.timeouts).await?;
        client.ehlo(&params.ehlo_domain).await?;
        Ok(client)
    }

    fn slot(&self, host_key: &str) -> Arc<HostSlot> {
        self.inner
            .hosts
            .lock()
            .entry(host_key.to_string())
            .or_insert_with(|| {
                Arc::new(HostSlot {
                    host_key: host_key.to_string(),
                    state: Mutex::new(HostState {
                        idle: vec![],
                        total: 0,
                    }),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    /// One reaper pass: validate every idle connection, drop the stale
    /// ones, and forget hosts that emptied out.
    pub async fn reap(&self) {
        let slots: Vec<Arc<HostSlot>> =
            self.inner.hosts.lock().values().cloned().collect();

        for slot in slots {
            let candidates = {
                let mut state = slot.state.lock();
                std::mem::take(&mut state.idle)
            };

            let mut keep = vec![];
            for mut conn in candidates {
                if self.is_valid(&mut conn).await {
                    keep.push(conn);
                } else {
                    conn.client.quit().await.ok();
                    slot.forget_connection();
                }
            }

            slot.state.lock().idle.extend(keep);
        }

        self.inner
            .hosts
            .lock()
            .retain(|_, slot| slot.state.lock().total > 0);
    }

    pub async fn close_all(&self) {
        tracing::info!("shutting down SMTP connection pool");
        let slots: Vec<Arc<HostSlot>> =
            self.inner.hosts.lock().values().cloned().collect();
        for slot in slots {
            let idle = {
                let mut state = slot.state.lock();
                std::mem::take(&mut state.idle)
            };
            for mut conn in idle {
                conn.client.quit().await.ok();
                slot.forget_connection();
            }
        }
        self.inner
            .hosts
            .lock()
            .retain(|_, slot| slot.state.lock().total > 0);
    }

    /// Owned connection count for a host (idle plus borrowed).
    pub fn connection_count(&self, host: &str, port: u16) -> usize {
        let host_key = format!("{host}:{port}");
        self.inner
            .hosts
            .lock()
            .get(&host_key)
            .map(|slot| slot.state.lock().total)
            .unwrap_or(0)
    }

    fn idle_count(&self, host: &str, port: u16) -> usize {
        let host_key = format!("{host}:{port}");
        self.inner
            .hosts
            .lock()
            .get(&host_key)
            .map(|slot| slot.state.lock().idle.len())
            .unwrap_or(0)
    }
}

fn error_kind(err: &ClientError) -> &'static str {
    match err {
        ClientError::Rejected(response) if response.is_transient() => "transient",
        ClientError::Rejected(_) => "rejected",
        ClientError::TimeOutResponse { .. } | ClientError::TimeOutRequest { .. } => "timeout",
        ClientError::ReadError { .. } | ClientError::WriteError { .. } => "io",
        _ => "other",
    }
}

/// An exclusively borrowed connection. Release it to give it back,
/// discard it to drop it, or just drop it (error and cancel paths) and
/// the pool forgets it.
pub struct PooledConnection {
    conn: Option<ConnState>,
    slot: Arc<HostSlot>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("host_key", &self.slot.host_key)
            .finish()
    }
}

impl PooledConnection {
    pub fn client_mut(&mut self) -> &mut SmtpClient {
        &mut self
            .conn
            .as_mut()
            .expect("connection accessed after release")
            .client
    }

    pub fn host_key(&self) -> &str {
        &self.slot.host_key
    }

    /// Record a protocol failure on this connection; enough of them and
    /// the validity predicate will refuse to reuse it.
    pub fn mark_failed(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.failed_count += 1;
        }
    }

    /// Health-check with NOOP and return the connection to the idle
    /// list; on failure the connection is discarded instead.
    pub async fn release(mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        match conn.client.noop().await {
            Ok(()) => {
                conn.last_used = Instant::now();
                let mut state = self.slot.state.lock();
                state.idle.push(conn);
                drop(state);
                self.slot.notify.notify_one();
            }
            Err(err) => {
                tracing::debug!(
                    "NOOP failed on release for {}: {err}; discarding",
                    self.slot.host_key
                );
                conn.client.quit().await.ok();
                self.slot.forget_connection();
            }
        }
    }

    /// Close and forget the connection (eg: after a 421).
    pub async fn discard(mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.client.quit().await.ok();
            self.slot.forget_connection();
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // Not released and not discarded: the borrower bailed out via
        // an error or cancellation. Dropping ConnState closes the
        // socket; the accounting must still be settled.
        if self.conn.take().is_some() {
            self.slot.forget_connection();
        }
    }
}
