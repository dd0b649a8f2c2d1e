//! DNS resolution for mail-exchanger discovery.
//!
//! Lookups go through a sharded `(domain, kind)` TTL cache. On a miss, up
//! to three configured nameservers are queried concurrently and the first
//! successful non-empty answer wins; the losing queries are cancelled.
//! An MX miss falls back to A then AAAA, synthesizing a pseudo-MX record
//! so that domains without explicit MX still route to their host.
use futures::stream::{FuturesUnordered, StreamExt};
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::Name;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;

pub mod cache;
mod record;
pub mod resolver;

pub use cache::{CachedAnswer, ShardedDnsCache};
pub use record::{DnsRecord, RecordKind};
pub use resolver::{
    fully_qualify, ptr_host, Answer, DnsError, FailingResolver, HickoryResolver, Resolver,
    TestResolver,
};

/// How many nameservers to race for a single query.
const MAX_PARALLEL_QUERIES: usize = 3;

static MX_IN_PROGRESS: LazyLock<prometheus::IntGauge> = LazyLock::new(|| {
    prometheus::register_int_gauge!(
        "dns_mx_resolve_in_progress",
        "number of MX resolutions currently in progress"
    )
    .unwrap()
});
static MX_SUCCESS: LazyLock<prometheus::IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "dns_mx_resolve_status_ok",
        "total number of successful MX resolutions"
    )
    .unwrap()
});
static MX_FAIL: LazyLock<prometheus::IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "dns_mx_resolve_status_fail",
        "total number of failed MX resolutions"
    )
    .unwrap()
});
static CACHE_HIT: LazyLock<prometheus::IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "dns_cache_hit",
        "total number of lookups satisfied by the DNS cache",
        &["kind"]
    )
    .unwrap()
});
static CACHE_MISS: LazyLock<prometheus::IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "dns_cache_miss",
        "total number of lookups that had to query a nameserver",
        &["kind"]
    )
    .unwrap()
});
static LOOKUP_DURATION: LazyLock<prometheus::HistogramVec> = LazyLock::new(|| {
    prometheus::register_histogram_vec!(
        "dns_lookup_duration_seconds",
        "duration of DNS lookups, by record kind",
        &["kind"]
    )
    .unwrap()
});

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DnsParams {
    /// Overall deadline for a single resolution, fallbacks included.
    /// Each racing nameserver query gets half of this.
    #[serde(default = "DnsParams::default_timeout", with = "duration_serde")]
    pub timeout: Duration,
    /// Cap applied on top of the record's own TTL.
    #[serde(default = "DnsParams::default_cache_ttl", with = "duration_serde")]
    pub cache_ttl: Duration,
    /// TTL for cached NXDOMAIN and empty answers.
    #[serde(default = "DnsParams::default_negative_ttl", with = "duration_serde")]
    pub negative_ttl: Duration,
    /// Number of cache shards; rounded up to a power of two.
    #[serde(default = "DnsParams::default_shard_count")]
    pub shard_count: usize,
    /// Maximum number of concurrent in-flight resolutions.
    #[serde(default = "DnsParams::default_max_fanout")]
    pub max_fanout: usize,
    /// Upstream nameservers. Empty means use the system resolver.
    #[serde(default)]
    pub nameservers: Vec<SocketAddr>,
}

impl DnsParams {
    fn default_timeout() -> Duration {
        Duration::from_secs(5)
    }
    fn default_cache_ttl() -> Duration {
        Duration::from_secs(300)
    }
    fn default_negative_ttl() -> Duration {
        Duration::from_secs(60)
    }
    fn default_shard_count() -> usize {
        16
    }
    fn default_max_fanout() -> usize {
        128
    }
}

impl Default for DnsParams {
    fn default() -> Self {
        Self {
            timeout: Self::default_timeout(),
            cache_ttl: Self::default_cache_ttl(),
            negative_ttl: Self::default_negative_ttl(),
            shard_count: Self::default_shard_count(),
            max_fanout: Self::default_max_fanout(),
            nameservers: vec![],
        }
    }
}

/// One MX host in priority order (lower is preferred).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MxHost {
    pub host: String,
    pub priority: u16,
}

/// The outcome of resolving a domain's mail exchangers. An empty `hosts`
/// is the terminal "no MX" answer, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MxResolution {
    pub domain: String,
    pub hosts: Vec<MxHost>,
    /// Set when no MX record existed and the host itself answered for
    /// A or AAAA, yielding a synthesized pseudo-MX.
    pub fallback: Option<RecordKind>,
}

impl MxResolution {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Host names in ascending priority order, ties in stable input order.
    pub fn hosts_in_order(&self) -> Vec<&str> {
        self.hosts.iter().map(|mx| mx.host.as_str()).collect()
    }
}

type FlightKey = (String, RecordKind);

/// The resolution service: cache, nameserver set, and fan-out control.
/// Construct one at startup and share it by reference.
pub struct DnsService {
    resolvers: Vec<Arc<dyn Resolver>>,
    cache: ShardedDnsCache,
    params: DnsParams,
    fanout: Semaphore,
    flights: Mutex<HashMap<FlightKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl DnsService {
    pub fn new(params: DnsParams) -> Result<Self, DnsError> {
        let resolvers: Vec<Arc<dyn Resolver>> = if params.nameservers.is_empty() {
            vec![Arc::new(HickoryResolver::system().map_err(|err| {
                DnsError::Resolution(format!("failed to initialize system resolver: {err}"))
            })?)]
        } else {
            params
                .nameservers
                .iter()
                .map(|addr| {
                    Arc::new(HickoryResolver::for_nameserver(*addr, params.timeout / 2))
                        as Arc<dyn Resolver>
                })
                .collect()
        };
        Ok(Self::with_resolvers(resolvers, params))
    }

    /// Build with explicit resolver implementations; used by tests.
    pub fn with_resolvers(resolvers: Vec<Arc<dyn Resolver>>, params: DnsParams) -> Self {
        let fanout = Semaphore::new(params.max_fanout.max(1));
        Self {
            cache: ShardedDnsCache::new(params.shard_count),
            resolvers,
            fanout,
            flights: Mutex::new(HashMap::new()),
            params,
        }
    }

    pub fn cache(&self) -> &ShardedDnsCache {
        &self.cache
    }

    pub fn params(&self) -> &DnsParams {
        &self.params
    }

    /// Resolve the mail exchangers for `domain`, in priority order.
    pub async fn resolve_mx(&self, domain: &str) -> Result<MxResolution, DnsError> {
        MX_IN_PROGRESS.inc();
        let result = self.resolve_mx_impl(domain).await;
        MX_IN_PROGRESS.dec();
        if result.is_ok() {
            MX_SUCCESS.inc();
        } else {
            MX_FAIL.inc();
        }
        result
    }

    async fn resolve_mx_impl(&self, domain: &str) -> Result<MxResolution, DnsError> {
        let key = cache_key(domain);

        if let Some(answer) = self.cache.get(&key, RecordKind::Mx) {
            CACHE_HIT.with_label_values(&["MX"]).inc();
            return Ok(resolution_from_answer(&key, &answer));
        }

        let flight = self.flight_lock(&key, RecordKind::Mx);
        let _guard = flight.lock().await;
        if let Some(answer) = self.cache.get(&key, RecordKind::Mx) {
            CACHE_HIT.with_label_values(&["MX"]).inc();
            return Ok(resolution_from_answer(&key, &answer));
        }
        CACHE_MISS.with_label_values(&["MX"]).inc();

        let (answer, ttl) = self.lookup_mx_remote(&key).await?;
        self.cache.put(&key, RecordKind::Mx, answer.clone(), ttl);
        self.flights.lock().remove(&(key.clone(), RecordKind::Mx));

        Ok(resolution_from_answer(&key, &answer))
    }

    /// The uncached MX walk: race the nameservers for MX, then fall back
    /// to A and AAAA, synthesizing a pseudo-MX for whichever answers
    /// first. Timeout and transport errors are never cached.
    async fn lookup_mx_remote(&self, key: &str) -> Result<(CachedAnswer, Duration), DnsError> {
        let _permit = self.fanout.acquire().await.expect("semaphore never closed");
        let timer = LOOKUP_DURATION.with_label_values(&["MX"]).start_timer();
        let name = fully_qualify(key)?;

        let deadline = self.params.timeout;
        let result = timeout(deadline, async {
            let mut last_err = None;
            let mut negative = CachedAnswer::Empty;

            match self.query_race(name.clone(), RecordType::MX).await {
                Ok(answer) if !answer.is_empty() => {
                    let ttl = self.positive_ttl(answer.expires);
                    let mut hosts: Vec<(u16, String)> = answer
                        .records
                        .iter()
                        .filter_map(|r| r.as_mx())
                        .map(|mx| {
                            (
                                mx.preference(),
                                host_string(&mx.exchange().to_lowercase()),
                            )
                        })
                        .collect();
                    hosts.sort_by_key(|(pref, _)| *pref);

                    let expires_at = Instant::now() + ttl;
                    let records = hosts
                        .into_iter()
                        .map(|(pref, host)| DnsRecord {
                            value: host,
                            kind: RecordKind::Mx,
                            priority: Some(pref),
                            expires_at,
                        })
                        .collect();
                    return Ok((CachedAnswer::Records(records), ttl));
                }
                Ok(answer) => {
                    if answer.nxdomain {
                        negative = CachedAnswer::NxDomain;
                    }
                }
                Err(err) => {
                    last_err = Some(err);
                }
            }

            // No MX answer: try the host itself.
            for kind in [RecordKind::A, RecordKind::Aaaa] {
                match self.resolve_kind(key, kind).await {
                    Ok(CachedAnswer::Records(records)) if !records.is_empty() => {
                        let ttl = records
                            .first()
                            .map(|r| r.expires_at.saturating_duration_since(Instant::now()))
                            .unwrap_or(self.params.negative_ttl);
                        let pseudo = DnsRecord {
                            value: key.to_string(),
                            kind,
                            priority: Some(10),
                            expires_at: Instant::now() + ttl,
                        };
                        return Ok((CachedAnswer::Records(vec![pseudo]), ttl));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        last_err = Some(err);
                    }
                }
            }

            match last_err {
                // Every path errored out; report it rather than caching.
                Some(err) => Err(err),
                None => Ok((negative, self.params.negative_ttl)),
            }
        })
        .await
        .map_err(|_| DnsError::Timeout {
            name: key.to_string(),
            duration: deadline,
        })?;

        timer.observe_duration();
        result
    }

    /// Cache-aware single-kind lookup.
    pub async fn resolve_kind(
        &self,
        domain: &str,
        kind: RecordKind,
    ) -> Result<CachedAnswer, DnsError> {
        let key = cache_key(domain);
        let label = kind.to_string();
        if let Some(answer) = self.cache.get(&key, kind) {
            CACHE_HIT.with_label_values(&[label.as_str()]).inc();
            return Ok(answer);
        }

        let flight = self.flight_lock(&key, kind);
        let _guard = flight.lock().await;
        if let Some(answer) = self.cache.get(&key, kind) {
            CACHE_HIT.with_label_values(&[label.as_str()]).inc();
            return Ok(answer);
        }
        CACHE_MISS.with_label_values(&[label.as_str()]).inc();

        let timer = LOOKUP_DURATION
            .with_label_values(&[label.as_str()])
            .start_timer();
        let name = fully_qualify(&key)?;
        let answer = self.query_race(name, kind.record_type()).await?;
        timer.observe_duration();

        let (cached, ttl) = if answer.is_empty() {
            (
                if answer.nxdomain {
                    CachedAnswer::NxDomain
                } else {
                    CachedAnswer::Empty
                },
                self.params.negative_ttl,
            )
        } else {
            let ttl = self.positive_ttl(answer.expires);
            let expires_at = Instant::now() + ttl;
            let records = answer
                .records
                .iter()
                .filter_map(|r| rdata_to_string(r, kind))
                .map(|value| DnsRecord {
                    value,
                    kind,
                    priority: None,
                    expires_at,
                })
                .collect();
            (CachedAnswer::Records(records), ttl)
        };

        self.cache.put(&key, kind, cached.clone(), ttl);
        self.flights.lock().remove(&(key, kind));
        Ok(cached)
    }

    /// Find the PTR name for the domain's first address, if any.
    pub async fn resolve_ptr(&self, domain: &str) -> Result<Option<String>, DnsError> {
        let key = cache_key(domain);
        if let Some(answer) = self.cache.get(&key, RecordKind::Ptr) {
            CACHE_HIT.with_label_values(&["PTR"]).inc();
            return Ok(first_record_value(&answer));
        }

        let addr = match self.resolve_kind(&key, RecordKind::A).await? {
            CachedAnswer::Records(records) => records
                .first()
                .and_then(|r| r.value.parse::<IpAddr>().ok()),
            _ => None,
        };
        let Some(addr) = addr else {
            self.cache.put(
                &key,
                RecordKind::Ptr,
                CachedAnswer::Empty,
                self.params.negative_ttl,
            );
            return Ok(None);
        };

        CACHE_MISS.with_label_values(&["PTR"]).inc();
        let name = fully_qualify(&ptr_host(addr))?;
        let answer = self.query_race(name, RecordType::PTR).await?;

        let ptr_name = answer
            .records
            .iter()
            .filter_map(|r| r.as_ptr())
            .map(|ptr| host_string(&ptr.0))
            .next();

        let (cached, ttl) = match &ptr_name {
            Some(value) => {
                let ttl = self.positive_ttl(answer.expires);
                (
                    CachedAnswer::Records(vec![DnsRecord {
                        value: value.clone(),
                        kind: RecordKind::Ptr,
                        priority: None,
                        expires_at: Instant::now() + ttl,
                    }]),
                    ttl,
                )
            }
            None => (CachedAnswer::Empty, self.params.negative_ttl),
        };
        self.cache.put(&key, RecordKind::Ptr, cached, ttl);

        Ok(ptr_name)
    }

    /// Resolve many domains: compute the missing set per shard, fan out
    /// the remote lookups bounded by the concurrency cap, insert the
    /// fresh answers in one bulk pass per shard, then assemble results.
    pub async fn resolve_mx_batch(
        &self,
        domains: &[String],
    ) -> HashMap<String, Result<MxResolution, DnsError>> {
        let keys: Vec<String> = domains.iter().map(|d| cache_key(d)).collect();
        let missing = self.cache.missing(&keys, RecordKind::Mx);

        let lookups = missing.iter().map(|key| async move {
            let result = self.lookup_mx_remote(key).await;
            (key.clone(), result)
        });
        let fresh: Vec<(String, Result<(CachedAnswer, Duration), DnsError>)> =
            futures::future::join_all(lookups).await;

        let mut bulk = vec![];
        let mut errors: HashMap<String, DnsError> = HashMap::new();
        for (key, result) in fresh {
            match result {
                Ok((answer, ttl)) => bulk.push((key, RecordKind::Mx, answer, ttl)),
                Err(err) => {
                    errors.insert(key, err);
                }
            }
        }
        self.cache.put_bulk(bulk);

        let mut results = HashMap::new();
        for (domain, key) in domains.iter().zip(keys.iter()) {
            let entry = if let Some(err) = errors.get(key) {
                Err(err.clone())
            } else {
                match self.cache.get(key, RecordKind::Mx) {
                    Some(answer) => Ok(resolution_from_answer(key, &answer)),
                    None => Err(DnsError::Resolution(format!(
                        "MX answer for {key} disappeared from cache"
                    ))),
                }
            };
            results.insert(domain.clone(), entry);
        }
        results
    }

    /// Race up to three nameservers; first successful non-empty answer
    /// wins and the rest are dropped. A clean negative answer beats a
    /// transport error.
    async fn query_race(&self, name: Name, rrtype: RecordType) -> Result<Answer, DnsError> {
        let per_query = self.params.timeout / 2;
        let mut futs = FuturesUnordered::new();
        for resolver in self.resolvers.iter().take(MAX_PARALLEL_QUERIES) {
            let resolver = resolver.clone();
            let name = name.clone();
            futs.push(async move {
                match timeout(per_query, resolver.query(name.clone(), rrtype)).await {
                    Ok(result) => result,
                    Err(_) => Err(DnsError::Timeout {
                        name: name.to_string(),
                        duration: per_query,
                    }),
                }
            });
        }

        let mut negative: Option<Answer> = None;
        let mut last_err: Option<DnsError> = None;
        while let Some(result) = futs.next().await {
            match result {
                Ok(answer) if !answer.is_empty() => return Ok(answer),
                Ok(answer) => {
                    negative.get_or_insert(answer);
                }
                Err(err) => {
                    tracing::debug!("query for {name} {rrtype} failed: {err}");
                    last_err.replace(err);
                }
            }
        }

        match negative {
            Some(answer) => Ok(answer),
            None => Err(last_err.unwrap_or_else(|| {
                DnsError::Resolution(format!("no nameservers configured for {name}"))
            })),
        }
    }

    fn positive_ttl(&self, expires: Instant) -> Duration {
        expires
            .saturating_duration_since(Instant::now())
            .min(self.params.cache_ttl)
    }

    fn flight_lock(&self, key: &str, kind: RecordKind) -> Arc<tokio::sync::Mutex<()>> {
        self.flights
            .lock()
            .entry((key.to_string(), kind))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn cache_key(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

fn host_string(name: &Name) -> String {
    let mut host = name.to_ascii();
    if host.ends_with('.') {
        host.pop();
    }
    host
}

fn rdata_to_string(
    rdata: &hickory_resolver::proto::rr::RData,
    kind: RecordKind,
) -> Option<String> {
    match kind {
        RecordKind::A => rdata.as_a().map(|a| a.0.to_string()),
        RecordKind::Aaaa => rdata.as_aaaa().map(|a| a.0.to_string()),
        RecordKind::Ns => rdata.as_ns().map(|ns| host_string(&ns.0)),
        RecordKind::Ptr => rdata.as_ptr().map(|ptr| host_string(&ptr.0)),
        RecordKind::Mx => rdata.as_mx().map(|mx| host_string(mx.exchange())),
    }
}

fn first_record_value(answer: &CachedAnswer) -> Option<String> {
    match answer {
        CachedAnswer::Records(records) => records.first().map(|r| r.value.clone()),
        _ => None,
    }
}

fn resolution_from_answer(domain: &str, answer: &CachedAnswer) -> MxResolution {
    match answer {
        CachedAnswer::Records(records) => {
            let fallback = records
                .first()
                .filter(|r| r.kind != RecordKind::Mx)
                .map(|r| r.kind);
            let hosts = records
                .iter()
                .map(|r| MxHost {
                    host: r.value.clone(),
                    priority: r.priority.unwrap_or(0),
                })
                .collect();
            MxResolution {
                domain: domain.to_string(),
                hosts,
                fallback,
            }
        }
        CachedAnswer::Empty | CachedAnswer::NxDomain => MxResolution {
            domain: domain.to_string(),
            hosts: vec![],
            fallback: None,
        },
    }
}
