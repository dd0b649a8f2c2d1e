use crate::record::{DnsRecord, RecordKind};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// A cached lookup outcome. Negative answers are remembered too, so
/// that NXDOMAIN and empty responses don't hammer the nameservers.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedAnswer {
    Records(Vec<DnsRecord>),
    Empty,
    NxDomain,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    answer: CachedAnswer,
    expires: Instant,
}

type Shard = HashMap<String, HashMap<RecordKind, CacheEntry>>;

/// DNS cache sharded by domain hash. Each operation locks exactly one
/// shard; bulk operations visit shards in ascending index order so a
/// pair of bulk callers can never deadlock.
pub struct ShardedDnsCache {
    shards: Vec<Mutex<Shard>>,
    mask: usize,
}

impl ShardedDnsCache {
    /// `shard_count` is rounded up to the next power of two.
    pub fn new(shard_count: usize) -> Self {
        let count = shard_count.max(1).next_power_of_two();
        Self {
            shards: (0..count).map(|_| Mutex::new(HashMap::new())).collect(),
            mask: count - 1,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, domain: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        domain.hash(&mut hasher);
        (hasher.finish() as usize) & self.mask
    }

    /// Fetch an unexpired answer. An expired entry is deleted on the way
    /// out, treating the miss as a piece of cleanup.
    pub fn get(&self, domain: &str, kind: RecordKind) -> Option<CachedAnswer> {
        let mut shard = self.shards[self.shard_index(domain)].lock();
        let by_kind = shard.get_mut(domain)?;
        match by_kind.get(&kind) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.answer.clone()),
            Some(_) => {
                by_kind.remove(&kind);
                if by_kind.is_empty() {
                    shard.remove(domain);
                }
                None
            }
            None => None,
        }
    }

    pub fn put(&self, domain: &str, kind: RecordKind, answer: CachedAnswer, ttl: Duration) {
        let mut shard = self.shards[self.shard_index(domain)].lock();
        shard.entry(domain.to_string()).or_default().insert(
            kind,
            CacheEntry {
                answer,
                expires: Instant::now() + ttl,
            },
        );
    }

    /// Of `domains`, which have no live entry for `kind`? Groups by shard
    /// so each lock is taken once.
    pub fn missing(&self, domains: &[String], kind: RecordKind) -> Vec<String> {
        let now = Instant::now();
        let mut by_shard: Vec<Vec<&String>> = vec![vec![]; self.shards.len()];
        for domain in domains {
            by_shard[self.shard_index(domain)].push(domain);
        }

        let mut result = vec![];
        for (idx, domains) in by_shard.iter().enumerate() {
            if domains.is_empty() {
                continue;
            }
            let shard = self.shards[idx].lock();
            for domain in domains {
                let live = shard
                    .get(domain.as_str())
                    .and_then(|by_kind| by_kind.get(&kind))
                    .map(|entry| entry.expires > now)
                    .unwrap_or(false);
                if !live {
                    result.push((*domain).clone());
                }
            }
        }
        result
    }

    /// Insert a batch of answers, holding each shard lock exactly once,
    /// in ascending shard order.
    pub fn put_bulk(&self, entries: Vec<(String, RecordKind, CachedAnswer, Duration)>) {
        let now = Instant::now();
        let mut by_shard: Vec<Vec<(String, RecordKind, CachedAnswer, Duration)>> =
            (0..self.shards.len()).map(|_| vec![]).collect();
        for entry in entries {
            let idx = self.shard_index(&entry.0);
            by_shard[idx].push(entry);
        }

        for (idx, batch) in by_shard.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            let mut shard = self.shards[idx].lock();
            for (domain, kind, answer, ttl) in batch {
                shard.entry(domain).or_default().insert(
                    kind,
                    CacheEntry {
                        answer,
                        expires: now + ttl,
                    },
                );
            }
        }
    }

    /// Drop every expired entry.
    pub fn cleanup(&self) {
        let now = Instant::now();
        for shard in &self.shards {
            let mut shard = shard.lock();
            for by_kind in shard.values_mut() {
                by_kind.retain(|_, entry| entry.expires > now);
            }
            shard.retain(|_, by_kind| !by_kind.is_empty());
        }
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().values().map(|by_kind| by_kind.len()).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mx(value: &str, priority: u16, ttl: Duration) -> DnsRecord {
        DnsRecord {
            value: value.to_string(),
            kind: RecordKind::Mx,
            priority: Some(priority),
            expires_at: Instant::now() + ttl,
        }
    }

    #[test]
    fn keyed_by_domain_and_kind() {
        let cache = ShardedDnsCache::new(16);
        let ttl = Duration::from_secs(60);
        cache.put(
            "example.com",
            RecordKind::Mx,
            CachedAnswer::Records(vec![mx("mx1.example.com", 10, ttl)]),
            ttl,
        );

        assert!(cache.get("example.com", RecordKind::Mx).is_some());
        assert!(cache.get("example.com", RecordKind::A).is_none());
        assert!(cache.get("other.com", RecordKind::Mx).is_none());
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache = ShardedDnsCache::new(4);
        cache.put(
            "example.com",
            RecordKind::Mx,
            CachedAnswer::Empty,
            Duration::from_millis(0),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("example.com", RecordKind::Mx), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn negative_answers_are_cached() {
        let cache = ShardedDnsCache::new(4);
        cache.put(
            "nope.example",
            RecordKind::Mx,
            CachedAnswer::NxDomain,
            Duration::from_secs(30),
        );
        assert_eq!(
            cache.get("nope.example", RecordKind::Mx),
            Some(CachedAnswer::NxDomain)
        );
    }

    #[test]
    fn missing_reports_expired_and_absent() {
        let cache = ShardedDnsCache::new(4);
        let domains: Vec<String> = (0..32).map(|i| format!("host{i}.example.com")).collect();
        cache.put(
            &domains[0],
            RecordKind::Mx,
            CachedAnswer::Empty,
            Duration::from_secs(60),
        );
        cache.put(
            &domains[1],
            RecordKind::Mx,
            CachedAnswer::Empty,
            Duration::from_millis(0),
        );
        std::thread::sleep(Duration::from_millis(5));

        let missing = cache.missing(&domains, RecordKind::Mx);
        assert_eq!(missing.len(), domains.len() - 1);
        assert!(!missing.contains(&domains[0]));
        assert!(missing.contains(&domains[1]));
    }

    #[test]
    fn bulk_put_lands_in_every_shard() {
        let cache = ShardedDnsCache::new(8);
        let entries: Vec<_> = (0..64)
            .map(|i| {
                (
                    format!("host{i}.example.com"),
                    RecordKind::A,
                    CachedAnswer::Empty,
                    Duration::from_secs(60),
                )
            })
            .collect();
        cache.put_bulk(entries);
        assert_eq!(cache.len(), 64);
        assert_eq!(
            cache.missing(
                &(0..64).map(|i| format!("host{i}.example.com")).collect::<Vec<_>>(),
                RecordKind::A
            ),
            Vec::<String>::new()
        );
    }

    #[test]
    fn cleanup_and_clear() {
        let cache = ShardedDnsCache::new(2);
        cache.put(
            "a.example.com",
            RecordKind::A,
            CachedAnswer::Empty,
            Duration::from_millis(0),
        );
        cache.put(
            "b.example.com",
            RecordKind::A,
            CachedAnswer::Empty,
            Duration::from_secs(60),
        );
        std::thread::sleep(Duration::from_millis(5));
        cache.cleanup();
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn shard_count_rounds_to_power_of_two() {
        assert_eq!(ShardedDnsCache::new(10).shard_count(), 16);
        assert_eq!(ShardedDnsCache::new(16).shard_count(), 16);
        assert_eq!(ShardedDnsCache::new(0).shard_count(), 1);
    }
}
