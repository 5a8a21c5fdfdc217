//! Reputation cache
//!
//! One record per (IP, source) pair with TTL. Expired records are retained
//! as stale fallbacks for rate-limited or failed live queries; they are only
//! dropped once well past their expiry.

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::ReputationRecord;

/// Stale records are kept this many TTLs past expiry before cleanup
const STALE_RETENTION_FACTOR: i64 = 7;

/// Result of one cache probe
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// Unexpired record
    Fresh(ReputationRecord),
    /// Expired record, usable as a degraded fallback
    Stale(ReputationRecord),
    Miss,
}

/// Cache hit/lookup counters
#[derive(Debug, Default)]
pub struct CacheStats {
    pub lookups: AtomicU64,
    pub hits: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.lookups.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        }
    }
}

/// TTL cache over (IP, source name) pairs
pub struct ReputationCache {
    records: RwLock<HashMap<(IpAddr, String), ReputationRecord>>,
    stats: CacheStats,
}

impl Default for ReputationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReputationCache {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    /// Probe the cache for one (IP, source) record.
    ///
    /// A fresh record counts as a hit; a stale record is returned but does
    /// not count, so the hit rate reflects avoided live queries within TTL.
    pub fn get(&self, ip: IpAddr, source: &str) -> CacheLookup {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);

        let records = self.records.read();
        match records.get(&(ip, source.to_string())) {
            Some(record) if record.expires_at > Utc::now() => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Fresh(record.clone())
            }
            Some(record) => CacheLookup::Stale(record.clone()),
            None => CacheLookup::Miss,
        }
    }

    /// Insert or replace the record for its (IP, source) pair
    pub fn insert(&self, ip: IpAddr, record: ReputationRecord) {
        let mut records = self.records.write();
        records.insert((ip, record.source.clone()), record);
    }

    /// Drop records stale beyond the retention horizon
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut records = self.records.write();
        let before = records.len();

        records.retain(|_, record| {
            let ttl = record.expires_at - record.fetched_at;
            record.expires_at + ttl * STALE_RETENTION_FACTOR as i32 > now
        });

        let removed = before - records.len();
        if removed > 0 {
            debug!("Dropped {} long-stale reputation records", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn hit_rate(&self) -> f64 {
        self.stats.hit_rate()
    }
}

/// Build a record expiring `ttl_secs` from now
pub fn record_with_ttl(
    source: &str,
    score: f64,
    tags: Vec<String>,
    country: Option<String>,
    ttl_secs: u64,
) -> ReputationRecord {
    let now = Utc::now();
    ReputationRecord {
        source: source.to_string(),
        score,
        tags,
        country,
        fetched_at: now,
        expires_at: now + Duration::seconds(ttl_secs as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
    }

    #[test]
    fn test_fresh_roundtrip() {
        let cache = ReputationCache::new();
        let record = record_with_ttl("feed-a", 80.0, vec!["abuse".into()], None, 3600);
        cache.insert(ip(), record.clone());

        match cache.get(ip(), "feed-a") {
            CacheLookup::Fresh(found) => {
                assert_eq!(found.score, record.score);
                assert_eq!(found.tags, record.tags);
            }
            other => panic!("expected fresh hit, got {:?}", other),
        }
    }

    #[test]
    fn test_expired_record_served_stale() {
        let cache = ReputationCache::new();
        let mut record = record_with_ttl("feed-a", 80.0, vec![], None, 3600);
        record.fetched_at = Utc::now() - Duration::seconds(7200);
        record.expires_at = Utc::now() - Duration::seconds(3600);
        cache.insert(ip(), record);

        assert!(matches!(cache.get(ip(), "feed-a"), CacheLookup::Stale(_)));
    }

    #[test]
    fn test_miss_and_per_source_keys() {
        let cache = ReputationCache::new();
        cache.insert(ip(), record_with_ttl("feed-a", 10.0, vec![], None, 3600));

        assert!(matches!(cache.get(ip(), "feed-b"), CacheLookup::Miss));
        let other = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
        assert!(matches!(cache.get(other, "feed-a"), CacheLookup::Miss));
    }

    #[test]
    fn test_hit_rate_counts_fresh_only() {
        let cache = ReputationCache::new();
        cache.insert(ip(), record_with_ttl("feed-a", 10.0, vec![], None, 3600));

        cache.get(ip(), "feed-a"); // fresh
        cache.get(ip(), "feed-b"); // miss
        assert!((cache.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cleanup_drops_long_stale() {
        let cache = ReputationCache::new();

        let mut ancient = record_with_ttl("feed-a", 10.0, vec![], None, 60);
        ancient.fetched_at = Utc::now() - Duration::seconds(86_400);
        ancient.expires_at = Utc::now() - Duration::seconds(86_340);
        cache.insert(ip(), ancient);
        cache.insert(
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
            record_with_ttl("feed-a", 10.0, vec![], None, 3600),
        );

        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
