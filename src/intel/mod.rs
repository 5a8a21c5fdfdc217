//! Threat intelligence aggregator
//!
//! Unifies the local static feed with pluggable external reputation sources.
//! Each external source is independently cached and rate limited; sources are
//! queried concurrently with per-source timeouts and joined under one overall
//! deadline so a stalled source cannot stall classification.
//!
//! Partial failure is the normal case: every source's contribution to one
//! lookup is a tagged [`SourceReport`] (fresh, stale, or unavailable), and
//! fusion pattern-matches over those variants. Nothing on this path returns
//! an error to the pipeline.

pub mod cache;
pub mod limiter;
pub mod sources;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::IntelConfig;

pub use cache::{CacheLookup, ReputationCache};
pub use limiter::QuotaLimiter;
pub use sources::{HttpSource, LocalFeed, ReputationSource, SourceReply};

/// Cached result of one reputation lookup from one source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub source: String,
    /// Sub-score in [0, 100]
    pub score: f64,
    /// Categorical tags (tor, proxy, vpn, datacenter, abuse)
    pub tags: Vec<String>,
    pub country: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One source's contribution to a lookup
#[derive(Debug, Clone)]
pub enum SourceReport {
    /// Live or unexpired cached data
    Fresh(ReputationRecord),
    /// Expired cached data served because the live path was unavailable
    Stale(ReputationRecord),
    /// No data for this lookup; degraded, not an error
    Unavailable { source: String },
}

impl SourceReport {
    pub fn record(&self) -> Option<&ReputationRecord> {
        match self {
            SourceReport::Fresh(r) | SourceReport::Stale(r) => Some(r),
            SourceReport::Unavailable { .. } => None,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            SourceReport::Fresh(r) | SourceReport::Stale(r) => &r.source,
            SourceReport::Unavailable { source } => source,
        }
    }
}

/// Fused reputation for one IP, consumed by the risk classifier
#[derive(Debug, Clone, Default)]
pub struct ReputationSummary {
    pub reports: Vec<SourceReport>,
    /// Composite score in [0, 100]
    pub composite: f64,
    /// Union of tags across contributing sources
    pub tags: Vec<String>,
    pub country: Option<String>,
    /// Whether any external source contributed data (live or stale)
    pub external_available: bool,
}

impl ReputationSummary {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

struct SourceHandle {
    source: Box<dyn ReputationSource>,
    limiter: QuotaLimiter,
}

/// Multi-source reputation aggregator
pub struct ReputationAggregator {
    cache: Arc<ReputationCache>,
    local: LocalFeed,
    sources: Vec<Arc<SourceHandle>>,
    cache_ttl_secs: u64,
    per_source_timeout: Duration,
    overall_timeout: Duration,
    external_weight: f64,
}

impl ReputationAggregator {
    pub fn new(config: &IntelConfig) -> Result<Self> {
        let mut sources = Vec::new();
        for source_config in config.sources.iter().filter(|s| s.enabled) {
            let source = HttpSource::new(source_config, config.per_source_timeout_secs)?;
            sources.push(Arc::new(SourceHandle {
                source: Box::new(source),
                limiter: QuotaLimiter::new(
                    source_config.per_minute_limit,
                    source_config.daily_limit,
                ),
            }));
        }

        Ok(Self {
            cache: Arc::new(ReputationCache::new()),
            local: LocalFeed::new(config.local_feed.clone()),
            sources,
            cache_ttl_secs: config.cache_ttl_secs,
            per_source_timeout: Duration::from_secs(config.per_source_timeout_secs),
            overall_timeout: Duration::from_secs(config.overall_timeout_secs),
            external_weight: config.external_weight,
        })
    }

    /// Register an additional source with its own quota budgets
    pub fn add_source(&mut self, source: Box<dyn ReputationSource>, per_minute: u32, daily: u32) {
        self.sources.push(Arc::new(SourceHandle {
            source,
            limiter: QuotaLimiter::new(per_minute, daily),
        }));
    }

    /// Query all configured sources for one IP.
    ///
    /// Synchronous from the caller's perspective; internally the external
    /// sources run concurrently, each behind cache, quota and timeout.
    pub async fn lookup(&self, ip: IpAddr) -> Vec<SourceReport> {
        let mut handles = Vec::with_capacity(self.sources.len());
        for handle in &self.sources {
            let handle = handle.clone();
            let cache = self.cache.clone();
            let ttl = self.cache_ttl_secs;
            let per_source_timeout = self.per_source_timeout;
            handles.push(tokio::spawn(async move {
                query_source(&handle, &cache, ip, ttl, per_source_timeout).await
            }));
        }

        let joined = tokio::time::timeout(self.overall_timeout, async {
            let mut reports = Vec::with_capacity(handles.len());
            for handle in handles {
                match handle.await {
                    Ok(report) => reports.push(report),
                    Err(e) => warn!("reputation task panicked: {}", e),
                }
            }
            reports
        })
        .await;

        match joined {
            Ok(reports) => reports,
            Err(_) => {
                // Abandoned, not cancelled with cleanup: the stragglers still
                // write their results to the cache when they finish.
                warn!(%ip, "reputation lookup exceeded overall deadline, degrading");
                self.sources
                    .iter()
                    .map(|h| SourceReport::Unavailable {
                        source: h.source.name().to_string(),
                    })
                    .collect()
            }
        }
    }

    /// Lookup plus fusion into a single composite summary
    pub async fn assess(&self, ip: IpAddr) -> ReputationSummary {
        let reports = self.lookup(ip).await;
        self.fuse(ip, reports)
    }

    /// Composite = external_weight x max(external sub-scores) +
    /// (1 - external_weight) x local score when external data exists,
    /// else the local score alone.
    fn fuse(&self, ip: IpAddr, reports: Vec<SourceReport>) -> ReputationSummary {
        let local = self.local.lookup(ip);
        let local_score = local.as_ref().map(|r| r.score).unwrap_or(0.0);

        let external_max = reports
            .iter()
            .filter_map(|r| r.record())
            .map(|r| r.score)
            .fold(None::<f64>, |acc, s| Some(acc.map_or(s, |a: f64| a.max(s))));

        let composite = match external_max {
            Some(external) => {
                self.external_weight * external + (1.0 - self.external_weight) * local_score
            }
            None => local_score,
        }
        .clamp(0.0, 100.0);

        let mut tags: Vec<String> = Vec::new();
        let mut country = None;
        for record in reports.iter().filter_map(|r| r.record()) {
            for tag in &record.tags {
                if !tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
                    tags.push(tag.clone());
                }
            }
            if country.is_none() {
                country = record.country.clone();
            }
        }
        if let Some(local_reply) = local {
            for tag in local_reply.tags {
                if !tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
                    tags.push(tag);
                }
            }
        }

        debug!(%ip, composite, external = external_max.is_some(), "reputation fused");

        ReputationSummary {
            external_available: external_max.is_some(),
            reports,
            composite,
            tags,
            country,
        }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        self.cache.hit_rate()
    }

    pub fn limiter_rejections(&self) -> u64 {
        self.sources.iter().map(|h| h.limiter.rejections()).sum()
    }

    pub fn cleanup_expired(&self) -> usize {
        self.cache.cleanup_expired()
    }
}

/// One source's cache -> quota -> live-query path. Failures of any step
/// degrade to stale data or `Unavailable`; nothing propagates as an error.
async fn query_source(
    handle: &SourceHandle,
    cache: &ReputationCache,
    ip: IpAddr,
    ttl_secs: u64,
    per_source_timeout: Duration,
) -> SourceReport {
    let name = handle.source.name().to_string();

    let stale = match cache.get(ip, &name) {
        CacheLookup::Fresh(record) => return SourceReport::Fresh(record),
        CacheLookup::Stale(record) => Some(record),
        CacheLookup::Miss => None,
    };

    if !handle.limiter.try_acquire() {
        debug!(%ip, source = %name, "quota exhausted, falling back to cache");
        return match stale {
            Some(record) => SourceReport::Stale(record),
            None => SourceReport::Unavailable { source: name },
        };
    }

    match tokio::time::timeout(per_source_timeout, handle.source.query(ip)).await {
        Ok(Ok(reply)) => {
            let record = cache::record_with_ttl(&name, reply.score, reply.tags, reply.country, ttl_secs);
            cache.insert(ip, record.clone());
            SourceReport::Fresh(record)
        }
        Ok(Err(e)) => {
            warn!(%ip, source = %name, "reputation query failed: {:#}", e);
            degraded(stale, name)
        }
        Err(_) => {
            warn!(%ip, source = %name, "reputation query timed out");
            degraded(stale, name)
        }
    }
}

fn degraded(stale: Option<ReputationRecord>, source: String) -> SourceReport {
    match stale {
        Some(record) => SourceReport::Stale(record),
        None => SourceReport::Unavailable { source },
    }
}
