//! Behavioral detector
//!
//! Maintains one sliding-window profile per source IP and flags brute-force,
//! credential-stuffing and distributed-campaign patterns:
//! - rate flag: failures per window above threshold
//! - pattern flag: usernames tried match a dictionary of common probe names
//! - distributed flag: the same username tried from several IPs against the
//!   same target within a short window
//!
//! The profile map is bounded; at capacity the least-recently-updated profile
//! is evicted (logged as a capacity event, never an error).

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::config::DetectorConfig;
use crate::models::AuthEvent;

/// Flags and counters produced for one observed event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehavioralFindings {
    /// Failures-per-window threshold exceeded
    pub rate_flag: bool,
    /// Usernames tried form a dictionary pattern
    pub pattern_flag: bool,
    /// Same username hit from several IPs against the same target
    pub distributed_flag: bool,
    /// Successful login following a burst of failures from the same IP
    pub success_after_failures: bool,
    pub failures_in_window: u32,
    pub failures_in_burst: u32,
    pub distinct_usernames: usize,
    pub distinct_targets: usize,
}

impl BehavioralFindings {
    pub fn any_flag(&self) -> bool {
        self.rate_flag || self.pattern_flag || self.distributed_flag || self.success_after_failures
    }
}

/// Time-bounded counter, pruned lazily on each update
#[derive(Debug, Default)]
struct SlidingWindow {
    timestamps: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    fn record(&mut self, at: DateTime<Utc>, window: Duration) {
        self.prune(at, window);
        self.timestamps.push_back(at);
    }

    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while let Some(front) = self.timestamps.front() {
            if *front <= cutoff {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn count(&mut self, now: DateTime<Utc>, window: Duration) -> usize {
        self.prune(now, window);
        self.timestamps.len()
    }
}

/// Per-source-IP aggregate, owned exclusively by the detector
#[derive(Debug)]
struct IpProfile {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    /// Failures within the rate window (e.g. 10 min)
    failures: SlidingWindow,
    /// Failures within the burst window (e.g. 60 s)
    failures_burst: SlidingWindow,
    /// All attempts within the long window (e.g. 1 h)
    attempts: SlidingWindow,
    usernames: HashSet<String>,
    /// Subset of usernames that hit the probe wordlist
    wordlist_hits: HashSet<String>,
    targets: HashSet<String>,
}

impl IpProfile {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            first_seen: at,
            last_seen: at,
            failures: SlidingWindow::default(),
            failures_burst: SlidingWindow::default(),
            attempts: SlidingWindow::default(),
            usernames: HashSet::new(),
            wordlist_hits: HashSet::new(),
            targets: HashSet::new(),
        }
    }
}

/// Behavioral detector over per-IP sliding-window profiles.
///
/// Profiles live in a sharded concurrent map keyed by source IP, so updates
/// for one IP serialize on that entry while unrelated IPs proceed in
/// parallel. There is no detector-wide lock.
pub struct BehavioralDetector {
    config: DetectorConfig,
    wordlist: HashSet<String>,
    profiles: DashMap<IpAddr, IpProfile>,
    /// (target host, username) -> source IPs with their last attempt time,
    /// for distributed-campaign correlation
    target_index: DashMap<(String, String), HashMap<IpAddr, DateTime<Utc>>>,
    evictions: AtomicU64,
}

impl BehavioralDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let wordlist = config
            .probe_wordlist
            .iter()
            .map(|s| s.to_lowercase())
            .collect();

        Self {
            config,
            wordlist,
            profiles: DashMap::new(),
            target_index: DashMap::new(),
            evictions: AtomicU64::new(0),
        }
    }

    /// Update the source IP's profile with one event and return the
    /// behavioral flags for it. O(1) amortized per call; holds only the
    /// profile's own map entry while mutating it.
    pub fn observe(&self, event: &AuthEvent) -> BehavioralFindings {
        let now = event.timestamp;
        let rate_window = Duration::seconds(self.config.rate_window_secs as i64);
        let burst_window = Duration::seconds(self.config.burst_window_secs as i64);
        let long_window = Duration::seconds(self.config.long_window_secs as i64);

        if !self.profiles.contains_key(&event.source_ip) && self.profiles.len() >= self.config.max_profiles {
            self.evict_lru();
        }

        let mut entry = self
            .profiles
            .entry(event.source_ip)
            .or_insert_with(|| IpProfile::new(now));
        let profile = entry.value_mut();
        profile.last_seen = now;
        profile.attempts.record(now, long_window);

        if !event.username.is_empty() {
            let lower = event.username.to_lowercase();
            if self.wordlist.contains(&lower) {
                profile.wordlist_hits.insert(lower);
            }
            profile.usernames.insert(event.username.clone());
        }
        profile.targets.insert(event.target_host.clone());

        // The success-after-burst flag reads the failure count *before*
        // this event, so a success never counts itself.
        let prior_failures = profile.failures.count(now, rate_window) as u32;

        if event.is_failure() {
            profile.failures.record(now, rate_window);
            profile.failures_burst.record(now, burst_window);
        }

        let failures_in_window = profile.failures.count(now, rate_window) as u32;
        let failures_in_burst = profile.failures_burst.count(now, burst_window) as u32;

        let rate_flag = failures_in_window >= self.config.rate_threshold;
        let pattern_flag = profile.wordlist_hits.len() >= self.config.pattern_min_hits as usize;
        let success_after_failures =
            !event.is_failure() && prior_failures >= self.config.rate_threshold;

        let distinct_usernames = profile.usernames.len();
        let distinct_targets = profile.targets.len();
        drop(entry);

        let distributed_flag = event.is_failure() && self.update_target_index(event);

        if rate_flag || pattern_flag || distributed_flag {
            debug!(
                ip = %event.source_ip,
                failures = failures_in_window,
                usernames = distinct_usernames,
                rate = rate_flag,
                pattern = pattern_flag,
                distributed = distributed_flag,
                "behavioral flags raised"
            );
        }

        BehavioralFindings {
            rate_flag,
            pattern_flag,
            distributed_flag,
            success_after_failures,
            failures_in_window,
            failures_in_burst,
            distinct_usernames,
            distinct_targets,
        }
    }

    /// Record this (target, username, source) and check whether enough
    /// distinct IPs hit the same pair within the distributed window.
    fn update_target_index(&self, event: &AuthEvent) -> bool {
        if event.username.is_empty() {
            return false;
        }

        let now = event.timestamp;
        let window = Duration::seconds(self.config.distributed_window_secs as i64);
        let key = (event.target_host.clone(), event.username.clone());

        let mut sources = self.target_index.entry(key).or_default();
        sources.insert(event.source_ip, now);

        let cutoff = now - window;
        sources.retain(|_, seen| *seen > cutoff);

        sources.len() >= self.config.distributed_min_ips as usize
    }

    /// Soft-fail at capacity: drop the least-recently-updated profile
    fn evict_lru(&self) {
        let oldest = self
            .profiles
            .iter()
            .min_by_key(|entry| entry.value().last_seen)
            .map(|entry| *entry.key());

        if let Some(ip) = oldest {
            self.profiles.remove(&ip);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            warn!(%ip, "profile map at capacity, evicted least-recently-updated entry");
        }
    }

    /// Drop profiles idle past the eviction period and stale index entries.
    /// Run periodically from the engine.
    pub fn cleanup_idle(&self) -> usize {
        let now = Utc::now();
        let idle_cutoff = now - Duration::seconds(self.config.idle_eviction_secs as i64);
        let index_cutoff = now - Duration::seconds(self.config.distributed_window_secs as i64);

        let before = self.profiles.len();
        self.profiles.retain(|_, p| p.last_seen > idle_cutoff);
        let removed = before - self.profiles.len();

        self.target_index.retain(|_, sources| {
            sources.retain(|_, seen| *seen > index_cutoff);
            !sources.is_empty()
        });

        if removed > 0 {
            debug!("Evicted {} idle profiles", removed);
        }
        removed
    }

    pub fn tracked_profiles(&self) -> usize {
        self.profiles.len()
    }

    pub fn capacity_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// First/last-seen for one tracked IP, for admin surfaces
    pub fn profile_span(&self, ip: &IpAddr) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.profiles
            .get(ip)
            .map(|p| (p.first_seen, p.last_seen))
    }
}
