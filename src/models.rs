use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Outcome of one authentication attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthOutcome {
    Success,
    Failure,
}

/// One normalized SSH authentication attempt.
///
/// Produced by the normalizer, never mutated afterwards; downstream stages
/// enrich it by carrying it alongside their own findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source_ip: IpAddr,
    pub source_port: Option<u16>,
    pub target_host: String,
    pub target_port: u16,
    pub username: String,
    pub outcome: AuthOutcome,
    pub failure_reason: Option<String>,
    pub raw: String,
}

impl AuthEvent {
    pub fn is_failure(&self) -> bool {
        self.outcome == AuthOutcome::Failure
    }
}

/// Source of a block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BlockSource {
    Manual,
    /// Automatic block, tagged with the triggering tier
    Auto(String),
}

impl std::fmt::Display for BlockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockSource::Manual => write!(f, "manual"),
            BlockSource::Auto(origin) => write!(f, "auto:{}", origin),
        }
    }
}

impl std::str::FromStr for BlockSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "manual" {
            Ok(BlockSource::Manual)
        } else if let Some(origin) = s.strip_prefix("auto:") {
            Ok(BlockSource::Auto(origin.to_string()))
        } else {
            Err(format!("Unknown block source: {}", s))
        }
    }
}

/// Lifecycle record for one blocked IP or CIDR.
///
/// At most one active record exists per network at a time; re-blocking
/// extends the existing record instead of creating a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub network: IpNetwork,
    /// Reason trail, newest last. Re-blocks append rather than overwrite.
    pub reasons: Vec<String>,
    pub source: BlockSource,
    pub created_at: DateTime<Utc>,
    /// None = permanent
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub unblocked_at: Option<DateTime<Utc>>,
    pub unblocked_by: Option<String>,
    /// Number of block decisions folded into this record
    pub hit_count: u32,
}

impl BlockRecord {
    pub fn new(
        network: IpNetwork,
        reason: String,
        source: BlockSource,
        duration_secs: Option<i64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            network,
            reasons: vec![reason],
            source,
            created_at: now,
            expires_at: duration_secs.map(|d| now + chrono::Duration::seconds(d)),
            active: true,
            unblocked_at: None,
            unblocked_by: None,
            hit_count: 1,
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires) => Utc::now() >= expires,
            None => false, // permanent
        }
    }

    /// Most recent reason, for display and alert text
    pub fn last_reason(&self) -> &str {
        self.reasons.last().map(String::as_str).unwrap_or("")
    }
}

/// Whitelist entry (exact IP or CIDR)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub network: IpNetwork,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WhitelistEntry {
    pub fn new(network: IpNetwork, comment: Option<String>) -> Self {
        Self {
            network,
            comment,
            created_at: Utc::now(),
        }
    }
}

/// Audit trail actions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AuditAction {
    Block,
    Unblock,
    Whitelist,
    Unwhitelist,
    DeliveryFailed,
    CapacityEviction,
    AnomalyDetected,
    DaemonStart,
    DaemonStop,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditAction::Block => write!(f, "BLOCK"),
            AuditAction::Unblock => write!(f, "UNBLOCK"),
            AuditAction::Whitelist => write!(f, "WHITELIST"),
            AuditAction::Unwhitelist => write!(f, "UNWHITELIST"),
            AuditAction::DeliveryFailed => write!(f, "DELIVERY_FAILED"),
            AuditAction::CapacityEviction => write!(f, "CAPACITY"),
            AuditAction::AnomalyDetected => write!(f, "ANOMALY"),
            AuditAction::DaemonStart => write!(f, "START"),
            AuditAction::DaemonStop => write!(f, "STOP"),
        }
    }
}

/// One audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub ip: Option<IpAddr>,
    pub actor: Option<String>,
    pub details: String,
}

impl AuditEntry {
    pub fn new(action: AuditAction, ip: Option<IpAddr>, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            ip,
            actor: None,
            details: details.into(),
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// Bounded in-memory audit trail.
///
/// No database schema here; the trail is a ring that admin surfaces read.
#[derive(Debug)]
pub struct AuditLog {
    entries: parking_lot::Mutex<std::collections::VecDeque<AuditEntry>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: parking_lot::Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, entry: AuditEntry) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Most recent entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.lock();
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Point-in-time metrics snapshot for dashboards
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub events_processed: u64,
    pub events_dropped: u64,
    pub lines_unmatched: u64,
    pub threats_detected: u64,
    pub verdicts_clean: u64,
    pub verdicts_low: u64,
    pub verdicts_medium: u64,
    pub verdicts_high: u64,
    pub verdicts_critical: u64,
    pub cache_hit_rate: f64,
    pub limiter_rejections: u64,
    pub active_blocks: u64,
    pub alerts_delivered: u64,
    pub alerts_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_block_record_expiry() {
        let net: IpNetwork = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)).into();
        let permanent = BlockRecord::new(net, "test".into(), BlockSource::Manual, None);
        assert!(!permanent.is_expired());

        let expired = BlockRecord::new(net, "test".into(), BlockSource::Manual, Some(-60));
        assert!(expired.is_expired());
    }

    #[test]
    fn test_block_source_roundtrip() {
        let source: BlockSource = "auto:critical".parse().unwrap();
        assert_eq!(source, BlockSource::Auto("critical".to_string()));
        assert_eq!(source.to_string(), "auto:critical");

        assert_eq!("manual".parse::<BlockSource>().unwrap(), BlockSource::Manual);
        assert!("bogus".parse::<BlockSource>().is_err());
    }

    #[test]
    fn test_audit_log_bounded() {
        let log = AuditLog::new(3);
        for i in 0..5 {
            log.record(AuditEntry::new(AuditAction::Block, None, format!("entry {}", i)));
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent(10);
        assert_eq!(recent[0].details, "entry 4");
        assert_eq!(recent[2].details, "entry 2");
    }
}
