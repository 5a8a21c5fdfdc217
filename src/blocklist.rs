//! Block lifecycle management
//!
//! - At most one active record per network; re-blocks fold into it
//! - Expiry extension is monotonic: a re-block never shortens a block
//! - Whitelisted networks can never be blocked
//! - Expired records are swept on an interval and the sweep is idempotent

use anyhow::{bail, Result};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classifier::RiskVerdict;
use crate::models::{AuditAction, AuditEntry, AuditLog, BlockRecord, BlockSource, WhitelistEntry};

/// Networks exempt from blocking. Exact IPs are /32 (or /128) networks.
#[derive(Debug, Default)]
pub struct Whitelist {
    entries: RwLock<Vec<WhitelistEntry>>,
}

impl Whitelist {
    pub fn new(networks: &[IpNetwork]) -> Self {
        let entries = networks
            .iter()
            .map(|n| WhitelistEntry::new(*n, None))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.entries.read().iter().any(|e| e.network.contains(ip))
    }

    /// True when any whitelisted network overlaps `network`
    pub fn overlaps(&self, network: &IpNetwork) -> bool {
        self.entries
            .read()
            .iter()
            .any(|e| e.network.contains(network.ip()) || network.contains(e.network.ip()))
    }

    pub fn add(&self, network: IpNetwork, comment: Option<String>) -> bool {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.network == network) {
            return false;
        }
        entries.push(WhitelistEntry::new(network, comment));
        true
    }

    pub fn remove(&self, network: &IpNetwork) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.network != *network);
        entries.len() < before
    }

    pub fn entries(&self) -> Vec<WhitelistEntry> {
        self.entries.read().clone()
    }
}

/// In-memory block table with audit trail
pub struct BlockManager {
    blocks: DashMap<IpNetwork, BlockRecord>,
    whitelist: Arc<Whitelist>,
    audit: Arc<AuditLog>,
}

impl BlockManager {
    pub fn new(whitelist: Arc<Whitelist>, audit: Arc<AuditLog>) -> Self {
        Self {
            blocks: DashMap::new(),
            whitelist,
            audit,
        }
    }

    /// Carry out the response implied by a verdict. Returns the block
    /// record when one was created or extended.
    pub fn apply(&self, verdict: &RiskVerdict) -> Option<BlockRecord> {
        if verdict.whitelisted || !verdict.action.is_block() {
            return None;
        }
        let duration = match verdict.action {
            crate::classifier::ResponseAction::Block { duration_secs } => Some(duration_secs),
            _ => return None,
        };
        let source = BlockSource::Auto(verdict.severity.to_string());
        match self.block(verdict.source_ip.into(), verdict.reason_text(), duration, source) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(ip = %verdict.source_ip, "Block refused: {}", e);
                None
            }
        }
    }

    /// Block a network, folding into any existing active record.
    ///
    /// Expiry only ever moves later: the new deadline is the later of the
    /// existing one and the requested one, and a permanent block stays
    /// permanent.
    pub fn block(
        &self,
        network: IpNetwork,
        reason: String,
        duration_secs: Option<i64>,
        source: BlockSource,
    ) -> Result<BlockRecord> {
        if self.whitelist.overlaps(&network) {
            bail!("{} is whitelisted", network);
        }

        let snapshot = match self.blocks.entry(network) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.active && !record.is_expired() {
                    // Fold into the live record
                    let requested =
                        duration_secs.map(|d| Utc::now() + chrono::Duration::seconds(d));
                    record.expires_at = match (record.expires_at, requested) {
                        (Some(current), Some(new)) => Some(current.max(new)),
                        // Either side permanent -> permanent
                        _ => None,
                    };
                    if record.reasons.last() != Some(&reason) {
                        record.reasons.push(reason.clone());
                    }
                    record.hit_count += 1;
                    debug!(network = %network, hits = record.hit_count, "Block extended");
                } else {
                    // Dead record under this key, start a fresh lifecycle
                    *record =
                        BlockRecord::new(network, reason.clone(), source.clone(), duration_secs);
                    info!(network = %network, source = %source, "Blocked");
                }
                record.clone()
            }
            Entry::Vacant(vacant) => {
                info!(network = %network, source = %source, "Blocked");
                vacant
                    .insert(BlockRecord::new(
                        network,
                        reason.clone(),
                        source.clone(),
                        duration_secs,
                    ))
                    .clone()
            }
        };

        self.audit.record(
            AuditEntry::new(AuditAction::Block, Some(network.ip()), reason)
                .with_actor(source.to_string()),
        );
        Ok(snapshot)
    }

    /// Deactivate a block. Idempotent: unblocking a network that is not
    /// actively blocked returns None and changes nothing.
    pub fn unblock(&self, network: &IpNetwork, actor: &str) -> Option<BlockRecord> {
        let mut entry = self.blocks.get_mut(network)?;
        let record = entry.value_mut();
        if !record.active {
            return None;
        }
        record.active = false;
        record.unblocked_at = Some(Utc::now());
        record.unblocked_by = Some(actor.to_string());
        let snapshot = record.clone();
        drop(entry);

        info!(network = %network, actor = actor, "Unblocked");
        self.audit.record(
            AuditEntry::new(AuditAction::Unblock, Some(network.ip()), "unblocked")
                .with_actor(actor),
        );
        Some(snapshot)
    }

    /// Deactivate every expired block. Returns how many were expired;
    /// running the sweep twice in a row is a no-op the second time.
    pub fn expire_due(&self) -> usize {
        let due: Vec<IpNetwork> = self
            .blocks
            .iter()
            .filter(|r| r.active && r.is_expired())
            .map(|r| *r.key())
            .collect();

        for network in &due {
            if let Some(mut entry) = self.blocks.get_mut(network) {
                let record = entry.value_mut();
                // Re-check under the entry lock; a re-block may have
                // extended it since the scan
                if record.active && record.is_expired() {
                    record.active = false;
                    record.unblocked_at = Some(Utc::now());
                    record.unblocked_by = Some("expiry".to_string());
                    info!(network = %network, "Block expired");
                }
            }
        }
        due.len()
    }

    /// Whether an address is currently blocked. An expired record answers
    /// false even before the sweep deactivates it.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.blocks
            .iter()
            .any(|r| r.active && !r.is_expired() && r.network.contains(ip))
    }

    pub fn get(&self, network: &IpNetwork) -> Option<BlockRecord> {
        self.blocks.get(network).map(|r| r.value().clone())
    }

    pub fn list_active(&self) -> Vec<BlockRecord> {
        let mut active: Vec<BlockRecord> = self
            .blocks
            .iter()
            .filter(|r| r.active && !r.is_expired())
            .map(|r| r.value().clone())
            .collect();
        active.sort_by_key(|r| r.created_at);
        active
    }

    /// Full history including inactive records, newest first
    pub fn list_all(&self) -> Vec<BlockRecord> {
        let mut all: Vec<BlockRecord> = self.blocks.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub fn active_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|r| r.active && !r.is_expired())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    fn manager() -> BlockManager {
        BlockManager::new(Arc::new(Whitelist::default()), Arc::new(AuditLog::new(100)))
    }

    #[test]
    fn test_block_and_unblock() {
        let mgr = manager();
        let net: IpNetwork = ip(7).into();
        mgr.block(net, "brute force".into(), Some(3600), BlockSource::Manual)
            .unwrap();

        assert!(mgr.is_blocked(ip(7)));
        assert!(!mgr.is_blocked(ip(8)));
        assert_eq!(mgr.list_active().len(), 1);

        let record = mgr.unblock(&net, "admin").unwrap();
        assert!(!record.active);
        assert_eq!(record.unblocked_by.as_deref(), Some("admin"));
        assert!(!mgr.is_blocked(ip(7)));
    }

    #[test]
    fn test_unblock_is_idempotent() {
        let mgr = manager();
        let net: IpNetwork = ip(7).into();
        mgr.block(net, "x".into(), None, BlockSource::Manual).unwrap();
        assert!(mgr.unblock(&net, "admin").is_some());
        assert!(mgr.unblock(&net, "admin").is_none());
        assert!(mgr.unblock(&ip(9).into(), "admin").is_none());
    }

    #[test]
    fn test_reblock_folds_into_one_record() {
        let mgr = manager();
        let net: IpNetwork = ip(7).into();
        mgr.block(net, "first".into(), Some(3600), BlockSource::Manual)
            .unwrap();
        let record = mgr
            .block(net, "second".into(), Some(60), BlockSource::Manual)
            .unwrap();

        assert_eq!(mgr.list_active().len(), 1);
        assert_eq!(record.hit_count, 2);
        assert_eq!(record.reasons, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_racing_blocks_keep_one_active_record() {
        let mgr = Arc::new(manager());
        let net: IpNetwork = ip(7).into();

        let mut handles = Vec::new();
        for i in 0..8 {
            let mgr = mgr.clone();
            handles.push(std::thread::spawn(move || {
                mgr.block(net, format!("hit {}", i), Some(3600), BlockSource::Manual)
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // The map entry serializes the racing writers onto one record
        assert_eq!(mgr.list_active().len(), 1);
        let record = mgr.get(&net).unwrap();
        assert!(record.active);
        assert_eq!(record.hit_count, 8);
    }

    #[test]
    fn test_extension_is_monotonic() {
        let mgr = manager();
        let net: IpNetwork = ip(7).into();
        let long = mgr
            .block(net, "x".into(), Some(7200), BlockSource::Manual)
            .unwrap();
        // Shorter re-block must not pull the deadline earlier
        let after_short = mgr
            .block(net, "y".into(), Some(60), BlockSource::Manual)
            .unwrap();
        assert_eq!(after_short.expires_at, long.expires_at);

        // Longer re-block pushes it later
        let after_long = mgr
            .block(net, "z".into(), Some(86_400), BlockSource::Manual)
            .unwrap();
        assert!(after_long.expires_at > long.expires_at);

        // Permanent wins over any deadline
        let permanent = mgr.block(net, "p".into(), None, BlockSource::Manual).unwrap();
        assert!(permanent.expires_at.is_none());
    }

    #[test]
    fn test_whitelisted_network_refused() {
        let net: IpNetwork = "10.0.0.0/8".parse().unwrap();
        let mgr = BlockManager::new(
            Arc::new(Whitelist::new(&[net])),
            Arc::new(AuditLog::new(100)),
        );
        let target: IpNetwork = "10.1.2.3/32".parse().unwrap();
        assert!(mgr
            .block(target, "x".into(), None, BlockSource::Manual)
            .is_err());
        assert!(!mgr.is_blocked("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn test_expiry_sweep_idempotent() {
        let mgr = manager();
        let net: IpNetwork = ip(7).into();
        mgr.block(net, "x".into(), Some(-60), BlockSource::Manual)
            .unwrap();

        // Expired but unswept records already answer not-blocked
        assert!(!mgr.is_blocked(ip(7)));

        assert_eq!(mgr.expire_due(), 1);
        assert_eq!(mgr.expire_due(), 0);

        let record = mgr.get(&net).unwrap();
        assert!(!record.active);
        assert_eq!(record.unblocked_by.as_deref(), Some("expiry"));
    }

    #[test]
    fn test_block_after_expiry_starts_fresh() {
        let mgr = manager();
        let net: IpNetwork = ip(7).into();
        mgr.block(net, "old".into(), Some(-60), BlockSource::Manual)
            .unwrap();
        mgr.expire_due();

        let record = mgr
            .block(net, "new".into(), Some(3600), BlockSource::Manual)
            .unwrap();
        assert!(record.active);
        assert_eq!(record.hit_count, 1);
        assert_eq!(record.reasons, vec!["new".to_string()]);
        assert!(mgr.is_blocked(ip(7)));
    }

    #[test]
    fn test_cidr_block_covers_range() {
        let mgr = manager();
        let net: IpNetwork = "203.0.113.0/24".parse().unwrap();
        mgr.block(net, "range".into(), None, BlockSource::Manual)
            .unwrap();
        assert!(mgr.is_blocked(ip(1)));
        assert!(mgr.is_blocked(ip(254)));
        assert!(!mgr.is_blocked("203.0.114.1".parse().unwrap()));
    }

    #[test]
    fn test_whitelist_add_remove() {
        let wl = Whitelist::default();
        let net: IpNetwork = "192.0.2.1/32".parse().unwrap();
        assert!(wl.add(net, Some("bastion".into())));
        assert!(!wl.add(net, None));
        assert!(wl.contains("192.0.2.1".parse().unwrap()));
        assert!(wl.remove(&net));
        assert!(!wl.remove(&net));
        assert!(!wl.contains("192.0.2.1".parse().unwrap()));
    }
}
