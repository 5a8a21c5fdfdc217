//! Staged detection pipeline
//!
//! Normalizer -> behavioral detector -> reputation + ML -> risk classifier
//! -> block manager and alert manager. Stages are connected by a bounded
//! queue; when it is full the ingest edge drops the event and counts the
//! drop instead of blocking the log reader.
//!
//! The queue worker applies each event to the behavioral profiles in
//! arrival order (a fast, synchronous step), then hands enrichment,
//! classification and response off to a per-event task. A slow reputation
//! lookup for one IP therefore never holds up scoring of the others, and
//! alert delivery runs on its own worker behind the alert manager's
//! outbox.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::alerts::AlertManager;
use crate::blocklist::{BlockManager, Whitelist};
use crate::classifier::{MlScorer, NeutralScorer, RiskClassifier, RiskVerdict, Severity};
use crate::config::Config;
use crate::detector::{BehavioralDetector, BehavioralFindings};
use crate::intel::ReputationAggregator;
use crate::models::{AuditAction, AuditEntry, AuditLog, AuthEvent, EngineSnapshot};
use crate::normalizer::EventNormalizer;

/// Cross-stage counters, all relaxed
#[derive(Default)]
struct EngineStats {
    events_processed: AtomicU64,
    events_dropped: AtomicU64,
    threats_detected: AtomicU64,
    verdicts_clean: AtomicU64,
    verdicts_low: AtomicU64,
    verdicts_medium: AtomicU64,
    verdicts_high: AtomicU64,
    verdicts_critical: AtomicU64,
}

impl EngineStats {
    fn record_verdict(&self, severity: Severity) {
        let counter = match severity {
            Severity::Clean => &self.verdicts_clean,
            Severity::Low => &self.verdicts_low,
            Severity::Medium => &self.verdicts_medium,
            Severity::High => &self.verdicts_high,
            Severity::Critical => &self.verdicts_critical,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The assembled detection engine. Construction wires every stage from
/// config; `run` drives the queue and the background timers.
pub struct Engine {
    config: Config,
    normalizer: EventNormalizer,
    detector: BehavioralDetector,
    intel: Arc<ReputationAggregator>,
    classifier: RiskClassifier,
    ml: Arc<dyn MlScorer>,
    pub whitelist: Arc<Whitelist>,
    pub blocks: Arc<BlockManager>,
    pub alerts: Arc<AlertManager>,
    pub audit: Arc<AuditLog>,
    stats: EngineStats,
    tx: mpsc::Sender<AuthEvent>,
    rx: Mutex<Option<mpsc::Receiver<AuthEvent>>>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_scorer(config, Arc::new(NeutralScorer))
    }

    pub fn with_scorer(config: Config, ml: Arc<dyn MlScorer>) -> Result<Self> {
        config.validate()?;

        let audit = Arc::new(AuditLog::new(config.general.audit_capacity));
        let whitelist = Arc::new(Whitelist::new(&config.blocks.whitelist));
        let blocks = Arc::new(BlockManager::new(whitelist.clone(), audit.clone()));
        let alerts = Arc::new(AlertManager::new(config.alerts.clone(), audit.clone())?);
        let (tx, rx) = mpsc::channel(config.general.queue_depth);

        Ok(Self {
            normalizer: EventNormalizer::new(&config.services)?,
            detector: BehavioralDetector::new(config.detector.clone()),
            intel: Arc::new(ReputationAggregator::new(&config.intel)?),
            classifier: RiskClassifier::new(config.risk.clone()),
            ml,
            whitelist,
            blocks,
            alerts,
            audit,
            stats: EngineStats::default(),
            tx,
            rx: Mutex::new(Some(rx)),
            config,
        })
    }

    /// Normalize one log line and enqueue the event if it matched.
    /// Returns the event for callers that want to inspect it.
    pub fn submit_line(&self, host: &str, line: &str) -> Option<AuthEvent> {
        let event = self.normalizer.normalize(host, line)?;
        self.submit_event(event.clone());
        Some(event)
    }

    /// Enqueue an already-normalized event. A full queue drops the event
    /// and counts it; the submitter is never blocked.
    pub fn submit_event(&self, event: AuthEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(ip = %event.source_ip, "Queue full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Run one event through the full pipeline inline. Exposed for admin
    /// lookups and tests; the queue worker splits the same work into
    /// `observe` plus a spawned `respond`.
    pub async fn process(&self, event: AuthEvent) -> RiskVerdict {
        let findings = self.observe(&event);
        self.respond(event, findings).await
    }

    /// Stage one: apply the event to the behavioral profiles. Synchronous
    /// and ordered, so profiles always reflect arrival order.
    fn observe(&self, event: &AuthEvent) -> BehavioralFindings {
        self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
        self.detector.observe(event)
    }

    /// Stages two onward: enrichment, classification and response. Safe to
    /// run concurrently across events; per-IP state lives behind sharded
    /// maps in the detector and block manager.
    async fn respond(&self, event: AuthEvent, findings: BehavioralFindings) -> RiskVerdict {
        let reputation = self.intel.assess(event.source_ip).await;
        let ml_score = self.ml.score(&event, &findings, &reputation);
        let whitelisted = self.whitelist.contains(event.source_ip);

        let verdict = self
            .classifier
            .classify(&event, &findings, &reputation, ml_score, whitelisted);
        self.stats.record_verdict(verdict.severity);

        if verdict.severity > Severity::Clean {
            self.stats.threats_detected.fetch_add(1, Ordering::Relaxed);
            debug!(
                ip = %verdict.source_ip,
                score = verdict.score,
                severity = %verdict.severity,
                "Threat classified"
            );
        }
        if findings.any_flag() && verdict.severity >= Severity::High {
            self.audit.record(AuditEntry::new(
                AuditAction::AnomalyDetected,
                Some(event.source_ip),
                verdict.reason_text(),
            ));
        }

        self.blocks.apply(&verdict);
        self.alerts.raise(&verdict);
        verdict
    }

    /// Drive the pipeline until `shutdown` fires. Spawns the maintenance
    /// timers (block sweep, idle profile eviction, cache cleanup, alert
    /// flushes) and consumes the event queue.
    pub async fn run(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("Engine already running"))?;

        self.audit
            .record(AuditEntry::new(AuditAction::DaemonStart, None, "pipeline up"));
        info!("Detection pipeline started");

        let (delivery_stop_tx, delivery_stop_rx) = mpsc::channel(1);
        let delivery = tokio::spawn(self.alerts.clone().run_delivery(delivery_stop_rx));

        let mut sweep = tokio::time::interval(Duration::from_secs(
            self.config.blocks.sweep_interval_secs,
        ));
        let mut batch_flush =
            tokio::time::interval(Duration::from_secs(self.config.alerts.batch_flush_secs));
        let mut digest_flush =
            tokio::time::interval(Duration::from_secs(self.config.alerts.digest_flush_secs));
        let mut daily = tokio::time::interval(Duration::from_secs(86_400));
        // Closed dedup windows are pruned once per window length
        let mut dedup_sweep =
            tokio::time::interval(Duration::from_secs(self.config.alerts.dedup_window_secs));
        // Profile eviction and cache cleanup share one housekeeping cadence
        let mut housekeeping = tokio::time::interval(Duration::from_secs(3600));

        // Intervals tick immediately; swallow the first round
        sweep.tick().await;
        batch_flush.tick().await;
        digest_flush.tick().await;
        daily.tick().await;
        dedup_sweep.tick().await;
        housekeeping.tick().await;

        // Enrichment tasks in flight; the shutdown drain waits for them
        let mut inflight: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    let findings = self.observe(&event);
                    let engine = self.clone();
                    inflight.spawn(async move {
                        engine.respond(event, findings).await;
                    });
                }
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
                _ = sweep.tick() => {
                    let expired = self.blocks.expire_due();
                    if expired > 0 {
                        info!(expired, "Expired blocks swept");
                    }
                }
                _ = batch_flush.tick() => {
                    self.alerts.flush_batch();
                }
                _ = digest_flush.tick() => {
                    self.alerts.flush_digest();
                }
                _ = daily.tick() => {
                    self.alerts.daily_summary();
                }
                _ = dedup_sweep.tick() => {
                    self.alerts.flush_dedup();
                }
                _ = housekeeping.tick() => {
                    self.detector.cleanup_idle();
                    self.intel.cleanup_expired();
                }
                _ = shutdown.recv() => {
                    info!("Shutdown requested, draining queue");
                    rx.close();
                    while let Some(event) = rx.recv().await {
                        let findings = self.observe(&event);
                        self.respond(event, findings).await;
                    }
                    while inflight.join_next().await.is_some() {}
                    self.alerts.flush_batch();
                    self.alerts.flush_digest();
                    self.alerts.flush_dedup();
                    break;
                }
            }
        }

        // Stop the delivery worker; it drains the outbox before returning
        let _ = delivery_stop_tx.send(()).await;
        let _ = delivery.await;

        self.audit
            .record(AuditEntry::new(AuditAction::DaemonStop, None, "pipeline down"));
        info!("Detection pipeline stopped");
        Ok(())
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            events_processed: self.stats.events_processed.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            lines_unmatched: self.normalizer.unmatched_count(),
            threats_detected: self.stats.threats_detected.load(Ordering::Relaxed),
            verdicts_clean: self.stats.verdicts_clean.load(Ordering::Relaxed),
            verdicts_low: self.stats.verdicts_low.load(Ordering::Relaxed),
            verdicts_medium: self.stats.verdicts_medium.load(Ordering::Relaxed),
            verdicts_high: self.stats.verdicts_high.load(Ordering::Relaxed),
            verdicts_critical: self.stats.verdicts_critical.load(Ordering::Relaxed),
            cache_hit_rate: self.intel.cache_hit_rate(),
            limiter_rejections: self.intel.limiter_rejections(),
            active_blocks: self.blocks.active_count() as u64,
            alerts_delivered: self.alerts.delivered(),
            alerts_failed: self.alerts.failed(),
        }
    }

    /// One-off reputation check for the admin surface
    pub async fn lookup(&self, ip: std::net::IpAddr) -> crate::intel::ReputationSummary {
        self.intel.assess(ip).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertTarget;
    use crate::models::AuthOutcome;
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};
    use uuid::Uuid;

    fn test_config() -> Config {
        let mut config = Config::with_defaults();
        // No external sources in tests; the local feed and defaults carry it
        config.intel.sources.clear();
        config
    }

    fn failure(ip: IpAddr, username: &str) -> AuthEvent {
        AuthEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source_ip: ip,
            source_port: Some(50022),
            target_host: "bastion".to_string(),
            target_port: 22,
            username: username.to_string(),
            outcome: AuthOutcome::Failure,
            failure_reason: Some("failed_password".to_string()),
            raw: String::new(),
        }
    }

    #[tokio::test]
    async fn test_single_failure_stays_below_block() {
        let engine = Engine::new(test_config()).unwrap();
        let verdict = engine
            .process(failure(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)), "alice"))
            .await;
        assert!(!verdict.action.is_block());
        assert_eq!(engine.snapshot().active_blocks, 0);
    }

    #[tokio::test]
    async fn test_repeated_failures_escalate_and_block() {
        let engine = Engine::new(test_config()).unwrap();
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

        let mut last = None;
        for username in ["root", "admin", "test", "user", "guest", "oracle", "pi", "git", "ubuntu", "postgres"] {
            last = Some(engine.process(failure(ip, username)).await);
        }
        let verdict = last.unwrap();

        assert!(verdict.severity >= Severity::High);
        assert!(verdict.action.is_block());
        assert!(engine.blocks.is_blocked(ip));

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.events_processed, 10);
        assert!(snapshot.threats_detected > 0);
        assert_eq!(snapshot.active_blocks, 1);
    }

    #[tokio::test]
    async fn test_whitelisted_ip_never_blocked() {
        let mut config = test_config();
        config.blocks.whitelist.push("203.0.113.0/24".parse().unwrap());
        let engine = Engine::new(config).unwrap();
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

        for username in ["root", "admin", "test", "user", "guest", "oracle"] {
            engine.process(failure(ip, username)).await;
        }

        assert!(!engine.blocks.is_blocked(ip));
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_and_counts() {
        let mut config = test_config();
        config.general.queue_depth = 2;
        let engine = Engine::new(config).unwrap();
        let ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9));

        // Nothing drains the queue here, so the third submit overflows
        for _ in 0..3 {
            engine.submit_event(failure(ip, "alice"));
        }
        assert_eq!(engine.snapshot().events_dropped, 1);
    }

    #[tokio::test]
    async fn test_submit_line_feeds_queue() {
        let engine = Engine::new(test_config()).unwrap();
        let event = engine
            .submit_line(
                "bastion",
                "Failed password for invalid user admin from 203.0.113.7 port 50022 ssh2",
            )
            .unwrap();
        assert_eq!(event.username, "admin");
        assert_eq!(event.source_ip, "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_run_drains_queue_on_shutdown() {
        let engine = Arc::new(Engine::new(test_config()).unwrap());
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        for username in ["root", "admin", "test", "user"] {
            engine.submit_event(failure(ip, username));
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(engine.clone().run(shutdown_rx));

        // Give the worker a moment, then stop it
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(engine.snapshot().events_processed, 4);
    }

    #[tokio::test]
    async fn test_processing_never_waits_on_delivery() {
        let mut config = test_config();
        // A target nothing listens on; connection attempts fail outright
        config.alerts.targets = vec![AlertTarget::Webhook {
            url: "http://127.0.0.1:9/alerts".to_string(),
            headers: Vec::new(),
        }];
        config.alerts.max_retries = 0;
        let engine = Engine::new(config).unwrap();
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

        for username in ["root", "admin", "test", "user", "guest", "oracle", "pi", "git"] {
            engine.process(failure(ip, username)).await;
        }

        // Verdicts landed without a single delivery attempt; the broken
        // target is only touched when the outbox drains
        let snapshot = engine.snapshot();
        assert!(snapshot.threats_detected > 0);
        assert_eq!(snapshot.alerts_delivered, 0);
        assert_eq!(snapshot.alerts_failed, 0);

        engine.alerts.deliver_pending().await;
        assert!(engine.snapshot().alerts_failed > 0);
    }

    #[tokio::test]
    async fn test_distinct_ips_score_concurrently() {
        let engine = Arc::new(Engine::new(test_config()).unwrap());
        let ip_a = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let ip_b = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9));

        let (first, second) = tokio::join!(
            engine.process(failure(ip_a, "alice")),
            engine.process(failure(ip_b, "bob")),
        );

        assert_eq!(first.source_ip, ip_a);
        assert_eq!(second.source_ip, ip_b);
        assert_eq!(engine.snapshot().events_processed, 2);
    }
}
