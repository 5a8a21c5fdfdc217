//! Alert routing, dedup and delivery
//!
//! Verdicts fan out by severity: critical and high go out immediately,
//! medium accumulates into timed batches, low into an hourly digest, and
//! everything is tallied into a daily summary. Identical alerts (same
//! source IP and dominant factor) inside the dedup window fold into one
//! envelope instead of repeating.
//!
//! Routing and delivery are decoupled: `raise` and the flush methods only
//! enqueue onto an outbox, and a dedicated delivery worker drains it. A
//! slow or down target stalls its own retries, never the detection path.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, VecDeque};
use std::io::Write as _;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::classifier::{RiskVerdict, Severity};
use crate::config::{AlertConfig, AlertTarget};
use crate::models::{AuditAction, AuditEntry, AuditLog};

/// Delivery path chosen by severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertChannel {
    Immediate,
    Batch,
    Digest,
}

impl AlertChannel {
    pub fn for_severity(severity: Severity) -> Option<Self> {
        match severity {
            Severity::Critical | Severity::High => Some(AlertChannel::Immediate),
            Severity::Medium => Some(AlertChannel::Batch),
            Severity::Low => Some(AlertChannel::Digest),
            Severity::Clean => None,
        }
    }
}

/// One alert, possibly representing several folded occurrences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEnvelope {
    pub id: Uuid,
    pub channel: AlertChannel,
    pub severity: Severity,
    pub source_ip: IpAddr,
    pub target_host: String,
    pub score: f64,
    pub reason: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Occurrences folded into this envelope
    pub count: u32,
}

impl AlertEnvelope {
    fn from_verdict(verdict: &RiskVerdict, channel: AlertChannel) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            channel,
            severity: verdict.severity,
            source_ip: verdict.source_ip,
            target_host: verdict.target_host.clone(),
            score: verdict.score,
            reason: verdict.reason_text(),
            first_seen: now,
            last_seen: now,
            count: 1,
        }
    }

    fn render(&self) -> String {
        if self.count > 1 {
            format!(
                "[{}] {} targeting {} score {:.0} ({}) x{} since {}",
                self.severity,
                self.source_ip,
                self.target_host,
                self.score,
                self.reason,
                self.count,
                self.first_seen.format("%Y-%m-%d %H:%M:%S UTC"),
            )
        } else {
            format!(
                "[{}] {} targeting {} score {:.0} ({})",
                self.severity, self.source_ip, self.target_host, self.score, self.reason,
            )
        }
    }
}

/// Outbound delivery seam
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, payload: &str) -> Result<()>;
}

/// POST payloads to an HTTP endpoint
pub struct WebhookNotifier {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String, headers: Vec<(String, String)>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("authban/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self { url, headers, client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, payload: &str) -> Result<()> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "text": payload }));
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let response = request.send().await.context("Webhook request failed")?;
        if !response.status().is_success() {
            bail!("Webhook returned {}", response.status());
        }
        Ok(())
    }
}

/// Append rendered alerts to a file, one per line
pub struct FileNotifier {
    path: PathBuf,
}

impl FileNotifier {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Notifier for FileNotifier {
    fn name(&self) -> &str {
        "file"
    }

    async fn deliver(&self, payload: &str) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open alert file {}", self.path.display()))?;
        writeln!(file, "{} {}", Utc::now().to_rfc3339(), payload)?;
        Ok(())
    }
}

/// Print rendered alerts to stdout
pub struct StdoutNotifier;

#[async_trait]
impl Notifier for StdoutNotifier {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn deliver(&self, payload: &str) -> Result<()> {
        println!("{}", payload);
        Ok(())
    }
}

/// (source IP, dominant factor) identifies "the same alert" for dedup
type DedupKey = (IpAddr, String);

/// Envelope shared between the dedup map and whatever path it was routed
/// to (outbox, batch, digest). Folds bump the count in place, so if the
/// envelope is still awaiting delivery the one notification that goes out
/// carries the accumulated occurrence count.
type SharedEnvelope = Arc<Mutex<AlertEnvelope>>;

/// Latest envelope for one dedup key during one window
struct DedupState {
    envelope: SharedEnvelope,
    window_started: DateTime<Utc>,
}

/// One queued delivery. Alerts render at delivery time so late folds are
/// still reflected; composed payloads (batches, digests, summaries) are
/// rendered up front.
enum Outbound {
    Alert(SharedEnvelope),
    Text(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DailyTally {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub clean: u64,
}

impl DailyTally {
    fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
            Severity::Clean => self.clean += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.critical + self.high + self.medium + self.low + self.clean
    }
}

/// Alert router and delivery engine
pub struct AlertManager {
    config: AlertConfig,
    notifiers: Vec<Arc<dyn Notifier>>,
    dedup: Mutex<HashMap<DedupKey, DedupState>>,
    batch: Mutex<Vec<SharedEnvelope>>,
    digest: Mutex<Vec<SharedEnvelope>>,
    tally: Mutex<DailyTally>,
    outbox: Mutex<VecDeque<Outbound>>,
    outbox_signal: Notify,
    audit: Arc<AuditLog>,
    host: String,
    delivered: AtomicU64,
    failed: AtomicU64,
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

impl AlertManager {
    pub fn new(config: AlertConfig, audit: Arc<AuditLog>) -> Result<Self> {
        let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
        for target in &config.targets {
            match target {
                AlertTarget::Webhook { url, headers } => notifiers.push(Arc::new(
                    WebhookNotifier::new(url.clone(), headers.clone(), config.delivery_timeout_secs)?,
                )),
                AlertTarget::File { path } => {
                    notifiers.push(Arc::new(FileNotifier::new(path.clone())))
                }
                AlertTarget::Stdout => notifiers.push(Arc::new(StdoutNotifier)),
            }
        }
        Ok(Self {
            config,
            notifiers,
            dedup: Mutex::new(HashMap::new()),
            batch: Mutex::new(Vec::new()),
            digest: Mutex::new(Vec::new()),
            tally: Mutex::new(DailyTally::default()),
            outbox: Mutex::new(VecDeque::new()),
            outbox_signal: Notify::new(),
            audit,
            host: local_hostname(),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    #[cfg(test)]
    fn with_notifier(config: AlertConfig, audit: Arc<AuditLog>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            notifiers: vec![notifier],
            dedup: Mutex::new(HashMap::new()),
            batch: Mutex::new(Vec::new()),
            digest: Mutex::new(Vec::new()),
            tally: Mutex::new(DailyTally::default()),
            outbox: Mutex::new(VecDeque::new()),
            outbox_signal: Notify::new(),
            audit,
            host: local_hostname(),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Route one verdict. The first alert for a dedup key goes onto its
    /// channel; repeats inside the window fold into that same envelope and
    /// are never routed again, so one dedup window produces at most one
    /// notification, carrying the occurrence count. Returns without
    /// touching any target; delivery happens on the delivery worker.
    pub fn raise(&self, verdict: &RiskVerdict) {
        self.tally.lock().record(verdict.severity);

        let Some(channel) = AlertChannel::for_severity(verdict.severity) else {
            return;
        };

        let key: DedupKey = (
            verdict.source_ip,
            verdict
                .top_reason()
                .map(|r| r.factor.to_string())
                .unwrap_or_else(|| "score".to_string()),
        );

        let window = chrono::Duration::seconds(self.config.dedup_window_secs as i64);
        let now = Utc::now();

        let fresh = {
            let mut dedup = self.dedup.lock();
            match dedup.entry(key.clone()) {
                MapEntry::Occupied(mut occupied) => {
                    let state = occupied.get_mut();
                    if now - state.window_started < window {
                        let mut envelope = state.envelope.lock();
                        envelope.count += 1;
                        envelope.last_seen = now;
                        envelope.score = envelope.score.max(verdict.score);
                        debug!(
                            ip = %key.0,
                            factor = %key.1,
                            folds = envelope.count,
                            "Alert folded"
                        );
                        None
                    } else {
                        // Window closed: the new occurrence starts a fresh
                        // window and is routed like a first sighting
                        let shared: SharedEnvelope =
                            Arc::new(Mutex::new(AlertEnvelope::from_verdict(verdict, channel)));
                        *state = DedupState {
                            envelope: shared.clone(),
                            window_started: now,
                        };
                        Some(shared)
                    }
                }
                MapEntry::Vacant(vacant) => {
                    let shared: SharedEnvelope =
                        Arc::new(Mutex::new(AlertEnvelope::from_verdict(verdict, channel)));
                    vacant.insert(DedupState {
                        envelope: shared.clone(),
                        window_started: now,
                    });
                    Some(shared)
                }
            }
        };

        let Some(envelope) = fresh else {
            return;
        };
        match channel {
            AlertChannel::Immediate => self.enqueue(Outbound::Alert(envelope)),
            AlertChannel::Batch => self.batch.lock().push(envelope),
            AlertChannel::Digest => self.digest.lock().push(envelope),
        }
    }

    /// Compose the medium-severity batch, grouped by target host, and queue
    /// it for delivery
    pub fn flush_batch(&self) {
        let pending = std::mem::take(&mut *self.batch.lock());
        if pending.is_empty() {
            return;
        }
        let mut by_target: HashMap<String, Vec<String>> = HashMap::new();
        for envelope in pending {
            let envelope = envelope.lock();
            by_target
                .entry(envelope.target_host.clone())
                .or_default()
                .push(envelope.render());
        }
        for (target, lines) in by_target {
            let payload = format!(
                "Batch: {} medium alert(s) for {}\n{}",
                lines.len(),
                target,
                lines.join("\n")
            );
            self.enqueue(Outbound::Text(payload));
        }
    }

    /// Compose the low-severity digest and queue it for delivery
    pub fn flush_digest(&self) {
        let pending = std::mem::take(&mut *self.digest.lock());
        if pending.is_empty() {
            return;
        }
        let lines: Vec<String> = pending.iter().map(|e| e.lock().render()).collect();
        let payload = format!(
            "Digest: {} low-severity alert(s)\n{}",
            lines.len(),
            lines.join("\n")
        );
        self.enqueue(Outbound::Text(payload));
    }

    /// Queue the daily activity summary and reset the tally
    pub fn daily_summary(&self) {
        if !self.config.daily_summary {
            return;
        }
        let tally = std::mem::take(&mut *self.tally.lock());
        let payload = format!(
            "Daily summary for {}: {} verdicts (critical {}, high {}, medium {}, low {}, clean {})",
            self.host,
            tally.total(),
            tally.critical,
            tally.high,
            tally.medium,
            tally.low,
            tally.clean
        );
        self.enqueue(Outbound::Text(payload));
    }

    fn enqueue(&self, item: Outbound) {
        self.outbox.lock().push_back(item);
        self.outbox_signal.notify_one();
    }

    /// Deliver one payload to every target, retrying each a bounded number
    /// of times. A target that exhausts its retries drops the payload and
    /// leaves an audit entry; it never wedges the pipeline.
    async fn deliver_all(&self, payload: &str) {
        for notifier in &self.notifiers {
            let mut attempt = 0;
            loop {
                match notifier.deliver(payload).await {
                    Ok(()) => {
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Err(e) if attempt < self.config.max_retries => {
                        attempt += 1;
                        warn!(
                            target = notifier.name(),
                            attempt, "Alert delivery failed, retrying: {}", e
                        );
                        // Linear backoff with jitter so targets shared by
                        // several instances don't see synchronized retries
                        let jitter = rand::random::<u64>() % 100;
                        tokio::time::sleep(Duration::from_millis(200 * attempt as u64 + jitter))
                            .await;
                    }
                    Err(e) => {
                        warn!(target = notifier.name(), "Alert dropped: {}", e);
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        self.audit.record(AuditEntry::new(
                            AuditAction::DeliveryFailed,
                            None,
                            format!("{}: {}", notifier.name(), e),
                        ));
                        break;
                    }
                }
            }
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn tally(&self) -> DailyTally {
        *self.tally.lock()
    }

    /// Drop dedup windows that have closed, keeping the map bounded. The
    /// occurrence count lives on the envelope that was routed when the
    /// window opened; nothing is re-sent here.
    pub fn flush_dedup(&self) {
        let window = chrono::Duration::seconds(self.config.dedup_window_secs as i64);
        let now = Utc::now();
        let mut dedup = self.dedup.lock();
        dedup.retain(|key, state| {
            let keep = now - state.window_started < window;
            if !keep {
                let count = state.envelope.lock().count;
                if count > 1 {
                    debug!(ip = %key.0, factor = %key.1, folds = count, "Dedup window closed");
                }
            }
            keep
        });
    }

    /// Deliver everything queued so far, in order. Called by the delivery
    /// worker and by the shutdown drain.
    pub async fn deliver_pending(&self) {
        loop {
            let item = self.outbox.lock().pop_front();
            let payload = match item {
                Some(Outbound::Alert(envelope)) => envelope.lock().render(),
                Some(Outbound::Text(text)) => text,
                None => break,
            };
            self.deliver_all(&payload).await;
        }
    }

    /// Delivery worker: drains the outbox as items arrive, so retries and
    /// slow targets back up here and not in the detection path. Runs until
    /// the shutdown channel fires, then drains once more and returns.
    pub async fn run_delivery(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.outbox_signal.notified() => self.deliver_pending().await,
                _ = shutdown.recv() => {
                    self.deliver_pending().await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ResponseAction, RiskFactor, RiskReason};
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicU32;

    struct MockNotifier {
        payloads: Mutex<Vec<String>>,
        fail_first: AtomicU32,
    }

    impl MockNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                payloads: Mutex::new(Vec::new()),
                fail_first: AtomicU32::new(0),
            })
        }

        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                payloads: Mutex::new(Vec::new()),
                fail_first: AtomicU32::new(times),
            })
        }

        fn payloads(&self) -> Vec<String> {
            self.payloads.lock().clone()
        }
    }

    #[async_trait]
    impl Notifier for Arc<MockNotifier> {
        fn name(&self) -> &str {
            "mock"
        }

        async fn deliver(&self, payload: &str) -> Result<()> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                bail!("simulated outage");
            }
            self.payloads.lock().push(payload.to_string());
            Ok(())
        }
    }

    fn verdict(severity: Severity, last_octet: u8) -> RiskVerdict {
        RiskVerdict {
            event_id: Uuid::new_v4(),
            source_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, last_octet)),
            target_host: "bastion".to_string(),
            score: 85.0,
            severity,
            action: ResponseAction::LogOnly,
            whitelisted: false,
            reasons: vec![
                RiskReason {
                    factor: RiskFactor::MlScore,
                    weight: 60.0,
                },
                RiskReason {
                    factor: RiskFactor::RateFlag,
                    weight: 20.0,
                },
            ],
            created_at: Utc::now(),
        }
    }

    fn manager(mock: Arc<MockNotifier>, config: AlertConfig) -> AlertManager {
        AlertManager::with_notifier(config, Arc::new(AuditLog::new(100)), Arc::new(mock))
    }

    #[tokio::test]
    async fn test_high_severity_delivers_immediately() {
        let mock = MockNotifier::new();
        let mgr = manager(mock.clone(), AlertConfig::default());

        mgr.raise(&verdict(Severity::High, 7));
        mgr.deliver_pending().await;

        let payloads = mock.payloads();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains("203.0.113.7"));
        assert!(payloads[0].contains("high"));
        assert_eq!(mgr.delivered(), 1);
    }

    #[tokio::test]
    async fn test_duplicates_fold_into_one_notification() {
        let mock = MockNotifier::new();
        let mgr = manager(mock.clone(), AlertConfig::default());

        for _ in 0..5 {
            mgr.raise(&verdict(Severity::High, 7));
        }
        mgr.deliver_pending().await;

        // One notification for the whole window, carrying the fold count
        let payloads = mock.payloads();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains("x5"), "payload was: {}", payloads[0]);
        assert_eq!(mgr.tally().high, 5);
    }

    #[tokio::test]
    async fn test_window_close_never_resends() {
        let mock = MockNotifier::new();
        let config = AlertConfig {
            dedup_window_secs: 1,
            ..AlertConfig::default()
        };
        let mgr = manager(mock.clone(), config);

        mgr.raise(&verdict(Severity::High, 7));
        mgr.deliver_pending().await;
        assert_eq!(mock.payloads().len(), 1);

        // A repeat after delivery folds silently; closing the window emits
        // nothing extra
        mgr.raise(&verdict(Severity::High, 7));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        mgr.flush_dedup();
        mgr.deliver_pending().await;
        assert_eq!(mock.payloads().len(), 1);

        // The next sighting starts a fresh window and alerts again
        mgr.raise(&verdict(Severity::High, 7));
        mgr.deliver_pending().await;
        assert_eq!(mock.payloads().len(), 2);
    }

    #[tokio::test]
    async fn test_different_ips_not_deduplicated() {
        let mock = MockNotifier::new();
        let mgr = manager(mock.clone(), AlertConfig::default());

        mgr.raise(&verdict(Severity::High, 7));
        mgr.raise(&verdict(Severity::High, 8));
        mgr.deliver_pending().await;

        assert_eq!(mock.payloads().len(), 2);
    }

    #[tokio::test]
    async fn test_medium_waits_for_batch_flush() {
        let mock = MockNotifier::new();
        let mgr = manager(mock.clone(), AlertConfig::default());

        mgr.raise(&verdict(Severity::Medium, 7));
        mgr.raise(&verdict(Severity::Medium, 8));
        mgr.deliver_pending().await;
        assert!(mock.payloads().is_empty());

        mgr.flush_batch();
        mgr.deliver_pending().await;
        let payloads = mock.payloads();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains("2 medium alert(s)"));

        // Nothing left to flush
        mgr.flush_batch();
        mgr.deliver_pending().await;
        assert_eq!(mock.payloads().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_line_reflects_folds() {
        let mock = MockNotifier::new();
        let mgr = manager(mock.clone(), AlertConfig::default());

        // Same key twice before the flush: one batched line, count folded in
        mgr.raise(&verdict(Severity::Medium, 7));
        mgr.raise(&verdict(Severity::Medium, 7));
        mgr.flush_batch();
        mgr.deliver_pending().await;

        let payloads = mock.payloads();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains("1 medium alert(s)"));
        assert!(payloads[0].contains("x2"), "payload was: {}", payloads[0]);
    }

    #[tokio::test]
    async fn test_low_goes_to_digest() {
        let mock = MockNotifier::new();
        let mgr = manager(mock.clone(), AlertConfig::default());

        mgr.raise(&verdict(Severity::Low, 7));
        mgr.deliver_pending().await;
        assert!(mock.payloads().is_empty());

        mgr.flush_digest();
        mgr.deliver_pending().await;
        assert!(mock.payloads()[0].contains("1 low-severity alert(s)"));
    }

    #[tokio::test]
    async fn test_clean_never_alerts() {
        let mock = MockNotifier::new();
        let mgr = manager(mock.clone(), AlertConfig::default());

        mgr.raise(&verdict(Severity::Clean, 7));
        mgr.flush_batch();
        mgr.flush_digest();
        mgr.deliver_pending().await;

        assert!(mock.payloads().is_empty());
        assert_eq!(mgr.tally().clean, 1);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let mock = MockNotifier::failing(2);
        let config = AlertConfig {
            max_retries: 3,
            ..AlertConfig::default()
        };
        let mgr = manager(mock.clone(), config);

        mgr.raise(&verdict(Severity::Critical, 7));
        mgr.deliver_pending().await;

        assert_eq!(mock.payloads().len(), 1);
        assert_eq!(mgr.delivered(), 1);
        assert_eq!(mgr.failed(), 0);
    }

    #[tokio::test]
    async fn test_raise_returns_before_any_delivery_attempt() {
        let mock = MockNotifier::failing(10);
        let config = AlertConfig {
            max_retries: 3,
            ..AlertConfig::default()
        };
        let mgr = manager(mock.clone(), config);

        // Routing touches no target, even one that is down: the retry loop
        // only runs once the outbox is drained
        mgr.raise(&verdict(Severity::Critical, 7));
        assert_eq!(mgr.delivered(), 0);
        assert_eq!(mgr.failed(), 0);

        mgr.deliver_pending().await;
        assert_eq!(mgr.failed(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_drops_and_audits() {
        let mock = MockNotifier::failing(10);
        let config = AlertConfig {
            max_retries: 2,
            ..AlertConfig::default()
        };
        let audit = Arc::new(AuditLog::new(100));
        let mgr = AlertManager::with_notifier(config, audit.clone(), Arc::new(mock.clone()));

        mgr.raise(&verdict(Severity::Critical, 7));
        mgr.deliver_pending().await;

        assert!(mock.payloads().is_empty());
        assert_eq!(mgr.failed(), 1);
        let recent = audit.recent(10);
        assert_eq!(recent[0].action, AuditAction::DeliveryFailed);
    }

    #[tokio::test]
    async fn test_delivery_worker_drains_on_shutdown() {
        let mock = MockNotifier::new();
        let mgr = Arc::new(manager(mock.clone(), AlertConfig::default()));

        let (tx, rx) = mpsc::channel(1);
        let worker = tokio::spawn(mgr.clone().run_delivery(rx));

        mgr.raise(&verdict(Severity::High, 7));
        tx.send(()).await.unwrap();
        worker.await.unwrap();

        assert_eq!(mock.payloads().len(), 1);
    }

    #[tokio::test]
    async fn test_daily_summary_resets_tally() {
        let mock = MockNotifier::new();
        let mgr = manager(mock.clone(), AlertConfig::default());

        mgr.raise(&verdict(Severity::High, 7));
        mgr.raise(&verdict(Severity::Clean, 8));

        mgr.daily_summary();
        mgr.deliver_pending().await;
        let payloads = mock.payloads();
        let summary = payloads.last().unwrap();
        assert!(summary.contains("2 verdicts"));
        assert!(summary.contains("high 1"));

        assert_eq!(mgr.tally().total(), 0);
    }
}
