use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration validation failure. Raised once at startup, never per-event.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid threshold for {field}: {value} (must be > 0)")]
    ZeroThreshold { field: &'static str, value: u64 },
    #[error("severity bands out of order: {0}")]
    BandOrder(String),
    #[error("external_weight must be within [0, 1], got {0}")]
    ExternalWeight(f64),
    #[error("reputation source '{0}' has an empty URL")]
    EmptySourceUrl(String),
    #[error("service '{service}' pattern '{pattern}' is not a valid regex: {error}")]
    BadPattern {
        service: String,
        pattern: String,
        error: String,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub intel: IntelConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub blocks: BlockConfig,

    #[serde(default)]
    pub alerts: AlertConfig,

    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/authban/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("authban/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::with_defaults())
    }

    /// Default config including the stock SSH service patterns
    pub fn with_defaults() -> Self {
        let mut config = Self::default();
        config.services.insert("sshd".to_string(), ServiceConfig::default_sshd());
        config
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Fail fast on missing or invalid thresholds
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detector;
        for (field, value) in [
            ("detector.rate_threshold", d.rate_threshold as u64),
            ("detector.rate_window_secs", d.rate_window_secs),
            ("detector.burst_window_secs", d.burst_window_secs),
            ("detector.long_window_secs", d.long_window_secs),
            ("detector.pattern_min_hits", d.pattern_min_hits as u64),
            ("detector.distributed_min_ips", d.distributed_min_ips as u64),
            ("detector.distributed_window_secs", d.distributed_window_secs),
            ("detector.max_profiles", d.max_profiles as u64),
            ("detector.idle_eviction_secs", d.idle_eviction_secs),
            ("intel.cache_ttl_secs", self.intel.cache_ttl_secs),
            ("intel.per_source_timeout_secs", self.intel.per_source_timeout_secs),
            ("intel.overall_timeout_secs", self.intel.overall_timeout_secs),
            ("blocks.sweep_interval_secs", self.blocks.sweep_interval_secs),
            ("alerts.dedup_window_secs", self.alerts.dedup_window_secs),
            ("alerts.batch_flush_secs", self.alerts.batch_flush_secs),
            ("alerts.digest_flush_secs", self.alerts.digest_flush_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroThreshold { field, value });
            }
        }

        let b = &self.risk.bands;
        if !(b.low_min < b.medium_min && b.medium_min < b.high_min && b.high_min < b.critical_min) {
            return Err(ConfigError::BandOrder(format!(
                "low {} / medium {} / high {} / critical {}",
                b.low_min, b.medium_min, b.high_min, b.critical_min
            )));
        }

        if !(0.0..=1.0).contains(&self.intel.external_weight) {
            return Err(ConfigError::ExternalWeight(self.intel.external_weight));
        }

        for source in &self.intel.sources {
            if source.enabled && source.url.trim().is_empty() {
                return Err(ConfigError::EmptySourceUrl(source.name.clone()));
            }
        }

        for (service, cfg) in &self.services {
            for pattern in &cfg.patterns {
                if let Err(e) = regex::Regex::new(&pattern.regex) {
                    return Err(ConfigError::BadPattern {
                        service: service.clone(),
                        pattern: pattern.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Audit trail capacity (entries)
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,

    /// Depth of the bounded queues between pipeline stages
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Unix socket the daemon listens on for admin commands
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            audit_capacity: default_audit_capacity(),
            queue_depth: default_queue_depth(),
            control_socket: default_control_socket(),
        }
    }
}

/// Behavioral detector thresholds. Every value independently tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Failures within `rate_window_secs` to set the rate flag
    #[serde(default = "default_rate_threshold")]
    pub rate_threshold: u32,

    /// Window for the rate flag (seconds)
    #[serde(default = "default_rate_window")]
    pub rate_window_secs: u64,

    /// Short window tracked per profile (seconds)
    #[serde(default = "default_burst_window")]
    pub burst_window_secs: u64,

    /// Long window tracked per profile (seconds)
    #[serde(default = "default_long_window")]
    pub long_window_secs: u64,

    /// Usernames that indicate dictionary probing
    #[serde(default = "default_probe_wordlist")]
    pub probe_wordlist: Vec<String>,

    /// Distinct wordlist usernames tried before the pattern flag sets
    #[serde(default = "default_pattern_min_hits")]
    pub pattern_min_hits: u32,

    /// Distinct source IPs trying the same username/target before the
    /// distributed flag sets
    #[serde(default = "default_distributed_min_ips")]
    pub distributed_min_ips: u32,

    /// Window for distributed-campaign correlation (seconds)
    #[serde(default = "default_distributed_window")]
    pub distributed_window_secs: u64,

    /// Maximum tracked profiles before LRU eviction kicks in
    #[serde(default = "default_max_profiles")]
    pub max_profiles: usize,

    /// Idle period after which a profile is evicted (seconds)
    #[serde(default = "default_idle_eviction")]
    pub idle_eviction_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            rate_threshold: default_rate_threshold(),
            rate_window_secs: default_rate_window(),
            burst_window_secs: default_burst_window(),
            long_window_secs: default_long_window(),
            probe_wordlist: default_probe_wordlist(),
            pattern_min_hits: default_pattern_min_hits(),
            distributed_min_ips: default_distributed_min_ips(),
            distributed_window_secs: default_distributed_window(),
            max_profiles: default_max_profiles(),
            idle_eviction_secs: default_idle_eviction(),
        }
    }
}

/// Threat intelligence aggregator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelConfig {
    /// Cache TTL for successful lookups (seconds)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Timeout enforced independently per source (seconds)
    #[serde(default = "default_source_timeout")]
    pub per_source_timeout_secs: u64,

    /// Overall join timeout for one lookup (seconds)
    #[serde(default = "default_overall_timeout")]
    pub overall_timeout_secs: u64,

    /// Share of the composite reputation taken from external sources
    /// when any external data is available (the remainder is local feed)
    #[serde(default = "default_external_weight")]
    pub external_weight: f64,

    /// Local static reputation feed
    #[serde(default)]
    pub local_feed: Vec<LocalFeedEntry>,

    /// External reputation sources
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Default for IntelConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            per_source_timeout_secs: default_source_timeout(),
            overall_timeout_secs: default_overall_timeout(),
            external_weight: default_external_weight(),
            local_feed: Vec::new(),
            sources: Vec::new(),
        }
    }
}

/// One entry in the local static reputation feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalFeedEntry {
    /// IP or CIDR
    pub network: IpNetwork,
    /// Sub-score in [0, 100]
    pub score: f64,
    /// Categorical tags (tor, proxy, vpn, datacenter, abuse)
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One external reputation source with its quota budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    /// Query endpoint; `{ip}` is substituted
    pub url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Live queries allowed per minute
    #[serde(default = "default_per_minute_limit")]
    pub per_minute_limit: u32,

    /// Live queries allowed per day
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Risk classifier weights and bands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Base score used when the ML scorer is unavailable
    #[serde(default = "default_ml_score")]
    pub default_ml_score: f64,

    #[serde(default)]
    pub modifiers: ModifierWeights,

    #[serde(default)]
    pub bands: TierBands,

    /// Block duration for the critical tier (seconds)
    #[serde(default = "default_critical_block")]
    pub critical_block_secs: i64,

    /// Block duration for the high tier (seconds)
    #[serde(default = "default_high_block")]
    pub high_block_secs: i64,

    /// Reputation sub-score at or above which an IP counts as known-malicious
    #[serde(default = "default_malicious_threshold")]
    pub malicious_reputation_min: f64,

    /// Country codes treated as high risk
    #[serde(default)]
    pub high_risk_countries: Vec<String>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            default_ml_score: default_ml_score(),
            modifiers: ModifierWeights::default(),
            bands: TierBands::default(),
            critical_block_secs: default_critical_block(),
            high_block_secs: default_high_block(),
            malicious_reputation_min: default_malicious_threshold(),
            high_risk_countries: Vec::new(),
        }
    }
}

/// Additive score modifiers, each gated by one boolean condition.
/// Conditions are evaluated independently and summed; no ordering effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifierWeights {
    #[serde(default = "default_w_malicious")]
    pub known_malicious: f64,
    #[serde(default = "default_w_tor")]
    pub tor_exit: f64,
    #[serde(default = "default_w_country")]
    pub high_risk_country: f64,
    #[serde(default = "default_w_rate")]
    pub rate_flag: f64,
    #[serde(default = "default_w_pattern")]
    pub pattern_flag: f64,
    #[serde(default = "default_w_distributed")]
    pub distributed_flag: f64,
    #[serde(default = "default_w_success_after")]
    pub success_after_failures: f64,
}

impl Default for ModifierWeights {
    fn default() -> Self {
        Self {
            known_malicious: default_w_malicious(),
            tor_exit: default_w_tor(),
            high_risk_country: default_w_country(),
            rate_flag: default_w_rate(),
            pattern_flag: default_w_pattern(),
            distributed_flag: default_w_distributed(),
            success_after_failures: default_w_success_after(),
        }
    }
}

/// Lower bounds of the severity score bands (upper bound is the next band)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierBands {
    #[serde(default = "default_band_low")]
    pub low_min: f64,
    #[serde(default = "default_band_medium")]
    pub medium_min: f64,
    #[serde(default = "default_band_high")]
    pub high_min: f64,
    #[serde(default = "default_band_critical")]
    pub critical_min: f64,
}

impl Default for TierBands {
    fn default() -> Self {
        Self {
            low_min: default_band_low(),
            medium_min: default_band_medium(),
            high_min: default_band_high(),
            critical_min: default_band_critical(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    /// Expiry sweep interval (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Whitelisted IPs/CIDRs, never blocked
    #[serde(default)]
    pub whitelist: Vec<IpNetwork>,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Window within which identical alerts fold into one envelope (seconds)
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,

    /// Batch flush timer for medium severities (seconds)
    #[serde(default = "default_batch_flush")]
    pub batch_flush_secs: u64,

    /// Digest flush timer for low severities (seconds)
    #[serde(default = "default_digest_flush")]
    pub digest_flush_secs: u64,

    /// Emit a daily summary across all tiers
    #[serde(default = "default_true")]
    pub daily_summary: bool,

    /// Delivery retries before an envelope is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delivery timeout per attempt (seconds)
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_secs: u64,

    /// Notification targets
    #[serde(default)]
    pub targets: Vec<AlertTarget>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window(),
            batch_flush_secs: default_batch_flush(),
            digest_flush_secs: default_digest_flush(),
            daily_summary: true,
            max_retries: default_max_retries(),
            delivery_timeout_secs: default_delivery_timeout(),
            targets: Vec::new(),
        }
    }
}

/// Outbound notification target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AlertTarget {
    /// POST rendered envelopes to an HTTP endpoint
    Webhook {
        url: String,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
    /// Append rendered envelopes to a file
    File { path: PathBuf },
    /// Write to stdout (for debugging)
    Stdout,
}

/// One monitored service's log patterns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Target port the service listens on
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Patterns to match in submitted log lines
    pub patterns: Vec<PatternConfig>,
}

impl ServiceConfig {
    /// Stock sshd patterns
    pub fn default_sshd() -> Self {
        Self {
            enabled: true,
            port: 22,
            patterns: vec![
                PatternConfig {
                    name: "failed_password".to_string(),
                    regex: r"Failed password for (?:invalid user )?(?P<user>\S+) from (?P<ip>[0-9a-fA-F:.]+)(?: port (?P<port>\d+))?".to_string(),
                    outcome: "failure".to_string(),
                    failure_reason: Some("failed_password".to_string()),
                },
                PatternConfig {
                    name: "invalid_user".to_string(),
                    regex: r"Invalid user (?P<user>\S+) from (?P<ip>[0-9a-fA-F:.]+)(?: port (?P<port>\d+))?".to_string(),
                    outcome: "failure".to_string(),
                    failure_reason: Some("invalid_user".to_string()),
                },
                PatternConfig {
                    name: "preauth_disconnect".to_string(),
                    regex: r"Connection closed by (?:authenticating user (?P<user>\S+) )?(?P<ip>[0-9a-fA-F:.]+) port (?P<port>\d+) \[preauth\]".to_string(),
                    outcome: "failure".to_string(),
                    failure_reason: Some("preauth_disconnect".to_string()),
                },
                PatternConfig {
                    name: "accepted".to_string(),
                    regex: r"Accepted (?:password|publickey) for (?P<user>\S+) from (?P<ip>[0-9a-fA-F:.]+)(?: port (?P<port>\d+))?".to_string(),
                    outcome: "success".to_string(),
                    failure_reason: None,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Name for this pattern
    pub name: String,

    /// Regex with named capture groups: `ip` (required), `user`, `port`
    pub regex: String,

    /// "success" or "failure"
    pub outcome: String,

    /// Failure reason recorded on matches
    #[serde(default)]
    pub failure_reason: Option<String>,
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_audit_capacity() -> usize {
    10_000
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/run/authban.sock")
}

fn default_queue_depth() -> usize {
    1024
}

fn default_rate_threshold() -> u32 {
    5
}

fn default_rate_window() -> u64 {
    600 // 10 minutes
}

fn default_burst_window() -> u64 {
    60
}

fn default_long_window() -> u64 {
    3600
}

fn default_probe_wordlist() -> Vec<String> {
    [
        "root", "admin", "test", "user", "guest", "oracle", "postgres", "ubuntu", "pi", "git",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_pattern_min_hits() -> u32 {
    3
}

fn default_distributed_min_ips() -> u32 {
    3
}

fn default_distributed_window() -> u64 {
    300
}

fn default_max_profiles() -> usize {
    100_000
}

fn default_idle_eviction() -> u64 {
    86_400 // 24 hours
}

fn default_cache_ttl() -> u64 {
    86_400
}

fn default_source_timeout() -> u64 {
    10
}

fn default_overall_timeout() -> u64 {
    12
}

fn default_external_weight() -> f64 {
    0.7
}

fn default_per_minute_limit() -> u32 {
    30
}

fn default_daily_limit() -> u32 {
    1000
}

fn default_ml_score() -> f64 {
    50.0 // unknown/neutral
}

fn default_critical_block() -> i64 {
    30 * 24 * 3600
}

fn default_high_block() -> i64 {
    7 * 24 * 3600
}

fn default_malicious_threshold() -> f64 {
    75.0
}

fn default_w_malicious() -> f64 {
    15.0
}

fn default_w_tor() -> f64 {
    10.0
}

fn default_w_country() -> f64 {
    10.0
}

fn default_w_rate() -> f64 {
    20.0
}

fn default_w_pattern() -> f64 {
    10.0
}

fn default_w_distributed() -> f64 {
    15.0
}

fn default_w_success_after() -> f64 {
    25.0
}

fn default_band_low() -> f64 {
    40.0
}

fn default_band_medium() -> f64 {
    60.0
}

fn default_band_high() -> f64 {
    75.0
}

fn default_band_critical() -> f64 {
    90.0
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_dedup_window() -> u64 {
    600 // 10 minutes
}

fn default_batch_flush() -> u64 {
    900 // 15 minutes
}

fn default_digest_flush() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    3
}

fn default_delivery_timeout() -> u64 {
    10
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}
