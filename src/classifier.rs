//! Risk classifier
//!
//! Fuses the ML score, behavioral flags and reputation into one composite
//! 0-100 risk score, a severity tier and a response action. `classify` is a
//! pure function of its inputs; every modifier condition is evaluated
//! independently and summed, so there is no ordering or double-counting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

use crate::config::RiskConfig;
use crate::detector::BehavioralFindings;
use crate::intel::ReputationSummary;
use crate::models::AuthEvent;

/// Discrete risk bucket derived from the composite score
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Clean,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Clean => write!(f, "clean"),
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Automated response implied by the severity tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResponseAction {
    Allow,
    LogOnly,
    RateLimit,
    Block { duration_secs: i64 },
}

impl ResponseAction {
    pub fn is_block(&self) -> bool {
        matches!(self, ResponseAction::Block { .. })
    }
}

/// One contributing condition in a verdict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    MlScore,
    KnownMalicious,
    TorExit,
    HighRiskCountry,
    RateFlag,
    PatternFlag,
    DistributedFlag,
    SuccessAfterFailures,
}

impl std::fmt::Display for RiskFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskFactor::MlScore => "ml_score",
            RiskFactor::KnownMalicious => "known_malicious",
            RiskFactor::TorExit => "tor_exit",
            RiskFactor::HighRiskCountry => "high_risk_country",
            RiskFactor::RateFlag => "rate_flag",
            RiskFactor::PatternFlag => "pattern_flag",
            RiskFactor::DistributedFlag => "distributed_flag",
            RiskFactor::SuccessAfterFailures => "success_after_failures",
        };
        write!(f, "{}", s)
    }
}

/// (factor, weight) pair recorded on the verdict
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskReason {
    pub factor: RiskFactor,
    pub weight: f64,
}

/// Immutable classification result for one event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub event_id: Uuid,
    pub source_ip: IpAddr,
    pub target_host: String,
    /// Composite score clamped to [0, 100]. Recorded even for whitelisted
    /// IPs, whose action is forced to allow.
    pub score: f64,
    pub severity: Severity,
    pub action: ResponseAction,
    pub whitelisted: bool,
    /// Contributing conditions ordered by weight, heaviest first
    pub reasons: Vec<RiskReason>,
    pub created_at: DateTime<Utc>,
}

impl RiskVerdict {
    /// Heaviest non-base contributing factor (for alert dedup keys)
    pub fn top_reason(&self) -> Option<&RiskReason> {
        self.reasons
            .iter()
            .find(|r| r.factor != RiskFactor::MlScore)
    }

    pub fn reason_text(&self) -> String {
        self.reasons
            .iter()
            .map(|r| format!("{}(+{})", r.factor, r.weight))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// External ML collaborator seam. Returns a score in [0, 100] or None
/// when the model is unavailable.
pub trait MlScorer: Send + Sync {
    fn score(
        &self,
        event: &AuthEvent,
        findings: &BehavioralFindings,
        reputation: &ReputationSummary,
    ) -> Option<f64>;
}

/// Stand-in scorer: always unavailable, so the configured default applies
pub struct NeutralScorer;

impl MlScorer for NeutralScorer {
    fn score(
        &self,
        _event: &AuthEvent,
        _findings: &BehavioralFindings,
        _reputation: &ReputationSummary,
    ) -> Option<f64> {
        None
    }
}

/// Risk classifier over the configured modifier table and tier bands
pub struct RiskClassifier {
    config: RiskConfig,
}

impl RiskClassifier {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Classify one event. Pure function of its inputs.
    ///
    /// `whitelisted` forces action to allow while the underlying score and
    /// tier are still computed and recorded for observability.
    pub fn classify(
        &self,
        event: &AuthEvent,
        findings: &BehavioralFindings,
        reputation: &ReputationSummary,
        ml_score: Option<f64>,
        whitelisted: bool,
    ) -> RiskVerdict {
        let base = ml_score
            .unwrap_or(self.config.default_ml_score)
            .clamp(0.0, 100.0);

        let mut reasons = vec![RiskReason {
            factor: RiskFactor::MlScore,
            weight: base,
        }];

        let w = &self.config.modifiers;
        let modifiers: [(RiskFactor, f64, bool); 7] = [
            (
                RiskFactor::KnownMalicious,
                w.known_malicious,
                reputation.composite >= self.config.malicious_reputation_min,
            ),
            (RiskFactor::TorExit, w.tor_exit, reputation.has_tag("tor")),
            (
                RiskFactor::HighRiskCountry,
                w.high_risk_country,
                self.is_high_risk_country(reputation.country.as_deref()),
            ),
            (RiskFactor::RateFlag, w.rate_flag, findings.rate_flag),
            (RiskFactor::PatternFlag, w.pattern_flag, findings.pattern_flag),
            (
                RiskFactor::DistributedFlag,
                w.distributed_flag,
                findings.distributed_flag,
            ),
            (
                RiskFactor::SuccessAfterFailures,
                w.success_after_failures,
                findings.success_after_failures,
            ),
        ];

        let mut score = base;
        for (factor, weight, satisfied) in modifiers {
            if satisfied {
                score += weight;
                reasons.push(RiskReason { factor, weight });
            }
        }
        let score = score.clamp(0.0, 100.0);

        // Heaviest first; the base score stays first only if it outweighs
        // every modifier, which is what the reason trail should show anyway.
        reasons.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));

        let severity = self.tier_for(score);
        let action = if whitelisted {
            ResponseAction::Allow
        } else {
            self.action_for(severity)
        };

        RiskVerdict {
            event_id: event.id,
            source_ip: event.source_ip,
            target_host: event.target_host.clone(),
            score,
            severity,
            action,
            whitelisted,
            reasons,
            created_at: Utc::now(),
        }
    }

    fn is_high_risk_country(&self, country: Option<&str>) -> bool {
        let Some(country) = country else {
            return false;
        };
        self.config
            .high_risk_countries
            .iter()
            .any(|c| c.eq_ignore_ascii_case(country))
    }

    fn tier_for(&self, score: f64) -> Severity {
        let bands = &self.config.bands;
        if score >= bands.critical_min {
            Severity::Critical
        } else if score >= bands.high_min {
            Severity::High
        } else if score >= bands.medium_min {
            Severity::Medium
        } else if score >= bands.low_min {
            Severity::Low
        } else {
            Severity::Clean
        }
    }

    fn action_for(&self, severity: Severity) -> ResponseAction {
        match severity {
            Severity::Critical => ResponseAction::Block {
                duration_secs: self.config.critical_block_secs,
            },
            Severity::High => ResponseAction::Block {
                duration_secs: self.config.high_block_secs,
            },
            Severity::Medium => ResponseAction::RateLimit,
            Severity::Low => ResponseAction::LogOnly,
            Severity::Clean => ResponseAction::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuthOutcome;
    use std::net::Ipv4Addr;

    fn event() -> AuthEvent {
        AuthEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
            source_port: None,
            target_host: "bastion".to_string(),
            target_port: 22,
            username: "root".to_string(),
            outcome: AuthOutcome::Failure,
            failure_reason: Some("failed_password".to_string()),
            raw: String::new(),
        }
    }

    fn classifier() -> RiskClassifier {
        RiskClassifier::new(RiskConfig::default())
    }

    #[test]
    fn test_neutral_event_is_clean() {
        let verdict = classifier().classify(
            &event(),
            &BehavioralFindings::default(),
            &ReputationSummary::default(),
            Some(10.0),
            false,
        );
        assert_eq!(verdict.severity, Severity::Clean);
        assert_eq!(verdict.action, ResponseAction::Allow);
        assert_eq!(verdict.score, 10.0);
    }

    #[test]
    fn test_missing_ml_score_uses_default() {
        let verdict = classifier().classify(
            &event(),
            &BehavioralFindings::default(),
            &ReputationSummary::default(),
            None,
            false,
        );
        assert_eq!(verdict.score, 50.0);
        assert_eq!(verdict.severity, Severity::Low);
        assert_eq!(verdict.action, ResponseAction::LogOnly);
    }

    #[test]
    fn test_brute_force_scenario_reaches_high() {
        // 60 base + 20 rate + 10 pattern = 90, right at the critical band edge
        let findings = BehavioralFindings {
            rate_flag: true,
            pattern_flag: true,
            ..BehavioralFindings::default()
        };
        let verdict = classifier().classify(
            &event(),
            &findings,
            &ReputationSummary::default(),
            Some(60.0),
            false,
        );
        assert!(verdict.score >= 80.0);
        assert!(verdict.severity >= Severity::High);
        match verdict.action {
            ResponseAction::Block { duration_secs } => assert!(duration_secs > 0),
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn test_modifiers_sum_independently() {
        let findings = BehavioralFindings {
            rate_flag: true,
            distributed_flag: true,
            ..BehavioralFindings::default()
        };
        let reputation = ReputationSummary {
            composite: 80.0,
            tags: vec!["tor".to_string()],
            ..ReputationSummary::default()
        };
        let verdict = classifier().classify(&event(), &findings, &reputation, Some(20.0), false);
        // 20 + 15 (malicious) + 10 (tor) + 20 (rate) + 15 (distributed) = 80
        assert_eq!(verdict.score, 80.0);
        assert_eq!(verdict.reasons.len(), 5);
    }

    #[test]
    fn test_score_clamped_to_100() {
        let findings = BehavioralFindings {
            rate_flag: true,
            pattern_flag: true,
            distributed_flag: true,
            success_after_failures: true,
            ..BehavioralFindings::default()
        };
        let reputation = ReputationSummary {
            composite: 100.0,
            tags: vec!["tor".to_string()],
            ..ReputationSummary::default()
        };
        let verdict = classifier().classify(&event(), &findings, &reputation, Some(95.0), false);
        assert_eq!(verdict.score, 100.0);
        assert_eq!(verdict.severity, Severity::Critical);
    }

    #[test]
    fn test_whitelist_override_keeps_score() {
        let findings = BehavioralFindings {
            rate_flag: true,
            pattern_flag: true,
            ..BehavioralFindings::default()
        };
        let reputation = ReputationSummary {
            composite: 90.0,
            ..ReputationSummary::default()
        };
        let verdict = classifier().classify(&event(), &findings, &reputation, Some(80.0), true);

        // Forced to allow, but the underlying score survives for observability
        assert_eq!(verdict.action, ResponseAction::Allow);
        assert!(verdict.whitelisted);
        assert_eq!(verdict.score, 100.0);
        assert_eq!(verdict.severity, Severity::Critical);
    }

    #[test]
    fn test_top_reason_skips_base_score() {
        let findings = BehavioralFindings {
            rate_flag: true,
            ..BehavioralFindings::default()
        };
        let verdict = classifier().classify(
            &event(),
            &findings,
            &ReputationSummary::default(),
            Some(60.0),
            false,
        );
        assert_eq!(verdict.top_reason().unwrap().factor, RiskFactor::RateFlag);
    }

    #[test]
    fn test_high_risk_country_modifier() {
        let config = RiskConfig {
            high_risk_countries: vec!["KP".to_string()],
            ..RiskConfig::default()
        };
        let classifier = RiskClassifier::new(config);
        let reputation = ReputationSummary {
            country: Some("kp".to_string()),
            ..ReputationSummary::default()
        };
        let verdict = classifier.classify(
            &event(),
            &BehavioralFindings::default(),
            &reputation,
            Some(50.0),
            false,
        );
        assert_eq!(verdict.score, 60.0);
    }
}
