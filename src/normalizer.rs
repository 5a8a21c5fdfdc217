//! Event normalizer
//!
//! Converts raw agent-submitted log lines into canonical [`AuthEvent`]s by
//! matching them against the per-service pattern tables from configuration.
//! Lines that match no pattern are counted and dropped; they are never an
//! error.

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::models::{AuthEvent, AuthOutcome};

/// Compiled pattern for matching log lines
struct CompiledPattern {
    name: String,
    regex: Regex,
    outcome: AuthOutcome,
    failure_reason: Option<String>,
}

/// Patterns for one monitored service
struct ServicePatterns {
    port: u16,
    patterns: Vec<CompiledPattern>,
}

/// Normalizes raw log lines into [`AuthEvent`]s
pub struct EventNormalizer {
    services: HashMap<String, ServicePatterns>,
    unmatched: AtomicU64,
}

impl EventNormalizer {
    /// Compile all enabled service patterns. Invalid regexes fail here,
    /// at startup, not per-line.
    pub fn new(services: &HashMap<String, ServiceConfig>) -> Result<Self> {
        let mut compiled = HashMap::new();

        for (name, config) in services {
            if !config.enabled {
                debug!("Service {} is disabled, skipping", name);
                continue;
            }

            let patterns = config
                .patterns
                .iter()
                .map(|p| {
                    let regex = Regex::new(&p.regex)
                        .with_context(|| format!("Invalid regex pattern: {}", p.regex))?;

                    let outcome = match p.outcome.as_str() {
                        "success" => AuthOutcome::Success,
                        _ => AuthOutcome::Failure,
                    };

                    Ok(CompiledPattern {
                        name: p.name.clone(),
                        regex,
                        outcome,
                        failure_reason: p.failure_reason.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            compiled.insert(
                name.clone(),
                ServicePatterns {
                    port: config.port,
                    patterns,
                },
            );
        }

        Ok(Self {
            services: compiled,
            unmatched: AtomicU64::new(0),
        })
    }

    /// Match one raw line from `host`'s log against all patterns of all
    /// services. Returns the canonical event for the first match.
    pub fn normalize(&self, host: &str, line: &str) -> Option<AuthEvent> {
        for service in self.services.values() {
            for pattern in &service.patterns {
                let Some(captures) = pattern.regex.captures(line) else {
                    continue;
                };

                let Some(ip_match) = captures.name("ip") else {
                    continue;
                };
                let Ok(ip) = ip_match.as_str().parse::<IpAddr>() else {
                    continue;
                };

                let username = captures
                    .name("user")
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();

                let source_port = captures
                    .name("port")
                    .and_then(|m| m.as_str().parse::<u16>().ok());

                debug!(
                    "Matched pattern '{}' for IP {} on host {}",
                    pattern.name, ip, host
                );

                return Some(AuthEvent {
                    id: Uuid::new_v4(),
                    timestamp: Utc::now(),
                    source_ip: ip,
                    source_port,
                    target_host: host.to_string(),
                    target_port: service.port,
                    username,
                    outcome: pattern.outcome,
                    failure_reason: pattern.failure_reason.clone(),
                    raw: line.trim().to_string(),
                });
            }
        }

        self.unmatched.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Lines seen that matched no pattern
    pub fn unmatched_count(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn normalizer() -> EventNormalizer {
        let config = Config::with_defaults();
        EventNormalizer::new(&config.services).unwrap()
    }

    #[test]
    fn test_failed_password_line() {
        let n = normalizer();
        let line = "Dec  4 10:00:00 bastion sshd[1234]: Failed password for root from 203.0.113.7 port 52312 ssh2";

        let event = n.normalize("bastion", line).unwrap();
        assert_eq!(event.source_ip.to_string(), "203.0.113.7");
        assert_eq!(event.username, "root");
        assert_eq!(event.source_port, Some(52312));
        assert_eq!(event.outcome, AuthOutcome::Failure);
        assert_eq!(event.failure_reason.as_deref(), Some("failed_password"));
        assert_eq!(event.target_port, 22);
    }

    #[test]
    fn test_invalid_user_line() {
        let n = normalizer();
        let line = "Invalid user deploy from 198.51.100.20 port 40022";

        let event = n.normalize("web01", line).unwrap();
        assert_eq!(event.username, "deploy");
        assert_eq!(event.failure_reason.as_deref(), Some("invalid_user"));
    }

    #[test]
    fn test_accepted_login_line() {
        let n = normalizer();
        let line = "Accepted publickey for alice from 192.0.2.10 port 50000 ssh2";

        let event = n.normalize("bastion", line).unwrap();
        assert_eq!(event.outcome, AuthOutcome::Success);
        assert_eq!(event.username, "alice");
        assert!(event.failure_reason.is_none());
    }

    #[test]
    fn test_unmatched_line_counted() {
        let n = normalizer();
        assert!(n.normalize("bastion", "kernel: out of memory").is_none());
        assert!(n.normalize("bastion", "random noise").is_none());
        assert_eq!(n.unmatched_count(), 2);
    }

    #[test]
    fn test_ipv6_source() {
        let n = normalizer();
        let line = "Failed password for root from 2001:db8::5 port 2222 ssh2";

        let event = n.normalize("bastion", line).unwrap();
        assert_eq!(event.source_ip.to_string(), "2001:db8::5");
    }
}
