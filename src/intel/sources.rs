//! Reputation sources
//!
//! The local static feed plus the pluggable external source trait and its
//! HTTP implementation. External sources expose `query(ip) -> {score, tags}`
//! and are individually rate-limited and cached by the aggregator.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

use crate::config::{LocalFeedEntry, SourceConfig};

/// Raw reply from one source for one IP
#[derive(Debug, Clone)]
pub struct SourceReply {
    /// Sub-score in [0, 100]
    pub score: f64,
    /// Categorical tags (tor, proxy, vpn, datacenter, abuse)
    pub tags: Vec<String>,
    pub country: Option<String>,
}

/// Any feed that scores an IP's likelihood of being malicious
#[async_trait]
pub trait ReputationSource: Send + Sync {
    fn name(&self) -> &str;

    async fn query(&self, ip: IpAddr) -> Result<SourceReply>;
}

/// External HTTP reputation source.
///
/// The endpoint URL carries an `{ip}` placeholder; the response is JSON
/// `{ "score": .., "tags": [..], "country": .. }`.
pub struct HttpSource {
    name: String,
    url_template: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpSource {
    pub fn new(config: &SourceConfig, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("authban/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            name: config.name.clone(),
            url_template: config.url.clone(),
            api_key: config.api_key.clone(),
            client,
        })
    }
}

#[derive(Debug, Deserialize)]
struct HttpSourcePayload {
    score: f64,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    country: Option<String>,
}

#[async_trait]
impl ReputationSource for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, ip: IpAddr) -> Result<SourceReply> {
        let url = self.url_template.replace("{ip}", &ip.to_string());

        let mut request = self.client.get(&url).header("Accept", "application/json");
        if let Some(ref key) = self.api_key {
            request = request.header("Key", key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("reputation query to {} failed", self.name))?;

        if !response.status().is_success() {
            anyhow::bail!("{} returned HTTP {}", self.name, response.status());
        }

        let payload: HttpSourcePayload = response
            .json()
            .await
            .with_context(|| format!("malformed payload from {}", self.name))?;

        Ok(SourceReply {
            score: payload.score.clamp(0.0, 100.0),
            tags: payload.tags,
            country: payload.country,
        })
    }
}

/// Local static reputation feed (exact IPs and CIDRs from configuration).
/// Not rate limited and always available.
pub struct LocalFeed {
    entries: Vec<LocalFeedEntry>,
}

impl LocalFeed {
    pub fn new(entries: Vec<LocalFeedEntry>) -> Self {
        Self { entries }
    }

    /// Most specific match wins (longest prefix)
    pub fn lookup(&self, ip: IpAddr) -> Option<SourceReply> {
        self.entries
            .iter()
            .filter(|entry| entry.network.contains(ip))
            .max_by_key(|entry| entry.network.prefix())
            .map(|entry| SourceReply {
                score: entry.score.clamp(0.0, 100.0),
                tags: entry.tags.clone(),
                country: None,
            })
    }

    /// Score contributed to fusion; an unlisted IP scores zero
    pub fn score(&self, ip: IpAddr) -> f64 {
        self.lookup(ip).map(|r| r.score).unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse an IP or CIDR string
pub fn parse_network(s: &str) -> Result<IpNetwork> {
    s.parse::<IpNetwork>()
        .with_context(|| format!("invalid IP or CIDR: {}", s))
}
