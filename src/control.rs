//! Admin control plane
//!
//! The daemon listens on a unix socket for line-delimited JSON commands;
//! the CLI connects, sends one request and reads one response. Every
//! mutating command lands in the audit trail via the engine.

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::intel::ReputationSummary;
use crate::models::{AuditEntry, BlockRecord, BlockSource, EngineSnapshot, WhitelistEntry};
use crate::pipeline::Engine;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    Block {
        network: String,
        duration_secs: Option<i64>,
        reason: String,
    },
    Unblock {
        network: String,
    },
    ListBlocks {
        all: bool,
    },
    WhitelistAdd {
        network: String,
        comment: Option<String>,
    },
    WhitelistRemove {
        network: String,
    },
    WhitelistShow,
    Lookup {
        ip: String,
    },
    Stats,
    Audit {
        limit: usize,
    },
}

/// Reputation lookup rendered for the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupReport {
    pub ip: String,
    pub composite: f64,
    pub tags: Vec<String>,
    pub country: Option<String>,
    pub external_available: bool,
    pub sources: Vec<SourceScore>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceScore {
    pub source: String,
    pub score: Option<f64>,
    pub stale: bool,
}

impl LookupReport {
    fn new(ip: IpAddr, summary: &ReputationSummary) -> Self {
        let sources = summary
            .reports
            .iter()
            .map(|report| SourceScore {
                source: report.source().to_string(),
                score: report.record().map(|r| r.score),
                stale: matches!(report, crate::intel::SourceReport::Stale(_)),
            })
            .collect();
        Self {
            ip: ip.to_string(),
            composite: summary.composite,
            tags: summary.tags.clone(),
            country: summary.country.clone(),
            external_available: summary.external_available,
            sources,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Error { message: String },
    Blocks { records: Vec<BlockRecord> },
    WhitelistEntries { entries: Vec<WhitelistEntry> },
    Reputation { report: Box<LookupReport> },
    Stats { snapshot: EngineSnapshot },
    AuditTrail { entries: Vec<AuditEntry> },
}

impl ControlResponse {
    fn error(message: impl Into<String>) -> Self {
        ControlResponse::Error {
            message: message.into(),
        }
    }
}

/// Serve admin commands on `path` until `shutdown` fires
pub async fn serve(
    engine: Arc<Engine>,
    path: PathBuf,
    mut shutdown: mpsc::Receiver<()>,
) -> Result<()> {
    // A stale socket from an unclean exit blocks the bind
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
    info!(socket = %path.display(), "Control socket listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(engine, stream).await {
                                debug!("Control connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Control accept failed: {}", e),
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    let _ = std::fs::remove_file(&path);
    Ok(())
}

async fn handle_connection(engine: Arc<Engine>, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => dispatch(&engine, request).await,
            Err(e) => ControlResponse::error(format!("Bad request: {}", e)),
        };
        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
    }
    Ok(())
}

async fn dispatch(engine: &Engine, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::Block {
            network,
            duration_secs,
            reason,
        } => match parse_network(&network) {
            Ok(network) => {
                match engine
                    .blocks
                    .block(network, reason, duration_secs, BlockSource::Manual)
                {
                    Ok(_) => ControlResponse::Ok,
                    Err(e) => ControlResponse::error(e.to_string()),
                }
            }
            Err(e) => ControlResponse::error(e),
        },
        ControlRequest::Unblock { network } => match parse_network(&network) {
            Ok(network) => match engine.blocks.unblock(&network, "cli") {
                Some(_) => ControlResponse::Ok,
                None => ControlResponse::error(format!("{} is not blocked", network)),
            },
            Err(e) => ControlResponse::error(e),
        },
        ControlRequest::ListBlocks { all } => ControlResponse::Blocks {
            records: if all {
                engine.blocks.list_all()
            } else {
                engine.blocks.list_active()
            },
        },
        ControlRequest::WhitelistAdd { network, comment } => match parse_network(&network) {
            Ok(network) => {
                if engine.whitelist.add(network, comment) {
                    ControlResponse::Ok
                } else {
                    ControlResponse::error(format!("{} already whitelisted", network))
                }
            }
            Err(e) => ControlResponse::error(e),
        },
        ControlRequest::WhitelistRemove { network } => match parse_network(&network) {
            Ok(network) => {
                if engine.whitelist.remove(&network) {
                    ControlResponse::Ok
                } else {
                    ControlResponse::error(format!("{} is not whitelisted", network))
                }
            }
            Err(e) => ControlResponse::error(e),
        },
        ControlRequest::WhitelistShow => ControlResponse::WhitelistEntries {
            entries: engine.whitelist.entries(),
        },
        ControlRequest::Lookup { ip } => match ip.parse::<IpAddr>() {
            Ok(ip) => {
                let summary = engine.lookup(ip).await;
                ControlResponse::Reputation {
                    report: Box::new(LookupReport::new(ip, &summary)),
                }
            }
            Err(e) => ControlResponse::error(format!("Bad IP address: {}", e)),
        },
        ControlRequest::Stats => ControlResponse::Stats {
            snapshot: engine.snapshot(),
        },
        ControlRequest::Audit { limit } => ControlResponse::AuditTrail {
            entries: engine.audit.recent(limit),
        },
    }
}

fn parse_network(s: &str) -> Result<IpNetwork, String> {
    s.parse::<IpNetwork>()
        .map_err(|e| format!("Bad network '{}': {}", s, e))
}

/// One request/response round trip from the CLI side
pub async fn send_request(path: &Path, request: &ControlRequest) -> Result<ControlResponse> {
    let stream = UnixStream::connect(path).await.with_context(|| {
        format!(
            "Failed to connect to {} (is the daemon running?)",
            path.display()
        )
    })?;
    let (reader, mut writer) = stream.into_split();

    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;

    let mut lines = BufReader::new(reader).lines();
    let line = lines
        .next_line()
        .await?
        .context("Daemon closed the connection without answering")?;
    Ok(serde_json::from_str(&line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_engine() -> Arc<Engine> {
        let mut config = Config::with_defaults();
        config.intel.sources.clear();
        Arc::new(Engine::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_block_list_unblock_roundtrip() {
        let engine = test_engine();
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("control.sock");

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let server = tokio::spawn(serve(engine, socket.clone(), shutdown_rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let response = send_request(
            &socket,
            &ControlRequest::Block {
                network: "203.0.113.7".to_string(),
                duration_secs: Some(3600),
                reason: "manual test".to_string(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(response, ControlResponse::Ok));

        let response = send_request(&socket, &ControlRequest::ListBlocks { all: false })
            .await
            .unwrap();
        match response {
            ControlResponse::Blocks { records } => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].last_reason(), "manual test");
            }
            other => panic!("unexpected response: {:?}", other),
        }

        let response = send_request(
            &socket,
            &ControlRequest::Unblock {
                network: "203.0.113.7".to_string(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(response, ControlResponse::Ok));

        shutdown_tx.send(()).await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_request_reports_error() {
        let engine = test_engine();
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("control.sock");

        let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(serve(engine, socket.clone(), shutdown_rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let response = send_request(
            &socket,
            &ControlRequest::Unblock {
                network: "not-an-ip".to_string(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(response, ControlResponse::Error { .. }));
    }
}
