//! Command line interface
//!
//! `start` runs the detection daemon (log lines on stdin, admin commands
//! on the control socket); every other subcommand is a thin client that
//! talks to the running daemon over that socket.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{Table, Tabled};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::error;

use authban::config::Config;
use authban::control::{self, ControlRequest, ControlResponse};
use authban::pipeline::Engine;

#[derive(Parser)]
#[command(name = "authban", version, about = "SSH authentication threat detection and response")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the detection daemon, reading log lines from stdin
    Start,
    /// Block an IP or CIDR
    Block {
        /// IP address or CIDR to block
        network: String,
        /// Block duration in seconds (omit for permanent)
        #[arg(short, long)]
        duration: Option<i64>,
        /// Reason recorded on the block
        #[arg(short, long, default_value = "manual block")]
        reason: String,
    },
    /// Remove an active block
    Unblock {
        /// IP address or CIDR to unblock
        network: String,
    },
    /// List blocks
    List {
        /// Include expired and removed blocks
        #[arg(long)]
        all: bool,
    },
    /// Manage the whitelist
    Whitelist {
        #[command(subcommand)]
        action: WhitelistAction,
    },
    /// Query threat intelligence for an IP
    Lookup {
        /// IP address to look up
        ip: String,
    },
    /// Show engine statistics
    Stats,
    /// Show the recent audit trail
    Audit {
        /// Entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum WhitelistAction {
    /// Add an IP or CIDR to the whitelist
    Add {
        network: String,
        #[arg(short, long)]
        comment: Option<String>,
    },
    /// Remove a whitelist entry
    Remove { network: String },
    /// Show the whitelist
    Show,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        #[arg(default_value = "config.toml")]
        path: PathBuf,
    },
}

#[derive(Tabled)]
struct BlockRow {
    network: String,
    source: String,
    reason: String,
    created: String,
    expires: String,
    hits: u32,
    state: String,
}

#[derive(Tabled)]
struct WhitelistRow {
    network: String,
    comment: String,
    created: String,
}

#[derive(Tabled)]
struct SourceRow {
    source: String,
    score: String,
    freshness: String,
}

#[derive(Tabled)]
struct StatRow {
    metric: String,
    value: String,
}

#[derive(Tabled)]
struct AuditRow {
    time: String,
    action: String,
    ip: String,
    actor: String,
    details: String,
}

pub async fn run(cli: Cli, config: Config) -> Result<()> {
    let socket = config.general.control_socket.clone();
    match cli.command {
        Command::Start => start(config).await,
        Command::Block {
            network,
            duration,
            reason,
        } => {
            expect_ok(
                control::send_request(
                    &socket,
                    &ControlRequest::Block {
                        network: network.clone(),
                        duration_secs: duration,
                        reason,
                    },
                )
                .await?,
            )?;
            println!("{} {}", "Blocked".red().bold(), network);
            Ok(())
        }
        Command::Unblock { network } => {
            expect_ok(
                control::send_request(
                    &socket,
                    &ControlRequest::Unblock {
                        network: network.clone(),
                    },
                )
                .await?,
            )?;
            println!("{} {}", "Unblocked".green().bold(), network);
            Ok(())
        }
        Command::List { all } => {
            let response =
                control::send_request(&socket, &ControlRequest::ListBlocks { all }).await?;
            let ControlResponse::Blocks { records } = response else {
                bail!("Unexpected response from daemon");
            };
            if records.is_empty() {
                println!("No blocks");
                return Ok(());
            }
            let rows: Vec<BlockRow> = records
                .iter()
                .map(|r| BlockRow {
                    network: r.network.to_string(),
                    source: r.source.to_string(),
                    reason: r.last_reason().to_string(),
                    created: r.created_at.format("%Y-%m-%d %H:%M").to_string(),
                    expires: r
                        .expires_at
                        .map(|e| e.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".to_string()),
                    hits: r.hit_count,
                    state: if r.active && !r.is_expired() {
                        "active".to_string()
                    } else {
                        "inactive".to_string()
                    },
                })
                .collect();
            println!("{}", Table::new(rows));
            Ok(())
        }
        Command::Whitelist { action } => whitelist(&socket, action).await,
        Command::Lookup { ip } => lookup(&socket, ip).await,
        Command::Stats => stats(&socket).await,
        Command::Audit { limit } => {
            let response = control::send_request(&socket, &ControlRequest::Audit { limit }).await?;
            let ControlResponse::AuditTrail { entries } = response else {
                bail!("Unexpected response from daemon");
            };
            let rows: Vec<AuditRow> = entries
                .iter()
                .map(|e| AuditRow {
                    time: e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                    action: e.action.to_string(),
                    ip: e.ip.map(|i| i.to_string()).unwrap_or_default(),
                    actor: e.actor.clone().unwrap_or_default(),
                    details: e.details.clone(),
                })
                .collect();
            println!("{}", Table::new(rows));
            Ok(())
        }
        Command::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigAction::Init { path } => {
                if path.exists() {
                    bail!("{} already exists", path.display());
                }
                Config::with_defaults().save(&path)?;
                println!("Wrote default configuration to {}", path.display());
                Ok(())
            }
        },
    }
}

/// Run the daemon: pipeline worker, control socket, stdin reader
async fn start(config: Config) -> Result<()> {
    let socket = config.general.control_socket.clone();
    let engine = Arc::new(Engine::new(config)?);

    let (pipeline_tx, pipeline_rx) = mpsc::channel(1);
    let (control_tx, control_rx) = mpsc::channel(1);

    let pipeline = tokio::spawn(engine.clone().run(pipeline_rx));
    let control = tokio::spawn(control::serve(engine.clone(), socket, control_rx));

    let reader_engine = engine.clone();
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            reader_engine.submit_line(&host, &line);
        }
    });

    tokio::signal::ctrl_c().await?;
    let _ = pipeline_tx.send(()).await;
    let _ = control_tx.send(()).await;

    if let Err(e) = pipeline.await? {
        error!("Pipeline exited with error: {}", e);
    }
    if let Err(e) = control.await? {
        error!("Control socket exited with error: {}", e);
    }
    Ok(())
}

async fn whitelist(socket: &std::path::Path, action: WhitelistAction) -> Result<()> {
    match action {
        WhitelistAction::Add { network, comment } => {
            expect_ok(
                control::send_request(
                    socket,
                    &ControlRequest::WhitelistAdd {
                        network: network.clone(),
                        comment,
                    },
                )
                .await?,
            )?;
            println!("{} {}", "Whitelisted".green().bold(), network);
            Ok(())
        }
        WhitelistAction::Remove { network } => {
            expect_ok(
                control::send_request(
                    socket,
                    &ControlRequest::WhitelistRemove {
                        network: network.clone(),
                    },
                )
                .await?,
            )?;
            println!("Removed {} from whitelist", network);
            Ok(())
        }
        WhitelistAction::Show => {
            let response = control::send_request(socket, &ControlRequest::WhitelistShow).await?;
            let ControlResponse::WhitelistEntries { entries } = response else {
                bail!("Unexpected response from daemon");
            };
            if entries.is_empty() {
                println!("Whitelist is empty");
                return Ok(());
            }
            let rows: Vec<WhitelistRow> = entries
                .iter()
                .map(|e| WhitelistRow {
                    network: e.network.to_string(),
                    comment: e.comment.clone().unwrap_or_default(),
                    created: e.created_at.format("%Y-%m-%d").to_string(),
                })
                .collect();
            println!("{}", Table::new(rows));
            Ok(())
        }
    }
}

async fn lookup(socket: &std::path::Path, ip: String) -> Result<()> {
    let response = control::send_request(socket, &ControlRequest::Lookup { ip }).await?;
    let ControlResponse::Reputation { report } = response else {
        bail!("Unexpected response from daemon");
    };

    let composite = format!("{:.1}", report.composite);
    let composite = if report.composite >= 75.0 {
        composite.red().bold()
    } else if report.composite >= 40.0 {
        composite.yellow()
    } else {
        composite.green()
    };
    println!("{}  composite score {}", report.ip.bold(), composite);
    if !report.tags.is_empty() {
        println!("tags: {}", report.tags.join(", "));
    }
    if let Some(country) = &report.country {
        println!("country: {}", country);
    }
    if !report.external_available {
        println!("{}", "external sources unavailable, local data only".yellow());
    }
    if !report.sources.is_empty() {
        let rows: Vec<SourceRow> = report
            .sources
            .iter()
            .map(|s| SourceRow {
                source: s.source.clone(),
                score: s
                    .score
                    .map(|v| format!("{:.1}", v))
                    .unwrap_or_else(|| "-".to_string()),
                freshness: if s.stale { "stale".to_string() } else { "fresh".to_string() },
            })
            .collect();
        println!("{}", Table::new(rows));
    }
    Ok(())
}

async fn stats(socket: &std::path::Path) -> Result<()> {
    let response = control::send_request(socket, &ControlRequest::Stats).await?;
    let ControlResponse::Stats { snapshot } = response else {
        bail!("Unexpected response from daemon");
    };
    let rows = vec![
        StatRow {
            metric: "events processed".to_string(),
            value: snapshot.events_processed.to_string(),
        },
        StatRow {
            metric: "events dropped".to_string(),
            value: snapshot.events_dropped.to_string(),
        },
        StatRow {
            metric: "lines unmatched".to_string(),
            value: snapshot.lines_unmatched.to_string(),
        },
        StatRow {
            metric: "threats detected".to_string(),
            value: snapshot.threats_detected.to_string(),
        },
        StatRow {
            metric: "verdicts (c/l/m/h/crit)".to_string(),
            value: format!(
                "{}/{}/{}/{}/{}",
                snapshot.verdicts_clean,
                snapshot.verdicts_low,
                snapshot.verdicts_medium,
                snapshot.verdicts_high,
                snapshot.verdicts_critical
            ),
        },
        StatRow {
            metric: "cache hit rate".to_string(),
            value: format!("{:.1}%", snapshot.cache_hit_rate * 100.0),
        },
        StatRow {
            metric: "limiter rejections".to_string(),
            value: snapshot.limiter_rejections.to_string(),
        },
        StatRow {
            metric: "active blocks".to_string(),
            value: snapshot.active_blocks.to_string(),
        },
        StatRow {
            metric: "alerts delivered / failed".to_string(),
            value: format!("{} / {}", snapshot.alerts_delivered, snapshot.alerts_failed),
        },
    ];
    println!("{}", Table::new(rows));
    Ok(())
}

fn expect_ok(response: ControlResponse) -> Result<()> {
    match response {
        ControlResponse::Ok => Ok(()),
        ControlResponse::Error { message } => bail!(message),
        _ => bail!("Unexpected response from daemon"),
    }
}
