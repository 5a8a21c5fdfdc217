//! authban - SSH authentication threat detection and response
//!
//! Normalizes raw authentication log lines into events, profiles source
//! IPs for brute-force behavior, enriches them with cached external
//! reputation, fuses everything into a 0-100 risk score, and responds
//! with blocks and alerts. Embeddable as a library through [`Engine`],
//! or run as a daemon via the `authban` binary.

pub mod alerts;
pub mod blocklist;
pub mod classifier;
pub mod config;
pub mod control;
pub mod detector;
pub mod intel;
pub mod models;
pub mod normalizer;
pub mod pipeline;

pub use classifier::{MlScorer, NeutralScorer, ResponseAction, RiskVerdict, Severity};
pub use config::Config;
pub use models::{AuthEvent, AuthOutcome, BlockRecord, BlockSource, EngineSnapshot};
pub use pipeline::Engine;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
