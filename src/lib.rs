//! Arena Bot AI Library
//!
//! Decision core for computer-controlled arena shooter players: perception,
//! threat assessment, combat and movement tactics, cover, team strategy,
//! dynamic difficulty and an online learning agent.
//!
//! # Features
//!
//! - `metrics_server` - Prometheus exporter over a plain TCP listener (enabled by default)

pub mod ai;
pub mod config;
pub mod metrics;
pub mod util;
pub mod world;
