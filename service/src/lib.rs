//! # Stayflow Service
//!
//! Process wiring for the `stayflow` binary:
//!
//! - [`config`]: [`ServiceConfig`] from environment variables
//! - [`repositories`]: in-process repositories behind the saga participants
//! - [`metrics`]: help text for the recorded counters
//! - [`app`]: [`Stayflow`], every component started over shared infrastructure

pub mod app;
pub mod config;
pub mod metrics;
pub mod repositories;

pub use app::Stayflow;
pub use config::{ConfigError, ServiceConfig};
