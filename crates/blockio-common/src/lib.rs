//! BlockIO Common - Shared types and utilities
//!
//! This crate provides the addressing types, array geometry configuration,
//! and the metrics collector used across all BlockIO components.

pub mod config;
pub mod metrics;
pub mod types;

pub use config::ArrayConfig;
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use types::*;
