//! Common types and utilities for slimfed
//!
//! This crate provides the shared error type, run configuration structures
//! and logging bootstrap used across all slimfed crates.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{parse_arch_ratio, AggregationScheme, ArchStyle, ClientSpec, RunConfig};
pub use error::Error;
pub use logging::{init_logging, init_logging_with_filter, LogLevel};
