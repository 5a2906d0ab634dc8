//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML file from the platform config
//! directory, writes changes back, and supplies defaults on first run.

pub mod config;
