//! gridscale-core — domain types and configuration for GridScale.
//!
//! Holds the node-group model shared by every other crate (group specs,
//! descriptors, instances, pods, nodes, templates) and the `gridscale.toml`
//! configuration loader. No I/O beyond reading the config file.

pub mod config;
pub mod types;

pub use config::{ConfigError, GridConfig, GroupConfig};
pub use types::*;
