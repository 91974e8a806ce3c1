//! Configuration for the forpost stream relay
//!
//! Loads layered `KEY=VALUE` configuration (shipped defaults, operator
//! overrides, environment) and persists reconciliation snapshots.

pub mod config;
pub mod keyvalue;
pub mod snapshot;

pub use config::*;
pub use keyvalue::{apply_updates, parse_key_values, quote_value, ConfigMap};
pub use snapshot::ConfigSnapshot;
