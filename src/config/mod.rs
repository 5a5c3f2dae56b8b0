//! Pipeline Configuration Module
//!
//! Operator-tunable retry budget, timeouts, publish backoff, bus delivery
//! and storage settings, loaded from TOML.
//!
//! ## Loading Order
//!
//! 1. `PARLANCE_CONFIG` environment variable (path to TOML file)
//! 2. `parlance.toml` in the current working directory
//! 3. Built-in defaults from [`defaults`]
//!
//! The loaded config is passed explicitly to the components that need it;
//! there is no process-wide global.

pub mod defaults;
mod pipeline_config;
pub mod validation;

pub use pipeline_config::*;
