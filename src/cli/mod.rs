//! CLI-specific functionality for the session gateway
//!
//! This module contains all CLI-related code including argument parsing
//! and configuration discovery.

pub mod args;
pub mod config;

pub use args::{Args, ExecutionMode, SessionTarget};
pub use config::ConfigDiscovery;
