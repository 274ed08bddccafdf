//! Telemetry pipeline CLI
//!
//! Client, formatting and command implementations behind the `tpl` binary.

pub mod client;
pub mod commands;
pub mod config;
pub mod output;
