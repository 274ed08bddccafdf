//! Telemetry pipeline daemon: configuration loading and the HTTP surface

pub mod api;
pub mod config;
