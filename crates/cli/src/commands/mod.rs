//! Subcommand implementations

pub mod alerts;
pub mod data;
pub mod rules;
pub mod status;
