//! Alerting and escalation
//!
//! This module provides:
//! - Validated rule registry with JSON file loading and hot reload
//! - Per-(rule, key) alert state machine with debounce, escalation,
//!   acknowledgement, cooldown and retention
//! - Notification dispatch through circuit-broken, retried sinks

mod dispatcher;
mod manager;
mod rules;
mod sinks;
mod state;
mod store;
mod timers;
mod watcher;


pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats};
pub use manager::{AlertEvent, AlertManager, AlertingConfig};
pub use rules::{
    parse_rules, Comparison, Condition, EscalationStep, Observation, Rule, RuleError, RuleRegistry,
    RuleTarget, Severity, ThresholdField,
};
pub use sinks::{
    AlertmanagerAlert, AlertmanagerPayload, Delivered, LogSink, Notification, NotificationKind,
    NotificationSink, WebhookSink,
};
pub use state::{Alert, AlertState, Transition, TransitionError, TRANSITION_HISTORY};
pub use store::{lock_alert, AlertHandle, AlertStore};
pub use watcher::{load_rules_file, reload_rules, RulesWatcher, RulesWatcherHandle};
