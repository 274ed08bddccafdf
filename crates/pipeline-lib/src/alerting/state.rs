//! Alert lifecycle state machine

use super::rules::Severity;
use crate::models::PartitionKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

/// Transitions kept per alert
pub const TRANSITION_HISTORY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Inactive,
    Pending,
    Firing,
    Acknowledged,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Inactive => "inactive",
            AlertState::Pending => "pending",
            AlertState::Firing => "firing",
            AlertState::Acknowledged => "acknowledged",
            AlertState::Resolved => "resolved",
        }
    }

    /// Pending, firing or acknowledged
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AlertState::Pending | AlertState::Firing | AlertState::Acknowledged
        )
    }

    /// Whether `self -> to` is an edge of the lifecycle graph.
    ///
    /// Only Pending and Firing alerts can be acknowledged; there is nothing
    /// left to suppress once an alert is inactive or resolved.
    pub fn can_transition_to(&self, to: AlertState) -> bool {
        use AlertState::*;
        matches!(
            (self, to),
            (Inactive, Pending)
                | (Pending, Firing)
                | (Pending, Resolved)
                | (Pending, Acknowledged)
                | (Firing, Firing)
                | (Firing, Resolved)
                | (Firing, Acknowledged)
                | (Acknowledged, Resolved)
                | (Acknowledged, Firing)
                | (Resolved, Pending)
                | (Resolved, Inactive)
        )
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(AlertState::Inactive),
            "pending" => Ok(AlertState::Pending),
            "firing" => Ok(AlertState::Firing),
            "acknowledged" => Ok(AlertState::Acknowledged),
            "resolved" => Ok(AlertState::Resolved),
            other => Err(format!("unknown alert state: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("alert {alert_id}: transition {from} -> {to} is not allowed")]
pub struct TransitionError {
    pub alert_id: String,
    pub from: AlertState,
    pub to: AlertState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: AlertState,
    pub to: AlertState,
    pub at_ms: i64,
    pub reason: String,
}

/// One alert per (rule, key)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub key: PartitionKey,
    pub state: AlertState,
    pub severity: Severity,
    pub first_triggered_ms: Option<i64>,
    pub last_notified_ms: Option<i64>,
    pub escalation_level: usize,
    /// Firing notifications are held back until this time
    pub suppressed_until_ms: Option<i64>,
    pub acknowledged_until_ms: Option<i64>,
    pub resolved_at_ms: Option<i64>,
    pub last_value: Option<f64>,
    /// Last evaluated truth of the rule condition
    pub condition_active: bool,
    /// A firing notification is waiting for the cooldown to pass
    pub notification_deferred: bool,
    /// Bumped whenever the alert enters Pending; stale timers carry an older epoch
    pub epoch: u64,
    pub transitions: VecDeque<Transition>,
}

impl Alert {
    pub fn id_for(rule_id: &str, key: &PartitionKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(rule_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(key.canonical().as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..16].to_string()
    }

    pub fn new(rule_id: impl Into<String>, key: PartitionKey, severity: Severity) -> Self {
        let rule_id = rule_id.into();
        Self {
            id: Self::id_for(&rule_id, &key),
            rule_id,
            key,
            state: AlertState::Inactive,
            severity,
            first_triggered_ms: None,
            last_notified_ms: None,
            escalation_level: 0,
            suppressed_until_ms: None,
            acknowledged_until_ms: None,
            resolved_at_ms: None,
            last_value: None,
            condition_active: false,
            notification_deferred: false,
            epoch: 0,
            transitions: VecDeque::new(),
        }
    }

    /// Move along one edge of the lifecycle graph, recording it in the history
    pub fn transition(
        &mut self,
        to: AlertState,
        at_ms: i64,
        reason: impl Into<String>,
    ) -> Result<Transition, TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                alert_id: self.id.clone(),
                from: self.state,
                to,
            });
        }

        let transition = Transition {
            from: self.state,
            to,
            at_ms,
            reason: reason.into(),
        };
        self.state = to;
        if self.transitions.len() >= TRANSITION_HISTORY {
            self.transitions.pop_front();
        }
        self.transitions.push_back(transition.clone());
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [AlertState; 5] = [
        AlertState::Inactive,
        AlertState::Pending,
        AlertState::Firing,
        AlertState::Acknowledged,
        AlertState::Resolved,
    ];

    fn alert() -> Alert {
        Alert::new("high-latency", PartitionKey::new("latency", Default::default()), Severity::Warning)
    }

    #[test]
    fn test_inactive_cannot_resolve() {
        let mut a = alert();
        let err = a.transition(AlertState::Resolved, 0, "test").unwrap_err();
        assert_eq!(err.from, AlertState::Inactive);
        assert_eq!(a.state, AlertState::Inactive);
        assert!(a.transitions.is_empty());
    }

    #[test]
    fn test_edge_count_matches_graph() {
        let edges = ALL
            .iter()
            .flat_map(|from| ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .count();
        assert_eq!(edges, 11);
        assert!(!AlertState::Acknowledged.can_transition_to(AlertState::Pending));
        assert!(!AlertState::Inactive.can_transition_to(AlertState::Firing));
    }

    #[test]
    fn test_only_active_alerts_accept_acknowledgement() {
        for state in ALL {
            let active = matches!(state, AlertState::Pending | AlertState::Firing);
            assert_eq!(state.can_transition_to(AlertState::Acknowledged), active, "{}", state);
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let mut a = alert();
        for (i, to) in [
            AlertState::Pending,
            AlertState::Firing,
            AlertState::Firing,
            AlertState::Acknowledged,
            AlertState::Firing,
            AlertState::Resolved,
            AlertState::Pending,
            AlertState::Resolved,
            AlertState::Inactive,
        ]
        .into_iter()
        .enumerate()
        {
            a.transition(to, i as i64, "step").unwrap();
        }
        assert_eq!(a.transitions.len(), 9);
        assert_eq!(a.state, AlertState::Inactive);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut a = alert();
        a.transition(AlertState::Pending, 0, "start").unwrap();
        a.transition(AlertState::Firing, 1, "fire").unwrap();
        for i in 0..100 {
            a.transition(AlertState::Firing, 2 + i, "escalate").unwrap();
        }
        assert_eq!(a.transitions.len(), TRANSITION_HISTORY);
        assert_eq!(a.transitions.back().unwrap().at_ms, 101);
    }

    #[test]
    fn test_id_is_stable_and_short() {
        let key = PartitionKey::new("latency", Default::default());
        let id = Alert::id_for("rule", &key);
        assert_eq!(id.len(), 16);
        assert_eq!(id, Alert::id_for("rule", &key));
        assert_ne!(id, Alert::id_for("rule2", &key));
    }

    #[test]
    fn test_state_parse() {
        for state in ALL {
            assert_eq!(state.as_str().parse::<AlertState>().unwrap(), state);
        }
        assert!("bogus".parse::<AlertState>().is_err());
    }
}
