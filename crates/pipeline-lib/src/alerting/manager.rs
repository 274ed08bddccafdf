//! Alert manager: drives per-(rule, key) state machines from observations,
//! timers and operator actions, and emits notifications on transitions.
//!
//! All methods take the current time explicitly; the pipeline passes wall
//! clock milliseconds.

use super::rules::{Observation, Rule, RuleRegistry};
use super::sinks::{Notification, NotificationKind};
use super::state::{Alert, AlertState, Transition, TransitionError};
use super::store::{lock_alert, AlertStore};
use super::timers::{Timer, TimerKind, TimerQueue};
use crate::error::PipelineError;
use crate::models::PartitionKey;
use crate::observability::{PipelineMetrics, StructuredLogger};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Acknowledged alerts whose condition still holds fire again after this
    pub ack_timeout_secs: u64,
    /// Resolved alerts return to Inactive after this
    pub resolved_retention_secs: u64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 60 * 60,
            resolved_retention_secs: 60 * 60,
        }
    }
}

/// A transition applied by the manager
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    pub alert_id: String,
    pub rule_id: String,
    pub key: String,
    pub transition: Transition,
}

fn secs_to_ms(secs: u64) -> i64 {
    (secs as i64).saturating_mul(1000)
}

pub struct AlertManager {
    config: AlertingConfig,
    rules: Arc<RuleRegistry>,
    store: Arc<AlertStore>,
    timers: TimerQueue,
    outbound: Option<mpsc::Sender<Notification>>,
    /// Alerts this manager has written
    owned: HashSet<String>,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl AlertManager {
    pub fn new(
        config: AlertingConfig,
        rules: Arc<RuleRegistry>,
        store: Arc<AlertStore>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            config,
            rules,
            store,
            timers: TimerQueue::new(),
            outbound: None,
            owned: HashSet::new(),
            metrics: PipelineMetrics::new(),
            logger,
        }
    }

    /// Route notifications to a dispatcher. Without one they are only logged.
    pub fn with_outbound(mut self, tx: mpsc::Sender<Notification>) -> Self {
        self.outbound = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<AlertStore> {
        &self.store
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Whether any alert on `key` is pending, firing or acknowledged
    pub fn is_active(&self, key: &PartitionKey) -> bool {
        self.rules.matching(key).iter().any(|rule| {
            self.store
                .get(&Alert::id_for(&rule.id, key))
                .map(|a| a.state.is_active())
                .unwrap_or(false)
        })
    }

    /// Evaluate every enabled rule that targets the observation's key
    pub fn evaluate(&mut self, obs: &Observation, now_ms: i64) -> Vec<AlertEvent> {
        let mut events = Vec::new();

        for rule in self.rules.matching(&obs.key) {
            let Some(holds) = rule.condition.evaluate(obs) else {
                continue;
            };

            let handle = if holds {
                self.store.get_or_create(&rule.id, &obs.key, rule.severity)
            } else {
                match self.store.handle(&Alert::id_for(&rule.id, &obs.key)) {
                    Some(h) => h,
                    None => continue,
                }
            };

            let mut alert = lock_alert(&handle);
            self.owned.insert(alert.id.clone());
            alert.last_value = Some(obs.value);
            alert.condition_active = holds;

            match (alert.state, holds) {
                (AlertState::Inactive | AlertState::Resolved, true) => {
                    self.start_pending(&rule, &mut alert, now_ms, &mut events);
                }
                (AlertState::Pending, true) => {
                    let since = alert.first_triggered_ms.unwrap_or(now_ms);
                    if now_ms - since >= secs_to_ms(rule.for_secs) {
                        self.fire(&rule, &mut alert, now_ms, "condition held for the configured duration", &mut events);
                    }
                }
                (AlertState::Pending | AlertState::Firing | AlertState::Acknowledged, false) => {
                    self.resolve(Some(&rule), &mut alert, now_ms, "condition cleared", &mut events);
                }
                _ => {}
            }
        }
        events
    }

    /// Process timers due at `now_ms` and resolve alerts whose rule disappeared
    pub fn tick(&mut self, now_ms: i64) -> Vec<AlertEvent> {
        let mut events = Vec::new();

        for timer in self.timers.pop_due(now_ms) {
            let Some(handle) = self.store.handle(&timer.alert_id) else {
                continue;
            };
            let mut alert = lock_alert(&handle);
            if alert.epoch != timer.epoch {
                continue;
            }
            let Some(rule) = self.rules.get(&alert.rule_id) else {
                continue;
            };
            self.on_timer(&rule, &mut alert, &timer, now_ms, &mut events);
        }

        let orphaned: Vec<String> = self
            .owned
            .iter()
            .filter(|id| {
                self.store
                    .get(id)
                    .map(|a| {
                        a.state.is_active()
                            && self.rules.get(&a.rule_id).map(|r| !r.enabled).unwrap_or(true)
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for id in orphaned {
            if let Some(handle) = self.store.handle(&id) {
                let mut alert = lock_alert(&handle);
                let rule = self.rules.get(&alert.rule_id);
                self.resolve(rule.as_ref(), &mut alert, now_ms, "rule removed or disabled", &mut events);
            }
        }

        events
    }

    /// Earliest pending timer deadline
    pub fn next_deadline(&self) -> Option<i64> {
        self.timers.next_due()
    }

    /// Operator acknowledgement of a pending or firing alert
    pub fn acknowledge(&mut self, alert_id: &str, now_ms: i64) -> Result<Alert, PipelineError> {
        let handle = self
            .store
            .handle(alert_id)
            .ok_or_else(|| PipelineError::AlertNotFound(alert_id.to_string()))?;
        let mut alert = lock_alert(&handle);

        let transition = alert.transition(AlertState::Acknowledged, now_ms, "acknowledged by operator")?;
        self.record(&alert, transition, &mut Vec::new());
        self.owned.insert(alert.id.clone());

        let until = now_ms + secs_to_ms(self.config.ack_timeout_secs);
        alert.acknowledged_until_ms = Some(until);
        self.schedule(&alert, TimerKind::AckTimeout, until);
        Ok(alert.clone())
    }

    /// Operator resolution of an active alert
    pub fn resolve_alert(&mut self, alert_id: &str, now_ms: i64) -> Result<Alert, PipelineError> {
        let handle = self
            .store
            .handle(alert_id)
            .ok_or_else(|| PipelineError::AlertNotFound(alert_id.to_string()))?;
        let mut alert = lock_alert(&handle);

        if !alert.state.can_transition_to(AlertState::Resolved) {
            return Err(TransitionError {
                alert_id: alert.id.clone(),
                from: alert.state,
                to: AlertState::Resolved,
            }
            .into());
        }
        let rule = self.rules.get(&alert.rule_id);
        self.owned.insert(alert.id.clone());
        self.resolve(rule.as_ref(), &mut alert, now_ms, "resolved by operator", &mut Vec::new());
        Ok(alert.clone())
    }

    fn on_timer(&mut self, rule: &Rule, alert: &mut Alert, timer: &Timer, now_ms: i64, events: &mut Vec<AlertEvent>) {
        match timer.kind {
            TimerKind::PendingElapsed => {
                if alert.state == AlertState::Pending && alert.condition_active && rule.enabled {
                    self.fire(rule, alert, now_ms, "condition held for the configured duration", events);
                }
            }
            TimerKind::Escalation { level } => {
                if alert.state == AlertState::Firing && alert.escalation_level == level {
                    self.escalate(rule, alert, level, now_ms, events);
                }
            }
            TimerKind::AckTimeout => {
                let expired = alert.acknowledged_until_ms.map(|t| t <= now_ms).unwrap_or(false);
                if alert.state == AlertState::Acknowledged && expired && alert.condition_active {
                    self.fire(rule, alert, now_ms, "acknowledgement expired", events);
                }
            }
            TimerKind::DeferredNotify => {
                let cooled = alert.suppressed_until_ms.map(|t| t <= now_ms).unwrap_or(true);
                if alert.state == AlertState::Firing && alert.notification_deferred && cooled {
                    alert.notification_deferred = false;
                    self.notify(rule, alert, NotificationKind::Firing, rule.sinks.clone(), now_ms);
                }
            }
            TimerKind::Retention => {
                let expired = alert
                    .resolved_at_ms
                    .map(|t| t + secs_to_ms(self.config.resolved_retention_secs) <= now_ms)
                    .unwrap_or(false);
                if alert.state == AlertState::Resolved && expired {
                    self.apply(alert, AlertState::Inactive, now_ms, "retention elapsed", events);
                }
            }
        }
    }

    fn start_pending(&mut self, rule: &Rule, alert: &mut Alert, now_ms: i64, events: &mut Vec<AlertEvent>) {
        if !self.apply(alert, AlertState::Pending, now_ms, "condition breached", events) {
            return;
        }
        alert.epoch += 1;
        alert.first_triggered_ms = Some(now_ms);
        alert.escalation_level = 0;
        alert.severity = rule.severity;
        alert.acknowledged_until_ms = None;
        alert.notification_deferred = false;

        if rule.for_secs == 0 {
            self.fire(rule, alert, now_ms, "condition breached with no debounce", events);
        } else {
            self.schedule(alert, TimerKind::PendingElapsed, now_ms + secs_to_ms(rule.for_secs));
        }
    }

    fn fire(&mut self, rule: &Rule, alert: &mut Alert, now_ms: i64, reason: &str, events: &mut Vec<AlertEvent>) {
        if !self.apply(alert, AlertState::Firing, now_ms, reason, events) {
            return;
        }
        alert.acknowledged_until_ms = None;
        self.schedule_escalation(rule, alert, now_ms);

        let suppressed = alert.suppressed_until_ms.filter(|t| *t > now_ms);
        match suppressed {
            Some(until) => {
                debug!(alert_id = %alert.id, until_ms = until, "Firing notification deferred by cooldown");
                alert.notification_deferred = true;
                self.schedule(alert, TimerKind::DeferredNotify, until);
            }
            None => self.notify(rule, alert, NotificationKind::Firing, rule.sinks.clone(), now_ms),
        }
    }

    fn escalate(&mut self, rule: &Rule, alert: &mut Alert, level: usize, now_ms: i64, events: &mut Vec<AlertEvent>) {
        let Some(step) = rule.escalation.get(level) else {
            return;
        };
        let reason = format!("escalated to level {}", level + 1);
        if !self.apply(alert, AlertState::Firing, now_ms, &reason, events) {
            return;
        }
        alert.escalation_level = level + 1;
        alert.severity = step.severity;
        if !alert.notification_deferred {
            self.notify(rule, alert, NotificationKind::Escalated, step.sinks.clone(), now_ms);
        }
        self.schedule_escalation(rule, alert, now_ms);
    }

    fn schedule_escalation(&mut self, rule: &Rule, alert: &Alert, now_ms: i64) {
        let level = alert.escalation_level;
        if let Some(step) = rule.escalation.get(level) {
            let base = alert.first_triggered_ms.unwrap_or(now_ms);
            let due = (base + secs_to_ms(step.delay_secs)).max(now_ms);
            self.schedule(alert, TimerKind::Escalation { level }, due);
        }
    }

    fn resolve(
        &mut self,
        rule: Option<&Rule>,
        alert: &mut Alert,
        now_ms: i64,
        reason: &str,
        events: &mut Vec<AlertEvent>,
    ) {
        let notified = match (alert.last_notified_ms, alert.first_triggered_ms) {
            (Some(notified), Some(triggered)) => notified >= triggered,
            _ => false,
        };
        if !self.apply(alert, AlertState::Resolved, now_ms, reason, events) {
            return;
        }
        alert.resolved_at_ms = Some(now_ms);
        alert.acknowledged_until_ms = None;
        alert.notification_deferred = false;

        if let Some(rule) = rule {
            alert.suppressed_until_ms = Some(now_ms + secs_to_ms(rule.cooldown_secs));
            if notified {
                self.notify(rule, alert, NotificationKind::Resolved, rule.sinks.clone(), now_ms);
            }
        }

        let retention = now_ms + secs_to_ms(self.config.resolved_retention_secs);
        self.schedule(alert, TimerKind::Retention, retention);
    }

    fn apply(&self, alert: &mut Alert, to: AlertState, now_ms: i64, reason: &str, events: &mut Vec<AlertEvent>) -> bool {
        match alert.transition(to, now_ms, reason) {
            Ok(transition) => {
                self.record(alert, transition, events);
                true
            }
            Err(e) => {
                warn!(alert_id = %alert.id, error = %e, "Rejected alert transition");
                false
            }
        }
    }

    fn record(&self, alert: &Alert, transition: Transition, events: &mut Vec<AlertEvent>) {
        self.metrics.inc_alert_transition(transition.to.as_str());
        self.logger.log_alert_transition(
            &alert.id,
            &alert.rule_id,
            alert.key.canonical(),
            transition.from.as_str(),
            transition.to.as_str(),
        );
        events.push(AlertEvent {
            alert_id: alert.id.clone(),
            rule_id: alert.rule_id.clone(),
            key: alert.key.canonical().to_string(),
            transition,
        });
    }

    fn schedule(&mut self, alert: &Alert, kind: TimerKind, due_ms: i64) {
        self.timers.schedule(Timer {
            alert_id: alert.id.clone(),
            kind,
            epoch: alert.epoch,
            due_ms,
        });
    }

    fn notify(&self, rule: &Rule, alert: &mut Alert, kind: NotificationKind, sinks: Vec<String>, now_ms: i64) {
        alert.last_notified_ms = Some(now_ms);

        let value = alert
            .last_value
            .map(|v| format!("{:.4}", v))
            .unwrap_or_else(|| "n/a".to_string());
        let notification = Notification {
            alert_id: alert.id.clone(),
            rule_id: rule.id.clone(),
            rule_name: rule.display_name().to_string(),
            metric: alert.key.metric().to_string(),
            key: alert.key.canonical().to_string(),
            labels: alert.key.labels().clone(),
            kind,
            severity: alert.severity,
            escalation_level: alert.escalation_level,
            value: alert.last_value,
            first_triggered_ms: alert.first_triggered_ms,
            at_ms: now_ms,
            sinks,
            message: format!("{} {} on {} (value {})", rule.display_name(), kind, alert.key, value),
        };

        let Some(tx) = &self.outbound else {
            debug!(alert_id = %alert.id, kind = %kind, "No dispatcher attached, notification dropped");
            return;
        };
        match tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                self.metrics.inc_backpressure_dropped("notifications");
                warn!(alert_id = %n.alert_id, kind = %n.kind, "Notification channel full, dropping notification");
            }
            Err(TrySendError::Closed(n)) => {
                warn!(alert_id = %n.alert_id, "Notification channel closed");
            }
        }
    }
}
