//! Shared alert store with one lock per (rule, key)

use super::rules::Severity;
use super::state::{Alert, AlertState};
use crate::models::PartitionKey;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub type AlertHandle = Arc<Mutex<Alert>>;

/// Lock an alert, recovering the data if a previous holder panicked
pub fn lock_alert(handle: &AlertHandle) -> MutexGuard<'_, Alert> {
    handle.lock().unwrap_or_else(|e| e.into_inner())
}

/// Written only by the alert manager owning the alert's partition; read by
/// query and operator paths.
#[derive(Default)]
pub struct AlertStore {
    alerts: DashMap<String, AlertHandle>,
}

impl AlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing alert for (rule, key) or a fresh Inactive one
    pub fn get_or_create(&self, rule_id: &str, key: &PartitionKey, severity: Severity) -> AlertHandle {
        let id = Alert::id_for(rule_id, key);
        self.alerts
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(Alert::new(rule_id, key.clone(), severity))))
            .clone()
    }

    pub fn handle(&self, id: &str) -> Option<AlertHandle> {
        self.alerts.get(id).map(|h| Arc::clone(h.value()))
    }

    /// Point-in-time copy of one alert
    pub fn get(&self, id: &str) -> Option<Alert> {
        self.handle(id).map(|h| {
            let alert = lock_alert(&h).clone();
            alert
        })
    }

    /// Snapshot of all alerts, optionally filtered by state, ordered by id
    pub fn list(&self, state: Option<AlertState>) -> Vec<Alert> {
        let handles: Vec<AlertHandle> = self.alerts.iter().map(|e| Arc::clone(e.value())).collect();
        let mut alerts: Vec<Alert> = handles
            .iter()
            .map(|h| lock_alert(h).clone())
            .filter(|a| state.map(|s| a.state == s).unwrap_or(true))
            .collect();
        alerts.sort_by(|a, b| a.id.cmp(&b.id));
        alerts
    }

    pub fn remove(&self, id: &str) -> Option<Alert> {
        self.alerts
            .remove(id)
            .map(|(_, h)| {
                let alert = lock_alert(&h).clone();
                alert
            })
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}
