//! Alert rule definitions and the validated rule registry

use crate::models::{AggregateResult, AnomalyScore, Labels, PartitionKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Which number of an observation a threshold compares against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdField {
    /// Raw value (sample mode) or window mean
    Value,
    Mean,
    Min,
    Max,
    Stddev,
    P95,
    P99,
    TrendSlope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    pub fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Gt => lhs > rhs,
            Comparison::Gte => lhs >= rhs,
            Comparison::Lt => lhs < rhs,
            Comparison::Lte => lhs <= rhs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Threshold {
        #[serde(default = "default_field")]
        field: ThresholdField,
        op: Comparison,
        value: f64,
    },
    Anomaly {
        min_score: f64,
    },
}

fn default_field() -> ThresholdField {
    ThresholdField::Value
}

/// Something the alert manager can evaluate rules against
#[derive(Debug, Clone)]
pub struct Observation {
    pub key: PartitionKey,
    pub timestamp_ms: i64,
    pub value: f64,
    pub aggregate: Option<AggregateResult>,
    pub score: Option<AnomalyScore>,
}

impl Observation {
    pub fn from_aggregate(aggregate: AggregateResult, score: Option<AnomalyScore>) -> Self {
        Self {
            key: aggregate.key.clone(),
            timestamp_ms: aggregate.interval.end_ms,
            value: aggregate.mean,
            aggregate: Some(aggregate),
            score,
        }
    }

    pub fn from_score(score: AnomalyScore) -> Self {
        Self {
            key: score.key.clone(),
            timestamp_ms: score.timestamp_ms,
            value: score.value,
            aggregate: None,
            score: Some(score),
        }
    }

    fn field(&self, field: ThresholdField) -> Option<f64> {
        let Some(agg) = &self.aggregate else {
            return match field {
                ThresholdField::Value | ThresholdField::Mean => Some(self.value),
                _ => None,
            };
        };
        match field {
            ThresholdField::Value | ThresholdField::Mean => Some(agg.mean),
            ThresholdField::Min => Some(agg.min),
            ThresholdField::Max => Some(agg.max),
            ThresholdField::Stddev => Some(agg.stddev),
            ThresholdField::P95 => agg.percentiles.map(|p| p.p95),
            ThresholdField::P99 => agg.percentiles.map(|p| p.p99),
            ThresholdField::TrendSlope => Some(agg.trend_slope),
        }
    }
}

impl Condition {
    /// Whether the condition holds; `None` when the observation lacks the needed input
    pub fn evaluate(&self, obs: &Observation) -> Option<bool> {
        match self {
            Condition::Threshold { field, op, value } => {
                obs.field(*field).map(|lhs| op.holds(lhs, *value))
            }
            Condition::Anomaly { min_score } => {
                obs.score.as_ref().map(|s| s.combined >= *min_score)
            }
        }
    }
}

/// Metric plus exact-match label selectors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTarget {
    pub metric: String,
    #[serde(default)]
    pub labels: Labels,
}

impl RuleTarget {
    pub fn matches(&self, key: &PartitionKey) -> bool {
        self.metric == key.metric()
            && self
                .labels
                .iter()
                .all(|(k, v)| key.labels().get(k) == Some(v))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationStep {
    /// Delay after the alert first triggered
    pub delay_secs: u64,
    pub severity: Severity,
    pub sinks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub target: RuleTarget,
    pub condition: Condition,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    /// Condition must hold this long before firing
    #[serde(default)]
    pub for_secs: u64,
    /// Re-fire notifications are held back this long after resolution
    #[serde(default)]
    pub cooldown_secs: u64,
    pub sinks: Vec<String>,
    #[serde(default)]
    pub escalation: Vec<EscalationStep>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_severity() -> Severity {
    Severity::Warning
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("rule id must not be empty")]
    EmptyId,

    #[error("rule {0}: target metric must not be empty")]
    EmptyMetric(String),

    #[error("rule {0}: threshold must be finite")]
    NonFiniteThreshold(String),

    #[error("rule {rule}: anomaly score {score} outside [0, 1]")]
    ScoreOutOfRange { rule: String, score: f64 },

    #[error("rule {0}: at least one sink is required")]
    NoSinks(String),

    #[error("rule {rule}: escalation step {index} must have sinks")]
    EmptyEscalationSinks { rule: String, index: usize },

    #[error("rule {rule}: escalation delays must strictly increase (step {index})")]
    EscalationOrder { rule: String, index: usize },

    #[error("rule {0} defined twice")]
    Duplicate(String),

    #[error("failed to parse rules: {0}")]
    Parse(String),

    #[error("failed to read rules file {path}: {reason}")]
    Io { path: String, reason: String },
}

impl Rule {
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.id.trim().is_empty() {
            return Err(RuleError::EmptyId);
        }
        if self.target.metric.trim().is_empty() {
            return Err(RuleError::EmptyMetric(self.id.clone()));
        }
        match self.condition {
            Condition::Threshold { value, .. } if !value.is_finite() => {
                return Err(RuleError::NonFiniteThreshold(self.id.clone()));
            }
            Condition::Anomaly { min_score } if !(0.0..=1.0).contains(&min_score) => {
                return Err(RuleError::ScoreOutOfRange {
                    rule: self.id.clone(),
                    score: min_score,
                });
            }
            _ => {}
        }
        if self.sinks.is_empty() {
            return Err(RuleError::NoSinks(self.id.clone()));
        }

        let mut previous: Option<u64> = None;
        for (index, step) in self.escalation.iter().enumerate() {
            if step.sinks.is_empty() {
                return Err(RuleError::EmptyEscalationSinks {
                    rule: self.id.clone(),
                    index,
                });
            }
            if previous.map(|p| step.delay_secs <= p).unwrap_or(false) {
                return Err(RuleError::EscalationOrder {
                    rule: self.id.clone(),
                    index,
                });
            }
            previous = Some(step.delay_secs);
        }
        Ok(())
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Parse and validate a JSON array of rules
pub fn parse_rules(json: &str) -> Result<Vec<Rule>, RuleError> {
    let rules: Vec<Rule> = serde_json::from_str(json).map_err(|e| RuleError::Parse(e.to_string()))?;
    let mut seen = std::collections::HashSet::new();
    for rule in &rules {
        rule.validate()?;
        if !seen.insert(rule.id.as_str()) {
            return Err(RuleError::Duplicate(rule.id.clone()));
        }
    }
    Ok(rules)
}

/// Active rule set, read by every partition and written by the API and file watcher
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<BTreeMap<String, Rule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<Rule>) -> Result<Self, RuleError> {
        let registry = Self::new();
        registry.replace_all(rules)?;
        Ok(registry)
    }

    /// Insert or replace a rule. Returns the rule it replaced.
    pub fn upsert(&self, rule: Rule) -> Result<Option<Rule>, RuleError> {
        rule.validate()?;
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        Ok(rules.insert(rule.id.clone(), rule))
    }

    pub fn remove(&self, id: &str) -> Option<Rule> {
        self.rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Rule> {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Rule> {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap in a whole rule set; nothing changes if any rule is invalid
    pub fn replace_all(&self, rules: Vec<Rule>) -> Result<(), RuleError> {
        let mut next = BTreeMap::new();
        for rule in rules {
            rule.validate()?;
            if next.contains_key(&rule.id) {
                return Err(RuleError::Duplicate(rule.id));
            }
            next.insert(rule.id.clone(), rule);
        }
        *self.rules.write().unwrap_or_else(|e| e.into_inner()) = next;
        Ok(())
    }

    /// Enabled rules whose target selects `key`
    pub fn matching(&self, key: &PartitionKey) -> Vec<Rule> {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.enabled && r.target.matches(key))
            .cloned()
            .collect()
    }
}
