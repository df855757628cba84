use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type recording the outcome of the last manifest apply.
pub const INSTALL: &str = "Install";
/// Condition type recording whether every workload reports Available.
pub const DEPLOYMENTS_AVAILABLE: &str = "DeploymentsAvailable";

const RECOGNIZED: [&str; 2] = [INSTALL, DEPLOYMENTS_AVAILABLE];

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition attached to the stack status.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(type_: impl Into<String>, status: ConditionStatus) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: None,
            message: None,
            last_transition_time: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        let message = message.into();
        self.message = if message.is_empty() { None } else { Some(message) };
        self
    }
}

/// Observed state of a serving stack.
///
/// Readiness is derived from the `Install` and `DeploymentsAvailable`
/// conditions and never stored on its own.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StackStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Version of the manifest last installed successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl StackStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    fn is_true(&self, type_: &str) -> bool {
        self.condition(type_).map(|c| c.status == ConditionStatus::True).unwrap_or(false)
    }

    /// Insert or replace a condition by type. The transition time is carried
    /// over when the status itself did not change.
    pub fn set_condition(&mut self, mut cond: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(existing) => {
                if existing.status == cond.status {
                    cond.last_transition_time = existing.last_transition_time;
                }
                *existing = cond;
            }
            None => self.conditions.push(cond),
        }
    }

    /// Set every recognized condition that is not present yet to Unknown.
    pub fn initialize_conditions(&mut self) {
        for type_ in RECOGNIZED {
            if self.condition(type_).is_none() {
                self.conditions.push(Condition::new(type_, ConditionStatus::Unknown));
            }
        }
    }

    pub fn mark_install_succeeded(&mut self, version: impl Into<String>) {
        self.set_condition(Condition::new(INSTALL, ConditionStatus::True).with_reason("Installed", ""));
        self.version = Some(version.into());
    }

    pub fn mark_install_failed(&mut self, message: impl Into<String>) {
        self.set_condition(Condition::new(INSTALL, ConditionStatus::False).with_reason("Error", message));
    }

    pub fn mark_deployments_available(&mut self) {
        self.set_condition(
            Condition::new(DEPLOYMENTS_AVAILABLE, ConditionStatus::True).with_reason("Available", ""),
        );
    }

    pub fn mark_deployments_not_ready(&mut self) {
        self.set_condition(
            Condition::new(DEPLOYMENTS_AVAILABLE, ConditionStatus::False)
                .with_reason("NotReady", "Waiting on deployments"),
        );
    }

    pub fn is_install_succeeded(&self) -> bool {
        self.is_true(INSTALL)
    }

    pub fn is_deployments_available(&self) -> bool {
        self.is_true(DEPLOYMENTS_AVAILABLE)
    }

    pub fn is_ready(&self) -> bool {
        self.is_install_succeeded() && self.is_deployments_available()
    }
}
