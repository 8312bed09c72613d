//! Shared status types for the ManagedCluster CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Named conditions maintained on a ManagedCluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// Waiting on the provider API or the cluster agent
    Waiting,
    /// The hosted cluster exists upstream
    Provisioned,
    /// The last spec change has been applied upstream
    Updated,
    /// An imported cluster has not started importing yet
    Pending,
    /// The cluster agent is deployed
    AgentDeployed,
    /// Legacy in-record credentials were moved into secrets
    ServiceAccountSecretsMigrated,
}

impl ConditionType {
    /// Wire name of the condition
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Provisioned => "Provisioned",
            Self::Updated => "Updated",
            Self::Pending => "Pending",
            Self::AgentDeployed => "AgentDeployed",
            Self::ServiceAccountSecretsMigrated => "ServiceAccountSecretsMigrated",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state condition stored on the cluster record
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition name (e.g. Provisioned)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Human-readable message, empty when there is nothing to report
    #[serde(default)]
    pub message: String,

    /// Last time status or message changed
    pub last_update_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition stamped with the current time
    pub fn new(type_: ConditionType, status: ConditionStatus, message: impl Into<String>) -> Self {
        Self {
            type_: type_.as_str().to_string(),
            status,
            message: message.into(),
            last_update_time: Utc::now(),
        }
    }

    /// True when status and message already match
    pub fn matches(&self, status: ConditionStatus, message: &str) -> bool {
        self.status == status && self.message == message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_is_default_status() {
        assert_eq!(ConditionStatus::default(), ConditionStatus::Unknown);
    }

    /// Story: conditions serialize with Kubernetes-style field names
    #[test]
    fn story_condition_wire_format() {
        let condition = Condition::new(
            ConditionType::Waiting,
            ConditionStatus::Unknown,
            "Waiting for API to be available",
        );
        let json = serde_json::to_value(&condition).unwrap();

        assert_eq!(json["type"], "Waiting");
        assert_eq!(json["status"], "Unknown");
        assert_eq!(json["message"], "Waiting for API to be available");
        assert!(json.get("lastUpdateTime").is_some());
    }

    #[test]
    fn test_matches_compares_status_and_message_only() {
        let condition = Condition::new(ConditionType::Updated, ConditionStatus::False, "403");
        assert!(condition.matches(ConditionStatus::False, "403"));
        assert!(!condition.matches(ConditionStatus::False, ""));
        assert!(!condition.matches(ConditionStatus::True, "403"));
    }
}
