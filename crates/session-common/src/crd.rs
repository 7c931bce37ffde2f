//! SessionBinding custom resource definition
//!
//! A SessionBinding declares that an external Cloudflare session should be
//! backed by a dedicated in-cluster pod, cloned from a target Deployment's
//! pod template, with a return route programmed in the edge.
//!
//! Spec fields are user intent; status is written only by the controller.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// SessionBinding binds one Cloudflare session to one session pod.
///
/// Example:
/// ```yaml
/// apiVersion: cloudflare.example.com/v1alpha1
/// kind: SessionBinding
/// metadata:
///   name: user-42
///   namespace: default
/// spec:
///   sessionID: s1
///   targetDeployment: web
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloudflare.example.com",
    version = "v1alpha1",
    kind = "SessionBinding",
    namespaced,
    status = "SessionBindingStatus",
    shortname = "sb",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Pod","type":"string","jsonPath":".status.boundPod"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.routeEndpoint"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SessionBindingSpec {
    /// Cloudflare session identifier to bind. Treated as immutable once set;
    /// changing it orphans the previously bound pod.
    #[serde(rename = "sessionID")]
    pub session_id: String,

    /// Optional identifier of the user owning the session. Informational only,
    /// never used for decisions.
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Name of the in-namespace Deployment whose pod template is cloned for
    /// the session pod.
    pub target_deployment: String,

    /// Advisory upper bound on binding lifetime in seconds. Carried in the
    /// schema but not acted upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
}

/// Lifecycle phase of a session binding.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SessionBindingPhase {
    /// Session exists but the pod is not ready yet
    #[default]
    Pending,
    /// Pod ready and edge route programmed
    Bound,
    /// Cloudflare no longer knows the session
    Expired,
    /// Reconciliation hit an error; see conditions
    Error,
}

impl std::fmt::Display for SessionBindingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Bound => write!(f, "Bound"),
            Self::Expired => write!(f, "Expired"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Observed state of a SessionBinding. Mutated only by the controller.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionBindingStatus {
    /// Coarse lifecycle summary
    #[serde(default)]
    pub phase: SessionBindingPhase,

    /// Name of the pod created for this session, if one exists
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bound_pod: String,

    /// `IP:port` currently programmed in Cloudflare for this session
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub route_endpoint: String,

    /// Latest spec generation processed by the controller
    #[serde(default)]
    pub observed_generation: i64,

    /// Granular observations on independent axes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Time of the most recent reconcile exit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
}

/// Condition types reported on SessionBinding status.
pub mod condition_types {
    /// Cloudflare reports the session as existing
    pub const SESSION_DISCOVERED: &str = "SessionDiscovered";
    /// The owned pod is Running and its Ready condition is True
    pub const POD_READY: &str = "PodReady";
    /// Cloudflare currently maps this session to the pod's endpoint
    pub const ROUTE_CONFIGURED: &str = "RouteConfigured";
}

/// Condition status following Kubernetes conventions.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Condition could not be determined
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

/// Kubernetes-style condition attached to SessionBinding status.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Condition type (SessionDiscovered, PodReady, RouteConfigured)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition's status changed
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a condition stamped with the given time.
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
        }
    }
}

/// Upsert a condition by type.
///
/// When a condition of the same type already exists with the same status,
/// only reason and message are refreshed and the original transition time is
/// kept. A status change replaces the condition wholesale, moving the
/// transition time forward.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                existing.reason = condition.reason;
                existing.message = condition.message;
            } else {
                *existing = condition;
            }
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn spec_serializes_with_api_field_names() {
        let spec = SessionBindingSpec {
            session_id: "s1".to_string(),
            user_id: Some("u1".to_string()),
            target_deployment: "web".to_string(),
            ttl_seconds: Some(3600),
        };

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["sessionID"], "s1");
        assert_eq!(value["userID"], "u1");
        assert_eq!(value["targetDeployment"], "web");
        assert_eq!(value["ttlSeconds"], 3600);
    }

    #[test]
    fn optional_spec_fields_are_omitted() {
        let spec = SessionBindingSpec {
            session_id: "s1".to_string(),
            user_id: None,
            target_deployment: "web".to_string(),
            ttl_seconds: None,
        };

        let value = serde_json::to_value(&spec).unwrap();
        assert!(value.get("userID").is_none());
        assert!(value.get("ttlSeconds").is_none());
    }

    #[test]
    fn empty_status_serializes_compactly() {
        let status = SessionBindingStatus::default();
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["phase"], "Pending");
        assert!(value.get("boundPod").is_none());
        assert!(value.get("routeEndpoint").is_none());
        assert!(value.get("conditions").is_none());
    }

    #[test]
    fn phase_display_matches_api_strings() {
        assert_eq!(SessionBindingPhase::Pending.to_string(), "Pending");
        assert_eq!(SessionBindingPhase::Bound.to_string(), "Bound");
        assert_eq!(SessionBindingPhase::Expired.to_string(), "Expired");
        assert_eq!(SessionBindingPhase::Error.to_string(), "Error");
    }

    #[test]
    fn set_condition_inserts_new_type() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new(
                condition_types::SESSION_DISCOVERED,
                ConditionStatus::True,
                "SessionActive",
                "Cloudflare session is active",
                at(9),
            ),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, "SessionDiscovered");
        assert_eq!(conditions[0].last_transition_time, at(9));
    }

    #[test]
    fn set_condition_preserves_transition_time_when_status_unchanged() {
        let mut conditions = vec![Condition::new(
            condition_types::POD_READY,
            ConditionStatus::False,
            "WaitingForReadiness",
            "Session pod not ready yet",
            at(9),
        )];

        set_condition(
            &mut conditions,
            Condition::new(
                condition_types::POD_READY,
                ConditionStatus::False,
                "WaitingForReadiness",
                "still waiting",
                at(10),
            ),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "still waiting");
        assert_eq!(conditions[0].last_transition_time, at(9));
    }

    #[test]
    fn set_condition_moves_transition_time_on_status_change() {
        let mut conditions = vec![Condition::new(
            condition_types::POD_READY,
            ConditionStatus::False,
            "WaitingForReadiness",
            "Session pod not ready yet",
            at(9),
        )];

        set_condition(
            &mut conditions,
            Condition::new(
                condition_types::POD_READY,
                ConditionStatus::True,
                "PodReady",
                "Session pod ready",
                at(10),
            ),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::True);
        assert_eq!(conditions[0].last_transition_time, at(10));
    }

    #[test]
    fn set_condition_keeps_other_axes_untouched() {
        let mut conditions = vec![Condition::new(
            condition_types::SESSION_DISCOVERED,
            ConditionStatus::True,
            "SessionActive",
            "Cloudflare session is active",
            at(9),
        )];

        set_condition(
            &mut conditions,
            Condition::new(
                condition_types::ROUTE_CONFIGURED,
                ConditionStatus::True,
                "RouteConfigured",
                "Cloudflare route configured",
                at(10),
            ),
        );

        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].type_, "SessionDiscovered");
        assert_eq!(conditions[1].type_, "RouteConfigured");
    }
}
