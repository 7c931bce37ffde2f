//! Kubernetes Event recording for the session operator.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so the reconciler
//! can emit Events visible in `kubectl describe sessionbinding` without
//! coupling to a live cluster in tests.
//!
//! Publishing is fire-and-forget: a failed Event is logged at warn and never
//! fails a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events against a SessionBinding.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given object.
    ///
    /// * `resource_ref` - the object the Event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - machine-readable reason (e.g. "PodCreated")
    /// * `action` - the action being taken (e.g. "Reconcile")
    /// * `note` - optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production publisher wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish Kubernetes event");
        }
    }
}

/// No-op publisher for tests. Never touches the API server.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event and condition reason strings.
///
/// These are part of the external contract: dashboards key off the REASON
/// column and off `status.conditions[].reason`.
pub mod reasons {
    /// A session pod was created for the binding
    pub const POD_CREATED: &str = "PodCreated";
    /// Pod deleted and Cloudflare route retracted during teardown
    pub const CLEANED_UP: &str = "CleanedUp";
    /// spec.sessionID is empty
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// A Cloudflare API call failed
    pub const CLOUDFLARE_ERROR: &str = "CloudflareError";
    /// Cloudflare does not know the session
    pub const NOT_FOUND: &str = "NotFound";
    /// Cloudflare confirmed the session exists
    pub const SESSION_ACTIVE: &str = "SessionActive";
    /// Session pod exists but is not ready yet
    pub const WAITING_FOR_READINESS: &str = "WaitingForReadiness";
    /// Session pod is Running and Ready
    pub const POD_READY: &str = "PodReady";
    /// Pod is ready but has no usable IP/port
    pub const POD_ENDPOINT_MISSING: &str = "PodEndpointMissing";
    /// Cloudflare maps the session to the pod endpoint
    pub const ROUTE_CONFIGURED: &str = "RouteConfigured";
}

/// Event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Teardown of binding-owned resources
    pub const DELETE: &str = "Delete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_match_external_contract() {
        assert_eq!(reasons::POD_CREATED, "PodCreated");
        assert_eq!(reasons::CLEANED_UP, "CleanedUp");
        assert_eq!(reasons::CLOUDFLARE_ERROR, "CloudflareError");
        assert_eq!(reasons::WAITING_FOR_READINESS, "WaitingForReadiness");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        let obj_ref = ObjectReference::default();
        publisher
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::POD_CREATED,
                actions::RECONCILE,
                Some("created pod session-s1".to_string()),
            )
            .await;
    }
}
