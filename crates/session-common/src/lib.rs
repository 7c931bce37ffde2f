//! Common types for the Cloudflare session operator: CRD, events, clock, leader election

#![deny(missing_docs)]

pub mod clock;
pub mod crd;
pub mod events;

pub use clock::{Clock, FixedClock, SystemClock};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};

/// Finalizer held on SessionBindings until the pod is deleted and the
/// Cloudflare route retracted
pub const SESSION_BINDING_FINALIZER: &str = "sessionbinding.cloudflare.example.com/finalizer";

/// Label and annotation key carrying the session id on managed pods
pub const SESSION_ID_LABEL: &str = "cloudflare.example.com/session-id";

/// Standard Kubernetes managed-by label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on pods created by this operator
pub const MANAGED_BY: &str = "cloudflare-session-operator";

/// Lease name used for leader election across operator replicas
pub const LEADER_LEASE_NAME: &str = "sessionbinding.cloudflare.example";
