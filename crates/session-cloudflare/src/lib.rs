//! Cloudflare edge client for the session operator
//!
//! The operator needs three idempotent operations against the Cloudflare
//! control plane: check that a session exists, program a route from a session
//! to a pod endpoint, and retract that route. This crate defines the
//! [`CloudflareApi`] trait for those operations and the REST-backed
//! [`ApiClient`] implementation.
//!
//! When credentials are not configured the integration is disabled: session
//! verification reports the session as existing and route programming is a
//! no-op, so the controller never blocks on a missing integration.

mod client;
mod error;

pub use client::ApiClient;
pub use error::CloudflareError;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

/// Operations the operator performs against the Cloudflare control plane.
///
/// All operations are idempotent and bounded by the client's request timeout.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudflareApi: Send + Sync {
    /// Check whether Cloudflare knows the given session.
    ///
    /// Returns `Ok(true)` when the integration is disabled. Fails with
    /// [`CloudflareError::Unavailable`] on transport or auth errors and
    /// [`CloudflareError::InvalidArgument`] on an empty session id.
    async fn verify_session(&self, session_id: &str) -> Result<bool, CloudflareError>;

    /// Upsert the route mapping `session_id` to `endpoint` (`IP:port`).
    ///
    /// Fails with [`CloudflareError::InvalidArgument`] when either argument
    /// is empty.
    async fn ensure_route(&self, session_id: &str, endpoint: &str) -> Result<(), CloudflareError>;

    /// Remove the route for `session_id`.
    ///
    /// An absent route and an empty session id are both success.
    async fn retract_route(&self, session_id: &str) -> Result<(), CloudflareError>;
}
