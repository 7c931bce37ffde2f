//! Error types for the session operator
//!
//! Errors returned from `reconcile` drive the work queue's exponential
//! backoff; everything else is folded into the binding's status instead of
//! being returned. Variants carry context fields so production logs identify
//! the binding and resource involved.

use session_cloudflare::CloudflareError;
use thiserror::Error;

/// Result alias for operator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the session binding controller.
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cloudflare control plane error
    #[error("cloudflare error: {source}")]
    Cloudflare {
        /// The underlying client error
        #[from]
        source: CloudflareError,
    },

    /// The target Deployment referenced by the binding does not exist
    #[error("target deployment {namespace}/{deployment} not found")]
    TemplateMissing {
        /// Namespace of the binding
        namespace: String,
        /// Name of the missing Deployment
        deployment: String,
    },

    /// The owner reference from pod to binding could not be constructed
    #[error("cannot build owner reference for binding {binding}: {message}")]
    OwnerRef {
        /// Name of the binding
        binding: String,
        /// What was missing
        message: String,
    },

    /// Serialization failure while preparing an API payload
    #[error("serialization error: {message}")]
    Serialization {
        /// What failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Where the error occurred (e.g. "reconciler", "teardown")
        context: String,
        /// What failed
        message: String,
    },
}

impl Error {
    /// Create a `TemplateMissing` error.
    pub fn template_missing(namespace: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self::TemplateMissing {
            namespace: namespace.into(),
            deployment: deployment.into(),
        }
    }

    /// Create an `OwnerRef` error.
    pub fn owner_ref(binding: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::OwnerRef {
            binding: binding.into(),
            message: msg.into(),
        }
    }

    /// Create a `Serialization` error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an `Internal` error with context.
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// True when the error is an apiserver conflict (409): a concurrent
    /// create of the same name or a stale-resourceVersion status write.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 409
        )
    }

    /// Whether retrying could succeed without a spec change.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Conflicts resolve on re-delivery; other 4xx need a spec fix.
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Cloudflare { source } => source.is_retryable(),
            // The Deployment may be created after the binding.
            Error::TemplateMissing { .. } => true,
            // The binding's uid appears as soon as the apiserver assigns it.
            Error::OwnerRef { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "test".to_string(),
                reason: "test".to_string(),
                code,
            }),
        }
    }

    /// Story: a lost create race shows up as a 409 and is treated as success.
    ///
    /// Two reconciles of the same binding can race across operator restarts;
    /// the deterministic pod name makes the second create collide.
    #[test]
    fn story_create_collision_is_a_conflict() {
        assert!(api_error(409).is_conflict());
        assert!(api_error(409).is_retryable());
        assert!(!api_error(404).is_conflict());
    }

    /// Story: transient apiserver failures retry, spec problems do not.
    #[test]
    fn story_kube_error_retryability() {
        // Server-side errors are retryable
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());

        // Client-side errors require a change
        assert!(!api_error(404).is_retryable());
        assert!(!api_error(422).is_retryable());
    }

    /// Story: a missing target Deployment is retryable because the user may
    /// simply create the binding first.
    #[test]
    fn story_template_missing_retries_until_deployment_appears() {
        let err = Error::template_missing("ns", "web");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("ns/web"));
    }

    /// Story: Cloudflare outages retry, argument bugs do not.
    #[test]
    fn story_cloudflare_error_retryability() {
        let err: Error = CloudflareError::unavailable("connection refused").into();
        assert!(err.is_retryable());

        let err: Error = CloudflareError::invalid_argument("endpoint is empty").into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn owner_ref_error_includes_binding_name() {
        let err = Error::owner_ref("user-42", "binding has no uid yet");
        assert!(err.to_string().contains("user-42"));
        assert!(err.is_retryable());
    }

    #[test]
    fn serialization_errors_are_permanent() {
        assert!(!Error::serialization("bad payload").is_retryable());
    }

    #[test]
    fn internal_error_carries_context() {
        let err = Error::internal("teardown", "unexpected state");
        assert!(err.to_string().contains("[teardown]"));
        assert!(err.is_retryable());
    }
}
