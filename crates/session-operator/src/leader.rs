//! Leader lease for the operator
//!
//! With `--leader-elect`, replicas compete for one coordination.k8s.io/v1
//! Lease and only the holder runs the SessionBinding controller. Losing
//! replicas block in [`LeaderLease::acquire`]; a deposed leader notices
//! within one renew interval and exits so reconciliation moves to the new
//! holder.
//!
//! Timing follows the manager defaults this operator deploys with: 15s lease
//! duration, 5s renewal, 2s retry while waiting. The lease outlives renewal
//! by three intervals, so a holder that stands down is always detected
//! before takeover.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// One replica's claim on the operator's leader Lease.
pub struct LeaderLease {
    api: Api<Lease>,
    name: String,
    identity: String,
}

impl LeaderLease {
    /// Create an elector for the named Lease in the given namespace.
    ///
    /// `identity` distinguishes replicas, normally the pod name.
    pub fn new(client: Client, namespace: &str, name: &str, identity: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Block until this replica holds the lease.
    pub async fn acquire(&self) {
        info!(lease = %self.name, identity = %self.identity, "waiting for leadership");
        loop {
            match self.try_claim().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    return;
                }
                Ok(false) => debug!("lease held by another replica"),
                Err(e) => warn!(error = %e, "lease claim failed, retrying"),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Keep renewing the held lease, returning once leadership is lost.
    ///
    /// A renewal failure also stands down: without a confirmed renewal the
    /// lease may expire and another replica take over, so the caller must
    /// stop reconciling.
    pub async fn hold(&self) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_claim().await {
                Ok(true) => debug!(lease = %self.name, "lease renewed"),
                Ok(false) => {
                    warn!(identity = %self.identity, "leadership taken by another replica");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "lease renewal failed, standing down");
                    return;
                }
            }
        }
    }

    /// One claim attempt: create the lease if absent, renew our own, or take
    /// over an expired one. Returns whether we hold the lease afterwards.
    async fn try_claim(&self) -> Result<bool, kube::Error> {
        let now = Utc::now();

        let Some(lease) = self.api.get_opt(&self.name).await? else {
            return match self
                .api
                .create(&PostParams::default(), &self.fresh_lease(now))
                .await
            {
                Ok(_) => Ok(true),
                // Another replica created it first.
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(e) => Err(e),
            };
        };

        let ours = held_by(&lease, &self.identity);
        if !ours && !is_expired(&lease, now) {
            return Ok(false);
        }

        let patch = if ours {
            serde_json::json!({ "spec": { "renewTime": MicroTime(now) } })
        } else {
            let transitions = lease
                .spec
                .as_ref()
                .and_then(|s| s.lease_transitions)
                .unwrap_or(0);
            serde_json::json!({
                "spec": {
                    "holderIdentity": self.identity,
                    "acquireTime": MicroTime(now),
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                    "leaseTransitions": transitions + 1,
                }
            })
        };

        self.api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(true)
    }

    fn fresh_lease(&self, now: DateTime<Utc>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        }
    }
}

fn held_by(lease: &Lease, identity: &str) -> bool {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
        == Some(identity)
}

/// A lease with no usable renew time or duration counts as expired so a
/// malformed lease cannot wedge the election.
fn is_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = lease.spec.as_ref() else {
        return true;
    };
    match (spec.renew_time.as_ref(), spec.lease_duration_seconds) {
        (Some(renewed), Some(secs)) => now > renewed.0 + chrono::Duration::seconds(secs as i64),
        _ => true,
    }
}
