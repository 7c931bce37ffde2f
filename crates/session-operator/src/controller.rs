//! SessionBinding controller implementation
//!
//! Reconciles SessionBinding resources against three authorities: the binding
//! spec, the Cloudflare session registry, and the owned session pod. Each
//! reconcile recomputes state from what it observes; nothing is trusted from
//! previous passes except `status.boundPod` during teardown.
//!
//! The per-invocation sequence: load fresh, branch on deletion, install the
//! finalizer, stamp generation and time, run the active machine, write status
//! back only when it changed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;
#[cfg(test)]
use session_common::NoopEventPublisher;

use session_cloudflare::{ApiClient, CloudflareApi};
use session_common::crd::{
    condition_types, set_condition, Condition, ConditionStatus, SessionBinding,
    SessionBindingPhase, SessionBindingStatus,
};
use session_common::events::{actions, reasons};
use session_common::{
    Clock, EventPublisher, KubeEventPublisher, SystemClock, SESSION_BINDING_FINALIZER,
};

use crate::error::{Error, Result};
use crate::pod::{build_session_pod, session_pod_name};

/// Field manager for apiserver writes.
const FIELD_MANAGER: &str = "sessionbinding-controller";

/// Requeue cadence after a Cloudflare call failed.
const REQUEUE_EDGE_ERROR: Duration = Duration::from_secs(60);
/// Requeue cadence while waiting for the session pod to become ready.
const REQUEUE_POD_PENDING: Duration = Duration::from_secs(10);
/// Requeue cadence while a ready pod still lacks an IP or port.
const REQUEUE_ENDPOINT_MISSING: Duration = Duration::from_secs(5);
/// Requeue cadence after a metadata write that must be re-observed.
const REQUEUE_AFTER_WRITE: Duration = Duration::from_secs(1);

/// Get a resource by name, mapping 404 to `None`.
async fn get_optional<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(resource) => Ok(Some(resource)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Trait abstracting Kubernetes operations for the SessionBinding controller.
///
/// Production uses [`KubeClientImpl`]; tests mock this trait.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a SessionBinding, `None` when it no longer exists.
    async fn get_binding(&self, namespace: &str, name: &str)
        -> Result<Option<SessionBinding>>;

    /// Add a finalizer to a SessionBinding's metadata.
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()>;

    /// Remove a finalizer from a SessionBinding's metadata.
    async fn remove_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()>;

    /// Replace the status subresource, carrying the binding's resourceVersion
    /// so a stale write surfaces as a conflict.
    async fn replace_status(&self, binding: &SessionBinding) -> Result<()>;

    /// Get a pod by name, `None` when absent.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Create a pod. An AlreadyExists collision surfaces as a 409.
    async fn create_pod(&self, pod: &Pod) -> Result<Pod>;

    /// Delete a pod by name. Absence is success.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Get a Deployment by name, `None` when absent.
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;
}

/// Real Kubernetes client implementation.
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Wrap a kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn bindings(&self, namespace: &str) -> Api<SessionBinding> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<SessionBinding>> {
        get_optional(&self.bindings(namespace), name).await
    }

    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()> {
        let api = self.bindings(namespace);
        let Some(binding) = get_optional(&api, name).await? else {
            debug!(binding = %name, "binding not found, skipping finalizer addition");
            return Ok(());
        };

        let mut finalizers = binding.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()> {
        let api = self.bindings(namespace);
        let Some(binding) = get_optional(&api, name).await? else {
            debug!(binding = %name, "binding not found, finalizer already removed");
            return Ok(());
        };

        let finalizers: Vec<String> = binding
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn replace_status(&self, binding: &SessionBinding) -> Result<()> {
        let namespace = binding
            .namespace()
            .ok_or_else(|| Error::internal("status", "binding has no namespace"))?;
        let name = binding.name_any();
        let data =
            serde_json::to_vec(binding).map_err(|e| Error::serialization(e.to_string()))?;
        self.bindings(&namespace)
            .replace_status(&name, &PostParams::default(), data)
            .await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        get_optional(&self.pods(namespace), name).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let namespace = pod
            .namespace()
            .ok_or_else(|| Error::internal("reconciler", "pod has no namespace"))?;
        Ok(self
            .pods(&namespace)
            .create(&PostParams::default(), pod)
            .await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        match self.pods(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        get_optional(&api, name).await
    }
}

/// Shared context for the SessionBinding controller.
///
/// The cloudflare client, event publisher and clock are process-global and
/// immutable after setup; all are injected for testability rather than
/// reached as ambient singletons.
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Cloudflare control plane client
    pub cloudflare: Arc<dyn CloudflareApi>,
    /// Event publisher for lifecycle Events on bindings
    pub events: Arc<dyn EventPublisher>,
    /// Time source for status stamps
    pub clock: Arc<dyn Clock>,
}

impl Context {
    /// Create a builder for constructing a Context.
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context wired to mocks, for unit tests.
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        cloudflare: Arc<dyn CloudflareApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            kube,
            cloudflare,
            events: Arc::new(NoopEventPublisher),
            clock,
        }
    }
}

/// Builder for [`Context`] with production defaults.
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    cloudflare: Option<Arc<dyn CloudflareApi>>,
    events: Option<Arc<dyn EventPublisher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            cloudflare: None,
            events: None,
            clock: None,
        }
    }

    /// Override the Kubernetes client (primarily for testing).
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Set the Cloudflare client. Defaults to [`ApiClient::from_env`].
    pub fn cloudflare(mut self, cloudflare: Arc<dyn CloudflareApi>) -> Self {
        self.cloudflare = Some(cloudflare);
        self
    }

    /// Override the event publisher (primarily for testing).
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the clock (primarily for testing).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the Context.
    pub fn build(self) -> Result<Context> {
        let cloudflare: Arc<dyn CloudflareApi> = match self.cloudflare {
            Some(c) => c,
            None => Arc::new(ApiClient::from_env()?),
        };

        Ok(Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            cloudflare,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, FIELD_MANAGER))),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        })
    }
}

fn has_finalizer(binding: &SessionBinding) -> bool {
    binding
        .finalizers()
        .iter()
        .any(|f| f == SESSION_BINDING_FINALIZER)
}

/// Readiness predicate: Running phase AND a True `Ready` condition. No other
/// signal substitutes.
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

/// Derive the `IP:port` endpoint for a pod.
///
/// Empty when the pod has no IP. The port comes from the first container's
/// first declared port, defaulting to 80 when the first container declares
/// none.
pub fn pod_endpoint(pod: &Pod) -> String {
    let ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .unwrap_or_default();
    if ip.is_empty() {
        return String::new();
    }

    let port = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.ports.as_ref())
        .and_then(|p| p.first())
        .map(|p| p.container_port)
        .unwrap_or(80);

    format!("{ip}:{port}")
}

/// Reconcile one SessionBinding.
#[instrument(skip(binding, ctx), fields(binding = %binding.name_any()))]
pub async fn reconcile(binding: Arc<SessionBinding>, ctx: Arc<Context>) -> Result<Action> {
    let name = binding.name_any();
    let namespace = binding
        .namespace()
        .ok_or_else(|| Error::internal("reconciler", "SessionBinding has no namespace"))?;

    // Load fresh: the watch event may be stale and the resource already gone.
    let Some(binding) = ctx.kube.get_binding(&namespace, &name).await? else {
        debug!("binding no longer exists, nothing to do");
        return Ok(Action::await_change());
    };

    if binding.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&binding, &ctx).await;
    }

    if !has_finalizer(&binding) {
        info!("adding finalizer");
        ctx.kube
            .add_finalizer(&namespace, &name, SESSION_BINDING_FINALIZER)
            .await?;
        return Ok(Action::requeue(REQUEUE_AFTER_WRITE));
    }

    let mut status = binding.status.clone().unwrap_or_default();
    status.observed_generation = binding.metadata.generation.unwrap_or(0);
    status.last_reconcile_time = Some(ctx.clock.now());

    let result = reconcile_active(&binding, &mut status, &ctx).await;
    let status_result = write_status(&ctx, &namespace, &name, &status).await;

    match result {
        Err(e) => Err(e),
        Ok(action) => {
            status_result?;
            Ok(action)
        }
    }
}

/// Active reconcile: drive the binding towards Bound from observed state.
///
/// Mutates `status` at every decision point; errors that should hit the
/// queue's backoff are returned, everything else becomes a phase plus a
/// requeue hint.
async fn reconcile_active(
    binding: &SessionBinding,
    status: &mut SessionBindingStatus,
    ctx: &Context,
) -> Result<Action> {
    let now = ctx.clock.now();
    let session_id = binding.spec.session_id.clone();

    if session_id.is_empty() {
        warn!("invalid SessionBinding spec: sessionID is empty");
        set_condition(
            &mut status.conditions,
            Condition::new(
                condition_types::SESSION_DISCOVERED,
                ConditionStatus::False,
                reasons::INVALID_SPEC,
                "spec.sessionID must be provided",
                now,
            ),
        );
        status.phase = SessionBindingPhase::Error;
        ctx.events
            .publish(
                &binding.object_ref(&()),
                EventType::Warning,
                reasons::INVALID_SPEC,
                actions::RECONCILE,
                Some("spec.sessionID must be provided".to_string()),
            )
            .await;
        // Only a spec edit can fix this; the watch re-triggers on edit.
        return Ok(Action::await_change());
    }

    match ctx.cloudflare.verify_session(&session_id).await {
        Err(e) => {
            error!(error = %e, session_id = %session_id, "failed to verify Cloudflare session");
            set_condition(
                &mut status.conditions,
                Condition::new(
                    condition_types::SESSION_DISCOVERED,
                    ConditionStatus::Unknown,
                    reasons::CLOUDFLARE_ERROR,
                    e.to_string(),
                    now,
                ),
            );
            status.phase = SessionBindingPhase::Error;
            ctx.events
                .publish(
                    &binding.object_ref(&()),
                    EventType::Warning,
                    reasons::CLOUDFLARE_ERROR,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
            return Ok(Action::requeue(REQUEUE_EDGE_ERROR));
        }
        Ok(false) => {
            info!(session_id = %session_id, "Cloudflare session missing, marking binding expired");
            set_condition(
                &mut status.conditions,
                Condition::new(
                    condition_types::SESSION_DISCOVERED,
                    ConditionStatus::False,
                    reasons::NOT_FOUND,
                    "Cloudflare session not found",
                    now,
                ),
            );
            status.phase = SessionBindingPhase::Expired;
            return Ok(Action::await_change());
        }
        Ok(true) => {
            set_condition(
                &mut status.conditions,
                Condition::new(
                    condition_types::SESSION_DISCOVERED,
                    ConditionStatus::True,
                    reasons::SESSION_ACTIVE,
                    "Cloudflare session is active",
                    now,
                ),
            );
        }
    }

    let pod = match ensure_session_pod(binding, ctx).await {
        Ok(Some(pod)) => pod,
        Ok(None) => {
            // Lost a create race; the pod exists under its deterministic
            // name, observe it on the next tick.
            status.phase = SessionBindingPhase::Pending;
            status.bound_pod = session_pod_name(&session_id);
            status.route_endpoint.clear();
            return Ok(Action::requeue(REQUEUE_AFTER_WRITE));
        }
        Err(e) => {
            status.phase = SessionBindingPhase::Error;
            return Err(e);
        }
    };

    let pod_name = pod.name_any();

    if !is_pod_ready(&pod) {
        set_condition(
            &mut status.conditions,
            Condition::new(
                condition_types::POD_READY,
                ConditionStatus::False,
                reasons::WAITING_FOR_READINESS,
                "Session pod not ready yet",
                now,
            ),
        );
        status.phase = SessionBindingPhase::Pending;
        status.bound_pod = pod_name;
        status.route_endpoint.clear();
        return Ok(Action::requeue(REQUEUE_POD_PENDING));
    }

    set_condition(
        &mut status.conditions,
        Condition::new(
            condition_types::POD_READY,
            ConditionStatus::True,
            reasons::POD_READY,
            "Session pod ready",
            now,
        ),
    );

    let endpoint = pod_endpoint(&pod);
    if endpoint.is_empty() {
        set_condition(
            &mut status.conditions,
            Condition::new(
                condition_types::ROUTE_CONFIGURED,
                ConditionStatus::False,
                reasons::POD_ENDPOINT_MISSING,
                "Pod ready but lacks podIP/port",
                now,
            ),
        );
        status.phase = SessionBindingPhase::Error;
        ctx.events
            .publish(
                &binding.object_ref(&()),
                EventType::Warning,
                reasons::POD_ENDPOINT_MISSING,
                actions::RECONCILE,
                Some(format!("pod {pod_name} is ready but has no endpoint")),
            )
            .await;
        return Ok(Action::requeue(REQUEUE_ENDPOINT_MISSING));
    }

    if let Err(e) = ctx.cloudflare.ensure_route(&session_id, &endpoint).await {
        error!(error = %e, session_id = %session_id, endpoint = %endpoint, "failed to configure Cloudflare route");
        set_condition(
            &mut status.conditions,
            Condition::new(
                condition_types::ROUTE_CONFIGURED,
                ConditionStatus::False,
                reasons::CLOUDFLARE_ERROR,
                e.to_string(),
                now,
            ),
        );
        status.phase = SessionBindingPhase::Error;
        ctx.events
            .publish(
                &binding.object_ref(&()),
                EventType::Warning,
                reasons::CLOUDFLARE_ERROR,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
        return Ok(Action::requeue(REQUEUE_EDGE_ERROR));
    }

    set_condition(
        &mut status.conditions,
        Condition::new(
            condition_types::ROUTE_CONFIGURED,
            ConditionStatus::True,
            reasons::ROUTE_CONFIGURED,
            "Cloudflare route configured",
            now,
        ),
    );
    status.phase = SessionBindingPhase::Bound;
    status.bound_pod = pod_name;
    status.route_endpoint = endpoint;
    Ok(Action::await_change())
}

/// Ensure the session pod exists: GET by deterministic name, CREATE from the
/// target Deployment's template when absent. An existing pod is used as-is;
/// its spec is never diffed. `Ok(None)` means a concurrent create won the
/// race and the pod should be observed on the next tick.
async fn ensure_session_pod(binding: &SessionBinding, ctx: &Context) -> Result<Option<Pod>> {
    let namespace = binding
        .namespace()
        .ok_or_else(|| Error::internal("reconciler", "SessionBinding has no namespace"))?;
    let pod_name = session_pod_name(&binding.spec.session_id);

    if let Some(pod) = ctx.kube.get_pod(&namespace, &pod_name).await? {
        return Ok(Some(pod));
    }

    let deployment = ctx
        .kube
        .get_deployment(&namespace, &binding.spec.target_deployment)
        .await?
        .ok_or_else(|| {
            warn!(deployment = %binding.spec.target_deployment, "target deployment not found");
            Error::template_missing(&namespace, &binding.spec.target_deployment)
        })?;

    let pod = build_session_pod(binding, &deployment)?;
    match ctx.kube.create_pod(&pod).await {
        Ok(created) => {
            info!(pod = %pod_name, "created session pod");
            ctx.events
                .publish(
                    &binding.object_ref(&()),
                    EventType::Normal,
                    reasons::POD_CREATED,
                    actions::RECONCILE,
                    Some(format!(
                        "Created pod {} for session {}",
                        pod_name, binding.spec.session_id
                    )),
                )
                .await;
            Ok(Some(created))
        }
        Err(e) if e.is_conflict() => {
            debug!(pod = %pod_name, "session pod created concurrently");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Teardown: delete the bound pod, retract the Cloudflare route, then drop
/// the finalizer. Every step is idempotent so the whole machine can be
/// re-entered after a partial failure.
async fn handle_deletion(binding: &SessionBinding, ctx: &Context) -> Result<Action> {
    if !has_finalizer(binding) {
        debug!("no finalizer, allowing deletion");
        return Ok(Action::await_change());
    }

    let name = binding.name_any();
    let namespace = binding
        .namespace()
        .ok_or_else(|| Error::internal("teardown", "SessionBinding has no namespace"))?;

    if let Some(status) = binding.status.as_ref() {
        if !status.bound_pod.is_empty() {
            info!(pod = %status.bound_pod, "deleting session pod");
            ctx.kube.delete_pod(&namespace, &status.bound_pod).await?;
        }
    }

    if !binding.spec.session_id.is_empty() {
        ctx.cloudflare
            .retract_route(&binding.spec.session_id)
            .await
            .map_err(|e| {
                error!(error = %e, session_id = %binding.spec.session_id, "failed to retract Cloudflare route during teardown");
                e
            })?;
    }

    ctx.kube
        .remove_finalizer(&namespace, &name, SESSION_BINDING_FINALIZER)
        .await?;

    ctx.events
        .publish(
            &binding.object_ref(&()),
            EventType::Normal,
            reasons::CLEANED_UP,
            actions::DELETE,
            Some("Removed Cloudflare route and session pod".to_string()),
        )
        .await;

    info!("binding cleaned up");
    Ok(Action::await_change())
}

/// Write status back only when it differs from what the apiserver holds.
///
/// Re-reads the binding so the write carries a current resourceVersion; a
/// concurrent modification turns into a 409 that surfaces to the queue.
async fn write_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    desired: &SessionBindingStatus,
) -> Result<()> {
    let Some(mut fresh) = ctx.kube.get_binding(namespace, name).await? else {
        debug!("binding disappeared before status write");
        return Ok(());
    };

    if fresh.status.as_ref() == Some(desired) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }

    fresh.status = Some(desired.clone());
    ctx.kube.replace_status(&fresh).await
}

/// Error policy: the queue retries with backoff.
pub fn error_policy(binding: Arc<SessionBinding>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        binding = %binding.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
