//! Session pod materialisation
//!
//! A binding's pod is cloned from the pod template of its target Deployment.
//! The name is derived from the session id without sanitisation: a session id
//! that is not a legal DNS-1123 name surfaces the apiserver error rather than
//! being silently rewritten.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use session_common::crd::SessionBinding;
use session_common::{MANAGED_BY, MANAGED_BY_LABEL, SESSION_ID_LABEL};

use crate::error::{Error, Result};

/// Deterministic name of the pod backing a session.
pub fn session_pod_name(session_id: &str) -> String {
    format!("session-{session_id}")
}

/// Build the pod for `binding` from the target Deployment's pod template.
///
/// The template's labels and annotations are carried over, then the session
/// id and managed-by markers are stamped on top. The pod spec is a deep copy
/// of the template spec. The binding becomes the controller owner so cascade
/// deletion covers the pod.
pub fn build_session_pod(binding: &SessionBinding, deployment: &Deployment) -> Result<Pod> {
    let name = binding.name_any();
    let namespace = binding
        .namespace()
        .ok_or_else(|| Error::internal("materialiser", "SessionBinding has no namespace"))?;
    let session_id = &binding.spec.session_id;

    let template = deployment
        .spec
        .as_ref()
        .map(|s| &s.template)
        .ok_or_else(|| {
            Error::internal(
                "materialiser",
                format!("deployment {} has no spec", binding.spec.target_deployment),
            )
        })?;

    let mut labels: BTreeMap<String, String> = template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    labels.insert(SESSION_ID_LABEL.to_string(), session_id.clone());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());

    let mut annotations: BTreeMap<String, String> = template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.clone())
        .unwrap_or_default();
    annotations.insert(SESSION_ID_LABEL.to_string(), session_id.clone());

    let owner = binding
        .controller_owner_ref(&())
        .ok_or_else(|| Error::owner_ref(&name, "binding has no uid yet"))?;

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(session_pod_name(session_id)),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: template.spec.clone(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
    use session_common::crd::SessionBindingSpec;

    fn sample_binding(session_id: &str) -> SessionBinding {
        let mut binding = SessionBinding::new(
            "user-42",
            SessionBindingSpec {
                session_id: session_id.to_string(),
                user_id: None,
                target_deployment: "web".to_string(),
                ttl_seconds: None,
            },
        );
        binding.metadata.namespace = Some("ns".to_string());
        binding.metadata.uid = Some("uid-1234".to_string());
        binding
    }

    fn sample_deployment() -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(BTreeMap::from([(
                            "app".to_string(),
                            "web".to_string(),
                        )])),
                        annotations: Some(BTreeMap::from([(
                            "team".to_string(),
                            "edge".to_string(),
                        )])),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "web".to_string(),
                            image: Some("web:latest".to_string()),
                            ports: Some(vec![ContainerPort {
                                container_port: 8080,
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_name_is_deterministic() {
        assert_eq!(session_pod_name("s1"), "session-s1");
        assert_eq!(session_pod_name("s1"), session_pod_name("s1"));
    }

    #[test]
    fn pod_carries_template_and_session_labels() {
        let pod = build_session_pod(&sample_binding("s1"), &sample_deployment()).unwrap();

        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get("app"), Some(&"web".to_string()));
        assert_eq!(labels.get(SESSION_ID_LABEL), Some(&"s1".to_string()));
        assert_eq!(labels.get(MANAGED_BY_LABEL), Some(&MANAGED_BY.to_string()));
    }

    #[test]
    fn pod_carries_template_and_session_annotations() {
        let pod = build_session_pod(&sample_binding("s1"), &sample_deployment()).unwrap();

        let annotations = pod.metadata.annotations.unwrap();
        assert_eq!(annotations.get("team"), Some(&"edge".to_string()));
        assert_eq!(annotations.get(SESSION_ID_LABEL), Some(&"s1".to_string()));
    }

    #[test]
    fn pod_spec_is_cloned_from_template() {
        let pod = build_session_pod(&sample_binding("s1"), &sample_deployment()).unwrap();

        let spec = pod.spec.unwrap();
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.containers[0].image.as_deref(), Some("web:latest"));
    }

    #[test]
    fn pod_is_controller_owned_by_binding() {
        let pod = build_session_pod(&sample_binding("s1"), &sample_deployment()).unwrap();

        let owners = pod.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "SessionBinding");
        assert_eq!(owners[0].name, "user-42");
        assert_eq!(owners[0].uid, "uid-1234");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn pod_lands_in_binding_namespace() {
        let pod = build_session_pod(&sample_binding("s1"), &sample_deployment()).unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("session-s1"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("ns"));
    }

    #[test]
    fn missing_uid_fails_owner_ref_setup() {
        let mut binding = sample_binding("s1");
        binding.metadata.uid = None;

        let err = build_session_pod(&binding, &sample_deployment()).unwrap_err();
        assert!(matches!(err, Error::OwnerRef { .. }));
    }

    #[test]
    fn session_markers_win_over_template_labels() {
        let mut deployment = sample_deployment();
        deployment
            .spec
            .as_mut()
            .unwrap()
            .template
            .metadata
            .as_mut()
            .unwrap()
            .labels
            .as_mut()
            .unwrap()
            .insert(SESSION_ID_LABEL.to_string(), "stale".to_string());

        let pod = build_session_pod(&sample_binding("s1"), &deployment).unwrap();
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get(SESSION_ID_LABEL), Some(&"s1".to_string()));
    }
}
