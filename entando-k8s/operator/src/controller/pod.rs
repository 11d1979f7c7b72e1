use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, LocalObjectReference, ObjectFieldSelector, Pod, PodSpec,
};
use kube::api::ObjectMeta;

use super::PodSettings;
use crate::{config::CONTROLLER_POD_NAME_VARIABLE, observer::WatchAction, resource::ResourceRef};

pub(crate) const CONTAINER_NAME: &str = "deployer";

/// Labels identifying the controller pods of one resource.
/// Used both to label new pods and to find those of earlier dispatches.
pub(crate) fn unit_labels(resource: &ResourceRef) -> BTreeMap<String, String> {
    let kind = resource.kind.as_str();
    BTreeMap::from([
        ("kind".to_owned(), kind.to_owned()),
        ("namespace".to_owned(), resource.namespace.clone()),
        (kind.to_owned(), resource.name.clone()),
    ])
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value.to_owned()),
        ..Default::default()
    }
}

/// Pod running `image` once against `resource`
pub(crate) fn controller_pod(
    resource: &ResourceRef,
    action: WatchAction,
    image: &str,
    settings: &PodSettings,
    forwarded_environment: &BTreeMap<String, String>,
) -> Pod {
    let mut env: Vec<EnvVar> = forwarded_environment
        .iter()
        .map(|(name, value)| env_var(name, value))
        .collect();
    env.extend([
        env_var("ACTION", action.as_str()),
        env_var("RESOURCE_KIND", resource.kind.as_str()),
        env_var("RESOURCE_NAMESPACE", &resource.namespace),
        env_var("RESOURCE_NAME", &resource.name),
        EnvVar {
            name: CONTROLLER_POD_NAME_VARIABLE.to_owned(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_owned(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]);

    let image_pull_secrets = (!settings.image_pull_secrets.is_empty()).then(|| {
        settings
            .image_pull_secrets
            .iter()
            .map(|name| LocalObjectReference { name: name.clone() })
            .collect()
    });

    Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-deployer-", resource.name)),
            namespace: Some(resource.namespace.clone()),
            labels: Some(unit_labels(resource)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_owned(),
                image: Some(image.to_owned()),
                image_pull_policy: Some("IfNotPresent".to_owned()),
                env: Some(env),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_owned()),
            active_deadline_seconds: i64::try_from(settings.completion_timeout.as_secs()).ok(),
            service_account_name: Some(settings.service_account.clone()),
            image_pull_secrets,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

pub(crate) fn is_terminated(pod: &Pod) -> bool {
    matches!(phase(pod), Some("Succeeded" | "Failed"))
}

/// Ready once any container reports ready, or already done
pub(crate) fn is_ready(pod: &Pod) -> bool {
    let container_ready = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .is_some_and(|statuses| statuses.iter().any(|s| s.ready));
    container_ready || is_terminated(pod)
}

/// Why a terminated pod counts as failed, `None` if it succeeded
pub(crate) fn unit_failure(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;
    let failed_exit = status
        .container_statuses
        .iter()
        .flatten()
        .filter_map(|s| {
            let terminated = s.state.as_ref()?.terminated.as_ref()?;
            (terminated.exit_code != 0).then(|| (s.name.clone(), terminated.exit_code))
        })
        .next();
    match (status.phase.as_deref(), failed_exit) {
        (_, Some((container, exit_code))) => Some(format!(
            "container '{container}' exited with code {exit_code}"
        )),
        (Some("Failed"), None) => Some(
            status
                .message
                .clone()
                .or_else(|| status.reason.clone())
                .unwrap_or_else(|| "pod phase is Failed".to_owned()),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crds::EntandoKind;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
    };

    use super::*;

    fn settings() -> PodSettings {
        PodSettings {
            service_account: "entando-operator".to_owned(),
            image_pull_secrets: vec!["regcred".to_owned()],
            readiness_timeout: Duration::from_secs(600),
            completion_timeout: Duration::from_secs(1200),
            shutdown_timeout: Duration::from_secs(120),
            garbage_collect: false,
        }
    }

    fn terminated_pod(phase: &str, exit_code: i32) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_owned()),
                container_statuses: Some(vec![ContainerStatus {
                    name: CONTAINER_NAME.to_owned(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_controller_pod() {
        let resource = ResourceRef::new(EntandoKind::EntandoPlugin, "ns1", "my-plugin");
        let forwarded = BTreeMap::from([(
            "ENTANDO_K8S_OPERATOR_ID".to_owned(),
            "blue".to_owned(),
        )]);
        let pod = controller_pod(
            &resource,
            WatchAction::Added,
            "docker.io/entando/entando-k8s-plugin-controller:7.0.0",
            &settings(),
            &forwarded,
        );

        assert_eq!(pod.metadata.generate_name.as_deref(), Some("my-plugin-deployer-"));
        assert_eq!(
            pod.metadata.labels.as_ref().unwrap(),
            &BTreeMap::from([
                ("kind".to_owned(), "EntandoPlugin".to_owned()),
                ("namespace".to_owned(), "ns1".to_owned()),
                ("EntandoPlugin".to_owned(), "my-plugin".to_owned()),
            ])
        );
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.active_deadline_seconds, Some(1200));
        assert_eq!(spec.service_account_name.as_deref(), Some("entando-operator"));
        assert_eq!(spec.image_pull_secrets.unwrap()[0].name, "regcred");

        let env = spec.containers[0].env.clone().unwrap();
        let names: Vec<_> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "ENTANDO_K8S_OPERATOR_ID",
                "ACTION",
                "RESOURCE_KIND",
                "RESOURCE_NAMESPACE",
                "RESOURCE_NAME",
                CONTROLLER_POD_NAME_VARIABLE,
            ]
        );
        assert_eq!(env[1].value.as_deref(), Some("ADDED"));
        assert_eq!(
            env[5].value_from.as_ref().unwrap().field_ref.as_ref().unwrap().field_path,
            "metadata.name"
        );
    }

    #[test]
    fn test_pod_states() {
        let pending = Pod {
            status: Some(PodStatus {
                phase: Some("Pending".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!is_ready(&pending));
        assert!(!is_terminated(&pending));

        let succeeded = terminated_pod("Succeeded", 0);
        assert!(is_ready(&succeeded));
        assert!(is_terminated(&succeeded));
        assert_eq!(unit_failure(&succeeded), None);
    }

    #[test]
    fn test_unit_failures() {
        assert_eq!(
            unit_failure(&terminated_pod("Failed", 3)).as_deref(),
            Some("container 'deployer' exited with code 3")
        );
        let mut deadline_exceeded = terminated_pod("Failed", 0);
        if let Some(status) = deadline_exceeded.status.as_mut() {
            status.reason = Some("DeadlineExceeded".to_owned());
        }
        assert_eq!(
            unit_failure(&deadline_exceeded).as_deref(),
            Some("DeadlineExceeded")
        );
    }
}
