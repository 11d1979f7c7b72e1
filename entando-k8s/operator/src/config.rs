use std::{collections::BTreeMap, time::Duration};

use envconfig::Envconfig;

use crate::observer::identity::OperatorIdentity;

/// Prefixes of operator environment variables handed on to controller pods
pub(crate) const FORWARDED_PREFIXES: [&str; 2] = ["ENTANDO_", "RELATED_IMAGE_"];

/// Name under which controller pods receive their own pod name
pub(crate) const CONTROLLER_POD_NAME_VARIABLE: &str = "ENTANDO_CONTROLLER_POD_NAME";

#[derive(Envconfig)]
pub(crate) struct OperatorConfig {
    /// Version stamped into the processed-by marker, defaults to the crate version
    #[envconfig(from = "ENTANDO_K8S_OPERATOR_VERSION")]
    pub(crate) version: Option<String>,

    /// Resources last processed by this version are reconciled unconditionally
    #[envconfig(from = "ENTANDO_K8S_OPERATOR_VERSION_TO_REPLACE")]
    pub(crate) version_to_replace: Option<String>,

    #[envconfig(from = "ENTANDO_K8S_OPERATOR_ID")]
    pub(crate) operator_id: Option<String>,

    /// Comma or whitespace separated namespaces, `*` to observe the whole cluster
    #[envconfig(from = "ENTANDO_NAMESPACES_TO_OBSERVE")]
    pub(crate) namespaces_to_observe: Option<String>,

    /// Namespace the operator runs in, the client's default if unset
    #[envconfig(from = "ENTANDO_K8S_OPERATOR_NAMESPACE")]
    pub(crate) operator_namespace: Option<String>,

    #[envconfig(from = "ENTANDO_K8S_OPERATOR_SERVICEACCOUNT", default = "entando-operator")]
    pub(crate) service_account: String,

    #[envconfig(from = "ENTANDO_K8S_OPERATOR_IMAGE_PULL_SECRETS")]
    pub(crate) image_pull_secrets: Option<String>,

    /// Delete controller pods after they completed successfully
    #[envconfig(from = "ENTANDO_K8S_OPERATOR_GC_CONTROLLER_PODS", default = "false")]
    pub(crate) gc_controller_pods: bool,

    #[envconfig(from = "ENTANDO_POD_READINESS_TIMEOUT_SECONDS", default = "600")]
    pub(crate) pod_readiness_timeout_sec: u64,

    #[envconfig(from = "ENTANDO_POD_COMPLETION_TIMEOUT_SECONDS", default = "1200")]
    pub(crate) pod_completion_timeout_sec: u64,

    /// Bound for removing a controller pod left over from a previous dispatch
    #[envconfig(from = "ENTANDO_POD_SHUTDOWN_TIMEOUT_SECONDS", default = "120")]
    pub(crate) pod_shutdown_timeout_sec: u64,

    #[envconfig(from = "ENTANDO_K8S_OPERATOR_SHUTDOWN_TIMEOUT_SECONDS", default = "30")]
    pub(crate) shutdown_timeout_sec: u64,

    #[envconfig(from = "ENTANDO_K8S_OPERATOR_HEALTH_PORT", default = "8081")]
    pub(crate) health_port: u16,

    #[envconfig(nested)]
    pub(crate) images: ImageConfig,
}

impl OperatorConfig {
    pub(crate) fn operator_version(&self) -> &str {
        self.version
            .as_deref()
            .unwrap_or(env!("CARGO_PKG_VERSION"))
    }

    pub(crate) fn identity(&self) -> OperatorIdentity {
        OperatorIdentity {
            operator_id: self.operator_id.clone(),
            version: self.operator_version().to_owned(),
            version_to_replace: self.version_to_replace.clone(),
        }
    }

    /// Image sources, falling back to the operator's own version as the tag
    pub(crate) fn image_config(&self) -> ImageConfig {
        let mut images = self.images.clone();
        images
            .version_fallback
            .get_or_insert_with(|| self.operator_version().to_owned());
        images
    }

    pub(crate) fn image_pull_secrets(&self) -> Vec<String> {
        self.image_pull_secrets
            .as_deref()
            .map(split_list)
            .unwrap_or_default()
    }

    pub(crate) fn pod_readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_readiness_timeout_sec)
    }

    pub(crate) fn pod_completion_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_completion_timeout_sec)
    }

    pub(crate) fn pod_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_shutdown_timeout_sec)
    }

    pub(crate) fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_sec)
    }
}

/// Where controller images come from
#[derive(Envconfig, Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImageConfig {
    #[envconfig(from = "ENTANDO_DOCKER_REGISTRY_OVERRIDE")]
    pub(crate) registry_override: Option<String>,
    #[envconfig(from = "ENTANDO_DOCKER_IMAGE_ORG_OVERRIDE")]
    pub(crate) organization_override: Option<String>,
    #[envconfig(from = "ENTANDO_DOCKER_IMAGE_VERSION_OVERRIDE")]
    pub(crate) version_override: Option<String>,

    #[envconfig(from = "ENTANDO_DOCKER_REGISTRY_FALLBACK", default = "docker.io")]
    pub(crate) registry_fallback: String,
    #[envconfig(from = "ENTANDO_DOCKER_IMAGE_ORG_FALLBACK", default = "entando")]
    pub(crate) organization_fallback: String,
    #[envconfig(from = "ENTANDO_DOCKER_IMAGE_VERSION_FALLBACK")]
    pub(crate) version_fallback: Option<String>,

    /// ConfigMap in the operator namespace with per image coordinates
    #[envconfig(
        from = "ENTANDO_DOCKER_IMAGE_INFO_CONFIGMAP",
        default = "entando-docker-image-info"
    )]
    pub(crate) image_info_config_map: String,
}

/// Operator environment entries controller pods inherit, sorted by name
pub(crate) fn forwarded_environment(
    vars: impl IntoIterator<Item = (String, String)>,
) -> BTreeMap<String, String> {
    vars.into_iter()
        .filter(|(name, _)| {
            name != CONTROLLER_POD_NAME_VARIABLE
                && FORWARDED_PREFIXES
                    .iter()
                    .any(|prefix| name.starts_with(prefix))
        })
        .collect()
}

pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}
