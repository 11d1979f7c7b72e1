//! Custom resources observed by the Entando controller coordinator.
//!
//! Only the parts of each spec the coordinator or its dispatched controllers
//! rely on are modelled here. Every kind shares [EntandoCustomResourceStatus],
//! which carries the generation the last dispatched controller reconciled.
use std::fmt::Debug;

use k8s_openapi::{api::core::v1::EnvVar, NamespaceResourceScope};
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Reexport of CustomResourceExt for tooling generating the CRD manifests
pub use kube::CustomResourceExt;

/// Lifecycle phase a dispatched controller reports back on the resource
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntandoDeploymentPhase {
    #[default]
    Requested,
    Started,
    Successful,
    Failed,
    Ignored,
}

/// Failure details written by a controller that could not converge the resource
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct EntandoControllerFailure {
    pub failed_object_name: Option<String>,
    pub message: Option<String>,
}

/// Status block shared by all Entando custom resources
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct EntandoCustomResourceStatus {
    /// Generation of the spec the last dispatched controller converged
    pub observed_generation: Option<i64>,
    pub phase: Option<EntandoDeploymentPhase>,
    pub entando_controller_failure: Option<EntandoControllerFailure>,
}

/// An Entando application server
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
#[kube(
    group = "entando.org",
    version = "v1",
    kind = "EntandoApp",
    plural = "entandoapps",
    derive = "PartialEq",
    status = "EntandoCustomResourceStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EntandoAppSpec {
    pub dbms: Option<String>,
    pub replicas: Option<i32>,
    pub ingress_host_name: Option<String>,
    pub standard_server_image: Option<String>,
    #[serde(default)]
    pub environment_variables: Vec<EnvVar>,
}

/// A microservice plugin deployed alongside an Entando application
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
#[kube(
    group = "entando.org",
    version = "v1",
    kind = "EntandoPlugin",
    plural = "entandoplugins",
    derive = "PartialEq",
    status = "EntandoCustomResourceStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EntandoPluginSpec {
    pub image: Option<String>,
    pub dbms: Option<String>,
    pub replicas: Option<i32>,
    pub ingress_path: Option<String>,
    pub health_check_path: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// A Keycloak identity server
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
#[kube(
    group = "entando.org",
    version = "v1",
    kind = "EntandoKeycloakServer",
    plural = "entandokeycloakservers",
    derive = "PartialEq",
    status = "EntandoCustomResourceStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EntandoKeycloakServerSpec {
    pub dbms: Option<String>,
    pub replicas: Option<i32>,
    pub ingress_host_name: Option<String>,
    pub standard_image: Option<String>,
    pub default_server: Option<bool>,
}

/// Links an [EntandoPlugin] into an [EntandoApp]
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
#[kube(
    group = "entando.org",
    version = "v1",
    kind = "EntandoAppPluginLink",
    plural = "entandoapppluginlinks",
    derive = "PartialEq",
    status = "EntandoCustomResourceStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EntandoAppPluginLinkSpec {
    pub entando_app_name: String,
    pub entando_app_namespace: Option<String>,
    pub entando_plugin_name: String,
    pub entando_plugin_namespace: Option<String>,
}

/// Aggregate owning a set of other Entando custom resources. Owned components
/// are reconciled by the composite app's own controller.
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
#[kube(
    group = "entando.org",
    version = "v1",
    kind = "EntandoCompositeApp",
    plural = "entandocompositeapps",
    derive = "PartialEq",
    status = "EntandoCustomResourceStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EntandoCompositeAppSpec {
    /// Embedded custom resources, deployed in order
    #[serde(default)]
    pub components: Vec<serde_json::Value>,
}

/// A database server, either external or deployed in cluster
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
#[kube(
    group = "entando.org",
    version = "v1",
    kind = "EntandoDatabaseService",
    plural = "entandodatabaseservices",
    derive = "PartialEq",
    status = "EntandoCustomResourceStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EntandoDatabaseServiceSpec {
    pub dbms: Option<String>,
    pub host: Option<String>,
    pub port: Option<i32>,
    pub database_name: Option<String>,
    pub create_deployment: Option<bool>,
}

/// The closed set of custom resource kinds the coordinator observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntandoKind {
    EntandoApp,
    EntandoPlugin,
    EntandoKeycloakServer,
    EntandoAppPluginLink,
    EntandoCompositeApp,
    EntandoDatabaseService,
}

impl EntandoKind {
    /// All kinds in the order observers are started
    pub fn all() -> [EntandoKind; 6] {
        [
            EntandoKind::EntandoKeycloakServer,
            EntandoKind::EntandoDatabaseService,
            EntandoKind::EntandoApp,
            EntandoKind::EntandoPlugin,
            EntandoKind::EntandoAppPluginLink,
            EntandoKind::EntandoCompositeApp,
        ]
    }

    /// The Kubernetes `kind` of this resource type
    pub fn as_str(&self) -> &'static str {
        match self {
            EntandoKind::EntandoApp => "EntandoApp",
            EntandoKind::EntandoPlugin => "EntandoPlugin",
            EntandoKind::EntandoKeycloakServer => "EntandoKeycloakServer",
            EntandoKind::EntandoAppPluginLink => "EntandoAppPluginLink",
            EntandoKind::EntandoCompositeApp => "EntandoCompositeApp",
            EntandoKind::EntandoDatabaseService => "EntandoDatabaseService",
        }
    }
}

impl std::fmt::Display for EntandoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common view over all Entando custom resources
pub trait EntandoCustomResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Registration key of this resource type
    const KIND: EntandoKind;

    fn entando_status(&self) -> Option<&EntandoCustomResourceStatus>;

    /// Generation last reconciled by a dispatched controller, if any
    fn observed_generation(&self) -> Option<i64> {
        self.entando_status()
            .and_then(|status| status.observed_generation)
    }
}

impl EntandoCustomResource for EntandoApp {
    const KIND: EntandoKind = EntandoKind::EntandoApp;

    fn entando_status(&self) -> Option<&EntandoCustomResourceStatus> {
        self.status.as_ref()
    }
}

impl EntandoCustomResource for EntandoPlugin {
    const KIND: EntandoKind = EntandoKind::EntandoPlugin;

    fn entando_status(&self) -> Option<&EntandoCustomResourceStatus> {
        self.status.as_ref()
    }
}

impl EntandoCustomResource for EntandoKeycloakServer {
    const KIND: EntandoKind = EntandoKind::EntandoKeycloakServer;

    fn entando_status(&self) -> Option<&EntandoCustomResourceStatus> {
        self.status.as_ref()
    }
}

impl EntandoCustomResource for EntandoAppPluginLink {
    const KIND: EntandoKind = EntandoKind::EntandoAppPluginLink;

    fn entando_status(&self) -> Option<&EntandoCustomResourceStatus> {
        self.status.as_ref()
    }
}

impl EntandoCustomResource for EntandoCompositeApp {
    const KIND: EntandoKind = EntandoKind::EntandoCompositeApp;

    fn entando_status(&self) -> Option<&EntandoCustomResourceStatus> {
        self.status.as_ref()
    }
}

impl EntandoCustomResource for EntandoDatabaseService {
    const KIND: EntandoKind = EntandoKind::EntandoDatabaseService;

    fn entando_status(&self) -> Option<&EntandoCustomResourceStatus> {
        self.status.as_ref()
    }
}
