//! Startup wiring of one observer per (kind, scope) to controller dispatch
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use crds::{
    EntandoApp, EntandoAppPluginLink, EntandoCompositeApp, EntandoCustomResource,
    EntandoDatabaseService, EntandoKeycloakServer, EntandoKind, EntandoPlugin,
};
use futures::future::join_all;
use kube::{Client, ResourceExt};
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::{
    config::split_list,
    controller::{ControllerExecutor, DispatchRequest},
    health::Liveness,
    observer::{
        client::{KubeResourceClient, ResourceClient},
        executor::AcceptedEventHandler,
        identity::OperatorIdentity,
        ObservationScope, ObserveError, ObserverHandle, ResourceObserver, WatchAction,
    },
    resource::ResourceRef,
};

/// Annotation selecting the controller image version for one resource
pub(crate) const CONTROLLER_IMAGE_VERSION_ANNOTATION: &str = "entando.org/controller-image-version";

/// Creates the clients observers use to reach their resources
pub(crate) trait ResourceClientFactory: Send + Sync + 'static {
    fn resource_client<K: EntandoCustomResource>(
        &self,
        scope: &ObservationScope,
    ) -> Arc<dyn ResourceClient<K>>;
}

pub(crate) struct KubeResourceClientFactory {
    client: Client,
}

impl KubeResourceClientFactory {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ResourceClientFactory for KubeResourceClientFactory {
    fn resource_client<K: EntandoCustomResource>(
        &self,
        scope: &ObservationScope,
    ) -> Arc<dyn ResourceClient<K>> {
        Arc::new(KubeResourceClient::new(self.client.clone(), scope.clone()))
    }
}

/// Scopes to observe given `ENTANDO_NAMESPACES_TO_OBSERVE`.
/// `*` selects the whole cluster, nothing selects the operator's own namespace.
pub(crate) fn observation_scopes(
    namespaces_to_observe: Option<&str>,
    own_namespace: &str,
) -> Vec<ObservationScope> {
    let namespaces = namespaces_to_observe.map(split_list).unwrap_or_default();
    if namespaces.iter().any(|namespace| namespace == "*") {
        return vec![ObservationScope::Cluster];
    }
    if namespaces.is_empty() {
        return vec![ObservationScope::Namespace(own_namespace.to_owned())];
    }
    let mut scopes: Vec<ObservationScope> = Vec::with_capacity(namespaces.len());
    for namespace in namespaces {
        let scope = ObservationScope::Namespace(namespace);
        if !scopes.contains(&scope) {
            scopes.push(scope);
        }
    }
    scopes
}

/// Observers by kind, fixed once the coordinator has started
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    observers: BTreeMap<EntandoKind, Vec<Arc<dyn ObserverHandle>>>,
}

impl ObserverRegistry {
    pub(crate) fn observers_for(&self, kind: EntandoKind) -> &[Arc<dyn ObserverHandle>] {
        self.observers.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.values().map(Vec::len).sum()
    }

    /// All observers in the order they were started
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<dyn ObserverHandle>> {
        EntandoKind::all()
            .into_iter()
            .flat_map(|kind| self.observers_for(kind))
    }
}

/// Turns accepted events into controller dispatches
pub(crate) struct ControllerDispatcher {
    executor: ControllerExecutor,
}

impl ControllerDispatcher {
    pub(crate) fn new(executor: ControllerExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl<K: EntandoCustomResource> AcceptedEventHandler<K> for ControllerDispatcher {
    async fn on_accepted(&self, action: WatchAction, resource: K) {
        let request = DispatchRequest {
            action,
            resource: ResourceRef::from_resource(&resource),
            version_override: resource
                .annotations()
                .get(CONTROLLER_IMAGE_VERSION_ANNOTATION)
                .cloned(),
        };
        info!("Dispatching {action} of {}", request.resource);
        match self.executor.dispatch(&request).await {
            Ok(pod) => info!(
                "Controller pod {} completed {action} of {}",
                pod.name_any(),
                request.resource
            ),
            Err(e) => error!("Dispatching {action} of {} failed: {e}", request.resource),
        }
    }
}

pub(crate) struct ControllerCoordinator<F> {
    factory: F,
    scopes: Vec<ObservationScope>,
    identity: Arc<OperatorIdentity>,
    liveness: Liveness,
    dispatcher: Arc<ControllerDispatcher>,
    registry: OnceCell<ObserverRegistry>,
}

impl<F: ResourceClientFactory> ControllerCoordinator<F> {
    pub(crate) fn new(
        factory: F,
        scopes: Vec<ObservationScope>,
        identity: OperatorIdentity,
        liveness: Liveness,
        dispatcher: ControllerDispatcher,
    ) -> Self {
        Self {
            factory,
            scopes,
            identity: Arc::new(identity),
            liveness,
            dispatcher: Arc::new(dispatcher),
            registry: OnceCell::new(),
        }
    }

    /// Start observing every kind in every scope. Later calls return the
    /// registry built by the first one.
    pub(crate) async fn start(&self) -> Result<&ObserverRegistry, ObserveError> {
        self.registry.get_or_try_init(|| self.build_registry()).await
    }

    async fn build_registry(&self) -> Result<ObserverRegistry, ObserveError> {
        let mut observers: BTreeMap<EntandoKind, Vec<Arc<dyn ObserverHandle>>> = BTreeMap::new();
        for kind in EntandoKind::all() {
            for scope in &self.scopes {
                let observer = match kind {
                    EntandoKind::EntandoKeycloakServer => {
                        self.observe::<EntandoKeycloakServer>(scope).await?
                    }
                    EntandoKind::EntandoDatabaseService => {
                        self.observe::<EntandoDatabaseService>(scope).await?
                    }
                    EntandoKind::EntandoApp => self.observe::<EntandoApp>(scope).await?,
                    EntandoKind::EntandoPlugin => self.observe::<EntandoPlugin>(scope).await?,
                    EntandoKind::EntandoAppPluginLink => {
                        self.observe::<EntandoAppPluginLink>(scope).await?
                    }
                    EntandoKind::EntandoCompositeApp => {
                        self.observe::<EntandoCompositeApp>(scope).await?
                    }
                };
                observers.entry(kind).or_default().push(observer);
            }
        }
        let registry = ObserverRegistry { observers };
        info!("Coordinator started {} observers", registry.len());
        Ok(registry)
    }

    async fn observe<K: EntandoCustomResource>(
        &self,
        scope: &ObservationScope,
    ) -> Result<Arc<dyn ObserverHandle>, ObserveError> {
        let handler: Arc<dyn AcceptedEventHandler<K>> = self.dispatcher.clone();
        let observer: Arc<dyn ObserverHandle> = ResourceObserver::observe(
            self.factory.resource_client::<K>(scope),
            scope.clone(),
            Arc::clone(&self.identity),
            self.liveness.clone(),
            handler,
        )
        .await?;
        Ok(observer)
    }

    /// Shut all observers down concurrently, each bounded by `timeout`.
    /// Returns false if any of them did not finish in time.
    pub(crate) async fn shut_down(&self, timeout: Duration) -> bool {
        let Some(registry) = self.registry.get() else {
            return true;
        };
        join_all(registry.iter().map(|observer| observer.shut_down_and_wait(timeout)))
            .await
            .into_iter()
            .all(|finished| finished)
    }
}
