//! In-memory stand-ins for the cluster used by unit tests
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use crds::{EntandoCustomResource, EntandoCustomResourceStatus, EntandoKind, EntandoPlugin, EntandoPluginSpec};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodStatus,
};
use kube::{
    api::{ObjectMeta, WatchEvent},
    core::ObjectList,
    error::ErrorResponse,
    ResourceExt,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    controller::{
        client::{PodClient, PodSubscription},
        pod::{unit_labels, CONTAINER_NAME},
    },
    coordinator::ResourceClientFactory,
    observer::{
        client::{ResourceClient, WatchStream},
        executor::AcceptedEventHandler,
        identity::OperatorIdentity,
        ObservationScope, WatchAction,
    },
    resource::ResourceRef,
    util::lock,
    waiter::ConditionWaiter,
};

/// resourceVersion reported by every fake listing
pub(crate) const LIST_RESOURCE_VERSION: &str = "20";

pub(crate) fn plugin(
    name: &str,
    uid: &str,
    resource_version: &str,
    generation: i64,
    observed_generation: Option<i64>,
) -> EntandoPlugin {
    let mut plugin = EntandoPlugin::new(name, EntandoPluginSpec::default());
    plugin.metadata = ObjectMeta {
        name: Some(name.to_owned()),
        namespace: Some("ns1".to_owned()),
        uid: Some(uid.to_owned()),
        resource_version: Some(resource_version.to_owned()),
        generation: Some(generation),
        ..Default::default()
    };
    plugin.status = observed_generation.map(|observed| EntandoCustomResourceStatus {
        observed_generation: Some(observed),
        ..Default::default()
    });
    plugin
}

pub(crate) fn identity(
    operator_id: Option<&str>,
    version_to_replace: Option<&str>,
) -> OperatorIdentity {
    OperatorIdentity {
        operator_id: operator_id.map(str::to_owned),
        version: "7.0.0".to_owned(),
        version_to_replace: version_to_replace.map(str::to_owned),
    }
}

pub(crate) fn api_status(code: u16, message: &str) -> ErrorResponse {
    serde_json::from_value(json!({
        "status": "Failure",
        "message": message,
        "reason": if code == 410 { "Expired" } else { "InternalError" },
        "code": code,
    }))
    .unwrap()
}

/// Poll `condition` until it holds, failing the test after five seconds
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

struct FakeResourceState<K> {
    items: Vec<K>,
    list_calls: usize,
    watch_versions: Vec<String>,
    watch: Option<mpsc::UnboundedSender<Result<WatchEvent<K>, kube::Error>>>,
    patched: Vec<K>,
    fail_patches: bool,
}

/// [ResourceClient] serving a fixed listing and a hand-fed watch.
/// Annotation patches are applied locally and bump the resourceVersion.
pub(crate) struct FakeResourceClient<K> {
    state: Mutex<FakeResourceState<K>>,
}

impl<K: EntandoCustomResource> FakeResourceClient<K> {
    pub(crate) fn with_items(items: Vec<K>) -> Self {
        Self {
            state: Mutex::new(FakeResourceState {
                items,
                list_calls: 0,
                watch_versions: Vec::new(),
                watch: None,
                patched: Vec::new(),
                fail_patches: false,
            }),
        }
    }

    /// Deliver `event` on the most recently opened watch
    pub(crate) fn send(&self, event: Result<WatchEvent<K>, kube::Error>) {
        let state = lock(&self.state);
        let watch = state.watch.as_ref().unwrap();
        watch.send(event).unwrap();
    }

    /// Replace what later listings return
    pub(crate) fn set_items(&self, items: Vec<K>) {
        lock(&self.state).items = items;
    }

    /// Close the current watch stream without an error
    pub(crate) fn end_watch(&self) {
        lock(&self.state).watch.take();
    }

    pub(crate) fn fail_patches(&self) {
        lock(&self.state).fail_patches = true;
    }

    pub(crate) fn list_calls(&self) -> usize {
        lock(&self.state).list_calls
    }

    /// resourceVersions watches were opened from, in order
    pub(crate) fn watch_versions(&self) -> Vec<String> {
        lock(&self.state).watch_versions.clone()
    }

    pub(crate) fn patched(&self) -> Vec<K> {
        lock(&self.state).patched.clone()
    }
}

#[async_trait]
impl<K: EntandoCustomResource> ResourceClient<K> for FakeResourceClient<K> {
    async fn list(&self) -> Result<ObjectList<K>, kube::Error> {
        let items = {
            let mut state = lock(&self.state);
            state.list_calls += 1;
            state.items.clone()
        };
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "List",
            "metadata": { "resourceVersion": LIST_RESOURCE_VERSION },
            "items": items,
        }))
        .map_err(kube::Error::SerdeError)
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>, kube::Error> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        state.watch_versions.push(resource_version.to_owned());
        state.watch = Some(sender);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn patch_annotations(&self, resource: &K, annotations: Value) -> Result<K, kube::Error> {
        let mut state = lock(&self.state);
        if state.fail_patches {
            return Err(kube::Error::Api(api_status(500, "patch refused")));
        }
        let mut patched = resource.clone();
        if let Value::Object(entries) = annotations {
            for (key, value) in entries {
                match value {
                    Value::String(value) => {
                        patched.annotations_mut().insert(key, value);
                    }
                    _ => {
                        patched.annotations_mut().remove(&key);
                    }
                }
            }
        }
        let next_version = resource
            .resource_version()
            .and_then(|version| version.parse::<u64>().ok())
            .map_or(1, |version| version + 1);
        patched.meta_mut().resource_version = Some(next_version.to_string());
        state.patched.push(patched.clone());
        Ok(patched)
    }
}

/// Records every resource handed to it
#[derive(Default)]
pub(crate) struct RecordingHandler {
    accepted: Mutex<Vec<(WatchAction, EntandoPlugin)>>,
}

impl RecordingHandler {
    pub(crate) fn events(&self) -> Vec<(WatchAction, String)> {
        lock(&self.accepted)
            .iter()
            .map(|(action, resource)| (*action, resource.name_any()))
            .collect()
    }

    pub(crate) fn resources(&self) -> Vec<EntandoPlugin> {
        lock(&self.accepted)
            .iter()
            .map(|(_, resource)| resource.clone())
            .collect()
    }
}

#[async_trait]
impl AcceptedEventHandler<EntandoPlugin> for RecordingHandler {
    async fn on_accepted(&self, action: WatchAction, resource: EntandoPlugin) {
        lock(&self.accepted).push((action, resource));
    }
}

/// Serves the given resources to observers of their kind, nothing otherwise
#[derive(Default)]
pub(crate) struct FakeFactory {
    resources: BTreeMap<EntandoKind, Vec<Value>>,
    requested: Mutex<Vec<(EntandoKind, ObservationScope)>>,
}

impl FakeFactory {
    pub(crate) fn with_resource<K: EntandoCustomResource>(mut self, resource: &K) -> Self {
        self.resources
            .entry(K::KIND)
            .or_default()
            .push(serde_json::to_value(resource).unwrap());
        self
    }

    pub(crate) fn requested(&self) -> Vec<(EntandoKind, ObservationScope)> {
        lock(&self.requested).clone()
    }
}

impl ResourceClientFactory for FakeFactory {
    fn resource_client<K: EntandoCustomResource>(
        &self,
        scope: &ObservationScope,
    ) -> Arc<dyn ResourceClient<K>> {
        lock(&self.requested).push((K::KIND, scope.clone()));
        let items = self
            .resources
            .get(&K::KIND)
            .into_iter()
            .flatten()
            .map(|value| serde_json::from_value(value.clone()).unwrap())
            .collect();
        Arc::new(FakeResourceClient::<K>::with_items(items))
    }
}

/// How pods created through [FakePodClient] behave
#[derive(Debug, Clone, Copy)]
pub(crate) enum UnitOutcome {
    /// Terminated as soon as created
    Complete { exit_code: i32 },
    /// Stays pending forever
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PodOp {
    Create(String),
    Delete(String),
}

struct FakePodState {
    pods: BTreeMap<(String, String), Pod>,
    created: Vec<Pod>,
    operations: Vec<PodOp>,
    subscribers: Vec<((String, String), ConditionWaiter<Option<Pod>>)>,
    next_id: u32,
    overlapped: bool,
    refuse_deletion: bool,
}

impl FakePodState {
    fn publish(&self, key: &(String, String)) {
        let current = self.pods.get(key).cloned();
        for (subscribed, waiter) in &self.subscribers {
            if subscribed == key {
                waiter.update(current.clone());
            }
        }
    }
}

pub(crate) struct FakePodClient {
    outcome: UnitOutcome,
    state: Mutex<FakePodState>,
}

impl FakePodClient {
    pub(crate) fn new(outcome: UnitOutcome) -> Self {
        Self {
            outcome,
            state: Mutex::new(FakePodState {
                pods: BTreeMap::new(),
                created: Vec::new(),
                operations: Vec::new(),
                subscribers: Vec::new(),
                next_id: 0,
                overlapped: false,
                refuse_deletion: false,
            }),
        }
    }

    /// Add a completed controller pod for `resource` without recording it
    pub(crate) fn seed_pod(&self, namespace: &str, name: &str, resource: &ResourceRef) -> String {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                labels: Some(unit_labels(resource)),
                ..Default::default()
            },
            status: Some(terminated_status(0)),
            ..Default::default()
        };
        lock(&self.state)
            .pods
            .insert((namespace.to_owned(), name.to_owned()), pod);
        name.to_owned()
    }

    /// Deletions are recorded but pods stay in place
    pub(crate) fn refuse_deletion(&self) {
        lock(&self.state).refuse_deletion = true;
    }

    pub(crate) fn operations(&self) -> Vec<PodOp> {
        lock(&self.state).operations.clone()
    }

    pub(crate) fn created(&self) -> Vec<Pod> {
        lock(&self.state).created.clone()
    }

    pub(crate) fn live_pods(&self) -> Vec<String> {
        lock(&self.state)
            .pods
            .keys()
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Whether a pod was ever created while another one with the same
    /// labels still existed
    pub(crate) fn overlapped(&self) -> bool {
        lock(&self.state).overlapped
    }
}

fn terminated_status(exit_code: i32) -> PodStatus {
    PodStatus {
        phase: Some(if exit_code == 0 { "Succeeded" } else { "Failed" }.to_owned()),
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
    }
}

fn has_labels(pod: &Pod, labels: &BTreeMap<String, String>) -> bool {
    let own = pod.labels();
    labels.iter().all(|(k, v)| own.get(k) == Some(v))
}

#[async_trait]
impl PodClient for FakePodClient {
    async fn find_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, kube::Error> {
        Ok(lock(&self.state)
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && has_labels(pod, labels))
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, kube::Error> {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let name = format!(
            "{}{:05}",
            pod.metadata.generate_name.clone().unwrap_or_default(),
            state.next_id
        );
        let labels = pod.labels().clone();
        if state
            .pods
            .iter()
            .any(|((ns, _), live)| ns == namespace && has_labels(live, &labels))
        {
            state.overlapped = true;
        }

        let mut created = pod.clone();
        created.metadata.name = Some(name.clone());
        created.status = Some(match self.outcome {
            UnitOutcome::Complete { exit_code } => terminated_status(exit_code),
            UnitOutcome::Hang => PodStatus {
                phase: Some("Pending".to_owned()),
                ..Default::default()
            },
        });
        let key = (namespace.to_owned(), name.clone());
        state.pods.insert(key.clone(), created.clone());
        state.created.push(created.clone());
        state.operations.push(PodOp::Create(name));
        state.publish(&key);
        Ok(created)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let mut state = lock(&self.state);
        state.operations.push(PodOp::Delete(name.to_owned()));
        if !state.refuse_deletion {
            let key = (namespace.to_owned(), name.to_owned());
            state.pods.remove(&key);
            state.publish(&key);
        }
        Ok(())
    }

    fn subscribe(&self, namespace: &str, name: &str) -> PodSubscription {
        let key = (namespace.to_owned(), name.to_owned());
        let waiter = ConditionWaiter::default();
        let mut state = lock(&self.state);
        waiter.update(state.pods.get(&key).cloned());
        state.subscribers.push((key, waiter.clone()));
        PodSubscription::new(waiter, None)
    }
}
