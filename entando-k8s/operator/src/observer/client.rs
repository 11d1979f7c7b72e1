use std::marker::PhantomData;

use async_trait::async_trait;
use crds::EntandoCustomResource;
use futures::{stream::BoxStream, StreamExt};
use kube::{
    api::{ListParams, Patch, PatchParams, WatchEvent, WatchParams},
    core::ObjectList,
    Api, Client, ResourceExt,
};
use serde_json::{json, Value};

use super::ObservationScope;

pub(crate) type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, kube::Error>>;

/// Access to one observed collection of custom resources
#[async_trait]
pub(crate) trait ResourceClient<K: Clone>: Send + Sync + 'static {
    async fn list(&self) -> Result<ObjectList<K>, kube::Error>;

    /// Open a watch starting after `resource_version`
    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>, kube::Error>;

    /// Merge-patch the annotations of `resource`, returning the updated resource.
    /// A `null` value removes the annotation.
    async fn patch_annotations(&self, resource: &K, annotations: Value) -> Result<K, kube::Error>;
}

pub(crate) struct KubeResourceClient<K> {
    client: Client,
    scope: ObservationScope,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeResourceClient<K> {
    pub(crate) fn new(client: Client, scope: ObservationScope) -> Self {
        Self {
            client,
            scope,
            _kind: PhantomData,
        }
    }
}

impl<K: EntandoCustomResource> KubeResourceClient<K> {
    fn api(&self) -> Api<K> {
        match &self.scope {
            ObservationScope::Cluster => Api::all(self.client.clone()),
            ObservationScope::Namespace(namespace) => {
                Api::namespaced(self.client.clone(), namespace)
            }
        }
    }
}

#[async_trait]
impl<K: EntandoCustomResource> ResourceClient<K> for KubeResourceClient<K> {
    async fn list(&self) -> Result<ObjectList<K>, kube::Error> {
        self.api().list(&ListParams::default()).await
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>, kube::Error> {
        let stream = self
            .api()
            .watch(&WatchParams::default(), resource_version)
            .await?;
        Ok(stream.boxed())
    }

    async fn patch_annotations(&self, resource: &K, annotations: Value) -> Result<K, kube::Error> {
        let namespace = resource.namespace().unwrap_or_else(|| "default".to_owned());
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        let patch = json!({
            "metadata": {
                "annotations": annotations
            }
        });
        let patch: Patch<&Value> = Patch::Merge(&patch);
        api.patch(&resource.name_any(), &PatchParams::default(), &patch)
            .await
    }
}
