use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{DeleteParams, ListParams, PostParams},
    Api, Client,
};
use kube_runtime::{watcher, WatchStreamExt};
use tokio::task::AbortHandle;
use tracing::warn;

use crate::waiter::ConditionWaiter;

/// Pod operations needed to run controller pods
#[async_trait]
pub(crate) trait PodClient: Send + Sync + 'static {
    async fn find_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, kube::Error>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, kube::Error>;

    /// Request deletion. A pod which is already gone is not an error.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Follow the state of one pod, `None` meaning it does not exist
    fn subscribe(&self, namespace: &str, name: &str) -> PodSubscription;
}

/// Live view of one pod. Dropping it stops the feed.
pub(crate) struct PodSubscription {
    waiter: ConditionWaiter<Option<Pod>>,
    feed: Option<AbortHandle>,
}

impl PodSubscription {
    pub(crate) fn new(waiter: ConditionWaiter<Option<Pod>>, feed: Option<AbortHandle>) -> Self {
        Self { waiter, feed }
    }

    pub(crate) fn waiter(&self) -> &ConditionWaiter<Option<Pod>> {
        &self.waiter
    }
}

impl Drop for PodSubscription {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.abort();
        }
    }
}

pub(crate) struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn find_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, kube::Error> {
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(self.api(namespace).list(&params).await?.items)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, kube::Error> {
        self.api(namespace).create(&PostParams::default(), pod).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 || e.reason == "NotFound" => {
                warn!("Attempted to delete pod '{namespace}/{name}' but it does not exist");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn subscribe(&self, namespace: &str, name: &str) -> PodSubscription {
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let stream = watcher(self.api(namespace), config).default_backoff();
        let waiter = ConditionWaiter::default();
        let feed = waiter.clone();
        let target = format!("{namespace}/{name}");
        let task = tokio::spawn(async move {
            let mut stream = stream.boxed();
            // only one pod matches, the last one listed is its current state
            let mut listed = None;
            while let Some(event) = stream.next().await {
                match event {
                    Ok(watcher::Event::Init) => listed = None,
                    Ok(watcher::Event::InitApply(pod)) => listed = Some(pod),
                    Ok(watcher::Event::InitDone) => feed.update(listed.take()),
                    Ok(watcher::Event::Apply(pod)) => feed.update(Some(pod)),
                    Ok(watcher::Event::Delete(_)) => feed.update(None),
                    Err(e) => warn!("Watch on pod {target} failed: {e}"),
                }
            }
        });
        PodSubscription::new(waiter, Some(task.abort_handle()))
    }
}
