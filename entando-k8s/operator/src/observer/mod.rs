//! Observation of one custom resource kind in one scope.
//!
//! A [ResourceObserver] lists the existing resources, replays them through the
//! reconciliation gate and then follows the watch. Accepted events are handed
//! to the registered [AcceptedEventHandler] on the observer's own executor, so
//! the watch task never waits for reconciliation work.

use std::{
    collections::HashSet,
    fmt::Display,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use crds::{EntandoCustomResource, EntandoKind};
use futures::{FutureExt, StreamExt};
use kube::{api::WatchEvent, error::ErrorResponse, ResourceExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{health::Liveness, resource::ResourceRef, util::lock};

pub(crate) mod cache;
pub(crate) mod client;
pub(crate) mod executor;
pub(crate) mod gate;
pub(crate) mod identity;
pub(crate) mod instruction;

use cache::ObserverCache;
use client::ResourceClient;
use executor::{AcceptedEventHandler, CallbackExecutor, ExecutorShutDown};
use gate::{AcceptReason, GateDecision, GateInput, RejectReason, ResourceVersionError};
use identity::{OperatorIdentity, PROCESSED_BY_VERSION_ANNOTATION};
use instruction::PROCESSING_INSTRUCTION_ANNOTATION;

/// Change reported by the watch for a single resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum WatchAction {
    Added,
    Modified,
    Deleted,
}

impl WatchAction {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            WatchAction::Added => "ADDED",
            WatchAction::Modified => "MODIFIED",
            WatchAction::Deleted => "DELETED",
        }
    }
}

impl Display for WatchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an observer looks for resources
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum ObservationScope {
    Cluster,
    Namespace(String),
}

impl Display for ObservationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObservationScope::Cluster => f.write_str("all namespaces"),
            ObservationScope::Namespace(namespace) => write!(f, "namespace {namespace}"),
        }
    }
}

/// Type erased view of an observer, held by the coordinator's registry
#[async_trait]
pub(crate) trait ObserverHandle: Send + Sync {
    fn kind(&self) -> EntandoKind;

    fn scope(&self) -> &ObservationScope;

    /// Number of resources currently tracked in the cache
    fn tracked_resources(&self) -> usize;

    /// Stop watching and wait for the in-flight callback.
    /// Returns false if `timeout` elapsed first.
    async fn shut_down_and_wait(&self, timeout: Duration) -> bool;
}

pub(crate) struct ResourceObserver<K: EntandoCustomResource> {
    scope: ObservationScope,
    client: Arc<dyn ResourceClient<K>>,
    identity: Arc<OperatorIdentity>,
    cache: ObserverCache<K>,
    executor: CallbackExecutor<K>,
    liveness: Liveness,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl<K: EntandoCustomResource> ResourceObserver<K> {
    /// Prime the cache from a full listing and start following the watch.
    /// Returns once priming is complete.
    pub(crate) async fn observe(
        client: Arc<dyn ResourceClient<K>>,
        scope: ObservationScope,
        identity: Arc<OperatorIdentity>,
        liveness: Liveness,
        handler: Arc<dyn AcceptedEventHandler<K>>,
    ) -> Result<Arc<Self>, ObserveError> {
        let observer = Arc::new(Self {
            scope,
            client,
            identity,
            cache: ObserverCache::default(),
            executor: CallbackExecutor::spawn(handler),
            liveness,
            watch_task: Mutex::new(None),
        });
        let resource_version = observer
            .prime()
            .await
            .map_err(|source| ObserveError::InitialList {
                kind: K::KIND,
                scope: observer.scope.clone(),
                source,
            })?;

        let task = tokio::spawn(Arc::clone(&observer).watch_loop(resource_version));
        *lock(&observer.watch_task) = Some(task);
        info!("Observing {} in {}", K::KIND, observer.scope);
        Ok(observer)
    }

    /// Replay every existing resource as a modification so nothing changed
    /// while the operator was down is missed. Resources missing from the
    /// listing are no longer tracked. Returns the listing's resourceVersion to
    /// watch from.
    async fn prime(&self) -> Result<String, kube::Error> {
        let list = self.client.list().await?;
        debug!(
            "Priming {} observer in {} with {} resources",
            K::KIND,
            self.scope,
            list.items.len()
        );
        let listed: HashSet<String> = list.items.iter().filter_map(|r| r.uid()).collect();
        let pruned = self.cache.retain_only(&listed);
        if pruned > 0 {
            debug!("Stopped tracking {pruned} {} resources deleted while unobserved", K::KIND);
        }
        for resource in list.items {
            self.event_received(WatchAction::Modified, resource).await;
        }
        Ok(list.metadata.resource_version.unwrap_or_default())
    }

    async fn watch_loop(self: Arc<Self>, mut resource_version: String) {
        loop {
            match self.follow_watch(&mut resource_version).await {
                WatchClose::Ended => {
                    debug!(
                        "Watch on {} in {} ended, resuming from resourceVersion {resource_version}",
                        K::KIND,
                        self.scope
                    );
                }
                WatchClose::Failed(cause) => match self.on_close(cause).await {
                    Some(relisted_version) => resource_version = relisted_version,
                    None => return,
                },
            }
        }
    }

    /// Feed watch events to [Self::event_received] until the watch closes,
    /// keeping `resource_version` at the last version seen
    async fn follow_watch(&self, resource_version: &mut String) -> WatchClose {
        let mut stream = match self.client.watch(resource_version).await {
            Ok(stream) => stream,
            Err(e) => return WatchClose::Failed(WatchCloseCause::Client(e)),
        };
        while let Some(event) = stream.next().await {
            let (action, resource) = match event {
                Ok(WatchEvent::Added(resource)) => (WatchAction::Added, resource),
                Ok(WatchEvent::Modified(resource)) => (WatchAction::Modified, resource),
                Ok(WatchEvent::Deleted(resource)) => (WatchAction::Deleted, resource),
                Ok(WatchEvent::Bookmark(bookmark)) => {
                    warn!(
                        "Ignoring bookmark for {} in {} at resourceVersion {}",
                        K::KIND,
                        self.scope,
                        bookmark.metadata.resource_version
                    );
                    continue;
                }
                Ok(WatchEvent::Error(status)) => {
                    return WatchClose::Failed(WatchCloseCause::Status(status))
                }
                Err(e) => return WatchClose::Failed(WatchCloseCause::Client(e)),
            };
            if let Some(version) = resource.resource_version() {
                *resource_version = version;
            }
            self.event_received(action, resource).await;
        }
        WatchClose::Ended
    }

    /// Decide how to continue after the watch closed with `cause`.
    /// Returns the resourceVersion to resume from, or `None` if the failure is
    /// fatal and the operator has been marked dead.
    async fn on_close(&self, cause: WatchCloseCause) -> Option<String> {
        if !cause.is_stale_resource_version() {
            error!(
                "Watch on {} in {} closed: {cause}. Marking operator as dead",
                K::KIND,
                self.scope
            );
            self.liveness.mark_dead();
            return None;
        }
        info!(
            "Watch on {} in {} expired ({cause}), listing again",
            K::KIND,
            self.scope
        );
        match self.prime().await {
            Ok(resource_version) => Some(resource_version),
            Err(e) => {
                error!(
                    "Listing {} in {} after watch expiry failed: {e}. Marking operator as dead",
                    K::KIND,
                    self.scope
                );
                self.liveness.mark_dead();
                None
            }
        }
    }

    /// Run one event through the gate. Failures are logged with the resource
    /// identity and never reach the watch.
    pub(crate) async fn event_received(&self, action: WatchAction, resource: K) {
        let reference = ResourceRef::from_resource(&resource);
        let outcome = AssertUnwindSafe(self.process_event(action, resource))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to process {action} event for {reference}: {e}"),
            Err(_) => error!("Panic while processing {action} event for {reference}"),
        }
    }

    async fn process_event(&self, action: WatchAction, resource: K) -> Result<(), ObserverEventError> {
        let reference = ResourceRef::from_resource(&resource);
        let uid = resource.uid().ok_or(ObserverEventError::MissingUid)?;
        let cached_version = self.cache.resource_version(&uid);
        let input =
            GateInput::from_resource(action, &resource, cached_version.as_deref(), &self.identity)?;

        let reason = match gate::evaluate(&input) {
            GateDecision::Reject(reason) => {
                log_rejection(action, &reference, reason);
                return Ok(());
            }
            GateDecision::Accept(reason) => reason,
        };

        // deletions are bookkeeping only, whatever the reason for acceptance
        if action == WatchAction::Deleted {
            self.cache.remove(&uid);
            debug!("Stopped tracking deleted {reference}");
            return Ok(());
        }

        let resource = if reason == AcceptReason::Forced {
            self.client
                .patch_annotations(&resource, json!({ PROCESSING_INSTRUCTION_ANNOTATION: Value::Null }))
                .await
                .map_err(ObserverEventError::StripInstruction)?
        } else {
            resource
        };
        self.cache.insert(uid.clone(), resource.clone());
        let resource = self.stamp_processed_by(&uid, resource).await;

        info!("Accepted {action} event for {reference} ({reason:?})");
        self.executor.submit(action, resource)?;
        Ok(())
    }

    /// Best effort marking of the resource with the running operator version.
    /// The patched resource replaces the cache entry so the echo of our own
    /// write is dropped as a duplicate.
    async fn stamp_processed_by(&self, uid: &str, resource: K) -> K {
        let version = &self.identity.version;
        if resource.annotations().get(PROCESSED_BY_VERSION_ANNOTATION) == Some(version) {
            return resource;
        }
        match self
            .client
            .patch_annotations(&resource, json!({ PROCESSED_BY_VERSION_ANNOTATION: version }))
            .await
        {
            Ok(stamped) => {
                self.cache.insert(uid.to_owned(), stamped.clone());
                stamped
            }
            Err(e) => {
                warn!(
                    "Could not mark {} as processed by version {version}: {e}",
                    ResourceRef::from_resource(&resource)
                );
                resource
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn cached(&self, uid: &str) -> Option<K> {
        self.cache.get(uid)
    }
}

#[async_trait]
impl<K: EntandoCustomResource> ObserverHandle for ResourceObserver<K> {
    fn kind(&self) -> EntandoKind {
        K::KIND
    }

    fn scope(&self) -> &ObservationScope {
        &self.scope
    }

    fn tracked_resources(&self) -> usize {
        self.cache.len()
    }

    async fn shut_down_and_wait(&self, timeout: Duration) -> bool {
        let task = lock(&self.watch_task).take();
        if let Some(task) = task {
            task.abort();
        }
        let finished = self.executor.shut_down_and_wait(timeout).await;
        if !finished {
            warn!(
                "Callback for {} in {} still running after {}s",
                K::KIND,
                self.scope,
                timeout.as_secs()
            );
        }
        finished
    }
}

fn log_rejection(action: WatchAction, reference: &ResourceRef, reason: RejectReason) {
    match reason {
        RejectReason::Duplicate => {
            warn!("Dropping duplicate {action} event for {reference}");
        }
        RejectReason::OwnedByCompositeApp
        | RejectReason::ForeignOperator
        | RejectReason::Deferred
        | RejectReason::Ignored
        | RejectReason::GenerationUnchanged => {
            debug!("Skipping {action} event for {reference} ({reason:?})");
        }
    }
}

enum WatchClose {
    /// Stream ended without reporting a problem
    Ended,
    Failed(WatchCloseCause),
}

#[derive(Debug)]
pub(crate) enum WatchCloseCause {
    /// Error status delivered in band on the watch
    Status(ErrorResponse),
    Client(kube::Error),
}

impl WatchCloseCause {
    /// The API server no longer holds history for our resourceVersion, which
    /// happens routinely and is recovered by listing again
    pub(crate) fn is_stale_resource_version(&self) -> bool {
        match self {
            WatchCloseCause::Status(status)
            | WatchCloseCause::Client(kube::Error::Api(status)) => {
                status.code == 410 || status.message.to_lowercase().contains("too old")
            }
            WatchCloseCause::Client(other) => other.to_string().to_lowercase().contains("too old"),
        }
    }
}

impl Display for WatchCloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchCloseCause::Status(status) => {
                write!(f, "{} ({}): {}", status.reason, status.code, status.message)
            }
            WatchCloseCause::Client(e) => write!(f, "{e}"),
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum ObserveError {
    #[error("Initial listing of {kind} in {scope} failed: {source}")]
    InitialList {
        kind: EntandoKind,
        scope: ObservationScope,
        source: kube::Error,
    },
}

#[derive(Debug, Error)]
pub(crate) enum ObserverEventError {
    #[error("Resource has no UID")]
    MissingUid,
    #[error(transparent)]
    ResourceVersion(#[from] ResourceVersionError),
    #[error("Error removing processing instruction: {0}")]
    StripInstruction(kube::Error),
    #[error(transparent)]
    Submit(#[from] ExecutorShutDown),
}
