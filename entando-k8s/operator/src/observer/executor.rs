//! Serial executor running accepted-event callbacks off the watch task.

use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use crds::EntandoCustomResource;
use futures::FutureExt;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, warn};

use super::WatchAction;
use crate::{resource::ResourceRef, util::lock};

/// Receives every event the reconciliation gate accepted
#[async_trait]
pub(crate) trait AcceptedEventHandler<K>: Send + Sync + 'static {
    async fn on_accepted(&self, action: WatchAction, resource: K);
}

/// Runs callbacks one at a time in submission order on a dedicated task
pub(crate) struct CallbackExecutor<K> {
    sender: Mutex<Option<mpsc::UnboundedSender<(WatchAction, K)>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<K: EntandoCustomResource> CallbackExecutor<K> {
    pub(crate) fn spawn(handler: Arc<dyn AcceptedEventHandler<K>>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<(WatchAction, K)>();
        let worker = tokio::spawn(async move {
            while let Some((action, resource)) = receiver.recv().await {
                let reference = ResourceRef::from_resource(&resource);
                let callback = AssertUnwindSafe(handler.on_accepted(action, resource));
                if callback.catch_unwind().await.is_err() {
                    error!("Callback for {action} event on {reference} panicked");
                }
            }
        });
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub(crate) fn submit(&self, action: WatchAction, resource: K) -> Result<(), ExecutorShutDown> {
        let guard = lock(&self.sender);
        let sender = guard.as_ref().ok_or(ExecutorShutDown)?;
        sender
            .send((action, resource))
            .map_err(|_| ExecutorShutDown)
    }

    /// Stop accepting submissions and wait for the queued callbacks to finish.
    /// Returns false if `timeout` elapsed first.
    pub(crate) async fn shut_down_and_wait(&self, timeout: Duration) -> bool {
        lock(&self.sender).take();
        let Some(worker) = lock(&self.worker).take() else {
            return true;
        };
        match tokio::time::timeout(timeout, worker).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Callback executor terminated abnormally: {e}");
                true
            }
            Err(_) => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Callback executor has been shut down")]
pub(crate) struct ExecutorShutDown;
