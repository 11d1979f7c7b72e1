//! Dispatch of accepted events to one-shot controller pods.
//!
//! Every dispatch first removes what is left of the previous controller pod
//! for the same resource, then starts a fresh pod running the kind's
//! controller image and blocks until it has completed.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::OperatorConfig,
    observer::WatchAction,
    resource::ResourceRef,
    waiter::{WaitError, WaitTarget},
};

pub(crate) mod client;
pub(crate) mod image;
pub(crate) mod pod;

use client::PodClient;
use image::{ControllerImageResolver, ImageResolutionError};
use pod::{controller_pod, is_ready, is_terminated, unit_failure, unit_labels};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DispatchRequest {
    pub(crate) action: WatchAction,
    pub(crate) resource: ResourceRef,
    /// Controller image version to use instead of the configured one
    pub(crate) version_override: Option<String>,
}

/// Settings shared by every controller pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PodSettings {
    pub(crate) service_account: String,
    pub(crate) image_pull_secrets: Vec<String>,
    pub(crate) readiness_timeout: Duration,
    pub(crate) completion_timeout: Duration,
    /// bound for removing the pod of a previous dispatch
    pub(crate) shutdown_timeout: Duration,
    /// delete pods which completed successfully
    pub(crate) garbage_collect: bool,
}

impl PodSettings {
    pub(crate) fn from_config(config: &OperatorConfig) -> Self {
        Self {
            service_account: config.service_account.clone(),
            image_pull_secrets: config.image_pull_secrets(),
            readiness_timeout: config.pod_readiness_timeout(),
            completion_timeout: config.pod_completion_timeout(),
            shutdown_timeout: config.pod_shutdown_timeout(),
            garbage_collect: config.gc_controller_pods,
        }
    }
}

pub(crate) struct ControllerExecutor {
    pods: Arc<dyn PodClient>,
    images: ControllerImageResolver,
    settings: PodSettings,
    forwarded_environment: BTreeMap<String, String>,
}

impl ControllerExecutor {
    pub(crate) fn new(
        pods: Arc<dyn PodClient>,
        images: ControllerImageResolver,
        settings: PodSettings,
        forwarded_environment: BTreeMap<String, String>,
    ) -> Self {
        Self {
            pods,
            images,
            settings,
            forwarded_environment,
        }
    }

    /// Run the controller for `request` to completion and return its final pod
    pub(crate) async fn dispatch(&self, request: &DispatchRequest) -> Result<Pod, DispatchError> {
        let resource = &request.resource;
        self.remove_previous_units(resource).await?;

        let image = self
            .images
            .resolve(resource.kind, request.version_override.as_deref())?;
        let pod = controller_pod(
            resource,
            request.action,
            &image,
            &self.settings,
            &self.forwarded_environment,
        );
        let created = self.pods.create_pod(&resource.namespace, &pod).await?;
        let name = created.name_any();
        info!(
            "Started controller pod {}/{name} for {} of {resource} using {image}",
            resource.namespace, request.action
        );

        let subscription = self.pods.subscribe(&resource.namespace, &name);
        let waiter = subscription.waiter();
        waiter
            .wait_for(
                |pod: &Option<Pod>| pod.as_ref().map_or(true, is_ready),
                self.settings.readiness_timeout,
                &WaitTarget::pod(&resource.namespace, &name, "ready"),
            )
            .await?;
        let completed = waiter
            .wait_for(
                |pod: &Option<Pod>| pod.as_ref().map_or(true, is_terminated),
                self.settings.completion_timeout,
                &WaitTarget::pod(&resource.namespace, &name, "completed"),
            )
            .await?
            .ok_or_else(|| DispatchError::UnitVanished {
                pod: name.clone(),
                resource: resource.clone(),
            })?;

        if let Some(reason) = unit_failure(&completed) {
            return Err(DispatchError::UnitFailed {
                pod: name,
                resource: resource.clone(),
                reason,
            });
        }
        if self.settings.garbage_collect {
            if let Err(e) = self.pods.delete_pod(&resource.namespace, &name).await {
                warn!("Could not remove completed controller pod {}/{name}: {e}", resource.namespace);
            }
        }
        Ok(completed)
    }

    /// Delete every controller pod left for `resource` and wait for each to
    /// be gone, so two controllers never run against the same resource
    async fn remove_previous_units(&self, resource: &ResourceRef) -> Result<(), DispatchError> {
        let namespace = &resource.namespace;
        let previous = self.pods.find_pods(namespace, &unit_labels(resource)).await?;
        for pod in previous {
            let name = pod.name_any();
            debug!("Removing previous controller pod {namespace}/{name} of {resource}");
            let subscription = self.pods.subscribe(namespace, &name);
            self.pods.delete_pod(namespace, &name).await?;
            subscription
                .waiter()
                .wait_for(
                    |pod: &Option<Pod>| pod.is_none(),
                    self.settings.shutdown_timeout,
                    &WaitTarget::pod(namespace, &name, "removed"),
                )
                .await?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub(crate) enum DispatchError {
    #[error("Error from Kubernetes: {0}")]
    Kubernetes(#[from] kube::Error),
    #[error(transparent)]
    ImageResolution(#[from] ImageResolutionError),
    #[error(transparent)]
    Wait(#[from] WaitError),
    #[error("Controller pod {pod} for {resource} failed: {reason}")]
    UnitFailed {
        pod: String,
        resource: ResourceRef,
        reason: String,
    },
    #[error("Controller pod {pod} for {resource} disappeared before completing")]
    UnitVanished { pod: String, resource: ResourceRef },
}
