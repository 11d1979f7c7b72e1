//! Entando Kubernetes operator
use std::sync::Arc;

use config::{forwarded_environment, OperatorConfig};
use controller::{
    client::KubePodClient,
    image::{load_image_info, ControllerImageResolver},
    ControllerExecutor, PodSettings,
};
use coordinator::{
    observation_scopes, ControllerCoordinator, ControllerDispatcher, KubeResourceClientFactory,
};
use envconfig::Envconfig;
use errors::Error;
use health::Liveness;
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

mod config;
mod controller;
mod coordinator;
mod errors;
mod health;
mod observer;
mod resource;
#[cfg(test)]
mod testing;
mod util;
mod waiter;

/// Main entry point
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    match main_inner().await {
        Ok(_) => (),
        Err(e) => {
            panic!("{:?}", eyre::Report::new(e))
        }
    }
}

async fn main_inner() -> Result<(), Error> {
    let config = OperatorConfig::init_from_env()?;
    let client = Client::try_default().await?;
    let own_namespace = config
        .operator_namespace
        .clone()
        .unwrap_or_else(|| client.default_namespace().to_owned());

    let liveness = Liveness::new();
    let health = tokio::spawn(health::serve(liveness.clone(), config.health_port));

    let environment = forwarded_environment(std::env::vars());
    let image_info = load_image_info(
        client.clone(),
        &own_namespace,
        &config.images.image_info_config_map,
    )
    .await
    .unwrap_or_else(|e| {
        warn!("Could not read image info ConfigMap, using environment only: {e}");
        Default::default()
    });
    let images = ControllerImageResolver::new(config.image_config(), &environment, image_info);
    let executor = ControllerExecutor::new(
        Arc::new(KubePodClient::new(client.clone())),
        images,
        PodSettings::from_config(&config),
        environment,
    );

    let scopes = observation_scopes(config.namespaces_to_observe.as_deref(), &own_namespace);
    let coordinator = ControllerCoordinator::new(
        KubeResourceClientFactory::new(client),
        scopes,
        config.identity(),
        liveness.clone(),
        ControllerDispatcher::new(executor),
    );
    info!(
        "Starting Entando operator {} in namespace {own_namespace}",
        config.operator_version()
    );
    let registry = coordinator.start().await?;
    for observer in registry.iter() {
        info!(
            "Tracking {} {} in {}",
            observer.tracked_resources(),
            observer.kind(),
            observer.scope()
        );
    }

    let mut terminate = signal(SignalKind::terminate()).map_err(Error::Signal)?;
    let outcome = tokio::select! {
        result = tokio::signal::ctrl_c() => result.map_err(Error::Signal),
        _ = terminate.recv() => {
            info!("Received SIGTERM");
            Ok(())
        }
        served = health => match served {
            Ok(served) => served.map_err(Error::from),
            Err(e) => {
                warn!("Health server task ended: {e}");
                Ok(())
            }
        },
    };

    if !liveness.is_alive() {
        warn!("Shutting down after the operator was marked dead");
    }
    info!("Shutting down observers");
    if !coordinator.shut_down(config.shutdown_timeout()).await {
        warn!(
            "Observers did not finish within {}s",
            config.shutdown_timeout().as_secs()
        );
    }
    outcome
}
