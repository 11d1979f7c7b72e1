//! Process liveness, published as the standard gRPC health service
use std::{net::SocketAddr, sync::Arc};

use tokio::sync::watch;
use tonic::transport::Server;
use tonic_health::{server::HealthReporter, ServingStatus};
use tracing::{error, info};

/// Name the operator reports under besides the overall ("") status
pub(crate) const HEALTH_SERVICE_NAME: &str = "entando.k8s.operator";

/// Process wide liveness flag. Once dead it never becomes alive again.
#[derive(Debug, Clone)]
pub(crate) struct Liveness {
    alive: Arc<watch::Sender<bool>>,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub(crate) fn new() -> Self {
        let (alive, _) = watch::channel(true);
        Self {
            alive: Arc::new(alive),
        }
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.send_replace(false);
    }

    pub(crate) fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.alive.subscribe()
    }
}

fn serving_status(alive: bool) -> ServingStatus {
    if alive {
        ServingStatus::Serving
    } else {
        ServingStatus::NotServing
    }
}

/// Mirror `liveness` into the health reporter until the flag turns dead
async fn report_liveness(mut reporter: HealthReporter, liveness: Liveness) {
    let mut alive = liveness.subscribe();
    loop {
        let status = serving_status(*alive.borrow_and_update());
        reporter.set_service_status("", status).await;
        reporter
            .set_service_status(HEALTH_SERVICE_NAME, status)
            .await;
        if status == ServingStatus::NotServing || alive.changed().await.is_err() {
            return;
        }
    }
}

/// Serve `grpc.health.v1.Health` on `port` for the kubelet's liveness probe
pub(crate) async fn serve(liveness: Liveness, port: u16) -> Result<(), tonic::transport::Error> {
    let (reporter, health_service) = tonic_health::server::health_reporter();
    tokio::spawn(report_liveness(reporter, liveness));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Serving health checks on {addr}");
    let served = Server::builder()
        .add_service(health_service)
        .serve(addr)
        .await;
    if let Err(e) = &served {
        error!("Health server stopped: {e}");
    }
    served
}
