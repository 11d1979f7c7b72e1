use crate::observer::ObserveError;

/// Errors which stop the operator
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("Invalid operator configuration: {0}")]
    Config(#[from] envconfig::Error),
    // Wrapper for Kubernetes error
    #[error("Kubernetes reported error: {0}")]
    KubeError(kube::Error),
    #[error(transparent)]
    Observe(#[from] ObserveError),
    #[error("Health server failed: {0}")]
    Health(#[from] tonic::transport::Error),
    #[error("Error installing signal handler: {0}")]
    Signal(std::io::Error),
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Self::KubeError(e)
    }
}
