use std::time::Duration;

use hostnet_k8s_utils::MetricLabel;
use kube::runtime::finalizer;
use thiserror::Error;

const ERROR_REQUEUE_DURATION: Duration = Duration::from_secs(5);
const NOT_SELECTED_REQUEUE_DURATION: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("kube utils error: {0}")]
    KubeUtils(#[from] hostnet_k8s_utils::Error),

    #[error("decode error: {0}")]
    Decode(#[from] hostnet_crds::Error),

    #[error("network error: {0}")]
    Network(#[from] hostnet_iface::Error),

    #[error("setting {0} not found")]
    SettingNotFound(String),

    #[error("no nic selected in setting {0}")]
    NicNotSelected(String),

    #[error("uplink {0} is not attached to the bridge")]
    UplinkNotAttached(String),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("other error: {0}")]
    Other(String),
}

impl Error {
    /// How long to wait before the object is reconciled again.
    pub fn requeue_after(&self) -> Duration {
        match self {
            Error::SettingNotFound(_) | Error::NicNotSelected(_) | Error::UplinkNotAttached(_) => {
                NOT_SELECTED_REQUEUE_DURATION
            }
            _ => ERROR_REQUEUE_DURATION,
        }
    }
}

impl MetricLabel for Error {
    fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) | Error::KubeUtils(_) => "kube",
            Error::Decode(_) => "decode",
            Error::Network(e) if e.is_precondition() => "precondition",
            Error::Network(_) => "kernel",
            Error::SettingNotFound(_) | Error::NicNotSelected(_) => "setting",
            Error::UplinkNotAttached(_) => "uplink",
            Error::Join(_) | Error::Other(_) => "other",
        }
        .into()
    }
}

impl From<finalizer::Error<Error>> for Error {
    fn from(err: finalizer::Error<Error>) -> Self {
        match err {
            finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
            finalizer::Error::AddFinalizer(e) | finalizer::Error::RemoveFinalizer(e) => {
                Error::KubeError(e)
            }
            finalizer::Error::UnnamedObject => Error::Other("object has no name".into()),
            finalizer::Error::InvalidFinalizer => Error::Other("invalid finalizer".into()),
        }
    }
}
