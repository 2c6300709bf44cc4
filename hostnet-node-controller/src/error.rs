use hostnet_k8s_utils::MetricLabel;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("kube utils error: {0}")]
    KubeUtils(#[from] hostnet_k8s_utils::Error),

    #[error("{kind} {name} has no uid")]
    MissingUid { kind: &'static str, name: String },

    #[error("other error: {0}")]
    Other(String),
}

impl MetricLabel for Error {
    fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) | Error::KubeUtils(_) => "kube",
            Error::MissingUid { .. } => "invalid_resource",
            Error::Other(_) => "other",
        }
        .into()
    }
}
