pub mod agent;
pub mod config;
pub mod controller;
pub mod http;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("crd error: {0}")]
    Crd(#[from] hostnet_crds::Error),

    #[error("agent error: {0}")]
    Agent(#[from] hostnet_agent_controller::Error),

    #[error("node controller error: {0}")]
    NodeController(#[from] hostnet_node_controller::Error),

    #[error("failed waiting for condition: {0}")]
    Wait(#[from] kube::runtime::wait::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
