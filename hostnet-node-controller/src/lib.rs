//! Control-plane reconcilers keeping one HostNetwork per node.

mod client;
mod context;
mod controller;
mod error;
mod runtime;

pub use client::{Created, KubeNodeClient, NodeKubeClient};
pub use context::Context;
pub use error::Error;
pub use runtime::start_node_controllers;

pub type Result<T, E = Error> = std::result::Result<T, E>;
