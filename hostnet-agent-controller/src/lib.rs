//! Per-node reconcilers converging host network state with the cluster's
//! attachments and network setting.

mod context;
mod controller;
mod error;
mod hostnetwork;
mod nad;
mod runtime;
mod setting;

pub use context::Context;
pub use error::Error;
pub use runtime::{AgentConfig, start_agent_controllers};

pub type Result<T, E = Error> = std::result::Result<T, E>;
