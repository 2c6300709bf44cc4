//! Host network primitives: links, VLAN filtering bridges and the VLAN
//! network built from them.

mod bridge;
mod error;
pub mod kernel;
mod link;
mod locks;
mod vlan;

pub use bridge::Bridge;
pub use error::{Error, Result};
pub use link::{DEFAULT_PVID, Interface, Link, RouteOutcome};
pub use locks::InterfaceLocks;
pub use vlan::{HostNetworking, IsolatedNetwork, NetworkConfig, Vlan};
