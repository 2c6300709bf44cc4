//! The kernel networking facility the link and bridge primitives are built on.
//!
//! Everything that touches host state goes through [`Netlink`]. Production code
//! uses [`IpRoute2`], which drives the iproute2 and ebtables tools. Tests use
//! [`FakeNetlink`], an in-memory model of the same state.

mod command;
#[cfg(any(test, feature = "testing"))]
mod fake;

use std::fmt;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use thiserror::Error;

pub use command::IpRoute2;
#[cfg(any(test, feature = "testing"))]
pub use fake::{FakeNetlink, Mutation};

pub const EBTABLES_TABLE_BROUTE: &str = "broute";
pub const EBTABLES_CHAIN_BROUTING: &str = "BROUTING";

#[derive(Debug)]
pub struct CommandFailureInfo {
    pub command: String,
    pub status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command [{}] failed with status: {}",
            self.command, self.status
        )?;
        write!(f, "  stderr: {}", self.stderr.trim())
    }
}

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("object already exists")]
    AlreadyExists,

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error("failed to parse output of [{command}]: {reason}")]
    Parse { command: String, reason: String },

    #[error("{0}")]
    Rejected(String),
}

pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Attributes of a kernel network interface as last read from the kernel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkAttrs {
    pub index: u32,
    pub name: String,
    /// `info_kind` of the link, `Some("bridge")` for bridges.
    pub kind: Option<String>,
    pub hardware_addr: Option<String>,
    /// Name of the master device this link is enslaved to.
    pub master: Option<String>,
    pub promisc: bool,
    /// Administrative state.
    pub up: bool,
    pub vlan_filtering: bool,
}

impl LinkAttrs {
    pub fn is_bridge(&self) -> bool {
        self.kind.as_deref() == Some("bridge")
    }
}

/// An IPv4 address assigned to an interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Addr {
    pub network: Ipv4Network,
    pub broadcast: Option<Ipv4Addr>,
    pub label: Option<String>,
}

impl Addr {
    pub fn new(network: Ipv4Network) -> Self {
        Self {
            network,
            broadcast: None,
            label: None,
        }
    }

    /// Two addresses are the same assignment when address and prefix match;
    /// broadcast and label are presentation details.
    pub fn same_assignment(&self, other: &Addr) -> bool {
        self.network.ip() == other.network.ip() && self.network.prefix() == other.network.prefix()
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.network)
    }
}

/// An IPv4 route in the main table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Route {
    /// `None` is the default route.
    pub dst: Option<Ipv4Network>,
    pub gateway: Option<Ipv4Addr>,
    pub dev: String,
    pub protocol: Option<String>,
    pub scope: Option<String>,
    pub src: Option<Ipv4Addr>,
    pub metric: Option<u32>,
}

impl Route {
    /// Same route pointed at another device.
    pub fn via_dev(&self, dev: &str) -> Route {
        Route {
            dev: dev.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dst {
            Some(dst) => write!(f, "{dst}")?,
            None => write!(f, "default")?,
        }
        if let Some(gw) = self.gateway {
            write!(f, " via {gw}")?;
        }
        write!(f, " dev {}", self.dev)?;
        if let Some(proto) = &self.protocol {
            write!(f, " proto {proto}")?;
        }
        if let Some(scope) = &self.scope {
            write!(f, " scope {scope}")?;
        }
        if let Some(src) = self.src {
            write!(f, " src {src}")?;
        }
        if let Some(metric) = self.metric {
            write!(f, " metric {metric}")?;
        }
        Ok(())
    }
}

/// Flags of a bridge VLAN filter entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VlanFlags {
    pub pvid: bool,
    pub untagged: bool,
    pub self_: bool,
    pub master: bool,
}

impl VlanFlags {
    /// Tagged entry on the bridge port, configured through the master.
    pub const TAGGED_MASTER: VlanFlags = VlanFlags {
        pvid: false,
        untagged: false,
        self_: false,
        master: true,
    };
}

/// Kernel networking operations used by the link and bridge primitives.
///
/// Implementations report "already exists" and "not found" conditions through
/// [`KernelError::AlreadyExists`] and [`KernelError::NotFound`] so callers can
/// treat them as convergence outcomes.
pub trait Netlink: Send + Sync {
    fn link_by_name(&self, name: &str) -> KernelResult<LinkAttrs>;
    /// Links enslaved to `master`.
    fn link_list_by_master(&self, master: &str) -> KernelResult<Vec<LinkAttrs>>;
    fn link_add_bridge(&self, name: &str, vlan_filtering: bool) -> KernelResult<()>;
    fn link_del(&self, name: &str) -> KernelResult<()>;
    fn link_set_master(&self, link: &str, master: &str) -> KernelResult<()>;
    fn link_set_nomaster(&self, link: &str) -> KernelResult<()>;
    fn link_set_promisc_on(&self, link: &str) -> KernelResult<()>;
    fn link_set_up(&self, link: &str) -> KernelResult<()>;
    fn link_set_vlan_filtering(&self, bridge: &str, on: bool) -> KernelResult<()>;

    fn addr_list(&self, link: &str) -> KernelResult<Vec<Addr>>;
    fn addr_replace(&self, link: &str, addr: &Addr) -> KernelResult<()>;
    fn addr_del(&self, link: &str, addr: &Addr) -> KernelResult<()>;

    fn route_list(&self, link: &str) -> KernelResult<Vec<Route>>;
    fn route_replace(&self, route: &Route) -> KernelResult<()>;
    fn route_del(&self, route: &Route) -> KernelResult<()>;

    /// VLAN ids configured on a bridge port, the PVID included.
    fn bridge_vlan_list(&self, link: &str) -> KernelResult<Vec<u16>>;
    fn bridge_vlan_add(&self, link: &str, vid: u16, flags: VlanFlags) -> KernelResult<()>;
    fn bridge_vlan_del(&self, link: &str, vid: u16, flags: VlanFlags) -> KernelResult<()>;

    fn ebtables_rule_exists(&self, table: &str, chain: &str, rule: &[String])
    -> KernelResult<bool>;
    fn ebtables_append(&self, table: &str, chain: &str, rule: &[String]) -> KernelResult<()>;
    fn ebtables_delete(&self, table: &str, chain: &str, rule: &[String]) -> KernelResult<()>;
}

/// Formats a hardware address the way ebtables prints it back: lower case
/// with leading zeros of each octet dropped.
pub fn ebtables_mac(mac: &str) -> String {
    mac.split(':')
        .map(|octet| {
            let trimmed = octet.trim_start_matches('0');
            if trimmed.is_empty() {
                "0".to_string()
            } else {
                trimmed.to_ascii_lowercase()
            }
        })
        .collect::<Vec<_>>()
        .join(":")
}
