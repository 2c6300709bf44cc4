use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::kernel::{Addr, KernelError, LinkAttrs, Netlink, Route};
use crate::link::{Interface, Link};
use crate::{Error, Result};

/// A VLAN filtering bridge, named up front and materialized by [`Bridge::ensure`].
pub struct Bridge<N> {
    link: Link<N>,
}

impl<N> Interface for Bridge<N> {
    fn name(&self) -> &str {
        &self.link.attrs.name
    }
}

/// Elements of `a` with no matching assignment in `b`.
fn relative_complement(a: &[Addr], b: &[Addr]) -> Vec<Addr> {
    a.iter()
        .filter(|x| !b.iter().any(|y| x.same_assignment(y)))
        .cloned()
        .collect()
}

impl<N: Netlink> Bridge<N> {
    pub fn new(netlink: Arc<N>, name: &str) -> Self {
        Self {
            link: Link {
                netlink,
                attrs: LinkAttrs {
                    name: name.to_string(),
                    kind: Some("bridge".into()),
                    vlan_filtering: true,
                    ..Default::default()
                },
            },
        }
    }

    pub fn attrs(&self) -> &LinkAttrs {
        &self.link.attrs
    }

    pub fn as_link(&self) -> &Link<N> {
        &self.link
    }

    /// Whether a device with this bridge's name is present in the kernel.
    pub fn exists(&self) -> Result<bool> {
        match self.link.netlink.link_by_name(self.name()) {
            Ok(_) => Ok(true),
            Err(KernelError::NotFound(_)) => Ok(false),
            Err(e) => Err(Error::kernel("get link", self.name())(e)),
        }
    }

    fn fetch(&self) -> Result<LinkAttrs> {
        let attrs = self
            .link
            .netlink
            .link_by_name(self.name())
            .map_err(Error::kernel("get link", self.name()))?;
        if !attrs.is_bridge() {
            return Err(Error::NotABridge(attrs.name));
        }
        Ok(attrs)
    }

    /// Creates the bridge or adopts an existing one, then brings it into
    /// the promiscuous, up and VLAN filtering state.
    pub fn ensure(&mut self) -> Result<()> {
        let netlink = &self.link.netlink;
        let name = self.link.attrs.name.as_str();
        match netlink.link_add_bridge(name, true) {
            Ok(()) => info!(bridge = name, "created bridge"),
            Err(KernelError::AlreadyExists) => debug!(bridge = name, "adopting existing bridge"),
            Err(e) => return Err(Error::kernel("add bridge", name)(e)),
        }

        let current = self.fetch()?;
        let netlink = &self.link.netlink;
        let name = current.name.as_str();
        if !current.promisc {
            netlink
                .link_set_promisc_on(name)
                .map_err(Error::kernel("set promisc", name))?;
        }
        if !current.up {
            netlink
                .link_set_up(name)
                .map_err(Error::kernel("set up", name))?;
        }
        if !current.vlan_filtering {
            netlink
                .link_set_vlan_filtering(name, true)
                .map_err(Error::kernel("set vlan filtering", name))?;
        }

        self.link.attrs = self.fetch()?;
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        self.link
            .netlink
            .link_del(self.name())
            .map_err(Error::kernel("delete bridge", self.name()))
    }

    /// Links currently enslaved to the bridge.
    pub fn slaves(&self) -> Result<Vec<Link<N>>> {
        let links = self
            .link
            .netlink
            .link_list_by_master(self.name())
            .map_err(Error::kernel("list slaves", self.name()))?;
        Ok(links
            .into_iter()
            .map(|attrs| Link {
                netlink: self.link.netlink.clone(),
                attrs,
            })
            .collect())
    }

    pub fn list_addr(&self) -> Result<Vec<Addr>> {
        self.link
            .netlink
            .addr_list(self.name())
            .map_err(Error::kernel("list addresses", self.name()))
    }

    /// Removes the single address of the bridge. More than one address is
    /// an unsupported configuration and is refused.
    pub fn del_addr(&self) -> Result<()> {
        let addrs = self.list_addr()?;
        match addrs.as_slice() {
            [] => Ok(()),
            [addr] => self
                .link
                .netlink
                .addr_del(self.name(), addr)
                .map_err(Error::kernel("delete address", self.name())),
            _ => Err(Error::MultipleAddresses(self.name().to_string())),
        }
    }

    /// Makes the bridge's addresses exactly the slave's.
    fn sync_addrs_from(&self, slave: &Link<N>) -> Result<()> {
        let slave_addrs = self
            .link
            .netlink
            .addr_list(slave.name())
            .map_err(Error::kernel("list addresses", slave.name()))?;
        let bridge_addrs = self.list_addr()?;

        for addr in relative_complement(&slave_addrs, &bridge_addrs) {
            let addr = Addr { label: None, ..addr };
            self.link
                .netlink
                .addr_replace(self.name(), &addr)
                .map_err(Error::kernel("replace address", self.name()))?;
        }
        for addr in relative_complement(&bridge_addrs, &slave_addrs) {
            self.link
                .netlink
                .addr_del(self.name(), &addr)
                .map_err(Error::kernel("delete address", self.name()))?;
        }
        Ok(())
    }

    /// Takes over the slave's IPv4 addresses and routes, then applies
    /// `routes` on a best-effort basis. Routes without a device go via the
    /// bridge.
    pub fn config_ipv4_addr_from_slave(&self, slave: &Link<N>, routes: &[Route]) -> Result<()> {
        self.sync_addrs_from(slave)?;
        self.link.replace_routes(slave)?;

        for route in routes {
            let route = if route.dev.is_empty() {
                route.via_dev(self.name())
            } else {
                route.clone()
            };
            if let Err(error) = self.link.netlink.route_replace(&route) {
                warn!(%route, %error, "could not replace route");
            }
        }
        Ok(())
    }
}
