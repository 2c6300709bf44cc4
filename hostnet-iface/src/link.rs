use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::kernel::{
    EBTABLES_CHAIN_BROUTING, EBTABLES_TABLE_BROUTE, KernelError, LinkAttrs, Netlink, Route,
    VlanFlags, ebtables_mac,
};
use crate::{Error, Result};

/// Default port VLAN id. Always present on a bridge port, never managed.
pub const DEFAULT_PVID: u16 = 1;

/// Anything backed by a named kernel interface.
pub trait Interface {
    fn name(&self) -> &str;
}

/// What happened to a single route while migrating it to another interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Replaced,
    /// Replace failed and the route was dropped from its source interface.
    Removed,
    /// Neither replace nor the fallback delete succeeded.
    Failed(String),
}

/// A kernel network interface.
pub struct Link<N> {
    pub(crate) netlink: Arc<N>,
    pub(crate) attrs: LinkAttrs,
}

impl<N> Interface for Link<N> {
    fn name(&self) -> &str {
        &self.attrs.name
    }
}

impl<N: Netlink> Link<N> {
    pub fn get(netlink: Arc<N>, name: &str) -> Result<Self> {
        let attrs = netlink
            .link_by_name(name)
            .map_err(Error::kernel("get link", name))?;
        Ok(Self { netlink, attrs })
    }

    pub fn attrs(&self) -> &LinkAttrs {
        &self.attrs
    }

    pub fn refresh(&mut self) -> Result<()> {
        self.attrs = self
            .netlink
            .link_by_name(&self.attrs.name)
            .map_err(Error::kernel("get link", &self.attrs.name))?;
        Ok(())
    }

    pub fn add_bridge_vlan(&self, vid: u16) -> Result<()> {
        if vid == DEFAULT_PVID {
            return Ok(());
        }
        self.netlink
            .bridge_vlan_add(&self.attrs.name, vid, VlanFlags::TAGGED_MASTER)
            .map_err(Error::kernel_vlan("add bridge vlan", &self.attrs.name, vid))
    }

    /// VLAN ids the port carries besides the default PVID.
    pub fn bridge_vlans(&self) -> Result<BTreeSet<u16>> {
        let vids = self
            .netlink
            .bridge_vlan_list(&self.attrs.name)
            .map_err(Error::kernel("list bridge vlans", &self.attrs.name))?;
        Ok(vids.into_iter().filter(|vid| *vid != DEFAULT_PVID).collect())
    }

    /// Removing an entry the port does not carry is not an error.
    pub fn del_bridge_vlan(&self, vid: u16) -> Result<()> {
        if vid == DEFAULT_PVID {
            return Ok(());
        }
        match self
            .netlink
            .bridge_vlan_del(&self.attrs.name, vid, VlanFlags::TAGGED_MASTER)
        {
            Ok(()) => Ok(()),
            Err(KernelError::NotFound(_)) => {
                debug!(link = %self.attrs.name, vid, "vlan already absent");
                Ok(())
            }
            Err(e) => Err(Error::kernel_vlan("delete bridge vlan", &self.attrs.name, vid)(e)),
        }
    }

    pub fn set_master(&mut self, bridge: &Bridge<N>) -> Result<()> {
        if self.attrs.master.as_deref() == Some(bridge.name()) {
            debug!(link = %self.attrs.name, bridge = %bridge.name(), "already enslaved");
            return Ok(());
        }
        self.netlink
            .link_set_master(&self.attrs.name, bridge.name())
            .map_err(Error::kernel("set master", &self.attrs.name))?;
        self.attrs.master = Some(bridge.name().to_string());
        Ok(())
    }

    pub fn set_no_master(&mut self) -> Result<()> {
        self.netlink
            .link_set_nomaster(&self.attrs.name)
            .map_err(Error::kernel("set nomaster", &self.attrs.name))?;
        self.attrs.master = None;
        Ok(())
    }

    /// Drops DHCP traffic addressed to this interface's own hardware address
    /// before the bridge sees it.
    pub fn set_rules_for_dhcp(&self) -> Result<()> {
        if self.has_rules_for_dhcp()? {
            return Ok(());
        }
        let rule = self.dhcp_rule()?;
        self.netlink
            .ebtables_append(EBTABLES_TABLE_BROUTE, EBTABLES_CHAIN_BROUTING, &rule)
            .map_err(Error::kernel("append dhcp rule", &self.attrs.name))
    }

    pub fn unset_rules_for_dhcp(&self) -> Result<()> {
        if !self.has_rules_for_dhcp()? {
            return Ok(());
        }
        let rule = self.dhcp_rule()?;
        self.netlink
            .ebtables_delete(EBTABLES_TABLE_BROUTE, EBTABLES_CHAIN_BROUTING, &rule)
            .map_err(Error::kernel("delete dhcp rule", &self.attrs.name))
    }

    /// The DHCP drop rule marks a link as a VLAN network's uplink.
    pub fn has_rules_for_dhcp(&self) -> Result<bool> {
        let rule = self.dhcp_rule()?;
        self.netlink
            .ebtables_rule_exists(EBTABLES_TABLE_BROUTE, EBTABLES_CHAIN_BROUTING, &rule)
            .map_err(Error::kernel("list dhcp rule", &self.attrs.name))
    }

    fn dhcp_rule(&self) -> Result<Vec<String>> {
        let mac = self
            .attrs
            .hardware_addr
            .as_deref()
            .ok_or_else(|| Error::MissingHardwareAddr(self.attrs.name.clone()))?;
        let mac = ebtables_mac(mac);
        Ok([
            "-p",
            "IPv4",
            "-d",
            mac.as_str(),
            "-i",
            self.attrs.name.as_str(),
            "--ip-proto",
            "udp",
            "--ip-dport",
            "67:68",
            "-j",
            "DROP",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect())
    }

    /// Moves every route of `from` onto this link. Routes that can not be
    /// re-pointed are dropped from `from`; per-route failures are logged only.
    pub fn replace_routes(&self, from: &impl Interface) -> Result<()> {
        for (route, outcome) in self.migrate_routes(from)? {
            match outcome {
                RouteOutcome::Replaced => debug!(%route, to = %self.attrs.name, "route moved"),
                RouteOutcome::Removed => {
                    warn!(%route, to = %self.attrs.name, "route could not be moved, removed")
                }
                RouteOutcome::Failed(reason) => {
                    warn!(%route, to = %self.attrs.name, %reason, "route migration failed")
                }
            }
        }
        Ok(())
    }

    pub(crate) fn migrate_routes(&self, from: &impl Interface) -> Result<Vec<(Route, RouteOutcome)>> {
        let routes = self
            .netlink
            .route_list(from.name())
            .map_err(Error::kernel("list routes", from.name()))?;

        Ok(routes
            .into_iter()
            .map(|route| {
                let outcome = match self.netlink.route_replace(&route.via_dev(&self.attrs.name)) {
                    Ok(()) => RouteOutcome::Replaced,
                    Err(replace_err) => match self.netlink.route_del(&route) {
                        Ok(()) => RouteOutcome::Removed,
                        Err(del_err) => {
                            RouteOutcome::Failed(format!("replace: {replace_err}, delete: {del_err}"))
                        }
                    },
                };
                (route, outcome)
            })
            .collect())
    }
}
