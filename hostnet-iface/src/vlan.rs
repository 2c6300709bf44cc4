use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

use crate::bridge::Bridge;
use crate::kernel::{Netlink, Route};
use crate::link::{Interface, Link};
use crate::locks::InterfaceLocks;
use crate::{Error, Result};

/// Extra configuration applied once a network is set up.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    pub routes: Vec<Route>,
}

/// An L2 network domain isolated from others on the same host.
pub trait IsolatedNetwork {
    /// Attaches `nic` and moves its L3 configuration onto the network.
    fn setup(&mut self, nic: &str, conf: NetworkConfig) -> Result<()>;

    /// Detaches the nic and destroys the network.
    fn repeal(&mut self) -> Result<()>;

    fn add_local_area(&self, id: u16) -> Result<()>;

    fn remove_local_area(&self, id: u16) -> Result<()>;

    /// Drift detection hook. Convergence is event driven, so nothing runs here.
    fn monitor(&self) {}
}

/// A bridge with VLAN filtering and a physical uplink.
pub struct Vlan<N> {
    bridge: Bridge<N>,
    nic: Option<Link<N>>,
}

impl<N: Netlink> Vlan<N> {
    pub fn new(netlink: Arc<N>, bridge: &str) -> Self {
        Self {
            bridge: Bridge::new(netlink, bridge),
            nic: None,
        }
    }

    /// A network whose uplink is already known, e.g. to manage VLAN
    /// membership without going through [`IsolatedNetwork::setup`].
    pub fn with_nic(netlink: Arc<N>, bridge: &str, nic: &str) -> Result<Self> {
        let nic = Link::get(netlink.clone(), nic)?;
        Ok(Self {
            bridge: Bridge::new(netlink, bridge),
            nic: Some(nic),
        })
    }

    /// The network as the kernel has it: `None` when the bridge is absent
    /// or has no uplink enslaved.
    pub fn attached(netlink: Arc<N>, bridge: &str) -> Result<Option<Self>> {
        let mut vlan = Self::new(netlink, bridge);
        if !vlan.bridge.exists()? {
            return Ok(None);
        }
        vlan.nic = vlan.uplinks()?.into_iter().next();
        Ok(vlan.nic.is_some().then_some(vlan))
    }

    /// Bridge ports carrying the uplink DHCP rule. Other ports, such as
    /// workload veths, are not uplinks.
    pub fn uplinks(&self) -> Result<Vec<Link<N>>> {
        let mut uplinks = Vec::new();
        for slave in self.bridge.slaves()? {
            if slave.attrs.hardware_addr.is_some() && slave.has_rules_for_dhcp()? {
                uplinks.push(slave);
            }
        }
        Ok(uplinks)
    }

    /// VLAN ids carried by the attached uplink.
    pub fn local_areas(&self) -> Result<BTreeSet<u16>> {
        self.attached_nic()?.bridge_vlans()
    }

    /// Detaches an uplink other than `keep` left behind by an earlier setup.
    fn release_stale_uplinks(&self, keep: &str) -> Result<()> {
        for mut stale in self.uplinks()? {
            if stale.name() == keep {
                continue;
            }
            stale.unset_rules_for_dhcp()?;
            stale.replace_routes(&self.bridge)?;
            stale.set_no_master()?;
            info!(bridge = %self.bridge.name(), nic = %stale.name(), "released stale uplink");
        }
        Ok(())
    }

    pub fn bridge(&self) -> &Bridge<N> {
        &self.bridge
    }

    pub fn nic(&self) -> Option<&Link<N>> {
        self.nic.as_ref()
    }

    fn attached_nic(&self) -> Result<&Link<N>> {
        self.nic
            .as_ref()
            .ok_or_else(|| Error::NicNotAttached(self.bridge.name().to_string()))
    }
}

impl<N: Netlink> IsolatedNetwork for Vlan<N> {
    fn setup(&mut self, nic: &str, conf: NetworkConfig) -> Result<()> {
        self.bridge.ensure()?;
        self.release_stale_uplinks(nic)?;

        let mut nic = Link::get(self.bridge.as_link().netlink.clone(), nic)?;
        nic.set_master(&self.bridge)?;

        nic.set_rules_for_dhcp()?;
        self.bridge.config_ipv4_addr_from_slave(&nic, &conf.routes)?;

        info!(bridge = %self.bridge.name(), nic = %nic.name(), "vlan network set up");
        self.nic = Some(nic);
        Ok(())
    }

    fn repeal(&mut self) -> Result<()> {
        let Some(nic) = self.nic.as_ref() else {
            return Err(Error::RepealWithoutNic(self.bridge.name().to_string()));
        };

        nic.unset_rules_for_dhcp()?;
        nic.replace_routes(&self.bridge)?;
        self.bridge.delete()?;

        info!(bridge = %self.bridge.name(), nic = %nic.name(), "vlan network repealed");
        self.nic = None;
        Ok(())
    }

    fn add_local_area(&self, id: u16) -> Result<()> {
        self.attached_nic()?.add_bridge_vlan(id)
    }

    fn remove_local_area(&self, id: u16) -> Result<()> {
        self.attached_nic()?.del_bridge_vlan(id)
    }
}

/// Entry point to the host's networking: builds networks over a shared
/// kernel handle and serializes work per bridge.
pub struct HostNetworking<N> {
    netlink: Arc<N>,
    locks: InterfaceLocks,
}

impl<N> Clone for HostNetworking<N> {
    fn clone(&self) -> Self {
        Self {
            netlink: self.netlink.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<N: Netlink> HostNetworking<N> {
    pub fn new(netlink: N) -> Self {
        Self {
            netlink: Arc::new(netlink),
            locks: InterfaceLocks::new(),
        }
    }

    pub fn from_arc(netlink: Arc<N>) -> Self {
        Self {
            netlink,
            locks: InterfaceLocks::new(),
        }
    }

    pub fn netlink(&self) -> &Arc<N> {
        &self.netlink
    }

    pub fn vlan(&self, bridge: &str) -> Vlan<N> {
        Vlan::new(self.netlink.clone(), bridge)
    }

    pub fn vlan_with_nic(&self, bridge: &str, nic: &str) -> Result<Vlan<N>> {
        Vlan::with_nic(self.netlink.clone(), bridge, nic)
    }

    /// The network currently built on `bridge`, discovered from the kernel.
    pub fn attached_vlan(&self, bridge: &str) -> Result<Option<Vlan<N>>> {
        Vlan::attached(self.netlink.clone(), bridge)
    }

    /// Runs `f` holding the lock for `bridge`.
    pub fn locked<T>(&self, bridge: &str, f: impl FnOnce(&Self) -> T) -> T {
        self.locks.run(bridge, || f(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{FakeNetlink, Mutation};

    fn host() -> Arc<FakeNetlink> {
        Arc::new(
            FakeNetlink::new()
                .with_link("eth1", "52:54:00:0a:34:f6")
                .with_addr("eth1", "10.0.0.5/24")
                .with_route(Route {
                    dst: Some("10.0.0.0/24".parse().unwrap()),
                    dev: "eth1".into(),
                    protocol: Some("kernel".into()),
                    scope: Some("link".into()),
                    src: Some("10.0.0.5".parse().unwrap()),
                    ..Default::default()
                })
                .with_route(Route {
                    gateway: Some("10.0.0.1".parse().unwrap()),
                    dev: "eth1".into(),
                    ..Default::default()
                }),
        )
    }

    #[test]
    fn test_setup_attaches_and_migrates() {
        let nl = host();
        let mut vlan = Vlan::new(nl.clone(), "br0");
        vlan.setup("eth1", NetworkConfig::default()).unwrap();

        assert_eq!(nl.link("eth1").unwrap().master.as_deref(), Some("br0"));
        assert_eq!(nl.addrs("br0"), vec!["10.0.0.5/24".parse().unwrap()]);
        assert!(nl.routes("eth1").is_empty());
        assert_eq!(nl.routes("br0").len(), 2);
        assert_eq!(nl.ebtables_rules().len(), 1);
        assert_eq!(vlan.nic().map(|n| n.name()), Some("eth1"));

        // a second setup converges without new mutations
        nl.clear_mutations();
        vlan.setup("eth1", NetworkConfig::default()).unwrap();
        assert!(nl.mutations().is_empty());
    }

    #[test]
    fn test_setup_orders_l2_before_l3() {
        let nl = host();
        let mut vlan = Vlan::new(nl.clone(), "br0");
        vlan.setup("eth1", NetworkConfig::default()).unwrap();

        let muts = nl.mutations();
        let pos = |f: &dyn Fn(&Mutation) -> bool| muts.iter().position(f).unwrap();
        let add = pos(&|m| matches!(m, Mutation::LinkAdd(_)));
        let up = pos(&|m| matches!(m, Mutation::SetUp(_)));
        let master = pos(&|m| matches!(m, Mutation::SetMaster { .. }));
        let rule = pos(&|m| matches!(m, Mutation::EbtablesAppend(_)));
        let addr = pos(&|m| matches!(m, Mutation::AddrReplace { .. }));
        let route = pos(&|m| matches!(m, Mutation::RouteReplace(_)));
        assert!(add < up && up < master && master < rule && rule < addr && addr < route);
    }

    #[test]
    fn test_setup_missing_nic_fails() {
        let nl = host();
        let mut vlan = Vlan::new(nl.clone(), "br0");
        assert!(matches!(
            vlan.setup("eth9", NetworkConfig::default()),
            Err(Error::Kernel { op: "get link", .. })
        ));
        assert!(vlan.nic().is_none());
    }

    #[test]
    fn test_repeal_tears_down() {
        let nl = host();
        let mut vlan = Vlan::new(nl.clone(), "br0");
        vlan.setup("eth1", NetworkConfig::default()).unwrap();
        vlan.repeal().unwrap();

        assert!(nl.link("br0").is_none());
        assert!(nl.ebtables_rules().is_empty());
        assert_eq!(nl.link("eth1").unwrap().master, None);
        assert!(!nl.routes("eth1").is_empty());
        assert!(vlan.nic().is_none());
    }

    #[test]
    fn test_repeal_without_nic_does_nothing() {
        let nl = host();
        let mut vlan = Vlan::new(nl.clone(), "br0");
        assert!(matches!(vlan.repeal(), Err(Error::RepealWithoutNic(_))));
        assert!(nl.mutations().is_empty());
    }

    #[test]
    fn test_local_area_requires_nic() {
        let nl = host();
        let vlan = Vlan::new(nl.clone(), "br0");
        let err = vlan.add_local_area(100).unwrap_err();
        assert!(err.is_precondition());
        assert!(err.to_string().contains("physical nic vlan network"));
        assert!(matches!(
            vlan.remove_local_area(100),
            Err(Error::NicNotAttached(_))
        ));
        assert!(nl.mutations().is_empty());
    }

    #[test]
    fn test_local_area_with_nic() {
        let nl = host();
        let networking = HostNetworking::from_arc(nl.clone());
        networking
            .locked("br0", |host| {
                host.vlan("br0").setup("eth1", NetworkConfig::default())?;
                let vlan = host.vlan_with_nic("br0", "eth1")?;
                vlan.add_local_area(100)?;
                vlan.add_local_area(100)?;
                vlan.monitor();
                Ok::<_, Error>(())
            })
            .unwrap();
        assert!(nl.vlans("eth1").contains(&100));

        let vlan = networking.vlan_with_nic("br0", "eth1").unwrap();
        assert_eq!(vlan.local_areas().unwrap(), BTreeSet::from([100]));
        vlan.remove_local_area(100).unwrap();
        vlan.remove_local_area(100).unwrap();
        assert!(nl.vlans("eth1").is_empty());
        assert!(networking.vlan("br0").nic().is_none());
    }

    #[test]
    fn test_local_area_on_unattached_nic_fails() {
        let nl = host();
        let vlan = Vlan::with_nic(nl.clone(), "br0", "eth1").unwrap();
        assert!(matches!(
            vlan.add_local_area(100),
            Err(Error::Kernel { op: "add bridge vlan", .. })
        ));
    }

    #[test]
    fn test_attached_is_discovered_from_kernel() {
        let nl = Arc::new(
            FakeNetlink::new()
                .with_link("eth1", "52:54:00:0a:34:f6")
                .with_link("veth0", "52:54:00:0a:34:f8"),
        );
        let networking = HostNetworking::from_arc(nl.clone());
        assert!(networking.attached_vlan("br0").unwrap().is_none());

        let mut bridge = Bridge::new(nl.clone(), "br0");
        bridge.ensure().unwrap();
        nl.link_set_master("veth0", "br0").unwrap();
        // a workload port alone is not an uplink
        assert!(networking.attached_vlan("br0").unwrap().is_none());

        networking
            .vlan("br0")
            .setup("eth1", NetworkConfig::default())
            .unwrap();
        let vlan = networking.attached_vlan("br0").unwrap().unwrap();
        assert_eq!(vlan.nic().map(|n| n.name()), Some("eth1"));
    }

    #[test]
    fn test_setup_releases_previous_uplink() {
        let nl = Arc::new(
            FakeNetlink::new()
                .with_link("eth1", "52:54:00:0a:34:f6")
                .with_link("eth2", "52:54:00:0a:34:f7")
                .with_link("veth0", "52:54:00:0a:34:f8"),
        );
        Vlan::new(nl.clone(), "br0")
            .setup("eth1", NetworkConfig::default())
            .unwrap();
        nl.link_set_master("veth0", "br0").unwrap();

        // a fresh handle knows nothing of eth1
        Vlan::new(nl.clone(), "br0")
            .setup("eth2", NetworkConfig::default())
            .unwrap();

        assert_eq!(nl.link("eth1").unwrap().master, None);
        assert_eq!(nl.link("eth2").unwrap().master.as_deref(), Some("br0"));
        assert_eq!(nl.link("veth0").unwrap().master.as_deref(), Some("br0"));
        assert_eq!(nl.ebtables_rules().len(), 1);
        assert!(nl.ebtables_rules()[0].contains(&"eth2".to_string()));
    }
}
