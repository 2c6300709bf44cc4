//! In-memory [`Netlink`] for tests.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ipnetwork::Ipv4Network;

use super::{Addr, KernelError, KernelResult, LinkAttrs, Netlink, Route, VlanFlags};

/// A state-changing call observed by [`FakeNetlink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    LinkAdd(String),
    LinkDel(String),
    SetMaster { link: String, master: String },
    SetNoMaster(String),
    SetPromisc(String),
    SetUp(String),
    SetVlanFiltering { bridge: String, on: bool },
    AddrReplace { link: String, addr: Ipv4Network },
    AddrDel { link: String, addr: Ipv4Network },
    RouteReplace(Route),
    RouteDel(Route),
    VlanAdd { link: String, vid: u16 },
    VlanDel { link: String, vid: u16 },
    EbtablesAppend(Vec<String>),
    EbtablesDelete(Vec<String>),
}

#[derive(Default)]
struct FakeLink {
    attrs: LinkAttrs,
    addrs: Vec<Addr>,
    vlans: BTreeSet<u16>,
}

#[derive(Default)]
struct State {
    links: BTreeMap<String, FakeLink>,
    next_index: u32,
    routes: Vec<Route>,
    ebtables: Vec<(String, String, Vec<String>)>,
    unreplaceable: HashSet<Option<Ipv4Network>>,
    mutations: Vec<Mutation>,
}

#[derive(Default)]
pub struct FakeNetlink {
    state: Mutex<State>,
}

impl FakeNetlink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a physical interface with the given hardware address.
    pub fn with_link(self, name: &str, mac: &str) -> Self {
        {
            let mut state = self.state();
            state.next_index += 1;
            let index = state.next_index;
            state.links.insert(
                name.to_string(),
                FakeLink {
                    attrs: LinkAttrs {
                        index,
                        name: name.to_string(),
                        hardware_addr: Some(mac.to_string()),
                        up: true,
                        ..Default::default()
                    },
                    ..Default::default()
                },
            );
        }
        self
    }

    /// Adds a device of an arbitrary kind, e.g. an existing bridge.
    pub fn with_device(self, attrs: LinkAttrs) -> Self {
        {
            let mut state = self.state();
            state.next_index += 1;
            let index = state.next_index;
            state.links.insert(
                attrs.name.clone(),
                FakeLink {
                    attrs: LinkAttrs { index, ..attrs },
                    ..Default::default()
                },
            );
        }
        self
    }

    pub fn with_addr(self, link: &str, addr: &str) -> Self {
        {
            let mut state = self.state();
            if let Some(l) = state.links.get_mut(link) {
                let network = addr.parse().unwrap_or_else(|e| panic!("bad addr {addr}: {e}"));
                l.addrs.push(Addr {
                    network,
                    broadcast: None,
                    label: Some(link.to_string()),
                });
            }
        }
        self
    }

    pub fn with_route(self, route: Route) -> Self {
        self.state().routes.push(route);
        self
    }

    /// Enslaves `link` to `master` without recording a mutation.
    pub fn with_master(self, link: &str, master: &str) -> Self {
        if let Some(l) = self.state().links.get_mut(link) {
            l.attrs.master = Some(master.to_string());
        }
        self
    }

    pub fn with_vlan(self, link: &str, vid: u16) -> Self {
        if let Some(l) = self.state().links.get_mut(link) {
            l.vlans.insert(vid);
        }
        self
    }

    /// Routes to `dst` can not be re-pointed at another device, like the
    /// kernel's own prefix routes.
    pub fn with_unreplaceable_route(self, dst: Option<Ipv4Network>) -> Self {
        self.state().unreplaceable.insert(dst);
        self
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.state().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.state().mutations.clear();
    }

    pub fn vlans(&self, link: &str) -> BTreeSet<u16> {
        self.state()
            .links
            .get(link)
            .map(|l| l.vlans.clone())
            .unwrap_or_default()
    }

    pub fn addrs(&self, link: &str) -> Vec<Ipv4Network> {
        self.state()
            .links
            .get(link)
            .map(|l| l.addrs.iter().map(|a| a.network).collect())
            .unwrap_or_default()
    }

    pub fn routes(&self, dev: &str) -> Vec<Route> {
        self.state()
            .routes
            .iter()
            .filter(|r| r.dev == dev)
            .cloned()
            .collect()
    }

    pub fn link(&self, name: &str) -> Option<LinkAttrs> {
        self.state().links.get(name).map(|l| l.attrs.clone())
    }

    pub fn ebtables_rules(&self) -> Vec<Vec<String>> {
        self.state()
            .ebtables
            .iter()
            .map(|(_, _, rule)| rule.clone())
            .collect()
    }
}

fn not_found(name: &str) -> KernelError {
    KernelError::NotFound(format!("Device \"{name}\" does not exist."))
}

impl State {
    fn link_mut(&mut self, name: &str) -> KernelResult<&mut FakeLink> {
        self.links.get_mut(name).ok_or_else(|| not_found(name))
    }

    /// VLAN entries configured through the master only exist on bridge
    /// ports; the kernel answers EOPNOTSUPP for anything else.
    fn port_mut(&mut self, name: &str) -> KernelResult<&mut FakeLink> {
        let link = self.link_mut(name)?;
        if link.attrs.master.is_none() {
            return Err(KernelError::Rejected(format!(
                "{name}: RTNETLINK answers: Operation not supported"
            )));
        }
        Ok(link)
    }

    fn record(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }
}

impl Netlink for FakeNetlink {
    fn link_by_name(&self, name: &str) -> KernelResult<LinkAttrs> {
        self.state()
            .links
            .get(name)
            .map(|l| l.attrs.clone())
            .ok_or_else(|| not_found(name))
    }

    fn link_list_by_master(&self, master: &str) -> KernelResult<Vec<LinkAttrs>> {
        let state = self.state();
        if !state.links.contains_key(master) {
            return Err(not_found(master));
        }
        Ok(state
            .links
            .values()
            .filter(|l| l.attrs.master.as_deref() == Some(master))
            .map(|l| l.attrs.clone())
            .collect())
    }

    fn link_add_bridge(&self, name: &str, vlan_filtering: bool) -> KernelResult<()> {
        let mut state = self.state();
        if state.links.contains_key(name) {
            return Err(KernelError::AlreadyExists);
        }
        state.next_index += 1;
        let index = state.next_index;
        state.links.insert(
            name.to_string(),
            FakeLink {
                attrs: LinkAttrs {
                    index,
                    name: name.to_string(),
                    kind: Some("bridge".into()),
                    hardware_addr: Some("02:00:00:00:00:01".into()),
                    vlan_filtering,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        state.record(Mutation::LinkAdd(name.to_string()));
        Ok(())
    }

    fn link_del(&self, name: &str) -> KernelResult<()> {
        let mut state = self.state();
        if state.links.remove(name).is_none() {
            return Err(not_found(name));
        }
        for link in state.links.values_mut() {
            if link.attrs.master.as_deref() == Some(name) {
                link.attrs.master = None;
                link.vlans.clear();
            }
        }
        state.routes.retain(|r| r.dev != name);
        state.record(Mutation::LinkDel(name.to_string()));
        Ok(())
    }

    fn link_set_master(&self, link: &str, master: &str) -> KernelResult<()> {
        let mut state = self.state();
        match state.links.get(master) {
            Some(m) if m.attrs.is_bridge() => {}
            Some(_) => return Err(KernelError::Rejected(format!("{master} is not a master"))),
            None => return Err(not_found(master)),
        }
        state.link_mut(link)?.attrs.master = Some(master.to_string());
        state.record(Mutation::SetMaster {
            link: link.to_string(),
            master: master.to_string(),
        });
        Ok(())
    }

    fn link_set_nomaster(&self, link: &str) -> KernelResult<()> {
        let mut state = self.state();
        let l = state.link_mut(link)?;
        l.attrs.master = None;
        l.vlans.clear();
        state.record(Mutation::SetNoMaster(link.to_string()));
        Ok(())
    }

    fn link_set_promisc_on(&self, link: &str) -> KernelResult<()> {
        let mut state = self.state();
        state.link_mut(link)?.attrs.promisc = true;
        state.record(Mutation::SetPromisc(link.to_string()));
        Ok(())
    }

    fn link_set_up(&self, link: &str) -> KernelResult<()> {
        let mut state = self.state();
        state.link_mut(link)?.attrs.up = true;
        state.record(Mutation::SetUp(link.to_string()));
        Ok(())
    }

    fn link_set_vlan_filtering(&self, bridge: &str, on: bool) -> KernelResult<()> {
        let mut state = self.state();
        state.link_mut(bridge)?.attrs.vlan_filtering = on;
        state.record(Mutation::SetVlanFiltering {
            bridge: bridge.to_string(),
            on,
        });
        Ok(())
    }

    fn addr_list(&self, link: &str) -> KernelResult<Vec<Addr>> {
        let mut state = self.state();
        Ok(state.link_mut(link)?.addrs.clone())
    }

    fn addr_replace(&self, link: &str, addr: &Addr) -> KernelResult<()> {
        let mut state = self.state();
        let l = state.link_mut(link)?;
        l.addrs.retain(|a| !a.same_assignment(addr));
        l.addrs.push(Addr {
            label: Some(link.to_string()),
            ..addr.clone()
        });
        state.record(Mutation::AddrReplace {
            link: link.to_string(),
            addr: addr.network,
        });
        Ok(())
    }

    fn addr_del(&self, link: &str, addr: &Addr) -> KernelResult<()> {
        let mut state = self.state();
        let l = state.link_mut(link)?;
        let before = l.addrs.len();
        l.addrs.retain(|a| !a.same_assignment(addr));
        if l.addrs.len() == before {
            return Err(KernelError::Rejected(format!(
                "address {addr} not assigned to {link}"
            )));
        }
        state.record(Mutation::AddrDel {
            link: link.to_string(),
            addr: addr.network,
        });
        Ok(())
    }

    fn route_list(&self, link: &str) -> KernelResult<Vec<Route>> {
        let state = self.state();
        if !state.links.contains_key(link) {
            return Err(not_found(link));
        }
        Ok(state
            .routes
            .iter()
            .filter(|r| r.dev == link)
            .cloned()
            .collect())
    }

    fn route_replace(&self, route: &Route) -> KernelResult<()> {
        let mut state = self.state();
        if !state.links.contains_key(&route.dev) {
            return Err(not_found(&route.dev));
        }
        if state.unreplaceable.contains(&route.dst) {
            return Err(KernelError::Rejected(format!(
                "route {route} can not be replaced"
            )));
        }
        // the kernel keys main-table routes on destination and metric
        state
            .routes
            .retain(|r| !(r.dst == route.dst && r.metric == route.metric));
        state.routes.push(route.clone());
        state.record(Mutation::RouteReplace(route.clone()));
        Ok(())
    }

    fn route_del(&self, route: &Route) -> KernelResult<()> {
        let mut state = self.state();
        let before = state.routes.len();
        state.routes.retain(|r| {
            !(r.dst == route.dst && r.dev == route.dev && r.metric == route.metric)
        });
        if state.routes.len() == before {
            return Err(KernelError::NotFound(format!("route {route}")));
        }
        state.record(Mutation::RouteDel(route.clone()));
        Ok(())
    }

    fn bridge_vlan_list(&self, link: &str) -> KernelResult<Vec<u16>> {
        let mut state = self.state();
        Ok(state.port_mut(link)?.vlans.iter().copied().collect())
    }

    fn bridge_vlan_add(&self, link: &str, vid: u16, _flags: VlanFlags) -> KernelResult<()> {
        let mut state = self.state();
        state.port_mut(link)?.vlans.insert(vid);
        state.record(Mutation::VlanAdd {
            link: link.to_string(),
            vid,
        });
        Ok(())
    }

    fn bridge_vlan_del(&self, link: &str, vid: u16, _flags: VlanFlags) -> KernelResult<()> {
        let mut state = self.state();
        if !state.port_mut(link)?.vlans.remove(&vid) {
            return Err(KernelError::NotFound(format!("vlan {vid} on {link}")));
        }
        state.record(Mutation::VlanDel {
            link: link.to_string(),
            vid,
        });
        Ok(())
    }

    fn ebtables_rule_exists(
        &self,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> KernelResult<bool> {
        Ok(self
            .state()
            .ebtables
            .iter()
            .any(|(t, c, r)| t == table && c == chain && r == rule))
    }

    fn ebtables_append(&self, table: &str, chain: &str, rule: &[String]) -> KernelResult<()> {
        let mut state = self.state();
        state
            .ebtables
            .push((table.to_string(), chain.to_string(), rule.to_vec()));
        state.record(Mutation::EbtablesAppend(rule.to_vec()));
        Ok(())
    }

    fn ebtables_delete(&self, table: &str, chain: &str, rule: &[String]) -> KernelResult<()> {
        let mut state = self.state();
        let Some(pos) = state
            .ebtables
            .iter()
            .position(|(t, c, r)| t == table && c == chain && r == rule)
        else {
            return Err(KernelError::Rejected("rule not found".into()));
        };
        state.ebtables.remove(pos);
        state.record(Mutation::EbtablesDelete(rule.to_vec()));
        Ok(())
    }
}
