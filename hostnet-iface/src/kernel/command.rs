//! [`Netlink`] implemented on top of the iproute2 (`ip`, `bridge`) and
//! `ebtables` command line tools.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::{Command, Output};

use ipnetwork::Ipv4Network;
use serde::Deserialize;
use tracing::trace;

use super::{
    Addr, CommandFailureInfo, KernelError, KernelResult, LinkAttrs, Netlink, Route, VlanFlags,
};

const IP: &str = "ip";
const BRIDGE: &str = "bridge";
const EBTABLES: &str = "ebtables";

/// Drives the host's iproute2 and ebtables binaries.
#[derive(Clone, Debug)]
pub struct IpRoute2 {
    ip: PathBuf,
    bridge: PathBuf,
    ebtables: PathBuf,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self {
            ip: IP.into(),
            bridge: BRIDGE.into(),
            ebtables: EBTABLES.into(),
        }
    }
}

impl IpRoute2 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paths(
        ip: impl Into<PathBuf>,
        bridge: impl Into<PathBuf>,
        ebtables: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ip: ip.into(),
            bridge: bridge.into(),
            ebtables: ebtables.into(),
        }
    }

    fn ip<I, S>(&self, args: I) -> KernelResult<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.ip);
        cmd.args(args);
        execute(&mut cmd)
    }
}

fn command_to_string(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<String>>()
        .join(" ")
}

fn execute(command: &mut Command) -> KernelResult<Output> {
    trace!(command = %command_to_string(command), "executing");
    let output = command.output().map_err(|err| KernelError::ExecutionStart {
        command: command_to_string(command),
        err,
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(classify_failure(command, output, stderr));
    }

    Ok(output)
}

fn classify_failure(command: &Command, output: Output, stderr: String) -> KernelError {
    if stderr.contains("File exists") {
        return KernelError::AlreadyExists;
    }
    if stderr.contains("does not exist")
        || stderr.contains("Cannot find device")
        || stderr.contains("No such device")
        || stderr.contains("No such file or directory")
        || stderr.contains("No such process")
    {
        return KernelError::NotFound(stderr.trim().to_string());
    }
    KernelError::CommandFailure(Box::new(CommandFailureInfo {
        command: command_to_string(command),
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr,
    }))
}

fn parse_error(command: &str, err: impl ToString) -> KernelError {
    KernelError::Parse {
        command: command.to_string(),
        reason: err.to_string(),
    }
}

#[derive(Deserialize, Debug)]
struct IpLink {
    #[serde(default)]
    ifindex: u32,
    #[serde(default)]
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    master: Option<String>,
    address: Option<String>,
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Deserialize, Debug)]
struct IpLinkInfo {
    info_kind: Option<String>,
    info_data: Option<serde_json::Value>,
}

impl From<IpLink> for LinkAttrs {
    fn from(link: IpLink) -> Self {
        let kind = link.linkinfo.as_ref().and_then(|i| i.info_kind.clone());
        let vlan_filtering = link
            .linkinfo
            .as_ref()
            .and_then(|i| i.info_data.as_ref())
            .and_then(|d| d.get("vlan_filtering"))
            .map(|v| v.as_u64() == Some(1) || v.as_bool() == Some(true))
            .unwrap_or(false);
        LinkAttrs {
            index: link.ifindex,
            promisc: link.flags.iter().any(|f| f == "PROMISC"),
            up: link.flags.iter().any(|f| f == "UP"),
            name: link.ifname,
            kind,
            hardware_addr: link.address,
            master: link.master,
            vlan_filtering,
        }
    }
}

pub(crate) fn parse_links(json: &[u8]) -> serde_json::Result<Vec<LinkAttrs>> {
    let links: Vec<IpLink> = serde_json::from_slice(json)?;
    Ok(links.into_iter().map(LinkAttrs::from).collect())
}

#[derive(Deserialize, Debug)]
struct BridgeVlanPort {
    #[serde(default)]
    vlans: Vec<BridgeVlanEntry>,
}

#[derive(Deserialize, Debug)]
struct BridgeVlanEntry {
    vlan: u16,
    #[serde(rename = "vlanEnd")]
    vlan_end: Option<u16>,
}

/// Parses `bridge -j vlan show dev <link>`, expanding compressed ranges.
pub(crate) fn parse_bridge_vlans(json: &[u8]) -> KernelResult<Vec<u16>> {
    let ports: Vec<BridgeVlanPort> =
        serde_json::from_slice(json).map_err(|e| parse_error("bridge vlan show", e))?;
    Ok(ports
        .into_iter()
        .flat_map(|p| p.vlans)
        .flat_map(|v| v.vlan..=v.vlan_end.unwrap_or(v.vlan))
        .collect())
}

#[derive(Deserialize, Debug)]
struct IpAddrLink {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Deserialize, Debug)]
struct IpAddrInfo {
    #[serde(default)]
    family: String,
    local: Option<Ipv4Addr>,
    #[serde(default)]
    prefixlen: u8,
    broadcast: Option<Ipv4Addr>,
    label: Option<String>,
}

pub(crate) fn parse_addrs(json: &[u8]) -> KernelResult<Vec<Addr>> {
    let links: Vec<IpAddrLink> =
        serde_json::from_slice(json).map_err(|e| parse_error("ip addr show", e))?;
    let mut addrs = Vec::new();
    for info in links.into_iter().flat_map(|l| l.addr_info) {
        if info.family != "inet" {
            continue;
        }
        let Some(local) = info.local else {
            continue;
        };
        let network =
            Ipv4Network::new(local, info.prefixlen).map_err(|e| parse_error("ip addr show", e))?;
        addrs.push(Addr {
            network,
            broadcast: info.broadcast,
            label: info.label,
        });
    }
    Ok(addrs)
}

#[derive(Deserialize, Debug)]
struct IpRoute {
    dst: String,
    gateway: Option<Ipv4Addr>,
    dev: Option<String>,
    protocol: Option<String>,
    scope: Option<String>,
    prefsrc: Option<Ipv4Addr>,
    metric: Option<u32>,
}

fn parse_dst(dst: &str) -> Result<Option<Ipv4Network>, ipnetwork::IpNetworkError> {
    match dst {
        "default" => Ok(None),
        d if d.contains('/') => d.parse().map(Some),
        d => {
            let ip: Ipv4Addr = d
                .parse()
                .map_err(|_| ipnetwork::IpNetworkError::InvalidAddr(d.to_string()))?;
            Ipv4Network::new(ip, 32).map(Some)
        }
    }
}

/// Parses `ip -j route show dev <dev>`; the listing omits the device, so the
/// caller's device is filled in.
pub(crate) fn parse_routes(json: &[u8], dev: &str) -> KernelResult<Vec<Route>> {
    let routes: Vec<IpRoute> =
        serde_json::from_slice(json).map_err(|e| parse_error("ip route show", e))?;
    routes
        .into_iter()
        .map(|r| {
            Ok(Route {
                dst: parse_dst(&r.dst).map_err(|e| parse_error("ip route show", e))?,
                gateway: r.gateway,
                dev: r.dev.unwrap_or_else(|| dev.to_string()),
                protocol: r.protocol,
                scope: r.scope,
                src: r.prefsrc,
                metric: r.metric,
            })
        })
        .collect()
}

pub(crate) fn route_args(route: &Route) -> Vec<String> {
    let mut args = vec![match route.dst {
        Some(dst) => dst.to_string(),
        None => "default".to_string(),
    }];
    if let Some(gw) = route.gateway {
        args.extend(["via".to_string(), gw.to_string()]);
    }
    args.extend(["dev".to_string(), route.dev.clone()]);
    if let Some(proto) = &route.protocol {
        args.extend(["proto".to_string(), proto.clone()]);
    }
    if let Some(scope) = &route.scope {
        args.extend(["scope".to_string(), scope.clone()]);
    }
    if let Some(src) = route.src {
        args.extend(["src".to_string(), src.to_string()]);
    }
    if let Some(metric) = route.metric {
        args.extend(["metric".to_string(), metric.to_string()]);
    }
    args
}

pub(crate) fn vlan_args(op: &str, link: &str, vid: u16, flags: VlanFlags) -> Vec<String> {
    let mut args = vec![
        "vlan".to_string(),
        op.to_string(),
        "dev".to_string(),
        link.to_string(),
        "vid".to_string(),
        vid.to_string(),
    ];
    if flags.pvid {
        args.push("pvid".into());
    }
    if flags.untagged {
        args.push("untagged".into());
    }
    if flags.self_ {
        args.push("self".into());
    }
    if flags.master {
        args.push("master".into());
    }
    args
}

/// A rule is present when one line of `ebtables -L` carries it verbatim.
pub(crate) fn listing_contains_rule(listing: &str, rule: &[String]) -> bool {
    let rule = rule.join(" ");
    listing.lines().any(|line| line.trim().contains(&rule))
}

impl Netlink for IpRoute2 {
    fn link_by_name(&self, name: &str) -> KernelResult<LinkAttrs> {
        let out = self.ip(["-d", "-j", "link", "show", "dev", name])?;
        parse_links(&out.stdout)
            .map_err(|e| parse_error("ip link show", e))?
            .into_iter()
            .next()
            .ok_or_else(|| KernelError::NotFound(name.to_string()))
    }

    fn link_list_by_master(&self, master: &str) -> KernelResult<Vec<LinkAttrs>> {
        let out = self.ip(["-d", "-j", "link", "show", "master", master])?;
        parse_links(&out.stdout).map_err(|e| parse_error("ip link show", e))
    }

    fn link_add_bridge(&self, name: &str, vlan_filtering: bool) -> KernelResult<()> {
        let filtering = if vlan_filtering { "1" } else { "0" };
        self.ip([
            "link",
            "add",
            "name",
            name,
            "type",
            "bridge",
            "vlan_filtering",
            filtering,
        ])?;
        Ok(())
    }

    fn link_del(&self, name: &str) -> KernelResult<()> {
        self.ip(["link", "del", "dev", name])?;
        Ok(())
    }

    fn link_set_master(&self, link: &str, master: &str) -> KernelResult<()> {
        self.ip(["link", "set", "dev", link, "master", master])?;
        Ok(())
    }

    fn link_set_nomaster(&self, link: &str) -> KernelResult<()> {
        self.ip(["link", "set", "dev", link, "nomaster"])?;
        Ok(())
    }

    fn link_set_promisc_on(&self, link: &str) -> KernelResult<()> {
        self.ip(["link", "set", "dev", link, "promisc", "on"])?;
        Ok(())
    }

    fn link_set_up(&self, link: &str) -> KernelResult<()> {
        self.ip(["link", "set", "dev", link, "up"])?;
        Ok(())
    }

    fn link_set_vlan_filtering(&self, bridge: &str, on: bool) -> KernelResult<()> {
        let filtering = if on { "1" } else { "0" };
        self.ip([
            "link",
            "set",
            "dev",
            bridge,
            "type",
            "bridge",
            "vlan_filtering",
            filtering,
        ])?;
        Ok(())
    }

    fn addr_list(&self, link: &str) -> KernelResult<Vec<Addr>> {
        let out = self.ip(["-j", "-4", "addr", "show", "dev", link])?;
        parse_addrs(&out.stdout)
    }

    fn addr_replace(&self, link: &str, addr: &Addr) -> KernelResult<()> {
        let network = addr.network.to_string();
        let broadcast = addr.broadcast.map(|b| b.to_string());
        let mut args = vec!["addr", "replace", network.as_str()];
        if let Some(b) = broadcast.as_deref() {
            args.extend(["broadcast", b]);
        }
        args.extend(["dev", link]);
        self.ip(args)?;
        Ok(())
    }

    fn addr_del(&self, link: &str, addr: &Addr) -> KernelResult<()> {
        let network = addr.network.to_string();
        self.ip(["addr", "del", network.as_str(), "dev", link])?;
        Ok(())
    }

    fn route_list(&self, link: &str) -> KernelResult<Vec<Route>> {
        let out = self.ip(["-j", "-4", "route", "show", "dev", link])?;
        parse_routes(&out.stdout, link)
    }

    fn route_replace(&self, route: &Route) -> KernelResult<()> {
        let mut args = vec!["-4".to_string(), "route".into(), "replace".into()];
        args.extend(route_args(route));
        self.ip(args)?;
        Ok(())
    }

    fn route_del(&self, route: &Route) -> KernelResult<()> {
        let mut args = vec!["-4".to_string(), "route".into(), "del".into()];
        args.extend(route_args(route));
        self.ip(args)?;
        Ok(())
    }

    fn bridge_vlan_list(&self, link: &str) -> KernelResult<Vec<u16>> {
        let mut cmd = Command::new(&self.bridge);
        cmd.args(["-j", "vlan", "show", "dev", link]);
        let out = execute(&mut cmd)?;
        parse_bridge_vlans(&out.stdout)
    }

    fn bridge_vlan_add(&self, link: &str, vid: u16, flags: VlanFlags) -> KernelResult<()> {
        let mut cmd = Command::new(&self.bridge);
        cmd.args(vlan_args("add", link, vid, flags));
        execute(&mut cmd)?;
        Ok(())
    }

    fn bridge_vlan_del(&self, link: &str, vid: u16, flags: VlanFlags) -> KernelResult<()> {
        let mut cmd = Command::new(&self.bridge);
        cmd.args(vlan_args("del", link, vid, flags));
        execute(&mut cmd)?;
        Ok(())
    }

    fn ebtables_rule_exists(
        &self,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> KernelResult<bool> {
        let mut cmd = Command::new(&self.ebtables);
        cmd.args(["-t", table, "-L", chain]);
        let out = execute(&mut cmd)?;
        Ok(listing_contains_rule(
            &String::from_utf8_lossy(&out.stdout),
            rule,
        ))
    }

    fn ebtables_append(&self, table: &str, chain: &str, rule: &[String]) -> KernelResult<()> {
        let mut cmd = Command::new(&self.ebtables);
        cmd.args(["-t", table, "-A", chain]).args(rule);
        execute(&mut cmd)?;
        Ok(())
    }

    fn ebtables_delete(&self, table: &str, chain: &str, rule: &[String]) -> KernelResult<()> {
        let mut cmd = Command::new(&self.ebtables);
        cmd.args(["-t", table, "-D", chain]).args(rule);
        execute(&mut cmd)?;
        Ok(())
    }
}
