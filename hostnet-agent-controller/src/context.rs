use std::collections::BTreeSet;

use hostnet_crds::nad::NetworkAttachmentDefinition;
use hostnet_crds::setting::Setting;
use hostnet_iface::kernel::Netlink;
use hostnet_iface::{DEFAULT_PVID, HostNetworking, Interface, IsolatedNetwork};
use hostnet_k8s_utils::ReconcileMetrics;
use kube::Client;
use kube::runtime::reflector::{ObjectRef, Store};
use tracing::debug;

use crate::{Error, Result};

pub(crate) type NadRef = ObjectRef<NetworkAttachmentDefinition>;

/// The VLAN an attachment asks for as seen by its own reconcile, which may
/// be newer than the cached copy.
pub(crate) struct Claim {
    pub(crate) key: NadRef,
    pub(crate) vid: Option<u16>,
}

/// Result of converging the uplink's VLANs with the cluster's attachments.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Convergence {
    /// No uplink is enslaved to the bridge.
    Detached,
    /// The bridge is attached to a nic other than the one expected.
    Elsewhere(String),
    Converged,
}

pub struct Context<N> {
    pub client: Client,
    pub node_name: String,
    pub bridge_name: String,
    /// Name of the cluster setting selecting the uplink nic.
    pub network_setting: String,
    pub host: HostNetworking<N>,
    pub settings: Store<Setting>,
    pub nads: Store<NetworkAttachmentDefinition>,
    pub metrics: ReconcileMetrics,
}

impl<N> Context<N>
where
    N: Netlink + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        node_name: String,
        bridge_name: String,
        network_setting: String,
        host: HostNetworking<N>,
        settings: Store<Setting>,
        nads: Store<NetworkAttachmentDefinition>,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            client,
            node_name,
            bridge_name,
            network_setting,
            host,
            settings,
            nads,
            metrics,
        }
    }

    /// Nic VLAN networking should run on, read from the cached setting on
    /// every call. `None` while VLAN networking is disabled.
    pub(crate) fn selected_uplink(&self) -> Result<Option<String>> {
        let setting = self
            .settings
            .get(&ObjectRef::new(&self.network_setting))
            .ok_or_else(|| Error::SettingNotFound(self.network_setting.clone()))?;
        let network = setting.network_setting()?;
        if !network.enable {
            return Ok(None);
        }
        if network.nic.is_empty() {
            return Err(Error::NicNotSelected(self.network_setting.clone()));
        }
        Ok(Some(network.nic))
    }

    /// Runs `f` on a blocking thread while holding this node's bridge lock.
    pub(crate) async fn run_locked<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&HostNetworking<N>, &str) -> hostnet_iface::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let host = self.host.clone();
        let bridge = self.bridge_name.clone();
        let out = tokio::task::spawn_blocking(move || {
            host.locked(&bridge, |host| f(host, &bridge))
        })
        .await??;
        Ok(out)
    }

    /// Makes the VLANs on the attached uplink match the live attachments.
    ///
    /// The wanted set is read from the cache under the bridge lock, so
    /// concurrent reconciles of attachments sharing an id agree on it. The
    /// uplink's VLAN entries are owned by this agent.
    pub(crate) async fn converge_vlans(
        &self,
        uplink: Option<String>,
        claim: Option<Claim>,
    ) -> Result<Convergence> {
        let nads = self.nads.clone();
        self.run_locked(move |host, bridge| {
            let Some(vlan) = host.attached_vlan(bridge)? else {
                return Ok(Convergence::Detached);
            };
            let nic = vlan.nic().map(|n| n.name().to_string()).unwrap_or_default();
            if uplink.as_ref().is_some_and(|u| *u != nic) {
                return Ok(Convergence::Elsewhere(nic));
            }

            let wanted = wanted_vlans(&nads, claim.as_ref());
            let current = vlan.local_areas()?;
            for vid in wanted.difference(&current) {
                debug!(%nic, vid, "adding vlan");
                vlan.add_local_area(*vid)?;
            }
            for vid in current.difference(&wanted) {
                debug!(%nic, vid, "removing vlan");
                vlan.remove_local_area(*vid)?;
            }
            Ok(Convergence::Converged)
        })
        .await
    }
}

/// VLAN ids of the attachments that are not being deleted. An undecodable
/// attachment wants nothing.
fn wanted_vlans(
    nads: &Store<NetworkAttachmentDefinition>,
    claim: Option<&Claim>,
) -> BTreeSet<u16> {
    let mut wanted: BTreeSet<u16> = nads
        .state()
        .iter()
        .filter(|nad| nad.metadata.deletion_timestamp.is_none())
        .filter(|nad| claim.is_none_or(|c| ObjectRef::from_obj(nad.as_ref()) != c.key))
        .filter_map(|nad| nad.vlan_id().ok().flatten())
        .collect();
    wanted.extend(claim.and_then(|c| c.vid));
    wanted.remove(&DEFAULT_PVID);
    wanted
}
