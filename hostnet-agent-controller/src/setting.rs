use hostnet_crds::setting::Setting;
use hostnet_iface::kernel::Netlink;
use hostnet_iface::{IsolatedNetwork, NetworkConfig};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, info, warn};

use crate::context::{Context, Convergence};
use crate::{Error, Result};

/// Sets the node's VLAN network up on the selected nic and brings the
/// attachments' VLANs onto it, or repeals the network once VLAN networking
/// is disabled. The attached uplink is read back from the kernel, so a nic
/// left enslaved by an earlier run is released.
pub(crate) async fn on_change<N>(setting: &Setting, ctx: &Context<N>) -> Result<Action>
where
    N: Netlink + 'static,
{
    if setting.metadata.deletion_timestamp.is_some() || setting.name_any() != ctx.network_setting
    {
        return Ok(Action::await_change());
    }
    let network = setting.network_setting()?;

    if network.enable && !network.nic.is_empty() {
        let nic = network.nic.clone();
        ctx.run_locked(move |host, bridge| {
            host.vlan(bridge).setup(&nic, NetworkConfig::default())
        })
        .await?;
        info!("vlan network on {} set up with {}", ctx.bridge_name, network.nic);

        match ctx.converge_vlans(Some(network.nic.clone()), None).await? {
            Convergence::Converged => {}
            Convergence::Detached => return Err(Error::UplinkNotAttached(network.nic)),
            Convergence::Elsewhere(attached) => {
                warn!("bridge uplink is {} right after setup with {}", attached, network.nic);
                return Err(Error::UplinkNotAttached(network.nic));
            }
        }
    } else {
        repeal(ctx).await?;
    }
    Ok(Action::await_change())
}

async fn repeal<N>(ctx: &Context<N>) -> Result<()>
where
    N: Netlink + 'static,
{
    let repealed = ctx
        .run_locked(move |host, bridge| match host.attached_vlan(bridge)? {
            Some(mut vlan) => vlan.repeal().map(|_| true),
            None => {
                let vlan = host.vlan(bridge);
                if !vlan.bridge().exists()? {
                    return Ok(false);
                }
                vlan.bridge().delete()?;
                Ok(true)
            }
        })
        .await?;
    if repealed {
        info!("vlan network on {} repealed", ctx.bridge_name);
    } else {
        debug!("vlan network disabled and no bridge present");
    }
    Ok(())
}
