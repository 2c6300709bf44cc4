use hostnet_crds::v1alpha1::hostnetwork::HostNetwork;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, info};

use crate::Result;

/// Observes this node's host network. Kernel state is driven by the
/// network setting and the attachments, so nothing is converged here yet.
pub(crate) fn on_change(hn: &HostNetwork, node_name: &str) -> Result<Action> {
    if hn.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let name = hn.name_any();
    if name != node_name {
        debug!("ignoring host network {} of another node", name);
        return Ok(Action::await_change());
    }
    info!(
        nic = hn.spec.nic.as_deref().unwrap_or_default(),
        network_type = ?hn.spec.network_type,
        "observed host network {}",
        name
    );
    Ok(Action::await_change())
}

pub(crate) fn on_remove(hn: &HostNetwork) -> Result<Action> {
    info!("host network {} is being removed", hn.name_any());
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use hostnet_crds::v1alpha1::hostnetwork::{HostNetworkSpec, NetworkType};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;

    #[test]
    fn test_observe_only() {
        let mut hn = HostNetwork::new(
            "node-a",
            HostNetworkSpec {
                network_type: Some(NetworkType::Vlan),
                nic: Some("eth1".into()),
            },
        );
        assert_eq!(on_change(&hn, "node-a").unwrap(), Action::await_change());
        assert_eq!(on_change(&hn, "node-b").unwrap(), Action::await_change());

        hn.metadata.deletion_timestamp = Some(Time(Default::default()));
        assert_eq!(on_change(&hn, "node-a").unwrap(), Action::await_change());
        assert_eq!(on_remove(&hn).unwrap(), Action::await_change());
    }
}
