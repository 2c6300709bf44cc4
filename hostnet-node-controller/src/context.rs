use hostnet_crds::v1alpha1::hostnetwork::HostNetwork;
use hostnet_k8s_utils::ReconcileMetrics;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::Store;

use crate::client::NodeKubeClient;

pub struct Context<C: NodeKubeClient> {
    pub client: C,
    pub nodes: Store<Node>,
    pub hostnetworks: Store<HostNetwork>,
    pub metrics: ReconcileMetrics,
}
