use kube::CustomResource;
use kube::KubeSchema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const NAME_GROUP_HOSTNETWORK: &str = "hostnetworks.network.hostnet.dev";

/// Network state of a single node. Named after, and owned by, its Node.
#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "network.hostnet.dev",
    version = "v1alpha1",
    kind = "HostNetwork",
    shortname = "hn",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct HostNetworkSpec {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub network_type: Option<NetworkType>,
    /// Physical interface carrying the node's VLAN traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic: Option<String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    Vlan,
}
