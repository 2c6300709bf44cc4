//! Multus network attachment definitions. The CNI configuration is carried
//! as an opaque JSON string.

use kube::CustomResource;
use kube::KubeSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const NAME_GROUP_NAD: &str = "network-attachment-definitions.k8s.cni.cncf.io";

/// Every agent holds its own finalizer on an attachment so each node gets
/// to clean up its VLAN membership.
pub const NAD_FINALIZER_PREFIX: &str = "hostnet.dev/nad-";

pub fn nad_finalizer(node_name: &str) -> String {
    format!("{NAD_FINALIZER_PREFIX}{node_name}")
}

#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "k8s.cni.cncf.io",
    version = "v1",
    kind = "NetworkAttachmentDefinition",
    plural = "network-attachment-definitions",
    shortname = "net-attach-def",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachmentDefinitionSpec {
    #[serde(default)]
    pub config: String,
}

/// The fields of a bridge CNI configuration this project acts on.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub plugin: String,
    #[serde(default)]
    pub bridge: Option<String>,
    /// Absent for configurations that do not tag traffic.
    #[serde(default)]
    pub vlan: Option<u16>,
}

impl NetConf {
    pub fn decode(config: &str) -> Result<Self> {
        let conf: NetConf = serde_json::from_str(config).map_err(|source| Error::Decode {
            what: "network configuration",
            source,
        })?;
        if let Some(vid) = conf.vlan
            && !(1..=4094).contains(&vid)
        {
            return Err(Error::InvalidVlan(vid));
        }
        Ok(conf)
    }
}

impl NetworkAttachmentDefinition {
    /// VLAN id of the attachment, `None` when it carries no configuration
    /// or a configuration without a VLAN.
    pub fn vlan_id(&self) -> Result<Option<u16>> {
        let config = self.spec.config.trim();
        if config.is_empty() {
            return Ok(None);
        }
        NetConf::decode(config).map(|conf| conf.vlan)
    }
}
