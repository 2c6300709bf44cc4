use async_trait::async_trait;
use hostnet_crds::nad::NetworkAttachmentDefinition;
use hostnet_crds::v1alpha1::hostnetwork::HostNetwork;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::json;

use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Created {
    Created,
    /// Another writer got there first, e.g. while the cache was stale.
    AlreadyExists,
}

/// Writes the node controller performs against the API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeKubeClient: Send + Sync {
    async fn create_host_network(&self, hn: &HostNetwork) -> Result<Created>;

    /// Replaces the attachment's finalizer list with `finalizers`.
    async fn set_nad_finalizers(
        &self,
        nad: &NetworkAttachmentDefinition,
        finalizers: Vec<String>,
    ) -> Result<()>;
}

pub struct KubeNodeClient {
    client: Client,
}

impl KubeNodeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeKubeClient for KubeNodeClient {
    async fn create_host_network(&self, hn: &HostNetwork) -> Result<Created> {
        let api: Api<HostNetwork> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), hn).await {
            Ok(_) => Ok(Created::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(Created::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_nad_finalizers(
        &self,
        nad: &NetworkAttachmentDefinition,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let api: Api<NetworkAttachmentDefinition> =
            Api::namespaced(self.client.clone(), &nad.namespace().unwrap_or_default());
        // resourceVersion guards against clobbering a concurrent agent update
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": nad.resource_version(),
            }
        });
        api.patch(&nad.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
