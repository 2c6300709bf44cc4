use std::time::Duration;

use hostnet_crds::nad::{NAME_GROUP_NAD, NetworkAttachmentDefinition};
use hostnet_crds::v1alpha1::hostnetwork::{HostNetwork, NAME_GROUP_HOSTNETWORK};
use hostnet_node_controller::start_node_controllers;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::conditions;
use kube::runtime::wait::await_condition;
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ControllerArgs;
use crate::{Error, Result};

const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn start(
    args: ControllerArgs,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let client = Client::try_default().await?;
    apply_crds(client.clone()).await?;
    ready.cancel();
    start_node_controllers(client, args.threads, cancel).await?;
    Ok(())
}

pub async fn apply_crds(client: Client) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let ssaply = PatchParams::apply("hostnet").force();
    crds.patch(
        NAME_GROUP_HOSTNETWORK,
        &ssaply,
        &Patch::Apply(&HostNetwork::crd()),
    )
    .await?;
    await_established(&crds, NAME_GROUP_HOSTNETWORK).await?;
    info!("applied HostNetwork CRD");

    // multus usually owns this one, only fill the gap when it is missing
    if crds.get_opt(NAME_GROUP_NAD).await?.is_none() {
        crds.create(&PostParams::default(), &NetworkAttachmentDefinition::crd())
            .await?;
        await_established(&crds, NAME_GROUP_NAD).await?;
        info!("created NetworkAttachmentDefinition CRD");
    }
    Ok(())
}

async fn await_established(crds: &Api<CustomResourceDefinition>, name: &str) -> Result<()> {
    let established = await_condition(crds.clone(), name, conditions::is_crd_established());
    match tokio::time::timeout(CRD_ESTABLISH_TIMEOUT, established).await {
        Ok(o) => o?,
        Err(e) => return Err(Error::Other(format!("crd {name} not established: {e}"))),
    };
    Ok(())
}
