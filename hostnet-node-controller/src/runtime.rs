use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use hostnet_crds::nad::NetworkAttachmentDefinition;
use hostnet_crds::v1alpha1::hostnetwork::HostNetwork;
use hostnet_k8s_utils::{ReconcileMetrics, shutdown, start_cache};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::{Config, Controller, watcher};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    Result,
    client::KubeNodeClient,
    context::Context,
    controller::{error_policy, reconcile_nad_finalizers, reconcile_node},
};

const STORE_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn start_node_controllers(
    client: Client,
    threads: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let store_init = tokio::try_join!(
        start_cache(
            Api::<Node>::all(client.clone()),
            watcher::Config::default(),
            Some(STORE_TIMEOUT)
        ),
        start_cache(
            Api::<HostNetwork>::all(client.clone()),
            watcher::Config::default(),
            Some(STORE_TIMEOUT)
        ),
        start_cache(
            Api::<NetworkAttachmentDefinition>::all(client.clone()),
            watcher::Config::default(),
            Some(STORE_TIMEOUT)
        ),
    )?;
    let (
        (node_store, node_subscriber),
        (hostnetwork_store, hostnetwork_subscriber),
        (nad_store, nad_subscriber),
    ) = store_init;

    let context = Arc::new(Context {
        client: KubeNodeClient::new(client),
        nodes: node_store.clone(),
        hostnetworks: hostnetwork_store,
        metrics: ReconcileMetrics::new("node"),
    });
    let controller_config = Config::default().concurrency(threads);

    info!("starting node controllers");
    let nodes = Controller::for_shared_stream(node_subscriber, node_store)
        .owns_shared_stream(hostnetwork_subscriber)
        .graceful_shutdown_on(shutdown(cancel.clone()))
        .with_config(controller_config.clone())
        .run(reconcile_node, error_policy, context.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));
    let nads = Controller::for_shared_stream(nad_subscriber, nad_store)
        .graceful_shutdown_on(shutdown(cancel))
        .with_config(controller_config)
        .run(reconcile_nad_finalizers, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    tokio::join!(nodes, nads);
    Ok(())
}
