use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use hostnet_crds::nad::NetworkAttachmentDefinition;
use hostnet_crds::setting::Setting;
use hostnet_crds::v1alpha1::hostnetwork::HostNetwork;
use hostnet_iface::HostNetworking;
use hostnet_iface::kernel::Netlink;
use hostnet_k8s_utils::{ReconcileMetrics, shutdown, start_cache};
use kube::runtime::{Config, Controller, watcher};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    Result,
    context::Context,
    controller::{error_policy, reconcile_hostnetwork, reconcile_nad, reconcile_setting},
};

const STORE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-node settings of the agent controllers.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub node_name: String,
    pub bridge_name: String,
    pub network_setting: String,
    /// Concurrent reconciliations per controller.
    pub threads: u16,
}

pub async fn start_agent_controllers<N>(
    client: Client,
    config: AgentConfig,
    netlink: N,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()>
where
    N: Netlink + 'static,
{
    let by_name = |name: &str| watcher::Config::default().fields(&format!("metadata.name={name}"));
    let store_init = tokio::try_join!(
        start_cache(
            Api::<NetworkAttachmentDefinition>::all(client.clone()),
            watcher::Config::default(),
            Some(STORE_TIMEOUT)
        ),
        start_cache(
            Api::<Setting>::all(client.clone()),
            by_name(&config.network_setting),
            Some(STORE_TIMEOUT)
        ),
        start_cache(
            Api::<HostNetwork>::all(client.clone()),
            by_name(&config.node_name),
            Some(STORE_TIMEOUT)
        ),
    )?;
    let (
        (nad_store, nad_subscriber),
        (setting_store, setting_subscriber),
        (hostnetwork_store, hostnetwork_subscriber),
    ) = store_init;

    let context = Arc::new(Context::new(
        client,
        config.node_name,
        config.bridge_name,
        config.network_setting,
        HostNetworking::new(netlink),
        setting_store.clone(),
        nad_store.clone(),
        ReconcileMetrics::new("agent"),
    ));
    let controller_config = Config::default().concurrency(config.threads);

    info!("starting agent controllers");
    ready.cancel();
    let settings = Controller::for_shared_stream(setting_subscriber, setting_store)
        .graceful_shutdown_on(shutdown(cancel.clone()))
        .with_config(controller_config.clone())
        .run(reconcile_setting, error_policy, context.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));
    let hostnetworks = Controller::for_shared_stream(hostnetwork_subscriber, hostnetwork_store)
        .graceful_shutdown_on(shutdown(cancel.clone()))
        .with_config(controller_config.clone())
        .run(reconcile_hostnetwork, error_policy, context.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));
    let nads = Controller::for_shared_stream(nad_subscriber, nad_store)
        .graceful_shutdown_on(shutdown(cancel))
        .with_config(controller_config)
        .run(reconcile_nad, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    tokio::join!(settings, hostnetworks, nads);
    Ok(())
}
