use std::{fmt::Debug, sync::Arc};

use hostnet_crds::nad::{NetworkAttachmentDefinition, nad_finalizer};
use hostnet_crds::setting::Setting;
use hostnet_crds::v1alpha1::hostnetwork::HostNetwork;
use hostnet_iface::kernel::Netlink;
use kube::{
    Api, Resource, ResourceExt,
    runtime::{controller::Action, finalizer},
};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::{Error, Result, context::Context, hostnetwork, nad, setting};

#[tracing::instrument(skip(ctx, nad), fields(nad = %nad::display_name(&nad)))]
pub(crate) async fn reconcile_nad<N>(
    nad: Arc<NetworkAttachmentDefinition>,
    ctx: Arc<Context<N>>,
) -> Result<Action>
where
    N: Netlink + 'static,
{
    let _timer = ctx.metrics.record_run(nad.as_ref());
    let api: Api<NetworkAttachmentDefinition> =
        Api::namespaced(ctx.client.clone(), &nad.namespace().unwrap_or_default());
    let finalizer_name = nad_finalizer(&ctx.node_name);
    if !is_managed(&nad, &finalizer_name) {
        debug!("network attachment carries no vlan, skipping");
        return Ok(Action::await_change());
    }

    finalizer(&api, &finalizer_name, nad, |event| async {
        match event {
            finalizer::Event::Apply(nad) => nad::on_change(&nad, &ctx).await,
            finalizer::Event::Cleanup(nad) => nad::on_remove(&nad, &ctx).await,
        }
    })
    .await
    .map_err(Error::from)
}

/// Attachments that are well formed but carry no VLAN are left alone unless
/// this node already holds a finalizer on them, e.g. from a VLAN the payload
/// has since dropped. Undecodable ones go through so the error surfaces.
fn is_managed(nad: &NetworkAttachmentDefinition, finalizer_name: &str) -> bool {
    match nad.vlan_id() {
        Ok(Some(_)) | Err(_) => true,
        Ok(None) => nad.finalizers().iter().any(|f| f == finalizer_name),
    }
}

#[tracing::instrument(skip(ctx, hn), fields(name = %hn.name_any()))]
pub(crate) async fn reconcile_hostnetwork<N>(
    hn: Arc<HostNetwork>,
    ctx: Arc<Context<N>>,
) -> Result<Action>
where
    N: Netlink + 'static,
{
    let _timer = ctx.metrics.record_run(hn.as_ref());
    if hn.metadata.deletion_timestamp.is_some() {
        return hostnetwork::on_remove(&hn);
    }
    hostnetwork::on_change(&hn, &ctx.node_name)
}

#[tracing::instrument(skip(ctx, s), fields(name = %s.name_any()))]
pub(crate) async fn reconcile_setting<N>(s: Arc<Setting>, ctx: Arc<Context<N>>) -> Result<Action>
where
    N: Netlink + 'static,
{
    let _timer = ctx.metrics.record_run(s.as_ref());
    setting::on_change(&s, &ctx).await
}

pub(crate) fn error_policy<K, N>(k: Arc<K>, error: &Error, ctx: Arc<Context<N>>) -> Action
where
    K: Resource<DynamicType = ()> + ResourceExt,
    K: DeserializeOwned + Clone + Send + Sync + Debug + 'static,
    N: Netlink + 'static,
{
    ctx.metrics.record_failure(k.as_ref(), error);
    let ns = k.namespace().map(|ns| format!("{ns}/")).unwrap_or_default();
    error!(?error, "reconcile error for {} {}{}", K::kind(&()), ns, k.name_any());
    Action::requeue(error.requeue_after())
}
