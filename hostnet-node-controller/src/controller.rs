use std::{fmt::Debug, sync::Arc, time::Duration};

use hostnet_crds::nad::{NAD_FINALIZER_PREFIX, NetworkAttachmentDefinition};
use hostnet_crds::v1alpha1::hostnetwork::{HostNetwork, HostNetworkSpec};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    Resource, ResourceExt,
    runtime::{controller::Action, reflector::ObjectRef},
};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use crate::client::{Created, NodeKubeClient};
use crate::{Error, Result, context::Context};

pub(crate) const DEFAULT_REQUEUE_DURATION: Duration = Duration::from_secs(300);
const ERROR_REQUEUE_DURATION: Duration = Duration::from_secs(5);
const FINALIZER_RECHECK_DURATION: Duration = Duration::from_secs(60);

/// Ensures the node has exactly one HostNetwork, owned by the node.
#[tracing::instrument(skip(ctx, node), fields(node = %node.name_any()))]
pub(crate) async fn reconcile_node<C>(node: Arc<Node>, ctx: Arc<Context<C>>) -> Result<Action>
where
    C: NodeKubeClient,
{
    let _timer = ctx.metrics.record_run(node.as_ref());
    if node.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let name = node.name_any();
    if ctx.hostnetworks.get(&ObjectRef::new(&name)).is_some() {
        debug!("host network {} exists", name);
        return Ok(Action::requeue(DEFAULT_REQUEUE_DURATION));
    }

    let hn = host_network_for(&node)?;
    match ctx.client.create_host_network(&hn).await? {
        Created::Created => info!("created host network {}", name),
        Created::AlreadyExists => debug!("host network {} already created", name),
    }
    Ok(Action::requeue(DEFAULT_REQUEUE_DURATION))
}

pub(crate) fn host_network_for(node: &Node) -> Result<HostNetwork> {
    let name = node.name_any();
    let uid = node.uid().ok_or_else(|| Error::MissingUid {
        kind: "Node",
        name: name.clone(),
    })?;
    let mut hn = HostNetwork::new(&name, HostNetworkSpec::default());
    hn.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "v1".into(),
        kind: "Node".into(),
        name,
        uid,
        ..Default::default()
    }]);
    Ok(hn)
}

/// Drops the finalizers that agents of since-removed nodes left on a
/// deleting attachment, so the deletion does not hang on them.
#[tracing::instrument(skip(ctx, nad), fields(nad = %nad.name_any()))]
pub(crate) async fn reconcile_nad_finalizers<C>(
    nad: Arc<NetworkAttachmentDefinition>,
    ctx: Arc<Context<C>>,
) -> Result<Action>
where
    C: NodeKubeClient,
{
    if nad.metadata.deletion_timestamp.is_none() {
        return Ok(Action::await_change());
    }
    let _timer = ctx.metrics.record_run(nad.as_ref());

    let finalizers = nad.finalizers();
    let keep: Vec<String> = finalizers
        .iter()
        .filter(|f| match f.strip_prefix(NAD_FINALIZER_PREFIX) {
            Some(node) => ctx.nodes.get(&ObjectRef::new(node)).is_some(),
            None => true,
        })
        .cloned()
        .collect();

    if keep.len() == finalizers.len() {
        if keep.iter().any(|f| f.starts_with(NAD_FINALIZER_PREFIX)) {
            return Ok(Action::requeue(FINALIZER_RECHECK_DURATION));
        }
        return Ok(Action::await_change());
    }

    info!(
        "removing {} stale node finalizers from {}/{}",
        finalizers.len() - keep.len(),
        nad.namespace().unwrap_or_default(),
        nad.name_any()
    );
    ctx.client.set_nad_finalizers(&nad, keep).await?;
    Ok(Action::await_change())
}

pub(crate) fn error_policy<K, C>(k: Arc<K>, error: &Error, ctx: Arc<Context<C>>) -> Action
where
    K: Resource<DynamicType = ()> + ResourceExt,
    K: DeserializeOwned + Clone + Send + Sync + Debug + 'static,
    C: NodeKubeClient,
{
    ctx.metrics.record_failure(k.as_ref(), error);
    error!(?error, "reconcile error for {} {}", K::kind(&()), k.name_any());
    Action::requeue(ERROR_REQUEUE_DURATION)
}

#[cfg(test)]
mod tests {
    use hostnet_k8s_utils::ReconcileMetrics;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use kube::runtime::{reflector::store, watcher};

    use super::*;
    use crate::client::MockNodeKubeClient;

    fn make_node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                uid: Some(format!("uid-{name}")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn make_context(
        client: MockNodeKubeClient,
        nodes: Vec<Node>,
        hostnetworks: Vec<HostNetwork>,
    ) -> Arc<Context<MockNodeKubeClient>> {
        let (node_store, mut node_writer) = store();
        for node in nodes {
            node_writer.apply_watcher_event(&watcher::Event::Apply(node));
        }
        let (hn_store, mut hn_writer) = store();
        for hn in hostnetworks {
            hn_writer.apply_watcher_event(&watcher::Event::Apply(hn));
        }
        Arc::new(Context {
            client,
            nodes: node_store,
            hostnetworks: hn_store,
            metrics: ReconcileMetrics::new("node-test"),
        })
    }

    #[tokio::test]
    async fn test_creates_owned_host_network_once() {
        let node = make_node("node-a");
        let mut client = MockNodeKubeClient::new();
        client
            .expect_create_host_network()
            .times(1)
            .withf(|hn| {
                let [owner] = hn.owner_references() else {
                    return false;
                };
                hn.name_any() == "node-a"
                    && owner.api_version == "v1"
                    && owner.kind == "Node"
                    && owner.name == "node-a"
                    && owner.uid == "uid-node-a"
            })
            .returning(|_| Ok(Created::Created));
        let ctx = make_context(client, vec![node.clone()], vec![]);

        let action = reconcile_node(Arc::new(node.clone()), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_REQUEUE_DURATION));

        // the created object shows up in the cache, a repeated event is a no-op
        let hn = host_network_for(&node).unwrap();
        let ctx = make_context(MockNodeKubeClient::new(), vec![node.clone()], vec![hn]);
        reconcile_node(Arc::new(node), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_already_exists_is_success() {
        let mut client = MockNodeKubeClient::new();
        client
            .expect_create_host_network()
            .times(1)
            .returning(|_| Ok(Created::AlreadyExists));
        let ctx = make_context(client, vec![], vec![]);
        reconcile_node(Arc::new(make_node("node-a")), ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_failure_is_propagated() {
        let mut client = MockNodeKubeClient::new();
        client
            .expect_create_host_network()
            .returning(|_| Err(Error::Other("apiserver unavailable".into())));
        let ctx = make_context(client, vec![], vec![]);
        let err = reconcile_node(Arc::new(make_node("node-a")), ctx.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)));

        let action = error_policy(Arc::new(make_node("node-a")), &err, ctx);
        assert_eq!(action, Action::requeue(ERROR_REQUEUE_DURATION));
    }

    #[tokio::test]
    async fn test_deleting_node_is_ignored() {
        let mut node = make_node("node-a");
        node.metadata.deletion_timestamp = Some(Time(Default::default()));
        let ctx = make_context(MockNodeKubeClient::new(), vec![], vec![]);
        let action = reconcile_node(Arc::new(node), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn test_node_without_uid_is_rejected() {
        let mut node = make_node("node-a");
        node.metadata.uid = None;
        assert!(matches!(
            host_network_for(&node),
            Err(Error::MissingUid { kind: "Node", .. })
        ));
    }

    fn deleting_nad(finalizers: &[&str]) -> NetworkAttachmentDefinition {
        NetworkAttachmentDefinition {
            metadata: ObjectMeta {
                name: Some("vlan100".into()),
                namespace: Some("default".into()),
                finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
                deletion_timestamp: Some(Time(Default::default())),
                ..Default::default()
            },
            spec: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_stale_nad_finalizers_are_removed() {
        let mut client = MockNodeKubeClient::new();
        client
            .expect_set_nad_finalizers()
            .times(1)
            .withf(|_, finalizers| {
                finalizers == &vec!["hostnet.dev/nad-node-a".to_string(), "other/keep".to_string()]
            })
            .returning(|_, _| Ok(()));
        let ctx = make_context(client, vec![make_node("node-a")], vec![]);
        let nad = deleting_nad(&[
            "hostnet.dev/nad-node-a",
            "hostnet.dev/nad-node-gone",
            "other/keep",
        ]);

        let action = reconcile_nad_finalizers(Arc::new(nad), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_live_node_finalizers_are_rechecked() {
        let ctx = make_context(MockNodeKubeClient::new(), vec![make_node("node-a")], vec![]);
        let nad = deleting_nad(&["hostnet.dev/nad-node-a"]);
        let action = reconcile_nad_finalizers(Arc::new(nad), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(FINALIZER_RECHECK_DURATION));

        let mut live = deleting_nad(&["hostnet.dev/nad-node-gone"]);
        live.metadata.deletion_timestamp = None;
        let action = reconcile_nad_finalizers(Arc::new(live), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
