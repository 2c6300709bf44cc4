use hostnet_crds::nad::NetworkAttachmentDefinition;
use hostnet_iface::kernel::Netlink;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use tracing::{debug, info};

use crate::context::{Claim, Context, Convergence};
use crate::{Error, Result};

/// Adds the attachment's VLAN to the uplink. Ids no live attachment wants,
/// such as the one an updated attachment held before, are released on the
/// way.
pub(crate) async fn on_change<N>(
    nad: &NetworkAttachmentDefinition,
    ctx: &Context<N>,
) -> Result<Action>
where
    N: Netlink + 'static,
{
    if nad.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let claim = Claim {
        key: ObjectRef::from_obj(nad),
        vid: nad.vlan_id()?,
    };

    let Some(vid) = claim.vid else {
        debug!("network attachment {} carries no vlan", display_name(nad));
        ctx.converge_vlans(None, Some(claim)).await?;
        return Ok(Action::await_change());
    };

    let Some(nic) = ctx.selected_uplink()? else {
        debug!("vlan networking disabled, not adding vid {}", vid);
        return Ok(Action::await_change());
    };
    info!("network attachment {} changed, vid {}", display_name(nad), vid);
    match ctx.converge_vlans(Some(nic.clone()), Some(claim)).await? {
        Convergence::Converged => Ok(Action::await_change()),
        Convergence::Detached => Err(Error::UplinkNotAttached(nic)),
        Convergence::Elsewhere(attached) => {
            debug!("bridge uplink is {}, waiting for {}", attached, nic);
            Err(Error::UplinkNotAttached(nic))
        }
    }
}

/// Releases the attachment's VLAN from whichever uplink the bridge has,
/// unless another attachment still uses it. Needs neither the setting nor a
/// decodable payload.
pub(crate) async fn on_remove<N>(
    nad: &NetworkAttachmentDefinition,
    ctx: &Context<N>,
) -> Result<Action>
where
    N: Netlink + 'static,
{
    info!("network attachment {} removed", display_name(nad));
    let claim = Claim {
        key: ObjectRef::from_obj(nad),
        vid: None,
    };
    if ctx.converge_vlans(None, Some(claim)).await? == Convergence::Detached {
        debug!("no uplink attached, nothing to release");
    }
    Ok(Action::await_change())
}

pub(crate) fn display_name(nad: &NetworkAttachmentDefinition) -> String {
    format!("{}/{}", nad.namespace().unwrap_or_default(), nad.name_any())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use hostnet_crds::setting::DEFAULT_NETWORK_SETTING;
    use hostnet_iface::kernel::{FakeNetlink, Mutation};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;
    use crate::test_utils::{
        attached_host, make_context, make_nad, make_setting, make_setting_value, vlan_conf,
    };

    fn vlan_mutations(nl: &FakeNetlink) -> Vec<Mutation> {
        nl.mutations()
            .into_iter()
            .filter(|m| matches!(m, Mutation::VlanAdd { .. } | Mutation::VlanDel { .. }))
            .collect()
    }

    fn deleting(mut nad: NetworkAttachmentDefinition) -> NetworkAttachmentDefinition {
        nad.metadata.deletion_timestamp = Some(Time(Default::default()));
        nad
    }

    fn vids(nl: &FakeNetlink) -> Vec<u16> {
        nl.vlans("eth1").into_iter().collect()
    }

    #[tokio::test]
    async fn test_create_adds_vlan_once() {
        let nl = attached_host("eth1");
        let nad = make_nad("vlan100", &vlan_conf(100));
        let ctx = make_context(nl.clone(), vec![make_setting("eth1")], vec![nad.clone()]);

        on_change(&nad, &ctx).await.unwrap();
        on_change(&nad, &ctx).await.unwrap();
        assert_eq!(
            vlan_mutations(&nl),
            vec![Mutation::VlanAdd {
                link: "eth1".into(),
                vid: 100
            }]
        );
        assert_eq!(vids(&nl), vec![100]);
    }

    #[tokio::test]
    async fn test_delete_removes_vlan_and_tolerates_redelivery() {
        let nl = attached_host("eth1");
        let nad = make_nad("vlan100", &vlan_conf(100));
        let ctx = make_context(nl.clone(), vec![make_setting("eth1")], vec![]);

        on_change(&nad, &ctx).await.unwrap();
        nl.clear_mutations();

        on_remove(&nad, &ctx).await.unwrap();
        on_remove(&nad, &ctx).await.unwrap();
        assert_eq!(
            vlan_mutations(&nl),
            vec![Mutation::VlanDel {
                link: "eth1".into(),
                vid: 100
            }]
        );
        assert!(vids(&nl).is_empty());
    }

    #[tokio::test]
    async fn test_empty_payload_is_inert() {
        let nl = Arc::new(FakeNetlink::new().with_link("eth1", "52:54:00:0a:34:f6"));
        let nad = make_nad("empty", "");
        let ctx = make_context(nl.clone(), vec![], vec![nad.clone()]);

        on_change(&nad, &ctx).await.unwrap();
        on_remove(&nad, &ctx).await.unwrap();
        assert!(nl.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_deleting_object_is_ignored_on_change() {
        let nl = attached_host("eth1");
        let nad = deleting(make_nad("vlan100", &vlan_conf(100)));
        let ctx = make_context(nl.clone(), vec![make_setting("eth1")], vec![]);

        on_change(&nad, &ctx).await.unwrap();
        assert!(nl.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_fails_but_removal_succeeds() {
        let nl = attached_host("eth1");
        let nad = make_nad("broken", r#"{"vlan": "abc"}"#);
        let ctx = make_context(nl.clone(), vec![make_setting("eth1")], vec![]);

        assert!(matches!(on_change(&nad, &ctx).await, Err(Error::Decode(_))));
        on_remove(&nad, &ctx).await.unwrap();
        assert!(nl.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_missing_or_empty_setting_is_retryable() {
        let nl = attached_host("eth1");
        let nad = make_nad("vlan100", &vlan_conf(100));

        let ctx = make_context(nl.clone(), vec![], vec![]);
        let err = on_change(&nad, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::SettingNotFound(_)));

        let ctx = make_context(nl.clone(), vec![make_setting("")], vec![]);
        let err = on_change(&nad, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::NicNotSelected(_)));
        assert!(err.requeue_after() > Duration::from_secs(5));
        assert!(nl.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_add_while_disabled_does_nothing() {
        let nl = attached_host("eth1");
        let nad = make_nad("vlan100", &vlan_conf(100));
        let disabled =
            make_setting_value(DEFAULT_NETWORK_SETTING, r#"{"enable":false,"nic":"eth1"}"#);
        let ctx = make_context(nl.clone(), vec![disabled], vec![nad.clone()]);

        let action = on_change(&nad, &ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(nl.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_add_without_attached_uplink_is_retryable() {
        let nad = make_nad("vlan100", &vlan_conf(100));

        let nl = Arc::new(FakeNetlink::new().with_link("eth1", "52:54:00:0a:34:f6"));
        let ctx = make_context(nl.clone(), vec![make_setting("eth1")], vec![]);
        let err = on_change(&nad, &ctx).await.unwrap_err();
        assert!(matches!(&err, Error::UplinkNotAttached(nic) if nic == "eth1"));
        assert_eq!(err.requeue_after(), Duration::from_secs(15));
        assert!(nl.mutations().is_empty());

        // attached, but not to the nic the setting names
        let nl = attached_host("eth2");
        let ctx = make_context(nl.clone(), vec![make_setting("eth1")], vec![]);
        let err = on_change(&nad, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::UplinkNotAttached(_)));
        assert!(nl.vlans("eth2").is_empty());
    }

    #[tokio::test]
    async fn test_update_releases_previous_vlan() {
        let nl = attached_host("eth1");
        let ctx = make_context(nl.clone(), vec![make_setting("eth1")], vec![]);

        on_change(&make_nad("net", &vlan_conf(100)), &ctx).await.unwrap();
        on_change(&make_nad("net", &vlan_conf(200)), &ctx).await.unwrap();
        assert_eq!(vids(&nl), vec![200]);

        on_change(&make_nad("net", ""), &ctx).await.unwrap();
        assert!(vids(&nl).is_empty());
    }

    #[tokio::test]
    async fn test_update_after_restart_releases_previous_vlan() {
        let nl = attached_host("eth1");
        let before = make_nad("net", &vlan_conf(100));
        let ctx = make_context(nl.clone(), vec![make_setting("eth1")], vec![before.clone()]);
        on_change(&before, &ctx).await.unwrap();
        drop(ctx);

        // a restarted agent only knows the current version of the object
        let after = make_nad("net", &vlan_conf(200));
        let ctx = make_context(nl.clone(), vec![make_setting("eth1")], vec![after.clone()]);
        on_change(&after, &ctx).await.unwrap();
        assert_eq!(vids(&nl), vec![200]);

        let ctx = make_context(nl.clone(), vec![], vec![deleting(after.clone())]);
        on_remove(&after, &ctx).await.unwrap();
        assert!(vids(&nl).is_empty());
    }

    #[tokio::test]
    async fn test_remove_needs_no_setting() {
        let nad = make_nad("vlan100", &vlan_conf(100));
        let disabled =
            make_setting_value(DEFAULT_NETWORK_SETTING, r#"{"enable":false,"nic":"eth1"}"#);
        for settings in [vec![disabled], vec![make_setting("")], vec![]] {
            let nl = attached_host("eth1");
            let ctx = make_context(nl.clone(), vec![make_setting("eth1")], vec![]);
            on_change(&nad, &ctx).await.unwrap();
            assert_eq!(vids(&nl), vec![100]);

            let ctx = make_context(nl.clone(), settings, vec![deleting(nad.clone())]);
            let action = on_remove(&nad, &ctx).await.unwrap();
            assert_eq!(action, Action::await_change());
            assert!(vids(&nl).is_empty());
        }
    }

    #[tokio::test]
    async fn test_remove_without_bridge_completes() {
        let nl = Arc::new(FakeNetlink::new().with_link("eth1", "52:54:00:0a:34:f6"));
        let nad = make_nad("vlan100", &vlan_conf(100));
        let ctx = make_context(nl.clone(), vec![], vec![deleting(nad.clone())]);

        let action = on_remove(&nad, &ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(nl.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_shared_vlan_is_kept_until_last_user_leaves() {
        let nl = attached_host("eth1");
        let a = make_nad("a", &vlan_conf(100));
        let b = make_nad("b", &vlan_conf(100));
        let ctx = make_context(
            nl.clone(),
            vec![make_setting("eth1")],
            vec![a.clone(), b.clone()],
        );

        on_change(&a, &ctx).await.unwrap();
        on_change(&b, &ctx).await.unwrap();

        on_remove(&a, &ctx).await.unwrap();
        assert_eq!(vids(&nl), vec![100]);
    }

    #[tokio::test]
    async fn test_last_user_removes_shared_vlan() {
        let nl = attached_host("eth1");
        let a = make_nad("a", &vlan_conf(100));
        let b = deleting(make_nad("b", &vlan_conf(100)));
        let ctx = make_context(nl.clone(), vec![make_setting("eth1")], vec![a.clone(), b]);

        on_change(&a, &ctx).await.unwrap();
        on_remove(&a, &ctx).await.unwrap();
        assert!(vids(&nl).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_and_remove_of_shared_vlan() {
        for _ in 0..20 {
            let nl = attached_host("eth1");
            let a = make_nad("a", &vlan_conf(100));
            let b = make_nad("b", &vlan_conf(100));
            let ctx = make_context(
                nl.clone(),
                vec![make_setting("eth1")],
                vec![a.clone(), b.clone()],
            );
            on_change(&a, &ctx).await.unwrap();

            // a leaves while b arrives
            let ctx = Arc::new(make_context(
                nl.clone(),
                vec![make_setting("eth1")],
                vec![deleting(a.clone()), b.clone()],
            ));
            let (removed, added) = tokio::join!(
                tokio::spawn({
                    let ctx = ctx.clone();
                    async move { on_remove(&a, &ctx).await }
                }),
                tokio::spawn({
                    let ctx = ctx.clone();
                    async move { on_change(&b, &ctx).await }
                }),
            );
            removed.unwrap().unwrap();
            added.unwrap().unwrap();
            assert_eq!(vids(&nl), vec![100]);
        }
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(&make_nad("net", "")), "default/net");
    }
}
