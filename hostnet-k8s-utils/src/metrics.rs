//! Reconcile counters shared by the agent and the control plane, exposed in
//! text format on `/metrics`.

use std::borrow::Cow;
use std::sync::{LazyLock, PoisonError, RwLock};

use kube::Resource;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time::Instant;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("hostnet")));

/// Bucket bounds in seconds. Kernel work on the agent usually lands in the
/// low buckets, CRD installation in the high ones.
const DURATION_BUCKETS: [f64; 8] = [0.005, 0.025, 0.1, 0.25, 1.0, 5.0, 15.0, 60.0];

/// Short, bounded label naming why a reconcile failed.
pub trait MetricLabel {
    fn metric_label(&self) -> String;
}

/// Runs, failures and durations of one controller's reconciles, labelled by
/// the kind of object reconciled.
#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Family<KindLabels, Counter>,
    pub failures: Family<FailureLabels, Counter>,
    pub duration: Histogram,
}

impl ReconcileMetrics {
    /// Registers the metrics of `controller` under a `controller` label.
    pub fn new(controller: &str) -> Self {
        let mut guard = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
        let registry = guard.sub_registry_with_label((
            Cow::Borrowed("controller"),
            Cow::Owned(controller.into()),
        ));
        let runs = Family::<KindLabels, Counter>::default();
        let failures = Family::<FailureLabels, Counter>::default();
        let duration = Histogram::new(DURATION_BUCKETS.into_iter());

        registry.register_with_unit(
            "reconcile_duration",
            "Time spent converging one object",
            Unit::Seconds,
            duration.clone(),
        );
        registry.register(
            "reconcile_failures",
            "Reconciles that ended in an error, by reason",
            failures.clone(),
        );
        registry.register(
            "reconcile_runs",
            "Reconciles started, by object kind",
            runs.clone(),
        );
        Self {
            runs,
            failures,
            duration,
        }
    }

    pub fn record_failure<K, E>(&self, _k: &K, e: &E)
    where
        K: Resource<DynamicType = ()>,
        E: MetricLabel,
    {
        self.failures
            .get_or_create(&FailureLabels {
                kind: kind_of::<K>(),
                reason: e.metric_label(),
            })
            .inc();
    }

    /// Counts a run; its duration is observed when the timer drops.
    pub fn record_run<K>(&self, _k: &K) -> ReconcileTimer
    where
        K: Resource<DynamicType = ()>,
    {
        self.runs
            .get_or_create(&KindLabels {
                kind: kind_of::<K>(),
            })
            .inc();
        ReconcileTimer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }
}

fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).to_lowercase()
}

pub struct ReconcileTimer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileTimer {
    fn drop(&mut self) {
        self.metric.observe(self.start.elapsed().as_secs_f64());
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub kind: String,
    pub reason: String,
}

/// Text exposition of everything registered in [`REGISTRY`].
pub fn encode() -> String {
    let mut buffer = String::new();
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    match prometheus_client::encoding::text::encode(&mut buffer, &registry) {
        Ok(()) => buffer,
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Node;

    use super::*;

    struct NotAttached;

    impl MetricLabel for NotAttached {
        fn metric_label(&self) -> String {
            "uplink".into()
        }
    }

    #[test]
    fn test_counts_runs_and_failures() {
        let metrics = ReconcileMetrics::new("metrics-test");
        let node = Node::default();
        drop(metrics.record_run(&node));
        metrics.record_failure(&node, &NotAttached);

        let runs = metrics
            .runs
            .get_or_create(&KindLabels {
                kind: "node".into(),
            })
            .get();
        assert_eq!(runs, 1);

        let text = encode();
        assert!(text.contains("hostnet_reconcile_runs_total"));
        assert!(text.contains(r#"controller="metrics-test""#));
        assert!(text.contains(r#"reason="uplink""#));
    }
}
