//! Watch caches and metrics shared by the hostnet agent and control plane.

pub mod metrics;

use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::runtime::reflector::{ReflectHandle, Store};
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Resource};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

pub use metrics::{MetricLabel, REGISTRY, ReconcileMetrics};

#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} cache not ready: {reason}")]
    CacheNotReady { kind: String, reason: String },

    #[error("{0} cache has no room for another subscriber")]
    NoSubscriber(String),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Events a slow controller may lag behind the cache before the watch
/// stream waits for it.
const SUBSCRIBER_BUFFER: usize = 1000;

/// Starts watching `api` into a shared cache and waits for the first full
/// listing, giving up after `timeout` when one is set.
///
/// The cache can back several controllers; the handle feeds a
/// `Controller::for_shared_stream` or `owns_shared_stream`.
pub async fn start_cache<K>(
    api: Api<K>,
    config: watcher::Config,
    timeout: Option<Duration>,
) -> Result<(Store<K>, ReflectHandle<K>)>
where
    K: Resource + Send + Clone + Debug + DeserializeOwned + Sync + 'static,
    <K as Resource>::DynamicType: Default + Eq + Send + DeserializeOwned + Hash + Clone,
{
    let kind = K::kind(&Default::default()).into_owned();
    let (store, writer) = reflector::store_shared(SUBSCRIBER_BUFFER);
    let subscriber: ReflectHandle<K> = writer
        .subscribe()
        .ok_or_else(|| Error::NoSubscriber(kind.clone()))?;

    let stream_kind = kind.clone();
    let stream = watcher(api, config)
        .default_backoff()
        .reflect_shared(writer)
        .for_each(move |res| {
            let kind = stream_kind.clone();
            async move {
                match res {
                    Ok(ev) => trace!(%kind, "watch event: {:?}", ev),
                    Err(e) => error!(%e, %kind, "watch stream error"),
                }
            }
        });

    tokio::spawn(stream);
    let not_ready = |reason: String| Error::CacheNotReady {
        kind: kind.clone(),
        reason,
    };
    let wait = store.wait_until_ready();
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| not_ready(format!("no listing within {timeout:?}")))?
            .map_err(|e| not_ready(e.to_string()))?,
        None => wait.await.map_err(|e| not_ready(e.to_string()))?,
    }
    Ok((store, subscriber))
}

/// Resolves once `cancel` fires. Used with `graceful_shutdown_on`.
pub async fn shutdown(cancel: CancellationToken) {
    cancel.cancelled().await;
}
