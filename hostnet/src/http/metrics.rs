use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::State as AxumState,
    response::{IntoResponse, Response},
    routing::get,
};
use http::{StatusCode, header::CONTENT_TYPE};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{Result, http::shutdown};

#[derive(Clone)]
pub(crate) struct State {
    ready: CancellationToken,
}

impl State {
    pub fn new(token: CancellationToken) -> Self {
        Self { ready: token }
    }

    pub fn ready(&self) -> Readiness {
        if self.ready.is_cancelled() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }

    pub fn metrics(&self) -> String {
        hostnet_k8s_utils::metrics::encode()
    }
}

pub(crate) async fn serve(
    addr: SocketAddr,
    state: Arc<State>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub(crate) fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn metrics(AxumState(handler): AxumState<Arc<State>>) -> String {
    handler.metrics()
}

async fn readyz(AxumState(handler): AxumState<Arc<State>>) -> Readiness {
    handler.ready()
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Readiness::Ready => (StatusCode::OK, "Ok"),
            Readiness::NotReady => (StatusCode::INTERNAL_SERVER_ERROR, "NotReady"),
        };
        (status, [(CONTENT_TYPE, "text/plain")], body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_follows_token() {
        let ready = CancellationToken::new();
        let state = State::new(ready.clone());
        assert_eq!(state.ready(), Readiness::NotReady);
        assert_eq!(
            state.ready().into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        ready.cancel();
        assert_eq!(state.ready(), Readiness::Ready);
        assert_eq!(state.ready().into_response().status(), StatusCode::OK);
    }

    #[test]
    fn test_metrics_exposes_registry() {
        let metrics = hostnet_k8s_utils::ReconcileMetrics::new("http-test");
        // families without a recorded sample are not encoded
        drop(metrics.record_run(&k8s_openapi::api::core::v1::Node::default()));

        let state = State::new(CancellationToken::new());
        let text = state.metrics();
        assert!(text.contains("hostnet_reconcile_runs"));
        assert!(text.contains(r#"controller="http-test""#));
    }
}
