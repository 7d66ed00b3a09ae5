//! Admin HTTP server for health checks, metrics, and condition status

use crate::alerts::AlertLog;
use crate::metrics;
use crate::provisioner::ClusterLifecycle;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const ADMIN_TARGET: &str = "vigil::admin";

/// Alert history entries returned by `/alerts`.
const ALERT_HISTORY_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AdminState {
    pub lifecycle: Arc<ClusterLifecycle>,
    pub alerts: Arc<AlertLog>,
    /// Once cancelled, `/readyz` reports not ready
    pub shutdown: CancellationToken,
}

/// Serve /healthz, /readyz, /metrics, /alerts, /conditions and
/// /conditions/<id> until `state.shutdown` is cancelled.
pub async fn serve_admin(addr: SocketAddr, state: AdminState) -> Result<(), hyper::Error> {
    let shutdown = state.shutdown.clone();
    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(req, &state).await) }
            }))
        }
    });

    tracing::info!("Admin HTTP server listening on {}", addr);
    Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

pub async fn handle(req: Request<Body>, state: &AdminState) -> Response<Body> {
    let path = req.uri().path().to_string();
    let response = match path.as_str() {
        "/healthz" => text(StatusCode::OK, "ok\n"),

        "/readyz" => {
            if state.shutdown.is_cancelled() {
                text(StatusCode::SERVICE_UNAVAILABLE, "not ready\n")
            } else {
                text(StatusCode::OK, "ready\n")
            }
        }

        "/metrics" => {
            let mut response = Response::new(Body::from(metrics::encode_metrics()));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }

        "/alerts" => json(
            StatusCode::OK,
            &state.alerts.list_history(ALERT_HISTORY_LIMIT),
        ),

        "/conditions" => {
            let conditions: Vec<ConditionSummary> = state
                .lifecycle
                .registry()
                .list()
                .iter()
                .map(|c| ConditionSummary {
                    id: c.metadata().id.clone(),
                    cluster_id: c.metadata().cluster_id.clone(),
                    phase: c.phase(),
                    firing: c.is_firing(),
                })
                .collect();
            json(StatusCode::OK, &conditions)
        }

        other => match other.strip_prefix("/conditions/") {
            Some(id) if !id.is_empty() => match state.lifecycle.condition_status(id).await {
                Ok(Some(status)) => json(StatusCode::OK, &status),
                Ok(None) => text(StatusCode::NOT_FOUND, "unknown condition\n"),
                Err(e) => {
                    tracing::error!("Failed to read status of {}: {}", id, e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, "storage error\n")
                }
            },
            _ => text(StatusCode::NOT_FOUND, "not found\n"),
        },
    };

    tracing::info!(
        target: ADMIN_TARGET,
        event = "admin_http_request",
        path = %path,
        status = %response.status().as_u16(),
    );
    response
}

#[derive(Serialize)]
struct ConditionSummary {
    id: String,
    cluster_id: String,
    phase: crate::condition::ConditionPhase,
    firing: bool,
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

fn json<V: Serialize>(status: StatusCode, value: &V) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            tracing::error!("Failed to encode response: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "encoding error\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AlertingConfig;
    use crate::storage::{KvClientSet, StorageClientSet};
    use crate::stream::InMemoryStream;
    use std::time::Duration;
    use vigil_shared::utils::time;
    use vigil_shared::CachedState;

    async fn state() -> (AdminState, Arc<KvClientSet>) {
        let clients = Arc::new(KvClientSet::in_memory(Duration::from_secs(1)));
        let lifecycle = ClusterLifecycle::new(
            Arc::new(InMemoryStream::new()),
            clients.clone(),
            Arc::new(AlertLog::new()),
            Arc::new(ManualClock::new(time::from_unix_secs(1_000).unwrap())),
            &AlertingConfig::default(),
        )
        .await
        .unwrap();
        let state = AdminState {
            lifecycle: Arc::new(lifecycle),
            alerts: Arc::new(AlertLog::new()),
            shutdown: CancellationToken::new(),
        };
        (state, clients)
    }

    async fn get(state: &AdminState, uri: &str) -> (StatusCode, String) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = handle(req, state).await;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let (state, _) = state().await;
        assert_eq!(get(&state, "/healthz").await.0, StatusCode::OK);
        assert_eq!(get(&state, "/readyz").await.0, StatusCode::OK);
        state.shutdown.cancel();
        assert_eq!(
            get(&state, "/readyz").await.0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(get(&state, "/nope").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_condition_status_from_storage() {
        let (state, clients) = state().await;
        let (status, _) = get(&state, "/conditions/agent-disconnect-c1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let at = time::from_unix_secs(1_000).unwrap();
        clients
            .states()
            .put("agent-disconnect-c1", &CachedState::new(false, true, at))
            .await
            .unwrap();
        let (status, body) = get(&state, "/conditions/agent-disconnect-c1").await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["id"], "agent-disconnect-c1");
        assert_eq!(value["state"]["firing"], true);
        assert!(value["phase"].is_null());
    }

    #[tokio::test]
    async fn test_conditions_list_is_json() {
        let (state, _) = state().await;
        let (status, body) = get(&state, "/conditions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");
        let (status, body) = get(&state, "/alerts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");
    }
}
