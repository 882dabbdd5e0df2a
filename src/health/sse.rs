//! Read-only HTTP observer
//!
//! Serves the live health stream over Server-Sent Events plus the registry
//! snapshot and per-service log tails. This is the only HTTP surface the
//! supervisor exposes; it is read-only by construction.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::events::HealthState;
use crate::process::Supervisor;
use crate::registry::Registry;

use super::HealthReport;

/// Heartbeat cadence on idle SSE streams
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Shared state behind the observer routes
#[derive(Clone)]
pub struct ObserverState {
    pub report_rx: watch::Receiver<Option<HealthReport>>,
    pub registry: Arc<Registry>,
    pub supervisor: Option<Arc<Supervisor>>,
}

/// Bind the observer on `addr` and serve until the token is cancelled.
/// Returns the bound address (callers record it in the registry snapshot).
pub async fn serve(
    addr: &str,
    state: ObserverState,
    token: CancellationToken,
) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let app = Router::new()
        .route("/events", get(events))
        .route("/health", get(latest_health))
        .route("/registry", get(registry_snapshot))
        .route("/logs/:service", get(service_logs))
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("Observer listening on http://{}", local_addr);

    tokio::spawn(async move {
        let shutdown = async move { token.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!("Observer server error: {}", e);
        }
    });

    Ok(local_addr)
}

/// SSE stream: `data` events per cycle, `health-change` when the overall
/// state flips, `heartbeat` while idle
async fn events(
    State(state): State<ObserverState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = state.report_rx.clone();

    let stream = async_stream::stream! {
        let mut last_overall: Option<HealthState> = None;

        // Replay the latest report to new subscribers
        let initial_report = rx.borrow().clone();
        if let Some(report) = initial_report {
            last_overall = Some(report.summary.overall);
            if let Ok(json) = serde_json::to_string(&report) {
                yield Ok(SseEvent::default().event("data").data(json));
            }
        }

        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let Some(report) = rx.borrow_and_update().clone() else {
                        continue;
                    };

                    let name = if last_overall
                        .map(|prev| prev != report.summary.overall)
                        .unwrap_or(true)
                    {
                        "health-change"
                    } else {
                        "data"
                    };
                    last_overall = Some(report.summary.overall);

                    if let Ok(json) = serde_json::to_string(&report) {
                        yield Ok(SseEvent::default().event(name).data(json));
                    }
                }
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    yield Ok(SseEvent::default().event("heartbeat").data("{}"));
                }
            }
        }
    };

    Sse::new(stream)
}

/// Latest health report as plain JSON
async fn latest_health(State(state): State<ObserverState>) -> impl IntoResponse {
    match state.report_rx.borrow().clone() {
        Some(report) => Json(report).into_response(),
        None => (StatusCode::NOT_FOUND, "no health cycle completed yet").into_response(),
    }
}

/// Registry snapshot as JSON
async fn registry_snapshot(State(state): State<ObserverState>) -> impl IntoResponse {
    Json(state.registry.snapshot())
}

#[derive(Deserialize)]
struct LogsQuery {
    /// Number of lines to tail
    n: Option<usize>,
}

/// Tail of one service's captured output
async fn service_logs(
    State(state): State<ObserverState>,
    Path(service): Path<String>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let Some(supervisor) = &state.supervisor else {
        return (StatusCode::NOT_FOUND, "no supervisor attached").into_response();
    };

    match supervisor.get(&service) {
        Some(running) => {
            let lines = running.sink().tail(query.n.unwrap_or(100));
            Json(lines).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            format!("service {:?} is not running", service),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{CheckType, HealthResult};

    fn state_with_report() -> (ObserverState, watch::Sender<Option<HealthReport>>) {
        let mut result = HealthResult::new("web", CheckType::Http);
        result.status = HealthState::Healthy;
        let report = HealthReport::new("demo", vec![result]);

        let (tx, rx) = watch::channel(Some(report));
        let state = ObserverState {
            report_rx: rx,
            registry: Arc::new(Registry::new("demo")),
            supervisor: None,
        };
        (state, tx)
    }

    #[tokio::test]
    async fn test_serve_and_fetch_health() {
        let (state, _tx) = state_with_report();
        let token = CancellationToken::new();

        let addr = serve("127.0.0.1:0", state, token.clone()).await.unwrap();

        let url = format!("http://{}/health", addr);
        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["project"], "demo");
        assert_eq!(body["summary"]["overall"], "healthy");

        let url = format!("http://{}/registry", addr);
        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["project"], "demo");

        token.cancel();
    }

    #[tokio::test]
    async fn test_logs_404_without_supervisor() {
        let (state, _tx) = state_with_report();
        let token = CancellationToken::new();
        let addr = serve("127.0.0.1:0", state, token.clone()).await.unwrap();

        let url = format!("http://{}/logs/web", addr);
        let status = reqwest::get(&url).await.unwrap().status();
        assert_eq!(status.as_u16(), 404);

        token.cancel();
    }
}
