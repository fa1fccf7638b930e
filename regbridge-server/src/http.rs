//! HTTP adapter: value ingestion and monitor snapshot.

use std::net::SocketAddr;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use regbridge_common::{DeviceDisplay, DisplayCache, IngestionGateway, RejectReason};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    gateway: IngestionGateway,
    cache: DisplayCache,
}

/// Body of an ingestion request.
///
/// Identifiers are read as numbers so that `1.0` is accepted like `1`.
#[derive(Debug, Deserialize)]
struct IngestRequest {
    #[serde(alias = "device_id")]
    slave_id: Option<f64>,
    index: Option<f64>,
    value: Option<f64>,
}

/// Whole-number view of a JSON number.
fn as_integer(number: f64) -> Option<i64> {
    (number.fract() == 0.0).then_some(number as i64)
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "status": "error",
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Body of the snapshot response.
#[derive(Debug, Serialize)]
struct SnapshotBody {
    taken_at: i64,
    devices: Vec<DeviceDisplay>,
}

/// Create the HTTP router.
fn create_router(gateway: IngestionGateway, cache: DisplayCache) -> Router {
    let state = AppState { gateway, cache };

    Router::new()
        .route("/api/receive-data", post(ingest_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the /api/receive-data endpoint.
async fn ingest_handler(
    State(state): State<AppState>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!("Unreadable ingest body: {}", rejection.body_text());
            return bad_request(rejection.body_text());
        }
    };

    let (Some(device_id), Some(index), Some(value)) =
        (request.slave_id, request.index, request.value)
    else {
        return bad_request("missing required fields: slave_id/index/value");
    };
    let Some(device_id) = as_integer(device_id) else {
        return bad_request(format!("slave_id must be an integer, got {}", device_id));
    };
    let Some(index) = as_integer(index) else {
        return bad_request(format!("index must be an integer, got {}", index));
    };

    match state.gateway.ingest(device_id, index, value) {
        Ok(accepted) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "message": accepted.message,
                "value": accepted.value,
            })),
        )
            .into_response(),
        Err(e) => {
            debug!(device_id, index, value, "Update rejected: {}", e);
            let status = match e.reason() {
                RejectReason::ServiceStopping => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            };
            (
                status,
                Json(json!({
                    "status": "error",
                    "reason": e.reason(),
                    "message": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

/// Handler for the /api/snapshot endpoint.
async fn snapshot_handler(State(state): State<AppState>) -> Response {
    let body = SnapshotBody {
        taken_at: chrono::Utc::now().timestamp_millis(),
        devices: state.cache.devices(),
    };
    (StatusCode::OK, Json(body)).into_response()
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// HTTP server configuration.
pub struct HttpServer {
    gateway: IngestionGateway,
    cache: DisplayCache,
    listen_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(gateway: IngestionGateway, cache: DisplayCache, listen_addr: SocketAddr) -> Self {
        Self {
            gateway,
            cache,
            listen_addr,
        }
    }

    /// Bind the listener. Fails if the address is unavailable.
    pub async fn bind(self) -> anyhow::Result<BoundHttpServer> {
        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(addr = %self.listen_addr, "HTTP server listening");

        Ok(BoundHttpServer {
            router: create_router(self.gateway, self.cache),
            listener,
        })
    }
}

/// HTTP server with its listener bound.
pub struct BoundHttpServer {
    router: Router,
    listener: tokio::net::TcpListener,
}

impl BoundHttpServer {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                // Wait for shutdown signal
                loop {
                    if *shutdown.borrow_and_update() {
                        break;
                    }
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
