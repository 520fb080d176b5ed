use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::put;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::registry::Entry;
use crate::registry::Registry;
use crate::registry::RegistryError;
use crate::sensor::Snapshot;
use crate::tracker::Tracker;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    sensors: usize,
}

/// A tracked sensor with its registry flags
#[derive(Serialize)]
struct SensorResponse {
    #[serde(flatten)]
    snapshot: Snapshot,
    registered: bool,
    disabled: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct DisabledRequest {
    disabled: bool,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    tracker: Arc<Tracker>,
    registry: Arc<dyn Registry>,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn lookup_entry(registry: &dyn Registry, id: &str) -> Result<Entry, Response> {
    match registry.get(id) {
        Ok(entry) => Ok(entry),
        Err(RegistryError::NotFound(_)) => Ok(Entry::default()),
        Err(e) => Err(error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
            sensors: state.tracker.sensor_list().len(),
        }),
    )
}

/// Handler for GET /v1/sensors
#[tracing::instrument(skip(state))]
async fn list_sensors(State(state): State<Arc<AppState>>) -> Response {
    let mut sensors = Vec::new();
    for id in state.tracker.sensor_list() {
        // Reset may race with listing
        let Ok(snapshot) = state.tracker.get(&id) else {
            continue;
        };
        let entry = match lookup_entry(state.registry.as_ref(), &id) {
            Ok(e) => e,
            Err(resp) => return resp,
        };
        sensors.push(SensorResponse {
            snapshot,
            registered: entry.registered,
            disabled: entry.disabled,
        });
    }
    (StatusCode::OK, Json(sensors)).into_response()
}

/// Handler for GET /v1/sensors/:id
#[tracing::instrument(skip(state))]
async fn get_sensor(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let snapshot = match state.tracker.get(&id) {
        Ok(s) => s,
        Err(e) => return error(StatusCode::NOT_FOUND, e.to_string()),
    };
    let entry = match lookup_entry(state.registry.as_ref(), &id) {
        Ok(e) => e,
        Err(resp) => return resp,
    };
    (
        StatusCode::OK,
        Json(SensorResponse {
            snapshot,
            registered: entry.registered,
            disabled: entry.disabled,
        }),
    )
        .into_response()
}

/// Handler for PUT /v1/sensors/:id/disabled
#[tracing::instrument(skip(state, body))]
async fn set_disabled(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<DisabledRequest>,
) -> Response {
    // Only sensors that have been seen can be toggled
    if state.tracker.get(&id).is_err() {
        match state.registry.get(&id) {
            Ok(_) => {}
            Err(RegistryError::NotFound(_)) => {
                return error(StatusCode::NOT_FOUND, format!("unknown sensor: {}", id));
            }
            Err(e) => return error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        }
    }

    match state.registry.set_disabled(&id, body.disabled) {
        Ok(entry) => {
            tracing::info!("[{}] disabled={}", id, entry.disabled);
            (StatusCode::OK, Json(entry)).into_response()
        }
        Err(e) => error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/sensors", get(list_sensors))
        .route("/v1/sensors/:id", get(get_sensor))
        .route("/v1/sensors/:id/disabled", put(set_disabled))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves until `cancel` fires.
pub async fn serve(
    listen: &str,
    port: u16,
    tracker: Arc<Tracker>,
    registry: Arc<dyn Registry>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        version: env!("CARGO_PKG_VERSION"),
        tracker,
        registry,
    });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;
    use crate::publisher::PublishError;
    use crate::publisher::Publisher;
    use crate::publisher::UpdateStatus;
    use crate::registry::SqliteRegistry;

    struct NullPublisher;

    #[async_trait]
    impl Publisher for NullPublisher {
        async fn register_sensor(&self, _s: &Snapshot) -> Result<(), PublishError> {
            Ok(())
        }

        async fn update_sensor(&self, _s: &Snapshot) -> Result<UpdateStatus, PublishError> {
            Ok(UpdateStatus::default())
        }
    }

    /// Router over a tracker that has seen "Uptime"
    async fn router() -> (TempDir, Router, Arc<SqliteRegistry>) {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(SqliteRegistry::open(dir.path()).unwrap());
        let tracker = Arc::new(Tracker::new(Arc::new(NullPublisher)));

        let (tx, rx) = mpsc::channel(1);
        tx.send(Snapshot::new("Uptime", 42)).await.unwrap();
        drop(tx);
        tracker
            .process(&CancellationToken::new(), registry.clone(), vec![rx])
            .await;

        let state = Arc::new(AppState {
            version: "test",
            tracker,
            registry: registry.clone(),
        });
        (dir, create_router(state), registry)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let (_dir, app, _) = router().await;
        let resp = app
            .oneshot(Request::get("/v1/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_info() {
        let (_dir, app, _) = router().await;
        let resp = app
            .oneshot(Request::get("/v1/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["version"], "test");
        assert_eq!(json["sensors"], 1);
    }

    #[tokio::test]
    async fn test_list_and_get_sensor() {
        let (_dir, app, _) = router().await;

        let resp = app
            .clone()
            .oneshot(Request::get("/v1/sensors").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json[0]["id"], "uptime");
        assert_eq!(json[0]["state"], 42);
        assert_eq!(json[0]["registered"], true);

        let resp = app
            .clone()
            .oneshot(Request::get("/v1/sensors/uptime").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["disabled"], false);

        let resp = app
            .oneshot(Request::get("/v1/sensors/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_set_disabled() {
        let (_dir, app, registry) = router().await;

        let resp = app
            .clone()
            .oneshot(
                Request::put("/v1/sensors/uptime/disabled")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"disabled": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["disabled"], true);
        assert!(registry.is_disabled("uptime"));
        assert!(registry.is_registered("uptime"));

        let resp = app
            .oneshot(
                Request::put("/v1/sensors/nope/disabled")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"disabled": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
