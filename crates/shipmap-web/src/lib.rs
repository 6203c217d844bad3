//! Axum JSON API for the store shipment map.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use shipmap_core::{group_recent_shipments, SyncMode};
use shipmap_storage::ShipmentRepository;
use shipmap_sync::{sync_status, QueueError, SyncQueue};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "shipmap-web";

pub const SYNC_SECRET_HEADER: &str = "x-sync-secret";

const STATUS_HISTORY_LIMIT: usize = 10;

const TRIGGERED_MESSAGE: &str = "sync triggered, running in background";

/// Manual trigger wiring; present only when the sync API is enabled.
#[derive(Clone)]
pub struct SyncTrigger {
    pub queue: SyncQueue,
    pub secret: String,
}

#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn ShipmentRepository>,
    pub recent_days: u32,
    pub cors_origins: Vec<String>,
    pub static_dir: Option<PathBuf>,
    pub sync: Option<SyncTrigger>,
}

impl AppState {
    pub fn new(repository: Arc<dyn ShipmentRepository>, recent_days: u32) -> Self {
        Self {
            repository,
            recent_days,
            cors_origins: vec!["*".to_string()],
            static_dir: None,
            sync: None,
        }
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }

    /// Serve files from `dir` for any path the API does not claim.
    pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }

    pub fn with_sync_trigger(mut self, queue: SyncQueue, secret: impl Into<String>) -> Self {
        self.sync = Some(SyncTrigger {
            queue,
            secret: secret.into(),
        });
        self
    }
}

pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() || origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(%origin, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            HeaderName::from_static(SYNC_SECRET_HEADER),
        ])
        .max_age(std::time::Duration::from_secs(12 * 3600))
}

/// `/api/shopeMap` and `/api/triggerSync` are the paths the existing map page calls.
pub fn app(state: AppState) -> Router {
    let cors = cors_layer(&state.cors_origins);
    let mut router = Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/store-map", get(store_map_handler))
        .route("/api/shopeMap", get(store_map_handler))
        .route("/api/sync/status", get(sync_status_handler));
    if state.sync.is_some() {
        router = router
            .route("/api/sync", post(trigger_sync_handler))
            .route("/api/triggerSync", post(trigger_sync_handler));
    }
    if let Some(dir) = &state.static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }
    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, sync_api = state.sync.is_some(), "api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn store_map_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.repository.recent_shipments(state.recent_days).await {
        Ok(rows) => Json(group_recent_shipments(rows)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match sync_status(state.repository.as_ref(), STATUS_HISTORY_LIMIT).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct TriggerQuery {
    secret: Option<String>,
    mode: Option<String>,
}

async fn trigger_sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TriggerQuery>,
) -> Response {
    let Some(trigger) = &state.sync else {
        return error_response(StatusCode::NOT_FOUND, "sync api is disabled");
    };

    let provided = headers
        .get(SYNC_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or(query.secret);
    if provided.as_deref() != Some(trigger.secret.as_str()) {
        warn!("sync trigger rejected: bad secret");
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let mode = match query.mode.as_deref().map(str::parse::<SyncMode>).transpose() {
        Ok(mode) => mode.unwrap_or(SyncMode::Incremental),
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    match trigger.queue.submit(mode) {
        Ok(ticket) => {
            tokio::spawn(async move {
                match ticket.outcome().await {
                    Ok(report) => info!(%mode, "{}", report.summary()),
                    Err(err) => error!(%mode, error = %err, "triggered sync failed"),
                }
            });
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "triggered",
                    "message": TRIGGERED_MESSAGE,
                    "mode": mode,
                })),
            )
                .into_response()
        }
        Err(QueueError::Full) => error_response(StatusCode::CONFLICT, &QueueError::Full.to_string()),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use shipmap_adapters::{PlaceCandidate, PlaceLookup, SheetSource};
    use shipmap_core::{GeoLocation, ProductCategory, ShipmentRecord, Store, StoreMap, SyncError};
    use shipmap_storage::MemoryRepository;
    use shipmap_sync::{GeocodeEnricher, SyncPipeline};
    use std::time::Duration;
    use tower::ServiceExt;

    struct OneStoreSheet;

    #[async_trait]
    impl SheetSource for OneStoreSheet {
        async fn load_stores(&self) -> Result<StoreMap, SyncError> {
            let mut store = Store::new("StoreA");
            store.push_shipment(ProductCategory::Okra, ShipmentRecord::new("2024/01/01", "5"));
            Ok(StoreMap::from([("StoreA".to_string(), store)]))
        }
    }

    struct NoPlaces;

    #[async_trait]
    impl PlaceLookup for NoPlaces {
        async fn search_text(&self, query: &str) -> Result<Vec<PlaceCandidate>, SyncError> {
            Err(SyncError::lookup(query, "no places found"))
        }
    }

    fn state_with_trigger(repo: Arc<MemoryRepository>) -> AppState {
        let enricher = GeocodeEnricher::new(Arc::new(NoPlaces), 2, Duration::ZERO);
        let pipeline = Arc::new(SyncPipeline::new(Arc::new(OneStoreSheet), enricher, repo.clone()));
        let (queue, _worker) = SyncQueue::start(pipeline, SyncQueue::DEFAULT_CAPACITY);
        AppState::new(repo, 3).with_sync_trigger(queue, "s3cret")
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    async fn wait_for_runs(repo: &MemoryRepository, count: usize) {
        for _ in 0..100 {
            if repo.runs().await.len() >= count
                && repo.runs().await.iter().all(|r| r.ended_at.is_some())
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sync run never finished");
    }

    #[tokio::test]
    async fn health_check() {
        let app = app(AppState::new(Arc::new(MemoryRepository::new()), 3));
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn store_map_groups_recent_shipments_and_hides_empty_quantities() {
        let repo = Arc::new(MemoryRepository::new());
        let today = Utc::now().date_naive();
        repo.seed_location(
            "StoreA",
            GeoLocation {
                place_id: "pid".into(),
                formatted_address: "No. 1, Taipei".into(),
                latitude: 25.03,
                longitude: 121.56,
            },
        )
        .await;
        repo.seed_shipment("StoreA", ProductCategory::Okra, today, "5").await;
        repo.seed_shipment("StoreA", ProductCategory::SpongeGourd, today, "0").await;
        repo.seed_shipment("StoreB", ProductCategory::Okra, today, "").await;

        let app = app(AppState::new(repo, 3));
        let resp = app
            .oneshot(Request::builder().uri("/api/store-map").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );

        let body = body_json(resp).await;
        let stores = body.as_array().unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0]["storeName"], "StoreA");
        assert_eq!(stores[0]["address"], "No. 1, Taipei");
        assert_eq!(stores[0]["latitude"], 25.03);
        let shipments = stores[0]["shipments"].as_array().unwrap();
        assert_eq!(shipments.len(), 1);
        assert_eq!(shipments[0]["productType"], "秋葵");
        assert_eq!(shipments[0]["quantity"], "5");
        assert_eq!(shipments[0]["date"], today.format("%Y-%m-%d").to_string());
    }

    #[tokio::test]
    async fn sync_route_is_absent_when_disabled() {
        let app = app(AppState::new(Arc::new(MemoryRepository::new()), 3));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sync")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_trigger_rejects_bad_secret() {
        let repo = Arc::new(MemoryRepository::new());
        let app = app(state_with_trigger(repo.clone()));
        for uri in ["/api/sync", "/api/sync?secret=wrong"] {
            let resp = app
                .clone()
                .oneshot(Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(repo.runs().await.is_empty());
    }

    #[tokio::test]
    async fn sync_trigger_accepts_header_secret_and_runs_in_background() {
        let repo = Arc::new(MemoryRepository::new());
        let app = app(state_with_trigger(repo.clone()));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sync?mode=full")
                    .header(SYNC_SECRET_HEADER, "s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "triggered");
        assert_eq!(body["message"], TRIGGERED_MESSAGE);
        assert_eq!(body["mode"], "full");

        wait_for_runs(&repo, 1).await;
        let runs = repo.runs().await;
        assert_eq!(runs[0].mode, SyncMode::Full);
        assert_eq!(runs[0].status, shipmap_core::SyncStatus::Success);
        assert_eq!(repo.shipment_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn sync_trigger_accepts_query_secret_and_rejects_unknown_mode() {
        let repo = Arc::new(MemoryRepository::new());
        let app = app(state_with_trigger(repo.clone()));

        let bad = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sync?secret=s3cret&mode=weekly")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let ok = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sync?secret=s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(ok).await["mode"], "incremental");
        wait_for_runs(&repo, 1).await;
    }

    #[tokio::test]
    async fn legacy_paths_serve_the_map_and_trigger() {
        let repo = Arc::new(MemoryRepository::new());
        repo.seed_shipment("StoreA", ProductCategory::Okra, Utc::now().date_naive(), "5")
            .await;
        let app = app(state_with_trigger(repo.clone()));

        let map = app
            .clone()
            .oneshot(Request::builder().uri("/api/shopeMap").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(map.status(), StatusCode::OK);
        assert_eq!(body_json(map).await[0]["storeName"], "StoreA");

        // An empty header falls back to the query secret.
        let triggered = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/triggerSync?secret=s3cret")
                    .header(SYNC_SECRET_HEADER, "")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(triggered.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(triggered).await["status"], "triggered");
        wait_for_runs(&repo, 1).await;
    }

    #[tokio::test]
    async fn legacy_trigger_is_absent_when_disabled() {
        let app = app(AppState::new(Arc::new(MemoryRepository::new()), 3));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/triggerSync?secret=s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn static_dir_serves_the_map_page_beside_the_api() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>shipment map</h1>").unwrap();
        let app = app(
            AppState::new(Arc::new(MemoryRepository::new()), 3).with_static_dir(dir.path()),
        );

        let page = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(page.status(), StatusCode::OK);
        let html = page.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&html[..], b"<h1>shipment map</h1>");

        let api = app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(api).await["status"], "ok");

        let missing = app
            .oneshot(Request::builder().uri("/nope.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_status_reports_history() {
        let repo = Arc::new(MemoryRepository::new());
        let app = app(state_with_trigger(repo.clone()));

        let empty = app
            .clone()
            .oneshot(Request::builder().uri("/api/sync/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(empty).await;
        assert!(body["lastSuccess"].is_null());
        assert!(body["hoursSinceLastSuccess"].is_null());

        let id = repo
            .start_sync_run(SyncMode::Incremental, Utc::now(), "sync started")
            .await
            .unwrap();
        repo.finish_sync_run(id, Utc::now(), shipmap_core::SyncStatus::Success, "ok")
            .await
            .unwrap();

        let resp = app
            .oneshot(Request::builder().uri("/api/sync/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["lastSuccess"]["id"], id.to_string());
        assert_eq!(body["recentRuns"].as_array().unwrap().len(), 1);
        assert!(body["hoursSinceLastSuccess"].as_f64().unwrap() < 0.1);
    }

    #[tokio::test]
    async fn cors_headers_follow_configured_origins() {
        let repo: Arc<dyn ShipmentRepository> = Arc::new(MemoryRepository::new());

        let open = app(AppState::new(Arc::clone(&repo), 3));
        let resp = open
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header(header::ORIGIN, "https://map.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let restricted = app(
            AppState::new(repo, 3).with_cors_origins(vec!["https://map.example".to_string()]),
        );
        let allowed = restricted
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header(header::ORIGIN, "https://map.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            allowed.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://map.example"
        );

        let other = restricted
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header(header::ORIGIN, "https://evil.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(other.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }
}
