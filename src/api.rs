use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, warn};

use crate::{
    auth::verify_bearer,
    error::CacheError,
    models::{CommanderSummary, NearestControlledQuery, NearestSystemResponse, RefreshRequest},
    AppState,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/v1/refresh", post(refresh))
        .route("/v1/systems/{id}", get(get_system))
        .route("/v1/systems/by-name/{name}", get(get_system_by_name))
        .route(
            "/v1/systems/{id}/nearest-controlled",
            get(get_nearest_controlled),
        )
        .route("/v1/commander", get(get_commander))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn get_status(State(state): State<AppState>) -> Response {
    match state.cache.status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(err) => cache_error_response(err),
    }
}

pub async fn get_system(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.cache.system_by_id(id).await {
        Ok(Some(system)) => (StatusCode::OK, Json(system)).into_response(),
        Ok(None) => system_not_found(),
        Err(err) => cache_error_response(err),
    }
}

pub async fn get_system_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.cache.system_by_name(&name).await {
        Ok(Some(system)) => (StatusCode::OK, Json(system)).into_response(),
        Ok(None) => system_not_found(),
        Err(err) => cache_error_response(err),
    }
}

pub async fn get_nearest_controlled(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<NearestControlledQuery>,
) -> Response {
    // A missing or blank power falls through to the store, which has no match
    // for it.
    let power = query.power.unwrap_or_default();
    let reference = match state.cache.system_by_id(id).await {
        Ok(Some(reference)) => reference,
        Ok(None) => return system_not_found(),
        Err(err) => return cache_error_response(err),
    };

    match state.cache.nearest_controlled(id, &power).await {
        Ok(Some(nearest)) => {
            let distance = reference.distance_to(&nearest);
            (
                StatusCode::OK,
                Json(NearestSystemResponse {
                    reference,
                    nearest,
                    distance,
                }),
            )
                .into_response()
        }
        Ok(None) => error_body(
            StatusCode::NOT_FOUND,
            "NO_CONTROLLED_SYSTEM",
            "No other system is controlled by that power.",
        ),
        Err(err) => cache_error_response(err),
    }
}

pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> Response {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    let force = body.map(|Json(request)| request.force).unwrap_or(false);
    match state.cache.ensure_fresh(force).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => cache_error_response(err),
    }
}

pub async fn get_commander(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    let allied = match state.cache.nearest_allied_system(state.commander.as_ref()).await {
        Ok(report) => report,
        Err(err) => return cache_error_response(err),
    };
    let credit_balance = state.commander.credit_balance().await;

    (
        StatusCode::OK,
        Json(CommanderSummary {
            cmdr_name: state.commander.cmdr_name().to_string(),
            credit_balance,
            generated_at: Utc::now(),
            allied,
        }),
    )
        .into_response()
}

fn system_not_found() -> Response {
    error_body(StatusCode::NOT_FOUND, "SYSTEM_NOT_FOUND", "System not found.")
}

fn cache_error_response(err: CacheError) -> Response {
    let (status, code) = match &err {
        CacheError::RefreshFailed { .. } => (StatusCode::BAD_GATEWAY, "REFRESH_FAILED"),
        CacheError::MalformedRecord { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "MALFORMED_RECORD"),
        CacheError::StorageUnavailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE")
        }
        CacheError::StorageWrite { .. }
        | CacheError::StorageRead { .. }
        | CacheError::FreshnessState { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
    };

    if status.is_server_error() {
        error!("Request failed: {err}");
    } else {
        warn!("Request failed: {err}");
    }
    error_body(status, code, &err.to_string())
}

fn error_body(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::{to_bytes, Body},
        http::{header, Request},
    };
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        cache::SystemCache,
        commander::CommanderClient,
        config::Config,
        download::HttpBulkSource,
        freshness::FreshnessTracker,
        refresh::tests::DUMP,
        store::{
            tests::{controlled, system},
            CatalogWriter, SystemStore,
        },
    };

    const API_KEY: &str = "test-key";

    fn test_config(dir: &TempDir) -> Config {
        Config {
            bind_addr: ([127, 0, 0, 1], 0).into(),
            api_key: API_KEY.to_string(),
            api_key_is_fallback: false,
            data_dir: dir.path().to_path_buf(),
            bulk_url: "http://127.0.0.1:9/systems.json".to_string(),
            refresh_interval_hours: 24,
            download_timeout: Duration::from_secs(2),
            max_corruption_retries: 1,
            ingest_batch_size: 100,
            read_pool_size: 2,
            refresh_check_interval: Duration::from_secs(300),
            cmdr_name: String::new(),
            edsm_api_key: None,
            inara_api_key: None,
            lookup_timeout: Duration::from_secs(1),
        }
    }

    // Seeds the store and a fresh freshness marker so nothing downloads
    // unless forced. The bulk URL points at a closed port.
    async fn seeded_app(dir: &TempDir) -> Router {
        let config = test_config(dir);
        let cache_config = config.cache_config();
        {
            let store = SystemStore::open(&cache_config.database_path(), 1).expect("store");
            store
                .upsert_many(&[
                    system(1, "A", 0.0, 0.0, 0.0),
                    controlled(2, "B", 1.0, "Alpha"),
                    controlled(3, "C", 5.0, "Alpha"),
                    controlled(4, "D", 2.0, "Beta"),
                ])
                .expect("seed");
        }
        std::fs::write(cache_config.source_path(), DUMP).expect("source file");
        FreshnessTracker::load(
            &cache_config.freshness_path(),
            &cache_config.source_path(),
            config.refresh_interval_hours,
        )
        .mark_refreshed(Utc::now())
        .expect("mark fresh");

        let source =
            HttpBulkSource::new(config.bulk_url.clone(), config.download_timeout).expect("source");
        let cache = SystemCache::open(cache_config, source).await.expect("cache");
        let commander =
            CommanderClient::new("", None, None, config.lookup_timeout).expect("commander");
        router(AppState {
            config,
            cache: Arc::new(cache),
            commander: Arc::new(commander),
        })
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::get(uri).body(Body::empty()).expect("request");
        send(app, request).await
    }

    fn refresh_request(token: Option<&str>, body: Option<&str>) -> Request<Body> {
        let mut builder = Request::post("/v1/refresh");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        };
        request.expect("request")
    }

    #[tokio::test]
    async fn system_routes_return_rows_or_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let app = seeded_app(&dir).await;

        let (status, body) = get_json(&app, "/v1/systems/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "A");

        let (status, body) = get_json(&app, "/v1/systems/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "SYSTEM_NOT_FOUND");

        let (status, body) = get_json(&app, "/v1/systems/by-name/C").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], 3);

        let (status, body) = get_json(&app, "/v1/systems/by-name/Nowhere").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "SYSTEM_NOT_FOUND");
    }

    #[tokio::test]
    async fn nearest_controlled_route_reports_closest_system() {
        let dir = TempDir::new().expect("tempdir");
        let app = seeded_app(&dir).await;

        let (status, body) = get_json(&app, "/v1/systems/1/nearest-controlled?power=Alpha").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nearest"]["name"], "B");
        assert_eq!(body["distance"], 1.0);

        let (status, body) = get_json(&app, "/v1/systems/999/nearest-controlled?power=Alpha").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "SYSTEM_NOT_FOUND");
    }

    #[tokio::test]
    async fn nearest_controlled_without_power_is_empty_not_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let app = seeded_app(&dir).await;

        for uri in [
            "/v1/systems/1/nearest-controlled",
            "/v1/systems/1/nearest-controlled?power=",
            "/v1/systems/1/nearest-controlled?power=%20%20",
            "/v1/systems/1/nearest-controlled?power=Gamma",
        ] {
            let (status, body) = get_json(&app, uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(body["error"]["code"], "NO_CONTROLLED_SYSTEM", "{uri}");
        }
    }

    #[tokio::test]
    async fn refresh_requires_bearer_token() {
        let dir = TempDir::new().expect("tempdir");
        let app = seeded_app(&dir).await;

        let (status, _) = send(&app, refresh_request(None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, refresh_request(Some("wrong"), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn refresh_returns_outcome_or_gateway_error() {
        let dir = TempDir::new().expect("tempdir");
        let app = seeded_app(&dir).await;

        let (status, body) = send(&app, refresh_request(Some(API_KEY), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "skipped");

        let (status, body) =
            send(&app, refresh_request(Some(API_KEY), Some(r#"{"force":false}"#))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "skipped");

        let (status, body) =
            send(&app, refresh_request(Some(API_KEY), Some(r#"{"force":true}"#))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "REFRESH_FAILED");

        let (status, body) = get_json(&app, "/v1/systems/4").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "D");
    }

    #[tokio::test]
    async fn status_route_reports_fresh_seeded_cache() {
        let dir = TempDir::new().expect("tempdir");
        let app = seeded_app(&dir).await;

        let (status, body) = get_json(&app, "/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "fresh");
        assert_eq!(body["systemCount"], 4);
        assert_eq!(body["refreshIntervalHours"], 24);
    }

    #[test]
    fn refresh_failures_map_to_bad_gateway() {
        let response = cache_error_response(CacheError::refresh_failed("offline"));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn malformed_records_map_to_unprocessable() {
        let response = cache_error_response(CacheError::MalformedRecord {
            index: 4,
            message: "missing field `x`".to_string(),
        });
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
