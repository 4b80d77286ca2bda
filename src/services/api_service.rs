use actix_web::{middleware::Logger, web, App, HttpResponse, HttpServer, Result as ActixResult};
use chrono::{DateTime, NaiveDate, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::aggregation::skip_for_span;
use crate::storage::latest_cache::LatestCache;
use crate::storage::sqlite_manager::SqliteManager;
use crate::utils::error::StoreError;

const DEFAULT_RECENT_HOURS: i64 = 24;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorResponse {
    fn new(code: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            code: code.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub skip: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    pub hours: Option<String>,
}

/// Read-only view shared by every worker.
#[derive(Clone)]
pub struct ApiServiceState {
    pub store: SqliteManager,
    pub cache: Arc<LatestCache>,
    pub device_ids: Vec<String>,
}

impl ApiServiceState {
    pub fn new(store: SqliteManager, cache: Arc<LatestCache>, device_ids: Vec<String>) -> Self {
        Self {
            store,
            cache,
            device_ids,
        }
    }

    fn knows(&self, device_id: &str) -> bool {
        self.device_ids.iter().any(|d| d == device_id)
    }
}

pub struct ApiService {
    state: ApiServiceState,
    server_handle: Option<actix_web::dev::ServerHandle>,
}

impl ApiService {
    pub fn new(state: ApiServiceState) -> Self {
        Self {
            state,
            server_handle: None,
        }
    }

    pub async fn start(&mut self, bind_address: &str, port: u16) -> std::io::Result<()> {
        info!("🌐 Starting HTTP API server on {}:{}", bind_address, port);

        let state_data = web::Data::new(self.state.clone());
        let server = HttpServer::new(move || {
            App::new()
                .app_data(state_data.clone())
                .wrap(Logger::default())
                .configure(configure)
        })
        .bind((bind_address, port))?
        .run();

        self.server_handle = Some(server.handle());
        tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("❌ HTTP API server error: {}", e);
            }
        });

        info!("✅ HTTP API server started on {}:{}", bind_address, port);
        Ok(())
    }

    pub async fn stop(&mut self) {
        info!("🛑 Stopping HTTP API server...");
        if let Some(handle) = self.server_handle.take() {
            tokio::select! {
                _ = handle.stop(true) => {
                    info!("✅ HTTP API server stopped gracefully");
                }
                _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {
                    warn!("⚠️  HTTP API server shutdown timeout, forcing stop");
                    handle.stop(false).await;
                }
            }
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(health_check))
            .route("/{device_id}/latest", web::get().to(latest))
            .route("/{device_id}/history", web::get().to(history))
            .route("/{device_id}/compare", web::get().to(compare))
            .route("/{device_id}/recent", web::get().to(recent))
            .route("/{device_id}/daily", web::get().to(daily)),
    );
}

fn bad_request(message: impl Into<String>) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponse::new("BAD_REQUEST", message))
}

fn unknown_device(device_id: &str) -> HttpResponse {
    HttpResponse::NotFound().json(ErrorResponse::new(
        "DEVICE_NOT_FOUND",
        format!("Unknown device: {}", device_id),
    ))
}

fn store_failure(context: &str, e: StoreError) -> HttpResponse {
    match e {
        StoreError::InvalidRange(msg) | StoreError::InvalidParameter(msg) => bad_request(msg),
        other => {
            error!("❌ {} failed: {}", context, other);
            HttpResponse::InternalServerError().json(ErrorResponse::new("DATABASE_ERROR", format!("{} failed", context)))
        }
    }
}

fn required_date(value: &Option<String>, name: &str) -> Result<NaiveDate, HttpResponse> {
    let raw = value
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request(format!("Missing {}", name)))?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| bad_request(format!("Invalid {} '{}', expected YYYY-MM-DD", name, raw)))
}

fn date_range(params: &RangeParams) -> Result<(NaiveDate, NaiveDate), HttpResponse> {
    Ok((
        required_date(&params.start_date, "start_date")?,
        required_date(&params.end_date, "end_date")?,
    ))
}

// GET /api/health
async fn health_check(state: web::Data<ApiServiceState>) -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "Power Monitor API",
        "devices": state.device_ids,
        "cached": state.cache.len(),
        "timestamp": Utc::now(),
        "version": crate::VERSION
    })))
}

// GET /api/{device_id}/latest
async fn latest(path: web::Path<String>, state: web::Data<ApiServiceState>) -> ActixResult<HttpResponse> {
    let device_id = path.into_inner();
    if !state.knows(&device_id) {
        return Ok(unknown_device(&device_id));
    }

    if let Some(reading) = state.cache.get(&device_id) {
        return Ok(HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "source": "cache",
            "reading": reading
        })));
    }

    match state.store.query_latest(&device_id).await {
        Ok(Some(reading)) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "source": "store",
            "reading": reading
        }))),
        Ok(None) => Ok(HttpResponse::NotFound().json(ErrorResponse::new(
            "NO_DATA",
            format!("No data for {}", device_id),
        ))),
        Err(e) => Ok(store_failure("Latest lookup", e)),
    }
}

// GET /api/{device_id}/history?start_date&end_date
async fn history(
    path: web::Path<String>,
    query: web::Query<RangeParams>,
    state: web::Data<ApiServiceState>,
) -> ActixResult<HttpResponse> {
    let device_id = path.into_inner();
    if !state.knows(&device_id) {
        return Ok(unknown_device(&device_id));
    }
    let (start, end) = match date_range(&query) {
        Ok(range) => range,
        Err(response) => return Ok(response),
    };

    match state.store.query_range(&device_id, start, end).await {
        Ok(buckets) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "device_id": device_id,
            "count": buckets.len(),
            "buckets": buckets
        }))),
        Err(e) => Ok(store_failure("History query", e)),
    }
}

// GET /api/{device_id}/compare?start_date&end_date[&skip]
async fn compare(
    path: web::Path<String>,
    query: web::Query<RangeParams>,
    state: web::Data<ApiServiceState>,
) -> ActixResult<HttpResponse> {
    let device_id = path.into_inner();
    if !state.knows(&device_id) {
        return Ok(unknown_device(&device_id));
    }
    let (start, end) = match date_range(&query) {
        Ok(range) => range,
        Err(response) => return Ok(response),
    };
    let skip = match query.skip.as_deref() {
        None => skip_for_span(start, end),
        Some(raw) => match raw.parse::<u32>() {
            Ok(skip) => skip,
            Err(_) => return Ok(bad_request(format!("Invalid skip '{}'", raw))),
        },
    };

    match state.store.query_downsampled(&device_id, start, end, skip).await {
        Ok(rows) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "device_id": device_id,
            "skip": skip,
            "count": rows.len(),
            "readings": rows
        }))),
        Err(e) => Ok(store_failure("Compare query", e)),
    }
}

// GET /api/{device_id}/recent[?hours]
async fn recent(
    path: web::Path<String>,
    query: web::Query<RecentParams>,
    state: web::Data<ApiServiceState>,
) -> ActixResult<HttpResponse> {
    let device_id = path.into_inner();
    if !state.knows(&device_id) {
        return Ok(unknown_device(&device_id));
    }
    let hours = match query.hours.as_deref() {
        None => DEFAULT_RECENT_HOURS,
        Some(raw) => match raw.parse::<i64>() {
            Ok(h) if h > 0 => h,
            _ => return Ok(bad_request(format!("Invalid hours '{}'", raw))),
        },
    };

    match state.store.query_recent(&device_id, hours).await {
        Ok(rows) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "device_id": device_id,
            "hours": hours,
            "count": rows.len(),
            "readings": rows
        }))),
        Err(e) => Ok(store_failure("Recent query", e)),
    }
}

// GET /api/{device_id}/daily?start_date&end_date
async fn daily(
    path: web::Path<String>,
    query: web::Query<RangeParams>,
    state: web::Data<ApiServiceState>,
) -> ActixResult<HttpResponse> {
    let device_id = path.into_inner();
    if !state.knows(&device_id) {
        return Ok(unknown_device(&device_id));
    }
    let (start, end) = match date_range(&query) {
        Ok(range) => range,
        Err(response) => return Ok(response),
    };

    match state.store.daily_usage(&device_id, start, end).await {
        Ok(days) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "device_id": device_id,
            "days": days
        }))),
        Err(e) => Ok(store_failure("Daily usage query", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::Reading;
    use crate::storage::sqlite_manager::tests::temp_store;
    use actix_web::http::StatusCode;
    use actix_web::test;
    use chrono::NaiveDateTime;
    use tempfile::TempDir;

    async fn test_state() -> (TempDir, ApiServiceState) {
        let (dir, store) = temp_store().await;
        let state = ApiServiceState::new(
            store,
            Arc::new(LatestCache::new()),
            vec!["unit01".to_string(), "unit02".to_string()],
        );
        (dir, state)
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn reading(device_id: &str, ts: &str, voltage: f64) -> Reading {
        Reading {
            voltage,
            current: 2.0,
            accumulated_energy: 10.0,
            ..Reading::zeroed(device_id, at(ts))
        }
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(App::new().app_data(web::Data::new($state.clone())).configure(configure)).await
        };
    }

    #[actix_web::test]
    async fn test_health() {
        let (_dir, state) = test_state().await;
        let app = app!(state);
        let req = test::TestRequest::get().uri("/api/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
    }

    #[actix_web::test]
    async fn test_latest_prefers_cache_then_store() {
        let (_dir, state) = test_state().await;
        state.store.append(&reading("unit01", "2024-01-01 00:00:00", 220.0)).await.unwrap();
        let app = app!(state);

        let req = test::TestRequest::get().uri("/api/unit01/latest").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["source"], "store");
        assert_eq!(body["reading"]["voltage"], 220.0);

        state.cache.set(reading("unit01", "2024-01-01 00:00:01", 231.0));
        let req = test::TestRequest::get().uri("/api/unit01/latest").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["source"], "cache");
        assert_eq!(body["reading"]["voltage"], 231.0);
    }

    #[actix_web::test]
    async fn test_latest_without_data_is_not_found() {
        let (_dir, state) = test_state().await;
        let app = app!(state);
        let req = test::TestRequest::get().uri("/api/unit02/latest").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["code"], "NO_DATA");
        assert!(body["error"].is_string());
    }

    #[actix_web::test]
    async fn test_unknown_device_is_not_found() {
        let (_dir, state) = test_state().await;
        let app = app!(state);
        let req = test::TestRequest::get()
            .uri("/api/unit09/history?start_date=2024-01-01&end_date=2024-01-01")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_history_requires_valid_dates() {
        let (_dir, state) = test_state().await;
        let app = app!(state);

        for uri in [
            "/api/unit01/history",
            "/api/unit01/history?start_date=2024-01-01",
            "/api/unit01/history?start_date=yesterday&end_date=2024-01-01",
            "/api/unit01/history?start_date=2024-01-05&end_date=2024-01-01",
        ] {
            let req = test::TestRequest::get().uri(uri).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", uri);
            let body: serde_json::Value = test::read_body_json(resp).await;
            assert_eq!(body["success"], false);
        }
    }

    #[actix_web::test]
    async fn test_history_returns_buckets() {
        let (_dir, state) = test_state().await;
        state.store.append(&reading("unit01", "2024-01-01 00:00:00", 100.0)).await.unwrap();
        state.store.append(&reading("unit01", "2024-01-01 00:04:00", 110.0)).await.unwrap();
        state.store.append(&reading("unit01", "2024-01-01 00:06:00", 120.0)).await.unwrap();
        let app = app!(state);

        let req = test::TestRequest::get()
            .uri("/api/unit01/history?start_date=2024-01-01&end_date=2024-01-01")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 2);
        assert_eq!(body["buckets"][0]["avg_voltage"], 105.0);
    }

    #[actix_web::test]
    async fn test_compare_uses_explicit_and_default_skip() {
        let (_dir, state) = test_state().await;
        for i in 0..20 {
            let ts = format!("2024-01-01 00:00:{:02}", i);
            state.store.append(&reading("unit02", &ts, i as f64)).await.unwrap();
        }
        let app = app!(state);

        let req = test::TestRequest::get()
            .uri("/api/unit02/compare?start_date=2024-01-01&end_date=2024-01-01&skip=5")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 4);

        let req = test::TestRequest::get()
            .uri("/api/unit02/compare?start_date=2024-01-01&end_date=2024-01-01")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["skip"], 1);
        assert_eq!(body["count"], 20);

        let req = test::TestRequest::get()
            .uri("/api/unit02/compare?start_date=2024-01-01&end_date=2024-01-01&skip=0")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_recent_rejects_bad_hours() {
        let (_dir, state) = test_state().await;
        let app = app!(state);
        let req = test::TestRequest::get().uri("/api/unit01/recent?hours=-3").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri("/api/unit01/recent").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["hours"], 24);
        assert_eq!(body["count"], 0);
    }

    #[actix_web::test]
    async fn test_recent_rejects_hours_beyond_calendar() {
        let (_dir, state) = test_state().await;
        let app = app!(state);
        for hours in ["3000000000", "9223372036854775807"] {
            let req = test::TestRequest::get()
                .uri(&format!("/api/unit01/recent?hours={}", hours))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "hours={}", hours);
        }
    }

    #[actix_web::test]
    async fn test_store_failure_is_reported() {
        let (_dir, state) = test_state().await;
        state.store.close().await;
        let app = app!(state);
        let req = test::TestRequest::get()
            .uri("/api/unit01/daily?start_date=2024-01-01&end_date=2024-01-07")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["code"], "DATABASE_ERROR");
    }
}
