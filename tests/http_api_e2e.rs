use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header::AUTHORIZATION, Method, Request, StatusCode};
use axum::Router;
use base64::{engine::general_purpose, Engine as _};
use chrono::NaiveDate;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

use tally_insights::application::handlers::dashboard_handler::{router, AppState};
use tally_insights::application::services::dashboard_pipeline::DashboardPipeline;
use tally_insights::application::services::report_cache::ReportCache;
use tally_insights::auth::{InMemoryUserStore, UserStore};
use tally_insights::domain::entities::raw_record::RawRecord;
use tally_insights::domain::entities::report_key::{DateRange, ReportKey, ReportKind};
use tally_insights::domain::errors::{PipelineError, PipelineResult};
use tally_insights::domain::repositories::source_client::SourceClient;
use tally_insights::domain::services::alert_engine::{AlertEngine, AlertThresholds};
use tally_insights::rate_limit::{create_rate_limiter, RateLimiterConfig};

struct StaticSource {
    reachable: bool,
    fetches: AtomicUsize,
    keys: Mutex<Vec<ReportKey>>,
}

impl StaticSource {
    fn new(reachable: bool) -> Self {
        Self {
            reachable,
            fetches: AtomicUsize::new(0),
            keys: Mutex::new(Vec::new()),
        }
    }

    fn fetched_key(&self, kind: ReportKind) -> Option<ReportKey> {
        let keys = self.keys.lock().unwrap();
        keys.iter().find(|k| k.kind == kind).cloned()
    }
}

#[async_trait]
impl SourceClient for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self, kind: ReportKind, key: &ReportKey) -> PipelineResult<Vec<RawRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().unwrap().push(key.clone());
        if !self.reachable {
            return Err(PipelineError::UpstreamUnavailable("timed out".to_string()));
        }
        let records = match kind {
            ReportKind::Inventory => vec![RawRecord::new("STOCKITEM")
                .with_text("NAME", "Widget")
                .with_text("CLOSINGBALANCE", "85")
                .with_text("REORDERBASE", "100")],
            _ => Vec::new(),
        };
        Ok(records)
    }

    async fn test_connection(&self) -> PipelineResult<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(PipelineError::UpstreamUnavailable("timed out".to_string()))
        }
    }

    async fn company_list(&self) -> PipelineResult<Vec<String>> {
        Ok(vec!["Acme Traders".to_string(), "Beta Stores".to_string()])
    }
}

fn app_with(source: Arc<StaticSource>, requests_per_minute: u32) -> Router {
    let engine = AlertEngine::new(AlertThresholds::default()).unwrap();
    let pipeline = DashboardPipeline::new(source, ReportCache::default(), engine);
    let state = AppState {
        pipeline: Arc::new(pipeline),
        default_horizon: 3,
        retry_delay: Duration::from_millis(1),
    };
    let users: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::with_default_users());
    let limiter = create_rate_limiter(&RateLimiterConfig {
        requests_per_minute,
    });
    router(state, users, limiter)
}

fn app(reachable: bool) -> (Router, Arc<StaticSource>) {
    let source = Arc::new(StaticSource::new(reachable));
    (app_with(source.clone(), 1000), source)
}

fn basic(user: &str, password: &str) -> String {
    format!(
        "Basic {}",
        general_purpose::STANDARD.encode(format!("{}:{}", user, password))
    )
}

fn get(uri: &str, credentials: Option<(&str, &str)>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some((user, password)) = credentials {
        builder = builder.header(AUTHORIZATION, basic(user, password));
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_needs_no_credentials() {
    let (app, _) = app(true);
    let response = app.oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["source"], "static");
}

#[tokio::test]
async fn test_api_requires_valid_credentials() {
    let (app, source) = app(true);

    let missing = app
        .clone()
        .oneshot(get("/api/reports/inventory", None))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .oneshot(get("/api/reports/inventory", Some(("admin", "nope"))))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(wrong).await["kind"], "unauthorized");
    assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_viewer_reads_reports_but_not_forecasts() {
    let (app, _) = app(true);

    let report = app
        .clone()
        .oneshot(get("/api/reports/inventory", Some(("viewer", "viewer123"))))
        .await
        .unwrap();
    assert_eq!(report.status(), StatusCode::OK);
    let body = json_body(report).await;
    assert_eq!(body["kind"], "inventory");
    assert_eq!(body["summary"]["low_stock_items"], 1);

    let forecast = app
        .oneshot(get("/api/forecast/sales", Some(("viewer", "viewer123"))))
        .await
        .unwrap();
    assert_eq!(forecast.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(forecast).await["kind"], "forbidden");
}

#[tokio::test]
async fn test_forecast_with_no_history_is_unprocessable() {
    let (app, _) = app(true);
    let response = app
        .oneshot(get("/api/forecast/sales?horizon=2", Some(("manager", "manager123"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json_body(response).await["kind"], "insufficient_history");
}

#[tokio::test]
async fn test_unknown_kind_and_bad_range_are_bad_requests() {
    let (app, _) = app(true);
    let admin = Some(("admin", "admin123"));

    let unknown = app
        .clone()
        .oneshot(get("/api/reports/payroll", admin))
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(unknown).await["kind"], "invalid_request");

    let inverted = app
        .oneshot(get("/api/reports/sales?from=2024-06-01&to=2024-05-01", admin))
        .await
        .unwrap();
    assert_eq!(inverted.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unreachable_upstream_is_retried_once_then_bad_gateway() {
    let (app, source) = app(false);
    let response = app
        .oneshot(get("/api/reports/sales", Some(("admin", "admin123"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(json_body(response).await["kind"], "upstream_unavailable");
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_alerts_endpoint_lists_low_stock() {
    let (app, _) = app(true);
    let response = app
        .oneshot(get("/api/alerts", Some(("viewer", "viewer123"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["alerts"][0]["kind"], "low_stock");
    assert_eq!(body["alerts"][0]["subject_id"], "Widget");
}

#[tokio::test]
async fn test_alerts_scope_dated_sources_to_the_requested_range() {
    let (app, source) = app(true);
    let response = app
        .oneshot(get(
            "/api/alerts?from=2024-04-01&to=2024-06-30",
            Some(("viewer", "viewer123")),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let range = DateRange::new(
        NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
    )
    .unwrap();
    for kind in [ReportKind::Sales, ReportKind::CashFlow] {
        let key = source.fetched_key(kind).unwrap();
        assert_eq!(key.date_range, Some(range), "{} lost its range", kind);
    }
    for kind in [ReportKind::Inventory, ReportKind::Outstanding] {
        assert_eq!(source.fetched_key(kind).unwrap().date_range, None);
    }
}

#[tokio::test]
async fn test_companies_endpoint() {
    let (app, _) = app(true);
    let response = app
        .oneshot(get("/api/tally/companies", Some(("viewer", "viewer123"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["companies"][0], "Acme Traders");
    assert_eq!(body["companies"][1], "Beta Stores");
}

#[tokio::test]
async fn test_scoped_invalidation_drops_one_key() {
    let (app, source) = app(true);
    let admin = Some(("admin", "admin123"));
    let post = |uri: &str| {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(AUTHORIZATION, basic("admin", "admin123"))
            .body(Body::empty())
            .unwrap()
    };

    for uri in ["/api/reports/sales?from=2024-04-01&to=2024-04-30", "/api/reports/sales"] {
        let ok = app.clone().oneshot(get(uri, admin)).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    let removed = app
        .clone()
        .oneshot(post("/api/cache/invalidate?kind=sales&from=2024-04-01&to=2024-04-30"))
        .await
        .unwrap();
    assert_eq!(removed.status(), StatusCode::OK);
    assert_eq!(json_body(removed).await["removed"], 1);

    // the undated report is still cached
    let _ = app
        .clone()
        .oneshot(get("/api/reports/sales", admin))
        .await
        .unwrap();
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    let _ = app
        .oneshot(get("/api/reports/sales?from=2024-04-01&to=2024-04-30", admin))
        .await
        .unwrap();
    assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cache_invalidation_is_admin_only() {
    let (app, _) = app(true);
    let invalidate = |user: &str, password: &str| {
        Request::builder()
            .method(Method::POST)
            .uri("/api/cache/invalidate?kind=inventory")
            .header(AUTHORIZATION, basic(user, password))
            .body(Body::empty())
            .unwrap()
    };

    let _ = app
        .clone()
        .oneshot(get("/api/reports/inventory", Some(("admin", "admin123"))))
        .await
        .unwrap();

    let manager = app
        .clone()
        .oneshot(invalidate("manager", "manager123"))
        .await
        .unwrap();
    assert_eq!(manager.status(), StatusCode::FORBIDDEN);

    let admin = app.oneshot(invalidate("admin", "admin123")).await.unwrap();
    assert_eq!(admin.status(), StatusCode::OK);
    assert_eq!(json_body(admin).await["removed"], 1);
}

#[tokio::test]
async fn test_rate_limit_rejects_excess_requests() {
    let app = app_with(Arc::new(StaticSource::new(true)), 2);
    let viewer = Some(("viewer", "viewer123"));

    for _ in 0..2 {
        let ok = app
            .clone()
            .oneshot(get("/api/tally/test-connection", viewer))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    let limited = app
        .clone()
        .oneshot(get("/api/tally/test-connection", viewer))
        .await
        .unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

    // Health sits outside the limiter
    let health = app.oneshot(get("/health", None)).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
}
