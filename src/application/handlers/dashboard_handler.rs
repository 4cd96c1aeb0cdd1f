use axum::{
    extract::{Path, Query, State},
    http::{header::WWW_AUTHENTICATE, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::application::services::dashboard_pipeline::DashboardPipeline;
use crate::application::services::report_cache::CacheStats;
use crate::auth::{require_auth, Authenticated, UserStore};
use crate::domain::entities::alert::AlertEvent;
use crate::domain::entities::forecast::{ForecastResult, SegmentationResult};
use crate::domain::entities::report::{FinancialSummary, Report};
use crate::domain::entities::report_key::{DateRange, ReportKey, ReportKind};
use crate::domain::errors::{ApiError, PipelineError};
use crate::rate_limit::{rate_limit_middleware, GlobalRateLimiter};
use crate::task_runner::retry_once_with_backoff;

/// Largest accepted forecast horizon
pub const MAX_FORECAST_HORIZON: usize = 24;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DashboardPipeline>,
    pub default_horizon: usize,
    /// Pause before the single retry of a transient upstream failure
    pub retry_delay: Duration,
}

/// Query parameters shared by the report endpoints
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReportQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub company: Option<String>,
    pub horizon: Option<usize>,
}

impl ReportQuery {
    /// A lone `from` runs to today; a lone `to` starts at its financial year
    fn date_range(&self) -> Result<Option<DateRange>, PipelineError> {
        match (self.from, self.to) {
            (None, None) => Ok(None),
            (Some(from), Some(to)) => DateRange::new(from, to).map(Some),
            (Some(from), None) => DateRange::new(from, Utc::now().date_naive()).map(Some),
            (None, Some(to)) => Ok(Some(DateRange::financial_year_to(to))),
        }
    }

    pub fn to_key(&self, kind: ReportKind) -> Result<ReportKey, PipelineError> {
        let company = self.company.as_deref().map(|c| ("company", c));
        Ok(ReportKey::new(kind, self.date_range()?, company))
    }
}

/// Without `kind` everything goes. With `kind` alone, every entry of that
/// kind. With `kind` plus any of `from`, `to`, `company`, the one matching key.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InvalidateQuery {
    pub kind: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub company: Option<String>,
}

impl InvalidateQuery {
    /// Request scope when one was given
    fn scope(&self) -> Option<ReportQuery> {
        if self.from.is_none() && self.to.is_none() && self.company.is_none() {
            return None;
        }
        Some(ReportQuery {
            from: self.from,
            to: self.to,
            company: self.company.clone(),
            horizon: None,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub source: String,
    pub cache: CacheStats,
    pub cache_hit_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionResponse {
    pub connected: bool,
    pub source: String,
}

#[derive(Debug, Serialize)]
pub struct CompaniesResponse {
    pub companies: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub total: usize,
    pub alerts: Vec<AlertEvent>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub removed: usize,
    pub cache: CacheStats,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Pipeline(e) => match e {
                PipelineError::UpstreamUnavailable(_) | PipelineError::UpstreamMalformed(_) => {
                    StatusCode::BAD_GATEWAY
                }
                PipelineError::InsufficientHistory { .. }
                | PipelineError::InvalidThresholdConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
                PipelineError::Forbidden { .. } => StatusCode::FORBIDDEN,
                PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            },
        };
        let kind = match &self {
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::RateLimitExceeded => "rate_limited",
            ApiError::Pipeline(e) => e.kind(),
        };
        let body = Json(ErrorResponse {
            error: self.to_string(),
            kind: kind.to_string(),
        });

        if status == StatusCode::UNAUTHORIZED {
            (
                status,
                [(WWW_AUTHENTICATE, "Basic realm=\"tally-insights\"")],
                body,
            )
                .into_response()
        } else {
            (status, body).into_response()
        }
    }
}

fn parse_kind(raw: &str) -> Result<ReportKind, ApiError> {
    Ok(ReportKind::from_str(raw)?)
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let cache = state.pipeline.cache_stats().await;
    Json(HealthResponse {
        status: "ok",
        source: state.pipeline.source_name().to_string(),
        cache_hit_rate: cache.hit_rate(),
        cache,
    })
}

pub async fn test_connection(
    State(state): State<AppState>,
    Extension(user): Extension<Authenticated>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    state.pipeline.test_connection(user.role).await?;
    Ok(Json(ConnectionResponse {
        connected: true,
        source: state.pipeline.source_name().to_string(),
    }))
}

pub async fn get_companies(
    State(state): State<AppState>,
    Extension(user): Extension<Authenticated>,
) -> Result<Json<CompaniesResponse>, ApiError> {
    let pipeline = &state.pipeline;
    let companies = retry_once_with_backoff("companies", state.retry_delay, || {
        pipeline.companies(user.role)
    })
    .await?;
    Ok(Json(CompaniesResponse { companies }))
}

pub async fn get_report(
    State(state): State<AppState>,
    Extension(user): Extension<Authenticated>,
    Path(kind): Path<String>,
    Query(params): Query<ReportQuery>,
) -> Result<Json<Report>, ApiError> {
    let key = params.to_key(parse_kind(&kind)?)?;
    let pipeline = &state.pipeline;
    let report = retry_once_with_backoff("report", state.retry_delay, || {
        pipeline.report(user.role, &key)
    })
    .await?;
    Ok(Json(report.as_ref().clone()))
}

pub async fn get_financial_summary(
    State(state): State<AppState>,
    Extension(user): Extension<Authenticated>,
    Query(params): Query<ReportQuery>,
) -> Result<Json<FinancialSummary>, ApiError> {
    let scope = params.to_key(ReportKind::ProfitLoss)?;
    let pipeline = &state.pipeline;
    let summary = retry_once_with_backoff("financial_summary", state.retry_delay, || {
        pipeline.financial_summary(user.role, &scope)
    })
    .await?;
    Ok(Json(summary))
}

pub async fn get_alerts(
    State(state): State<AppState>,
    Extension(user): Extension<Authenticated>,
    Query(params): Query<ReportQuery>,
) -> Result<Json<AlertsResponse>, ApiError> {
    // a dated kind, so the range survives into the sales and cash flow keys
    let scope = params.to_key(ReportKind::Sales)?;
    let pipeline = &state.pipeline;
    let alerts = retry_once_with_backoff("alerts", state.retry_delay, || {
        pipeline.alerts(user.role, &scope)
    })
    .await?;
    Ok(Json(AlertsResponse {
        total: alerts.len(),
        alerts,
    }))
}

pub async fn get_forecast(
    State(state): State<AppState>,
    Extension(user): Extension<Authenticated>,
    Path(kind): Path<String>,
    Query(params): Query<ReportQuery>,
) -> Result<Json<ForecastResult>, ApiError> {
    let key = params.to_key(parse_kind(&kind)?)?;
    let horizon = params.horizon.unwrap_or(state.default_horizon);
    if horizon > MAX_FORECAST_HORIZON {
        return Err(PipelineError::InvalidRequest(format!(
            "horizon {} exceeds the maximum of {}",
            horizon, MAX_FORECAST_HORIZON
        ))
        .into());
    }

    let pipeline = &state.pipeline;
    let result = retry_once_with_backoff("forecast", state.retry_delay, || {
        pipeline.forecast(user.role, &key, horizon)
    })
    .await?;
    Ok(Json(result))
}

pub async fn get_segments(
    State(state): State<AppState>,
    Extension(user): Extension<Authenticated>,
    Query(params): Query<ReportQuery>,
) -> Result<Json<SegmentationResult>, ApiError> {
    let scope = params.to_key(ReportKind::Sales)?;
    let pipeline = &state.pipeline;
    let result = retry_once_with_backoff("segments", state.retry_delay, || {
        pipeline.segments(user.role, &scope)
    })
    .await?;
    Ok(Json(result))
}

pub async fn invalidate_cache(
    State(state): State<AppState>,
    Extension(user): Extension<Authenticated>,
    Query(params): Query<InvalidateQuery>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let kind = params.kind.as_deref().map(parse_kind).transpose()?;
    let removed = match (kind, params.scope()) {
        (Some(kind), Some(scope)) => {
            let key = scope.to_key(kind)?;
            usize::from(state.pipeline.invalidate_key(user.role, &key).await?)
        }
        _ => state.pipeline.invalidate(user.role, kind).await?,
    };
    Ok(Json(InvalidateResponse {
        removed,
        cache: state.pipeline.cache_stats().await,
    }))
}

/// Dashboard routes. `/health` is open; everything under `/api` goes through
/// the rate limiter, then Basic authentication.
pub fn router(state: AppState, users: Arc<dyn UserStore>, limiter: GlobalRateLimiter) -> Router {
    let api = Router::new()
        .route("/api/tally/test-connection", get(test_connection))
        .route("/api/tally/companies", get(get_companies))
        .route("/api/reports/:kind", get(get_report))
        .route("/api/financial-summary", get(get_financial_summary))
        .route("/api/alerts", get(get_alerts))
        .route("/api/forecast/:kind", get(get_forecast))
        .route("/api/segments", get(get_segments))
        .route("/api/cache/invalidate", post(invalidate_cache))
        .route_layer(middleware::from_fn_with_state(users, require_auth))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .with_state(state)
}
