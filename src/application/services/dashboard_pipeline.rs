use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::application::services::alert_history::AlertHistory;
use crate::application::services::report_cache::{CacheStats, ReportCache};
use crate::auth::{authorize, Operation, Role};
use crate::domain::entities::alert::AlertEvent;
use crate::domain::entities::forecast::{ForecastResult, SegmentationResult};
use crate::domain::entities::report::{FinancialSummary, Report};
use crate::domain::entities::report_key::{DateRange, ReportKey, ReportKind};
use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::repositories::source_client::SourceClient;
use crate::domain::services::alert_engine::AlertEngine;
use crate::domain::services::report_builder::{financial_summary, ReportBuilder};
use crate::domain::services::{forecast, segmentation};

/// Reports scanned for the alert feed
pub const ALERT_SOURCES: [ReportKind; 4] = [
    ReportKind::Inventory,
    ReportKind::Outstanding,
    ReportKind::CashFlow,
    ReportKind::Sales,
];

/// Reports with a time series a trend can be fitted on
pub const FORECASTABLE: [ReportKind; 3] =
    [ReportKind::Sales, ReportKind::Purchases, ReportKind::CashFlow];

/// Authorization, cache, fetch, build, scan and forecast behind one facade.
///
/// Every public entry point that takes a `Role` checks it before touching the
/// cache or the upstream.
pub struct DashboardPipeline {
    source: Arc<dyn SourceClient>,
    cache: ReportCache,
    builder: ReportBuilder,
    engine: AlertEngine,
    history: Option<AlertHistory>,
}

impl DashboardPipeline {
    pub fn new(source: Arc<dyn SourceClient>, cache: ReportCache, engine: AlertEngine) -> Self {
        Self {
            source,
            cache,
            builder: ReportBuilder::default(),
            engine,
            history: None,
        }
    }

    /// Suppress repeated alerts through `history`
    pub fn with_alert_history(mut self, history: AlertHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Cached report for `key`, fetched and built on a miss
    async fn load(&self, key: &ReportKey) -> PipelineResult<Arc<Report>> {
        let source = Arc::clone(&self.source);
        let builder = self.builder.clone();
        let fetch_key = key.clone();

        self.cache
            .get_or_fetch(key, move || async move {
                let started = Instant::now();
                let records = source.fetch(fetch_key.kind, &fetch_key).await?;
                let report = builder.build(fetch_key.kind, &records);
                debug!(
                    key = %fetch_key,
                    records = records.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Report built"
                );
                Ok(report)
            })
            .await
    }

    pub async fn report(&self, role: Role, key: &ReportKey) -> PipelineResult<Arc<Report>> {
        authorize(role, Operation::ViewReports)?;
        self.load(key).await
    }

    pub async fn test_connection(&self, role: Role) -> PipelineResult<()> {
        authorize(role, Operation::ViewReports)?;
        self.source.test_connection().await
    }

    /// Companies loaded upstream. Not cached.
    pub async fn companies(&self, role: Role) -> PipelineResult<Vec<String>> {
        authorize(role, Operation::ViewReports)?;
        self.source.company_list().await
    }

    /// Alerts over every alert source report for the scope of `scope`.
    /// The kind of `scope` itself is ignored, but a snapshot kind carries no
    /// date range, so callers scope with a dated kind.
    pub async fn alerts(&self, role: Role, scope: &ReportKey) -> PipelineResult<Vec<AlertEvent>> {
        self.alerts_at(role, scope, Utc::now()).await
    }

    pub async fn alerts_at(
        &self,
        role: Role,
        scope: &ReportKey,
        now: DateTime<Utc>,
    ) -> PipelineResult<Vec<AlertEvent>> {
        authorize(role, Operation::ViewAlerts)?;

        let keys: Vec<ReportKey> = ALERT_SOURCES.iter().map(|k| scope.with_kind(*k)).collect();
        let reports = try_join_all(keys.iter().map(|key| self.load(key))).await?;

        let mut events: Vec<AlertEvent> = reports
            .iter()
            .flat_map(|report| self.engine.scan_at(report, now))
            .collect();
        events.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.subject_id.cmp(&b.subject_id))
                .then_with(|| a.kind.cmp(&b.kind))
        });

        if let Some(history) = &self.history {
            events = history.filter_at(events, now).await;
        }

        info!(scope = %scope, alerts = events.len(), "Alert scan complete");
        Ok(events)
    }

    /// Trend projection over the history of the `key` report
    pub async fn forecast(
        &self,
        role: Role,
        key: &ReportKey,
        horizon: usize,
    ) -> PipelineResult<ForecastResult> {
        authorize(role, Operation::Analytics)?;
        if !FORECASTABLE.contains(&key.kind) {
            return Err(PipelineError::InvalidRequest(format!(
                "No forecastable series for report kind {}",
                key.kind
            )));
        }

        let report = self.load(key).await?;
        let history = report.history().unwrap_or_default();
        let result = forecast::project(&history, horizon)?;
        debug!(
            key = %key,
            horizon,
            r_squared = result.model_metadata.r_squared,
            "Forecast computed"
        );
        Ok(result)
    }

    /// RFM segments of the customers in the sales report for `scope`
    pub async fn segments(&self, role: Role, scope: &ReportKey) -> PipelineResult<SegmentationResult> {
        authorize(role, Operation::Analytics)?;
        let report = self.load(&scope.with_kind(ReportKind::Sales)).await?;
        match report.as_ref() {
            Report::Sales(sales) => segmentation::segment(sales),
            other => Err(PipelineError::UpstreamMalformed(format!(
                "Expected a sales report, built {}",
                other.kind()
            ))),
        }
    }

    /// Profit & loss and balance sheet for `scope`, defaulting to the
    /// financial year to date
    pub async fn financial_summary(
        &self,
        role: Role,
        scope: &ReportKey,
    ) -> PipelineResult<FinancialSummary> {
        authorize(role, Operation::ViewReports)?;

        let mut scope = scope.clone();
        if scope.date_range.is_none() {
            scope.date_range = Some(DateRange::financial_year_to(Utc::now().date_naive()));
        }

        let pl_key = scope.with_kind(ReportKind::ProfitLoss);
        let bs_key = scope.with_kind(ReportKind::BalanceSheet);
        let (pl, bs) = futures_util::try_join!(self.load(&pl_key), self.load(&bs_key))?;

        match (pl.as_ref(), bs.as_ref()) {
            (Report::ProfitLoss(pl), Report::BalanceSheet(bs)) => Ok(financial_summary(
                pl.clone(),
                bs.clone(),
                scope.date_range,
            )),
            _ => Err(PipelineError::UpstreamMalformed(
                "Financial statements built with unexpected kinds".to_string(),
            )),
        }
    }

    /// Drop cached reports of `kind`, or everything when `None`.
    /// Returns the number of entries removed.
    pub async fn invalidate(&self, role: Role, kind: Option<ReportKind>) -> PipelineResult<usize> {
        authorize(role, Operation::ManageCache)?;
        let removed = match kind {
            Some(kind) => self.cache.invalidate_kind(kind).await,
            None => {
                let count = self.cache.len().await;
                self.cache.clear().await;
                count
            }
        };
        if let Some(history) = &self.history {
            history.clear().await;
        }
        info!(kind = ?kind, removed, "Cache invalidated");
        Ok(removed)
    }

    /// Drop the single cached report for `key`
    pub async fn invalidate_key(&self, role: Role, key: &ReportKey) -> PipelineResult<bool> {
        authorize(role, Operation::ManageCache)?;
        let removed = self.cache.invalidate(key).await;
        info!(key = %key, removed, "Cache entry invalidated");
        Ok(removed)
    }

    /// Load every unfiltered dashboard report into the cache. Meant for a
    /// background task, so it runs without a role.
    pub async fn warm_up(&self) -> PipelineResult<()> {
        let started = Instant::now();
        let keys: Vec<ReportKey> = ReportKind::ALL
            .iter()
            .map(|kind| ReportKey::unfiltered(*kind, None))
            .collect();
        try_join_all(keys.iter().map(|key| self.load(key))).await?;
        info!(
            reports = keys.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Report cache warmed up"
        );
        Ok(())
    }
}
