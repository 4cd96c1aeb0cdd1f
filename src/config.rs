use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::application::services::report_cache::TtlPolicy;
use crate::domain::entities::report_key::ReportKind;
use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::services::alert_engine::AlertThresholds;
use crate::domain::value_objects::money::Money;
use crate::infrastructure::tally_client::{TallyConfig, DEFAULT_TALLY_URL, DEFAULT_TIMEOUT_SECS};
use crate::rate_limit::RateLimiterConfig;
use crate::task_runner::BackoffConfig;

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub tally_url: String,
    pub tally_timeout_seconds: u64,
    pub bind_address: SocketAddr,

    pub report_cache_ttl_seconds: u64, // sales, purchases, outstanding, financial
    pub inventory_cache_ttl_seconds: u64,

    pub thresholds: AlertThresholds,
    /// Suppress repeats of the same alert within this window. Off when `None`.
    pub alert_quiet_period_minutes: Option<u64>,

    pub forecast_horizon: usize,
    pub requests_per_minute: u32,
    pub upstream_retry_delay_ms: u64,

    pub warmup_enabled: bool,
    pub warmup_interval_seconds: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        DashboardConfig {
            tally_url: DEFAULT_TALLY_URL.to_string(),
            tally_timeout_seconds: DEFAULT_TIMEOUT_SECS,
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8000)),

            report_cache_ttl_seconds: 300,   // 5 minutes
            inventory_cache_ttl_seconds: 600, // 10 minutes

            thresholds: AlertThresholds::default(),
            alert_quiet_period_minutes: None,

            forecast_horizon: 3,
            requests_per_minute: 120,
            upstream_retry_delay_ms: 500,

            warmup_enabled: false,
            warmup_interval_seconds: 300,
        }
    }
}

/// Parse `name` and keep it only when `valid` accepts it. Anything else is
/// logged and ignored.
fn parse_var<T, L>(lookup: &L, name: &str, expected: &str, valid: impl Fn(&T) -> bool) -> Option<T>
where
    T: FromStr + Display,
    T::Err: Display,
    L: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => Some(value),
        Ok(value) => {
            tracing::warn!(
                "Invalid {} value: {} (must be {}), using default",
                name,
                value,
                expected
            );
            None
        }
        Err(e) => {
            tracing::warn!("Failed to parse {} '{}': {}, using default", name, raw, e);
            None
        }
    }
}

fn parse_flag<L: Fn(&str) -> Option<String>>(lookup: &L, name: &str) -> Option<bool> {
    lookup(name).map(|v| {
        let v = v.trim().to_lowercase();
        v == "true" || v == "1"
    })
}

impl DashboardConfig {
    pub fn from_env() -> DashboardConfig {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. `from_env` passes the process
    /// environment.
    pub fn from_lookup<L: Fn(&str) -> Option<String>>(lookup: L) -> DashboardConfig {
        let mut config = DashboardConfig::default();

        if let Some(raw) = lookup("TALLY_SERVER_URL") {
            match Url::parse(raw.trim()) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => config.tally_url = url.to_string(),
                Ok(url) => tracing::warn!(
                    "Invalid TALLY_SERVER_URL scheme '{}' (must be http or https), using default: {}",
                    url.scheme(),
                    config.tally_url
                ),
                Err(e) => tracing::warn!(
                    "Failed to parse TALLY_SERVER_URL '{}': {}, using default: {}",
                    raw,
                    e,
                    config.tally_url
                ),
            }
        }

        if let Some(v) = parse_var(&lookup, "TALLY_TIMEOUT_SECONDS", "between 1 and 300", |v: &u64| {
            (1..=300).contains(v)
        }) {
            config.tally_timeout_seconds = v;
        }

        if let Some(v) = parse_var(&lookup, "BIND_ADDRESS", "a socket address", |_: &SocketAddr| true) {
            config.bind_address = v;
        }

        if let Some(v) = parse_var(
            &lookup,
            "REPORT_CACHE_TTL_SECONDS",
            "between 10 and 86400",
            |v: &u64| (10..=86_400).contains(v),
        ) {
            config.report_cache_ttl_seconds = v;
        }

        if let Some(v) = parse_var(
            &lookup,
            "INVENTORY_CACHE_TTL_SECONDS",
            "between 10 and 86400",
            |v: &u64| (10..=86_400).contains(v),
        ) {
            config.inventory_cache_ttl_seconds = v;
        }

        let t = &mut config.thresholds;
        if let Some(v) = parse_var(&lookup, "LOW_STOCK_RATIO", "between 0.01 and 10", |v: &f64| {
            (0.01..=10.0).contains(v)
        }) {
            t.low_stock_ratio = v;
        }
        if let Some(v) = parse_var(
            &lookup,
            "CRITICAL_STOCK_RATIO",
            "between 0.01 and 10",
            |v: &f64| (0.01..=10.0).contains(v),
        ) {
            t.critical_stock_ratio = v;
        }
        if let Some(v) = parse_var(&lookup, "OVERDUE_DAYS", "between 0 and 3650", |v: &i64| {
            (0..=3650).contains(v)
        }) {
            t.overdue_days = v;
        }
        if let Some(v) = parse_var(
            &lookup,
            "NEGATIVE_CASH_FLOW_WINDOW_DAYS",
            "between 1 and 366",
            |v: &i64| (1..=366).contains(v),
        ) {
            t.negative_cash_flow_window_days = v;
        }
        if let Some(v) = parse_var(
            &lookup,
            "HIGH_RECEIVABLE_AMOUNT",
            "a non-negative amount",
            |v: &f64| v.is_finite() && *v >= 0.0,
        ) {
            t.high_receivable_amount = Money::parse_lenient(&v.to_string());
        }
        if let Some(v) = parse_var(
            &lookup,
            "SALES_DROP_PERCENTAGE",
            "between 1 and 100",
            |v: &f64| (1.0..=100.0).contains(v),
        ) {
            t.sales_drop_percentage = v;
        }
        if let Some(v) = parse_var(
            &lookup,
            "SALES_DROP_WINDOW_DAYS",
            "between 1 and 366",
            |v: &i64| (1..=366).contains(v),
        ) {
            t.sales_drop_window_days = v;
        }

        if let Some(v) = parse_var(
            &lookup,
            "ALERT_QUIET_PERIOD_MINUTES",
            "between 1 and 10080",
            |v: &u64| (1..=10_080).contains(v),
        ) {
            config.alert_quiet_period_minutes = Some(v);
        }

        if let Some(v) = parse_var(&lookup, "FORECAST_HORIZON", "between 1 and 24", |v: &usize| {
            (1..=24).contains(v)
        }) {
            config.forecast_horizon = v;
        }

        if let Some(v) = parse_var(
            &lookup,
            "RATE_LIMIT_PER_MINUTE",
            "between 1 and 10000",
            |v: &u32| (1..=10_000).contains(v),
        ) {
            config.requests_per_minute = v;
        }

        if let Some(v) = parse_var(
            &lookup,
            "UPSTREAM_RETRY_DELAY_MS",
            "at most 10000",
            |v: &u64| *v <= 10_000,
        ) {
            config.upstream_retry_delay_ms = v;
        }

        if let Some(v) = parse_flag(&lookup, "CACHE_WARMUP_ENABLED") {
            config.warmup_enabled = v;
        }

        if let Some(v) = parse_var(
            &lookup,
            "CACHE_WARMUP_INTERVAL_SECONDS",
            "between 60 and 3600",
            |v: &u64| (60..=3600).contains(v),
        ) {
            config.warmup_interval_seconds = v;
        }

        config
    }

    /// Cross-field checks that single-variable parsing cannot catch
    pub fn validate(&self) -> PipelineResult<()> {
        self.thresholds.validate()
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        let mut policy = TtlPolicy::uniform(Duration::from_secs(self.report_cache_ttl_seconds));
        policy.overrides.insert(
            ReportKind::Inventory,
            Duration::from_secs(self.inventory_cache_ttl_seconds),
        );
        policy
    }

    pub fn tally_config(&self) -> PipelineResult<TallyConfig> {
        let url = Url::parse(&self.tally_url).map_err(|e| {
            PipelineError::InvalidRequest(format!("Invalid Tally URL '{}': {}", self.tally_url, e))
        })?;
        Ok(TallyConfig {
            url,
            timeout: Duration::from_secs(self.tally_timeout_seconds),
        })
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            requests_per_minute: self.requests_per_minute,
        }
    }

    pub fn warmup_backoff(&self) -> BackoffConfig {
        BackoffConfig {
            interval: Duration::from_secs(self.warmup_interval_seconds),
            ..BackoffConfig::default()
        }
    }

    pub fn upstream_retry_delay(&self) -> Duration {
        Duration::from_millis(self.upstream_retry_delay_ms)
    }

    pub fn alert_quiet_period(&self) -> Option<chrono::Duration> {
        self.alert_quiet_period_minutes
            .map(|m| chrono::Duration::minutes(m as i64))
    }
}
