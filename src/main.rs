use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tally_insights::application::handlers::dashboard_handler::{router, AppState};
use tally_insights::application::services::alert_history::AlertHistory;
use tally_insights::application::services::dashboard_pipeline::DashboardPipeline;
use tally_insights::application::services::report_cache::ReportCache;
use tally_insights::auth::{InMemoryUserStore, UserStore};
use tally_insights::config::DashboardConfig;
use tally_insights::domain::repositories::source_client::SourceClient;
use tally_insights::domain::services::alert_engine::AlertEngine;
use tally_insights::infrastructure::tally_client::TallyClient;
use tally_insights::rate_limit::create_rate_limiter;
use tally_insights::task_runner::run_with_backoff;

/// No endpoint takes a request body larger than this
const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_insights=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DashboardConfig::from_env();
    config.validate()?;
    info!(
        tally_url = %config.tally_url,
        bind = %config.bind_address,
        report_ttl_secs = config.report_cache_ttl_seconds,
        inventory_ttl_secs = config.inventory_cache_ttl_seconds,
        "Configuration loaded"
    );

    let source: Arc<dyn SourceClient> = Arc::new(TallyClient::new(config.tally_config()?)?);
    let cache = ReportCache::new(config.ttl_policy());
    let engine = AlertEngine::new(config.thresholds.clone())?;

    let mut pipeline = DashboardPipeline::new(source, cache, engine);
    if let Some(quiet_period) = config.alert_quiet_period() {
        info!(minutes = quiet_period.num_minutes(), "Alert quiet period enabled");
        pipeline = pipeline.with_alert_history(AlertHistory::new(quiet_period));
    }
    let pipeline = Arc::new(pipeline);

    let warmup = if config.warmup_enabled {
        let pipeline = pipeline.clone();
        let backoff = config.warmup_backoff();
        info!(interval_secs = backoff.interval.as_secs(), "Cache warm-up enabled");
        Some(tokio::spawn(async move {
            run_with_backoff("cache_warmup", backoff, || pipeline.warm_up()).await;
        }))
    } else {
        None
    };

    let users: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::with_default_users());
    let limiter = create_rate_limiter(&config.rate_limiter_config());
    let state = AppState {
        pipeline: pipeline.clone(),
        default_horizon: config.forecast_horizon,
        retry_delay: config.upstream_retry_delay(),
    };

    let app = router(state, users, limiter)
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    match pipeline.test_connection(tally_insights::auth::Role::Administrator).await {
        Ok(()) => info!("Tally server reachable"),
        Err(e) => warn!(error = %e, "Tally server not reachable yet, serving anyway"),
    }

    info!("Listening on {}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let server = axum::serve(listener, app);

    let shutdown_signal = async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    server.with_graceful_shutdown(shutdown_signal).await?;
    info!("Server shutting down gracefully...");

    if let Some(task) = warmup {
        task.abort();
    }

    info!("Shutdown complete");
    Ok(())
}
