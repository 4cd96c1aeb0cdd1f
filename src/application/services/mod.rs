pub mod alert_history;
pub mod dashboard_pipeline;
pub mod report_cache;
