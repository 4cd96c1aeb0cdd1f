pub mod alert_engine;
pub mod forecast;
pub mod report_builder;
pub mod segmentation;
