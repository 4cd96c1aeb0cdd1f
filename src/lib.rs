//! Tally Insights
//!
//! Business intelligence pipeline over a Tally Prime accounting server:
//! fetch, cache, build reports, raise alerts and forecast.

pub mod application;
pub mod auth;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod rate_limit;
pub mod task_runner;
