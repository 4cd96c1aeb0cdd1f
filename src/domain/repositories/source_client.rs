//! Source Client Trait
//!
//! This module defines the `SourceClient` trait, the single seam through which
//! the pipeline reads accounting data. The production implementation speaks
//! Tally Prime's XML envelopes; tests plug in in-memory clients.
//!
//! ## Contract
//! - `fetch` returns every record of one consistent upstream snapshot, in
//!   payload order, or fails as a whole
//! - unreachable server, timeout, or a connection lost mid-body →
//!   `PipelineError::UpstreamUnavailable`
//! - unparseable payload → `PipelineError::UpstreamMalformed`
//! - no retries and no shared state mutation inside the client

use crate::domain::entities::raw_record::RawRecord;
use crate::domain::entities::report_key::{ReportKey, ReportKind};
use crate::domain::errors::PipelineResult;
use async_trait::async_trait;

#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Human-readable name of the upstream, used in logs
    fn name(&self) -> &str;

    /// Fetch the raw records backing one report request
    ///
    /// # Arguments
    /// * `kind` - Report family to fetch records for
    /// * `key` - Canonical request parameters (date range, company filter)
    async fn fetch(&self, kind: ReportKind, key: &ReportKey) -> PipelineResult<Vec<RawRecord>>;

    /// Probe the upstream without fetching data
    async fn test_connection(&self) -> PipelineResult<()>;

    /// Companies the upstream can report on, in upstream order without duplicates
    async fn company_list(&self) -> PipelineResult<Vec<String>>;
}
