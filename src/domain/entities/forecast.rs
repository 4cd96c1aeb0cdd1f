use serde::{Deserialize, Serialize};

/// One observed period of a historical series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub period: String,
    pub value: f64,
}

impl HistoryPoint {
    pub fn new(period: impl Into<String>, value: f64) -> Self {
        HistoryPoint {
            period: period.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub period: String,
    pub projected_value: f64,
    pub confidence_low: f64,
    pub confidence_high: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model: String,
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub residual_std_error: f64,
    pub history_points: usize,
    pub confidence_level: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub series: Vec<ForecastPoint>,
    pub model_metadata: ModelMetadata,
}

/// Recency / frequency / monetary profile of one customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentAssignment {
    pub subject_id: String,
    pub recency_days: i64,
    pub frequency: usize,
    pub monetary: f64,
    pub segment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSummary {
    pub label: String,
    pub members: usize,
    pub mean_recency_days: f64,
    pub mean_frequency: f64,
    pub mean_monetary: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationResult {
    pub assignments: Vec<SegmentAssignment>,
    pub segments: Vec<SegmentSummary>,
    pub seed: u64,
}
