use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Alert severity, ordered from least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

/// Which threshold produced the alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowStock,
    OverduePayment,
    NegativeCashFlow,
    HighReceivable,
    SalesDrop,
}

impl AlertKind {
    pub fn name(&self) -> &'static str {
        match self {
            AlertKind::LowStock => "low_stock",
            AlertKind::OverduePayment => "overdue_payment",
            AlertKind::NegativeCashFlow => "negative_cash_flow",
            AlertKind::HighReceivable => "high_receivable",
            AlertKind::SalesDrop => "sales_drop",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One threshold crossing found by an alert scan. Recomputed on every scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub subject_id: String,
    pub triggered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
}

impl AlertEvent {
    pub fn new(
        kind: AlertKind,
        severity: Severity,
        subject_id: impl Into<String>,
        message: impl Into<String>,
        triggered_at: DateTime<Utc>,
    ) -> Self {
        AlertEvent {
            kind,
            severity,
            message: message.into(),
            subject_id: subject_id.into(),
            triggered_at,
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: impl ToString) -> Self {
        self.data.insert(key.to_string(), value.to_string());
        self
    }
}
