use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::domain::errors::PipelineError;

/// The report families the dashboard knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Sales,
    Purchases,
    Inventory,
    Outstanding,
    ProfitLoss,
    BalanceSheet,
    CashFlow,
}

impl ReportKind {
    pub const ALL: [ReportKind; 7] = [
        ReportKind::Sales,
        ReportKind::Purchases,
        ReportKind::Inventory,
        ReportKind::Outstanding,
        ReportKind::ProfitLoss,
        ReportKind::BalanceSheet,
        ReportKind::CashFlow,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ReportKind::Sales => "sales",
            ReportKind::Purchases => "purchases",
            ReportKind::Inventory => "inventory",
            ReportKind::Outstanding => "outstanding",
            ReportKind::ProfitLoss => "profit_loss",
            ReportKind::BalanceSheet => "balance_sheet",
            ReportKind::CashFlow => "cash_flow",
        }
    }

    /// Snapshot reports (stock, outstanding balances) ignore the date range
    pub fn is_dated(&self) -> bool {
        !matches!(self, ReportKind::Inventory | ReportKind::Outstanding)
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReportKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        ReportKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == wanted)
            .ok_or_else(|| PipelineError::InvalidRequest(format!("Unknown report kind: {}", s)))
    }
}

/// Inclusive date range of a report request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, PipelineError> {
        if from > to {
            return Err(PipelineError::InvalidRequest(format!(
                "from date {} is later than to date {}",
                from, to
            )));
        }
        Ok(DateRange { from, to })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }

    /// Financial year (April to March) containing `date`, up to `date`
    pub fn financial_year_to(date: NaiveDate) -> Self {
        let start_year = if date.month() >= 4 {
            date.year()
        } else {
            date.year() - 1
        };
        let from = NaiveDate::from_ymd_opt(start_year, 4, 1).unwrap_or(date);
        DateRange { from, to: date }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

/// Canonical identity of a report request, used as the cache key.
///
/// Filters live in a `BTreeMap` with lower-cased keys and trimmed values so
/// that logically equal requests compare and hash identically regardless of
/// the order parameters arrived in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ReportKey {
    pub kind: ReportKind,
    pub date_range: Option<DateRange>,
    pub filters: BTreeMap<String, String>,
}

impl ReportKey {
    pub fn new<I, K, V>(kind: ReportKind, date_range: Option<DateRange>, filters: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let filters = filters
            .into_iter()
            .filter_map(|(k, v)| {
                let key = k.as_ref().trim().to_lowercase();
                let value = v.as_ref().trim().to_string();
                if key.is_empty() || value.is_empty() {
                    None
                } else {
                    Some((key, value))
                }
            })
            .collect();

        ReportKey {
            kind,
            date_range: if kind.is_dated() { date_range } else { None },
            filters,
        }
    }

    pub fn unfiltered(kind: ReportKind, date_range: Option<DateRange>) -> Self {
        Self::new(kind, date_range, std::iter::empty::<(&str, &str)>())
    }

    pub fn filter(&self, name: &str) -> Option<&str> {
        self.filters.get(name).map(String::as_str)
    }

    pub fn company(&self) -> Option<&str> {
        self.filter("company")
    }

    /// Same request parameters for a different report kind
    pub fn with_kind(&self, kind: ReportKind) -> Self {
        ReportKey::new(kind, self.date_range, self.filters.clone())
    }
}

impl fmt::Display for ReportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(range) = &self.date_range {
            write!(f, "|{}", range)?;
        }
        for (k, v) in &self.filters {
            write!(f, "|{}={}", k, v)?;
        }
        Ok(())
    }
}
