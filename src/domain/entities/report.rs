use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::domain::entities::forecast::HistoryPoint;
use crate::domain::entities::report_key::{DateRange, ReportKind};
use crate::domain::value_objects::money::Money;
use crate::domain::value_objects::quantity::Quantity;

/// Derived view over one snapshot of raw accounting records.
///
/// Serialized with a `kind` discriminator so the presentation layer can
/// dispatch on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Report {
    Sales(VoucherReport),
    Purchases(VoucherReport),
    Inventory(InventoryReport),
    Outstanding(OutstandingReport),
    ProfitLoss(ProfitLossReport),
    BalanceSheet(BalanceSheetReport),
    CashFlow(CashFlowReport),
}

impl Report {
    pub fn kind(&self) -> ReportKind {
        match self {
            Report::Sales(_) => ReportKind::Sales,
            Report::Purchases(_) => ReportKind::Purchases,
            Report::Inventory(_) => ReportKind::Inventory,
            Report::Outstanding(_) => ReportKind::Outstanding,
            Report::ProfitLoss(_) => ReportKind::ProfitLoss,
            Report::BalanceSheet(_) => ReportKind::BalanceSheet,
            Report::CashFlow(_) => ReportKind::CashFlow,
        }
    }

    /// Ordered series a forecast can be fitted on, if this report has one.
    /// Voucher reports yield monthly totals, cash flow yields daily net flow.
    /// Periods without activity between the first and last one are zero.
    pub fn history(&self) -> Option<Vec<HistoryPoint>> {
        match self {
            Report::Sales(r) | Report::Purchases(r) => Some(monthly_history(&r.monthly)),
            Report::CashFlow(r) => Some(daily_history(&r.daily)),
            _ => None,
        }
    }
}

fn parse_month(period: &str) -> Option<(i32, u32)> {
    let (year, month) = period.split_once('-')?;
    let month: u32 = month.parse().ok()?;
    (1..=12).contains(&month).then_some((year.parse().ok()?, month))
}

fn monthly_history(points: &[SeriesPoint]) -> Vec<HistoryPoint> {
    let totals: BTreeMap<(i32, u32), f64> = points
        .iter()
        .filter_map(|p| Some((parse_month(&p.period)?, p.total.to_f64())))
        .collect();
    let (Some(&first), Some(&last)) = (totals.keys().next(), totals.keys().next_back()) else {
        return Vec::new();
    };

    let mut history = Vec::new();
    let (mut year, mut month) = first;
    while (year, month) <= last {
        let value = totals.get(&(year, month)).copied().unwrap_or(0.0);
        history.push(HistoryPoint::new(format!("{:04}-{:02}", year, month), value));
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    history
}

fn daily_history(points: &[CashFlowPoint]) -> Vec<HistoryPoint> {
    let net: BTreeMap<NaiveDate, f64> = points.iter().map(|p| (p.date, p.net.to_f64())).collect();
    let (Some(&first), Some(&last)) = (net.keys().next(), net.keys().next_back()) else {
        return Vec::new();
    };
    first
        .iter_days()
        .take_while(|date| *date <= last)
        .map(|date| HistoryPoint::new(date.to_string(), net.get(&date).copied().unwrap_or(0.0)))
        .collect()
}

// ---------------------------------------------------------------------------
// Sales / purchases

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct VoucherReport {
    pub summary: VoucherSummary,
    pub daily: Vec<SeriesPoint>,
    pub monthly: Vec<SeriesPoint>,
    /// Monday first
    pub weekdays: Vec<SeriesPoint>,
    pub peak_weekday: Option<String>,
    /// Calendar-month totals across years, January first
    pub months_of_year: Vec<SeriesPoint>,
    pub peak_month: Option<String>,
    pub quarters: Vec<SeriesPoint>,
    pub by_party: BTreeMap<String, Money>,
    pub top_parties: Vec<PartyAmount>,
    pub vouchers: Vec<VoucherLine>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct VoucherSummary {
    pub total: Money,
    pub transaction_count: usize,
    pub average: Money,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub period: String,
    pub total: Money,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartyAmount {
    pub party: String,
    pub amount: Money,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoucherLine {
    pub date: Option<NaiveDate>,
    pub voucher_number: String,
    pub party: String,
    pub amount: Money,
    pub voucher_type: String,
}

// ---------------------------------------------------------------------------
// Inventory

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct InventoryReport {
    pub summary: InventorySummary,
    /// Item count per stock level band (`High Stock`, `Medium Stock`, `Low Stock`)
    pub stock_levels: BTreeMap<String, usize>,
    pub items: Vec<StockLine>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct InventorySummary {
    pub total_items: usize,
    pub total_value: Money,
    pub zero_stock_items: usize,
    pub low_stock_items: usize,
    /// Share of items above their reorder level, in percent
    pub stock_health: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StockLine {
    pub name: String,
    pub closing_balance: Quantity,
    pub closing_value: Money,
    pub reorder_level: Quantity,
    pub base_unit: String,
    pub category: String,
    pub stock_level: String,
    pub is_low_stock: bool,
}

// ---------------------------------------------------------------------------
// Outstanding receivables / payables

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct OutstandingReport {
    pub summary: OutstandingSummary,
    pub receivables: Vec<PartyBalance>,
    /// Closing balances shown as positive amounts
    pub payables: Vec<PartyBalance>,
    pub value_bands: BTreeMap<String, usize>,
    pub bills: Vec<BillLine>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct OutstandingSummary {
    pub total_receivables: Money,
    pub total_payables: Money,
    pub net_position: Money,
    pub receivable_parties: usize,
    pub payable_parties: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartyBalance {
    pub party: String,
    pub opening_balance: Money,
    pub closing_balance: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillLine {
    pub party: String,
    pub bill_name: String,
    pub bill_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub amount: Money,
}

impl BillLine {
    /// Date a payment is considered due from
    pub fn effective_due_date(&self) -> Option<NaiveDate> {
        self.due_date.or(self.bill_date)
    }
}

// ---------------------------------------------------------------------------
// Financial statements

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ProfitLossReport {
    pub revenue: Money,
    pub cost_of_goods_sold: Money,
    pub gross_profit: Money,
    pub expenses: Money,
    pub net_profit: Money,
    pub breakdown: BTreeMap<String, Money>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BalanceSheetReport {
    pub assets: AssetSummary,
    pub liabilities: LiabilitySummary,
    pub equity: Money,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AssetSummary {
    pub current: Money,
    pub fixed: Money,
    pub total: Money,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct LiabilitySummary {
    pub current: Money,
    pub long_term: Money,
    pub total: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinancialSummary {
    pub period: Option<DateRange>,
    pub profit_loss: ProfitLossReport,
    pub balance_sheet: BalanceSheetReport,
    /// Absent when the balance sheet has no assets or no liabilities
    pub ratios: Option<FinancialRatios>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinancialRatios {
    pub current_ratio: f64,
    pub debt_equity_ratio: f64,
    pub asset_turnover: f64,
    /// Percent
    pub profit_margin: f64,
}

// ---------------------------------------------------------------------------
// Cash flow

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CashFlowReport {
    pub total_inflow: Money,
    pub total_outflow: Money,
    pub net_flow: Money,
    pub daily: Vec<CashFlowPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CashFlowPoint {
    pub date: NaiveDate,
    pub inflow: Money,
    pub outflow: Money,
    pub net: Money,
}

impl CashFlowReport {
    /// Net flow of the days inside `[from, to]`
    pub fn net_between(&self, from: NaiveDate, to: NaiveDate) -> Money {
        self.daily
            .iter()
            .filter(|p| p.date >= from && p.date <= to)
            .map(|p| &p.net)
            .sum()
    }
}
