//! Transform engine: raw accounting records → report structures.
//!
//! Every function here is pure. Aggregation goes through `BTreeMap`s and
//! explicitly ordered vectors, so the same records always serialize to the
//! same bytes. Missing or malformed fields count as zero, never as errors.

use chrono::{Datelike, NaiveDate};
use std::collections::{BTreeMap, BTreeSet};

use crate::domain::entities::raw_record::RawRecord;
use crate::domain::entities::report::{
    AssetSummary, BalanceSheetReport, BillLine, CashFlowPoint, CashFlowReport, FinancialRatios,
    FinancialSummary, InventoryReport, InventorySummary, LiabilitySummary, OutstandingReport,
    OutstandingSummary, PartyAmount, PartyBalance, ProfitLossReport, Report, SeriesPoint,
    StockLine, VoucherLine, VoucherReport, VoucherSummary,
};
use crate::domain::entities::report_key::{DateRange, ReportKind};
use crate::domain::value_objects::money::Money;
use crate::domain::value_objects::quantity::Quantity;

/// Party label for vouchers without a party ledger
pub const UNSPECIFIED_PARTY: &str = "Unspecified";

/// Default number of parties in the top-N ranking
pub const DEFAULT_TOP_PARTIES: usize = 10;

#[derive(Debug, Clone)]
pub struct ReportBuilder {
    top_parties: usize,
}

impl Default for ReportBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_PARTIES)
    }
}

impl ReportBuilder {
    pub fn new(top_parties: usize) -> Self {
        ReportBuilder { top_parties }
    }

    /// Build the report of `kind` from one snapshot of records
    pub fn build(&self, kind: ReportKind, records: &[RawRecord]) -> Report {
        match kind {
            ReportKind::Sales => Report::Sales(self.voucher_report(records)),
            ReportKind::Purchases => Report::Purchases(self.voucher_report(records)),
            ReportKind::Inventory => Report::Inventory(inventory_report(records)),
            ReportKind::Outstanding => Report::Outstanding(outstanding_report(records)),
            ReportKind::ProfitLoss => Report::ProfitLoss(profit_loss_report(records)),
            ReportKind::BalanceSheet => Report::BalanceSheet(balance_sheet_report(records)),
            ReportKind::CashFlow => Report::CashFlow(cash_flow_report(records)),
        }
    }

    fn voucher_report(&self, records: &[RawRecord]) -> VoucherReport {
        let mut vouchers: Vec<VoucherLine> = records
            .iter()
            .filter(|r| r.is("VOUCHER"))
            .map(|r| VoucherLine {
                date: r.date("DATE"),
                voucher_number: r.text("VOUCHERNUMBER"),
                party: party_name(&r.text("PARTYLEDGERNAME")),
                amount: r.money("AMOUNT"),
                voucher_type: r.text("VOUCHERTYPE"),
            })
            .collect();
        vouchers.sort_by(|a, b| {
            (a.date, &a.voucher_number, &a.party).cmp(&(b.date, &b.voucher_number, &b.party))
        });

        let total: Money = vouchers.iter().map(|v| &v.amount).sum();
        let count = vouchers.len();

        let mut daily: BTreeMap<NaiveDate, (Money, usize)> = BTreeMap::new();
        let mut monthly: BTreeMap<(i32, u32), (Money, usize)> = BTreeMap::new();
        let mut weekdays: [(Money, usize); 7] = Default::default();
        let mut months_of_year: [(Money, usize); 12] = Default::default();
        let mut quarters: [(Money, usize); 4] = Default::default();
        let mut by_party: BTreeMap<String, (Money, usize)> = BTreeMap::new();

        for v in &vouchers {
            let party = by_party
                .entry(v.party.clone())
                .or_insert_with(|| (Money::zero(), 0));
            party.0 += &v.amount;
            party.1 += 1;

            let Some(date) = v.date else { continue };
            accumulate(daily.entry(date).or_default(), &v.amount);
            accumulate(
                monthly.entry((date.year(), date.month())).or_default(),
                &v.amount,
            );
            accumulate(
                &mut weekdays[date.weekday().num_days_from_monday() as usize],
                &v.amount,
            );
            accumulate(&mut months_of_year[date.month0() as usize], &v.amount);
            accumulate(&mut quarters[(date.month0() / 3) as usize], &v.amount);
        }

        let weekday_points = labelled_points(&weekdays, &WEEKDAY_NAMES);
        let month_points = labelled_points(&months_of_year, &MONTH_NAMES);
        let quarter_points = labelled_points(&quarters, &QUARTER_NAMES);
        let peak_weekday = peak_period(&weekday_points);
        let peak_month = peak_period(&month_points);

        let mut top_parties: Vec<PartyAmount> = by_party
            .iter()
            .map(|(party, (amount, count))| PartyAmount {
                party: party.clone(),
                amount: amount.clone(),
                count: *count,
            })
            .collect();
        top_parties.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.party.cmp(&b.party)));
        top_parties.truncate(self.top_parties);

        VoucherReport {
            summary: VoucherSummary {
                average: total.average(count),
                total,
                transaction_count: count,
                first_date: daily.keys().next().copied(),
                last_date: daily.keys().next_back().copied(),
            },
            daily: daily
                .into_iter()
                .map(|(date, (total, count))| SeriesPoint {
                    period: date.format("%Y-%m-%d").to_string(),
                    total,
                    count,
                })
                .collect(),
            monthly: monthly
                .into_iter()
                .map(|((year, month), (total, count))| SeriesPoint {
                    period: format!("{:04}-{:02}", year, month),
                    total,
                    count,
                })
                .collect(),
            weekdays: weekday_points,
            peak_weekday,
            months_of_year: month_points,
            peak_month,
            quarters: quarter_points,
            by_party: by_party
                .into_iter()
                .map(|(party, (amount, _))| (party, amount))
                .collect(),
            top_parties,
            vouchers,
        }
    }
}

fn accumulate(slot: &mut (Money, usize), amount: &Money) {
    slot.0 += amount;
    slot.1 += 1;
}

fn labelled_points(slots: &[(Money, usize)], labels: &[&str]) -> Vec<SeriesPoint> {
    slots
        .iter()
        .zip(labels)
        .map(|((total, count), label)| SeriesPoint {
            period: label.to_string(),
            total: total.clone(),
            count: *count,
        })
        .collect()
}

/// Label of the largest non-empty slot. The earliest one wins ties.
fn peak_period(points: &[SeriesPoint]) -> Option<String> {
    points
        .iter()
        .filter(|p| p.count > 0)
        .fold(None::<&SeriesPoint>, |best, p| match best {
            Some(b) if b.total >= p.total => Some(b),
            _ => Some(p),
        })
        .map(|p| p.period.clone())
}

fn party_name(raw: &str) -> String {
    if raw.is_empty() {
        UNSPECIFIED_PARTY.to_string()
    } else {
        raw.to_string()
    }
}

const WEEKDAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Calendar quarters, January first
const QUARTER_NAMES: [&str; 4] = ["Q1", "Q2", "Q3", "Q4"];

fn stock_level(closing: &Quantity) -> &'static str {
    let qty = closing.to_f64();
    if qty > 100.0 {
        "High Stock"
    } else if qty > 50.0 {
        "Medium Stock"
    } else {
        "Low Stock"
    }
}

fn inventory_report(records: &[RawRecord]) -> InventoryReport {
    let mut items: Vec<StockLine> = records
        .iter()
        .filter(|r| r.is("STOCKITEM"))
        .map(|r| {
            let closing_balance = r.quantity("CLOSINGBALANCE");
            let reorder_level = if r.fields.contains_key("REORDERBASE") {
                r.quantity("REORDERBASE")
            } else {
                r.quantity("REORDERLEVEL")
            };
            StockLine {
                name: r.text("NAME"),
                is_low_stock: closing_balance <= reorder_level,
                stock_level: stock_level(&closing_balance).to_string(),
                closing_value: r.money("CLOSINGVALUE"),
                base_unit: r.text("BASEUNITS"),
                category: r.text("CATEGORY"),
                closing_balance,
                reorder_level,
            }
        })
        .collect();
    items.sort_by(|a, b| a.name.cmp(&b.name));

    let total_items = items.len();
    let low_stock_items = items.iter().filter(|i| i.is_low_stock).count();
    let zero_stock_items = items
        .iter()
        .filter(|i| !i.closing_balance.is_positive())
        .count();
    let stock_health = if total_items > 0 {
        (total_items - low_stock_items) as f64 / total_items as f64 * 100.0
    } else {
        0.0
    };

    let mut stock_levels = BTreeMap::new();
    for item in &items {
        *stock_levels.entry(item.stock_level.clone()).or_insert(0) += 1;
    }

    InventoryReport {
        summary: InventorySummary {
            total_items,
            total_value: items.iter().map(|i| &i.closing_value).sum(),
            zero_stock_items,
            low_stock_items,
            stock_health,
        },
        stock_levels,
        items,
    }
}

fn value_band(amount: &Money) -> &'static str {
    let value = amount.abs().to_f64();
    if value > 100_000.0 {
        "High Value"
    } else if value > 50_000.0 {
        "Medium Value"
    } else {
        "Low Value"
    }
}

fn sort_balances(balances: &mut [PartyBalance]) {
    balances.sort_by(|a, b| {
        b.closing_balance
            .cmp(&a.closing_balance)
            .then_with(|| a.party.cmp(&b.party))
    });
}

fn outstanding_report(records: &[RawRecord]) -> OutstandingReport {
    let ledgers: Vec<PartyBalance> = records
        .iter()
        .filter(|r| r.is("LEDGER"))
        .map(|r| PartyBalance {
            party: party_name(&r.text("NAME")),
            opening_balance: r.money("OPENINGBALANCE"),
            closing_balance: r.money("CLOSINGBALANCE"),
        })
        .collect();

    let mut value_bands = BTreeMap::new();
    for ledger in &ledgers {
        *value_bands
            .entry(value_band(&ledger.closing_balance).to_string())
            .or_insert(0) += 1;
    }

    let net_position: Money = ledgers.iter().map(|l| &l.closing_balance).sum();

    let mut receivables: Vec<PartyBalance> = ledgers
        .iter()
        .filter(|l| l.closing_balance.is_positive())
        .cloned()
        .collect();
    sort_balances(&mut receivables);

    let mut payables: Vec<PartyBalance> = ledgers
        .iter()
        .filter(|l| l.closing_balance.is_negative())
        .map(|l| PartyBalance {
            party: l.party.clone(),
            opening_balance: l.opening_balance.abs(),
            closing_balance: l.closing_balance.abs(),
        })
        .collect();
    sort_balances(&mut payables);

    let mut bills: Vec<BillLine> = records
        .iter()
        .filter(|r| r.is("BILLALLOCATIONS"))
        .map(|r| BillLine {
            party: party_name(&r.text("LEDGERNAME")),
            bill_name: r.text("NAME"),
            bill_date: r.date("DATE"),
            due_date: r.date("DUEDATE").or_else(|| r.date("BILLDUEDATE")),
            amount: r.money("AMOUNT"),
        })
        .collect();
    bills.sort_by(|a, b| {
        (&a.party, a.effective_due_date(), &a.bill_name).cmp(&(
            &b.party,
            b.effective_due_date(),
            &b.bill_name,
        ))
    });

    OutstandingReport {
        summary: OutstandingSummary {
            total_receivables: receivables.iter().map(|l| &l.closing_balance).sum(),
            total_payables: payables.iter().map(|l| &l.closing_balance).sum(),
            net_position,
            receivable_parties: receivables.len(),
            payable_parties: payables.len(),
        },
        receivables,
        payables,
        value_bands,
        bills,
    }
}

fn groups(records: &[RawRecord]) -> impl Iterator<Item = (String, Money)> + '_ {
    records
        .iter()
        .filter(|r| r.is("GROUP"))
        .map(|r| (r.text("NAME"), r.money("CLOSINGBALANCE")))
}

fn profit_loss_report(records: &[RawRecord]) -> ProfitLossReport {
    let mut report = ProfitLossReport::default();

    for (name, amount) in groups(records) {
        let lower = name.to_lowercase();
        if lower.contains("sales") || lower.contains("income") {
            report.revenue += &amount;
        } else if lower.contains("purchase") || lower.contains("cost") {
            report.cost_of_goods_sold += &amount;
        } else if lower.contains("expense") {
            report.expenses += &amount;
        }
        *report.breakdown.entry(name).or_insert_with(Money::zero) += &amount;
    }

    report.gross_profit = report.revenue.clone() - report.cost_of_goods_sold.clone();
    report.net_profit = report.gross_profit.clone() - report.expenses.clone();
    report
}

fn balance_sheet_report(records: &[RawRecord]) -> BalanceSheetReport {
    let mut assets = AssetSummary::default();
    let mut liabilities = LiabilitySummary::default();
    let mut equity = Money::zero();

    for (name, amount) in groups(records) {
        let lower = name.to_lowercase();
        if lower.contains("current assets") {
            assets.current += &amount;
        } else if lower.contains("fixed assets") {
            assets.fixed += &amount;
        } else if lower.contains("current liabilities") {
            liabilities.current += &amount;
        } else if lower.contains("loan") || lower.contains("long term") {
            liabilities.long_term += &amount;
        } else if lower.contains("capital") || lower.contains("equity") {
            equity += &amount;
        }
    }

    assets.total = assets.current.clone() + &assets.fixed;
    liabilities.total = liabilities.current.clone() + &liabilities.long_term;

    BalanceSheetReport {
        assets,
        liabilities,
        equity,
    }
}

fn cash_flow_report(records: &[RawRecord]) -> CashFlowReport {
    let mut daily: BTreeMap<NaiveDate, (Money, Money)> = BTreeMap::new();

    for r in records.iter().filter(|r| r.is("VOUCHER")) {
        let Some(date) = r.date("DATE") else { continue };
        let voucher_type = r.text("VOUCHERTYPE").to_lowercase();
        let amount = r.money("AMOUNT").abs();
        let slot = daily.entry(date).or_default();
        if voucher_type.contains("receipt") {
            slot.0 += &amount;
        } else if voucher_type.contains("payment") {
            slot.1 += &amount;
        }
    }

    let daily: Vec<CashFlowPoint> = daily
        .into_iter()
        .filter(|(_, (inflow, outflow))| !(inflow.is_zero() && outflow.is_zero()))
        .map(|(date, (inflow, outflow))| CashFlowPoint {
            date,
            net: inflow.clone() - outflow.clone(),
            inflow,
            outflow,
        })
        .collect();

    let total_inflow: Money = daily.iter().map(|p| &p.inflow).sum();
    let total_outflow: Money = daily.iter().map(|p| &p.outflow).sum();

    CashFlowReport {
        net_flow: total_inflow.clone() - total_outflow.clone(),
        total_inflow,
        total_outflow,
        daily,
    }
}

fn ratio(numerator: &Money, denominator: &Money) -> f64 {
    if denominator.is_positive() {
        numerator.to_f64() / denominator.to_f64()
    } else {
        0.0
    }
}

/// Combine one profit & loss and one balance sheet snapshot into the
/// financial summary with its key ratios
pub fn financial_summary(
    profit_loss: ProfitLossReport,
    balance_sheet: BalanceSheetReport,
    period: Option<DateRange>,
) -> FinancialSummary {
    let bs = &balance_sheet;
    let ratios = if bs.assets.total.is_positive() && bs.liabilities.total.is_positive() {
        Some(FinancialRatios {
            current_ratio: ratio(&bs.assets.current, &bs.liabilities.current),
            debt_equity_ratio: ratio(&bs.liabilities.total, &bs.equity),
            asset_turnover: ratio(&profit_loss.revenue, &bs.assets.total),
            profit_margin: ratio(&profit_loss.net_profit, &profit_loss.revenue) * 100.0,
        })
    } else {
        None
    };

    FinancialSummary {
        period,
        profit_loss,
        balance_sheet,
        ratios,
    }
}

/// Distinct voucher numbers per party, used for RFM frequency
pub fn distinct_vouchers_by_party(report: &VoucherReport) -> BTreeMap<String, usize> {
    let mut seen: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    for v in &report.vouchers {
        seen.entry(v.party.clone())
            .or_default()
            .insert(v.voucher_number.as_str());
    }
    seen.into_iter().map(|(party, set)| (party, set.len())).collect()
}
