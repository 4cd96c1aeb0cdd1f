use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::domain::entities::alert::{AlertEvent, AlertKind, Severity};
use crate::domain::entities::report::{
    CashFlowReport, InventoryReport, OutstandingReport, Report, VoucherReport,
};
use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::value_objects::money::Money;

/// Longest day count any threshold window may span
pub const MAX_WINDOW_DAYS: i64 = 36_500;

/// Threshold configuration for the alert scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Alert when `stock / reorder_level` falls below this ratio
    pub low_stock_ratio: f64,
    /// Below this ratio a low-stock alert escalates to `High`
    pub critical_stock_ratio: f64,
    /// Bills due more than this many days ago are overdue
    pub overdue_days: i64,
    /// Trailing window for the cash flow check
    pub negative_cash_flow_window_days: i64,
    /// Per-party receivable balance that warrants attention
    pub high_receivable_amount: Money,
    /// Minimum drop between consecutive sales windows, in percent
    pub sales_drop_percentage: f64,
    pub sales_drop_window_days: i64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        AlertThresholds {
            low_stock_ratio: 1.0,
            critical_stock_ratio: 0.5,
            overdue_days: 30,
            negative_cash_flow_window_days: 30,
            high_receivable_amount: Money::from(100_000),
            sales_drop_percentage: 20.0,
            sales_drop_window_days: 30,
        }
    }
}

impl AlertThresholds {
    pub fn validate(&self) -> PipelineResult<()> {
        let invalid =
            |msg: String| -> PipelineResult<()> { Err(PipelineError::InvalidThresholdConfig(msg)) };

        if !self.low_stock_ratio.is_finite() || self.low_stock_ratio <= 0.0 {
            return invalid(format!(
                "low_stock_ratio must be positive, got {}",
                self.low_stock_ratio
            ));
        }
        if !self.critical_stock_ratio.is_finite()
            || self.critical_stock_ratio <= 0.0
            || self.critical_stock_ratio > self.low_stock_ratio
        {
            return invalid(format!(
                "critical_stock_ratio must be in (0, {}], got {}",
                self.low_stock_ratio, self.critical_stock_ratio
            ));
        }
        if !(0..=MAX_WINDOW_DAYS).contains(&self.overdue_days) {
            return invalid(format!(
                "overdue_days must be in [0, {}], got {}",
                MAX_WINDOW_DAYS, self.overdue_days
            ));
        }
        if !(1..=MAX_WINDOW_DAYS).contains(&self.negative_cash_flow_window_days) {
            return invalid(format!(
                "negative_cash_flow_window_days must be in [1, {}], got {}",
                MAX_WINDOW_DAYS, self.negative_cash_flow_window_days
            ));
        }
        if self.high_receivable_amount.is_negative() {
            return invalid(format!(
                "high_receivable_amount must not be negative, got {}",
                self.high_receivable_amount
            ));
        }
        if !self.sales_drop_percentage.is_finite()
            || self.sales_drop_percentage <= 0.0
            || self.sales_drop_percentage > 100.0
        {
            return invalid(format!(
                "sales_drop_percentage must be in (0, 100], got {}",
                self.sales_drop_percentage
            ));
        }
        if !(1..=MAX_WINDOW_DAYS).contains(&self.sales_drop_window_days) {
            return invalid(format!(
                "sales_drop_window_days must be in [1, {}], got {}",
                MAX_WINDOW_DAYS, self.sales_drop_window_days
            ));
        }
        Ok(())
    }
}

/// Stateless threshold scanner. Each scan sees one report and nothing else.
#[derive(Debug, Clone)]
pub struct AlertEngine {
    thresholds: AlertThresholds,
}

impl AlertEngine {
    pub fn new(thresholds: AlertThresholds) -> PipelineResult<Self> {
        thresholds.validate()?;
        Ok(AlertEngine { thresholds })
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    pub fn scan(&self, report: &Report) -> Vec<AlertEvent> {
        self.scan_at(report, Utc::now())
    }

    /// Scan against a fixed clock. Output is sorted by severity (most urgent
    /// first), then subject, then kind.
    pub fn scan_at(&self, report: &Report, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let mut alerts = match report {
            Report::Inventory(r) => self.low_stock(r, now),
            Report::Outstanding(r) => {
                let mut alerts = self.overdue_payments(r, now);
                alerts.extend(self.high_receivables(r, now));
                alerts
            }
            Report::CashFlow(r) => self.negative_cash_flow(r, now).into_iter().collect(),
            Report::Sales(r) => self.sales_drop(r, now).into_iter().collect(),
            _ => Vec::new(),
        };

        alerts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.subject_id.cmp(&b.subject_id))
                .then_with(|| a.kind.cmp(&b.kind))
        });
        // one alert per subject and kind, the most severe one
        let mut seen = HashSet::new();
        alerts.retain(|a| seen.insert((a.kind, a.subject_id.clone())));

        debug!(
            report = %report.kind(),
            alerts = alerts.len(),
            "Alert scan complete"
        );
        alerts
    }

    /// Out-of-stock items always alert. Items in stock alert only against a
    /// positive reorder level.
    fn low_stock(&self, report: &InventoryReport, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let t = &self.thresholds;
        report
            .items
            .iter()
            .filter_map(|item| {
                let stock = item.closing_balance.to_f64();
                let (severity, message) = if stock <= 0.0 {
                    (Severity::Critical, format!("{} is out of stock", item.name))
                } else {
                    if !item.reorder_level.is_positive() {
                        return None;
                    }
                    let ratio = stock / item.reorder_level.to_f64();
                    if ratio >= t.low_stock_ratio {
                        return None;
                    }
                    let (severity, state) = if ratio < t.critical_stock_ratio {
                        (Severity::High, "critically low")
                    } else {
                        (Severity::Medium, "running low")
                    };
                    (
                        severity,
                        format!(
                            "{} is {}: {} left, reorder level {}",
                            item.name, state, item.closing_balance, item.reorder_level
                        ),
                    )
                };
                Some(
                    AlertEvent::new(AlertKind::LowStock, severity, &item.name, message, now)
                        .with_data("current_stock", &item.closing_balance)
                        .with_data("reorder_level", &item.reorder_level)
                        .with_data("unit", &item.base_unit),
                )
            })
            .collect()
    }

    fn overdue_payments(&self, report: &OutstandingReport, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let cutoff = now.date_naive() - Duration::days(self.thresholds.overdue_days);

        // party -> (amount, bills, oldest due date)
        let mut overdue: BTreeMap<&str, (Money, usize, NaiveDate)> = BTreeMap::new();
        for bill in &report.bills {
            let Some(due) = bill.effective_due_date() else {
                continue;
            };
            if due >= cutoff {
                continue;
            }
            let slot = overdue
                .entry(bill.party.as_str())
                .or_insert_with(|| (Money::zero(), 0, due));
            slot.0 += &bill.amount.abs();
            slot.1 += 1;
            slot.2 = slot.2.min(due);
        }

        overdue
            .into_iter()
            .map(|(party, (amount, bills, oldest))| {
                let days = (now.date_naive() - oldest).num_days();
                AlertEvent::new(
                    AlertKind::OverduePayment,
                    Severity::High,
                    party,
                    format!(
                        "{} has {} overdue bill(s) totalling {}, oldest due {} days ago",
                        party, bills, amount, days
                    ),
                    now,
                )
                .with_data("amount", &amount)
                .with_data("bills", bills)
                .with_data("days_overdue", days)
            })
            .collect()
    }

    fn high_receivables(&self, report: &OutstandingReport, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let limit = &self.thresholds.high_receivable_amount;
        report
            .receivables
            .iter()
            .filter(|r| &r.closing_balance > limit)
            .map(|r| {
                AlertEvent::new(
                    AlertKind::HighReceivable,
                    Severity::Medium,
                    &r.party,
                    format!(
                        "{} owes {}, above the {} limit",
                        r.party, r.closing_balance, limit
                    ),
                    now,
                )
                .with_data("amount", &r.closing_balance)
                .with_data("limit", limit)
            })
            .collect()
    }

    fn negative_cash_flow(&self, report: &CashFlowReport, now: DateTime<Utc>) -> Option<AlertEvent> {
        let window = self.thresholds.negative_cash_flow_window_days;
        let to = now.date_naive();
        let from = to - Duration::days(window - 1);
        let net = report.net_between(from, to);
        if !net.is_negative() {
            return None;
        }
        Some(
            AlertEvent::new(
                AlertKind::NegativeCashFlow,
                Severity::Critical,
                "cash_flow",
                format!("Net cash flow over the last {} days is {}", window, net),
                now,
            )
            .with_data("net_flow", &net)
            .with_data("window_days", window),
        )
    }

    fn sales_drop(&self, report: &VoucherReport, now: DateTime<Utc>) -> Option<AlertEvent> {
        let window = self.thresholds.sales_drop_window_days;
        let today = now.date_naive();
        let current_start = today - Duration::days(window - 1);
        let previous_start = current_start - Duration::days(window);

        let mut current = Money::zero();
        let mut previous = Money::zero();
        for point in &report.daily {
            let Ok(date) = NaiveDate::parse_from_str(&point.period, "%Y-%m-%d") else {
                continue;
            };
            if date >= current_start && date <= today {
                current += &point.total;
            } else if date >= previous_start && date < current_start {
                previous += &point.total;
            }
        }

        if !previous.is_positive() {
            return None;
        }
        let drop = (previous.to_f64() - current.to_f64()) / previous.to_f64() * 100.0;
        if drop < self.thresholds.sales_drop_percentage {
            return None;
        }
        Some(
            AlertEvent::new(
                AlertKind::SalesDrop,
                Severity::Medium,
                "sales",
                format!(
                    "Sales fell {:.1}% over the last {} days ({} vs {})",
                    drop, window, current, previous
                ),
                now,
            )
            .with_data("current", &current)
            .with_data("previous", &previous)
            .with_data("drop_percentage", format!("{:.1}", drop)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::report::{
        BillLine, CashFlowPoint, PartyBalance, SeriesPoint, StockLine,
    };
    use crate::domain::value_objects::quantity::Quantity;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn item(name: &str, stock: i64, reorder: i64) -> StockLine {
        StockLine {
            name: name.to_string(),
            closing_balance: Quantity::from(stock),
            closing_value: Money::zero(),
            reorder_level: Quantity::from(reorder),
            base_unit: "Nos".to_string(),
            category: String::new(),
            stock_level: String::new(),
            is_low_stock: stock <= reorder,
        }
    }

    fn inventory(items: Vec<StockLine>) -> Report {
        Report::Inventory(InventoryReport {
            items,
            ..Default::default()
        })
    }

    fn engine() -> AlertEngine {
        AlertEngine::new(AlertThresholds::default()).unwrap()
    }

    #[test]
    fn test_low_stock_below_reorder_alerts_once() {
        let alerts = engine().scan_at(&inventory(vec![item("Widget", 85, 100)]), now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowStock);
        assert_eq!(alerts[0].severity, Severity::Medium);
        assert_eq!(alerts[0].subject_id, "Widget");
        assert_eq!(alerts[0].data["current_stock"], "85");
    }

    #[test]
    fn test_healthy_stock_does_not_alert() {
        let alerts = engine().scan_at(&inventory(vec![item("Gadget", 450, 200)]), now());
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_low_stock_tiers() {
        let report = inventory(vec![
            item("Bolt", 0, 50),
            item("Nut", 20, 50),
            item("Washer", 40, 50),
            item("Untracked", 0, 0),
            item("Unplanned", 5, 0),
        ]);
        let alerts = engine().scan_at(&report, now());
        let tiers: Vec<(&str, Severity)> = alerts
            .iter()
            .map(|a| (a.subject_id.as_str(), a.severity))
            .collect();
        assert_eq!(
            tiers,
            vec![
                ("Bolt", Severity::Critical),
                ("Untracked", Severity::Critical),
                ("Nut", Severity::High),
                ("Washer", Severity::Medium),
            ]
        );
    }

    #[test]
    fn test_scan_is_idempotent() {
        let report = inventory(vec![item("Widget", 85, 100), item("Bolt", 0, 10)]);
        let engine = engine();
        assert_eq!(engine.scan_at(&report, now()), engine.scan_at(&report, now()));
    }

    #[test]
    fn test_overdue_bills_grouped_per_party() {
        let bill = |party: &str, name: &str, due: Option<NaiveDate>, date: NaiveDate| BillLine {
            party: party.to_string(),
            bill_name: name.to_string(),
            bill_date: Some(date),
            due_date: due,
            amount: Money::from(1000),
        };
        let report = Report::Outstanding(OutstandingReport {
            bills: vec![
                bill("Acme", "INV-1", Some(day(2024, 4, 1)), day(2024, 3, 1)),
                bill("Acme", "INV-2", None, day(2024, 5, 1)),
                // due within the grace period
                bill("Beta", "INV-3", Some(day(2024, 6, 15)), day(2024, 5, 1)),
            ],
            ..Default::default()
        });
        let alerts = engine().scan_at(&report, now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::OverduePayment);
        assert_eq!(alerts[0].subject_id, "Acme");
        assert_eq!(alerts[0].data["bills"], "2");
        assert_eq!(alerts[0].data["amount"], "2000.00");
        assert_eq!(alerts[0].data["days_overdue"], "90");
    }

    #[test]
    fn test_high_receivable_and_ordering() {
        let report = Report::Outstanding(OutstandingReport {
            receivables: vec![
                PartyBalance {
                    party: "Zeta".to_string(),
                    opening_balance: Money::zero(),
                    closing_balance: Money::from(250_000),
                },
                PartyBalance {
                    party: "Alpha".to_string(),
                    opening_balance: Money::zero(),
                    closing_balance: Money::from(150_000),
                },
                PartyBalance {
                    party: "Small".to_string(),
                    opening_balance: Money::zero(),
                    closing_balance: Money::from(5_000),
                },
            ],
            bills: vec![BillLine {
                party: "Zeta".to_string(),
                bill_name: "INV-9".to_string(),
                bill_date: Some(day(2024, 1, 1)),
                due_date: None,
                amount: Money::from(250_000),
            }],
            ..Default::default()
        });
        let alerts = engine().scan_at(&report, now());
        let order: Vec<(AlertKind, &str)> = alerts
            .iter()
            .map(|a| (a.kind, a.subject_id.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (AlertKind::OverduePayment, "Zeta"),
                (AlertKind::HighReceivable, "Alpha"),
                (AlertKind::HighReceivable, "Zeta"),
            ]
        );
    }

    #[test]
    fn test_negative_cash_flow_in_window() {
        let point = |date: NaiveDate, net: i64| CashFlowPoint {
            date,
            inflow: Money::zero(),
            outflow: Money::zero(),
            net: Money::from(net),
        };
        let report = Report::CashFlow(CashFlowReport {
            daily: vec![
                // outside the 30-day window
                point(day(2024, 5, 1), 100_000),
                point(day(2024, 6, 10), 5_000),
                point(day(2024, 6, 25), -8_000),
            ],
            ..Default::default()
        });
        let alerts = engine().scan_at(&report, now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].subject_id, "cash_flow");
        assert_eq!(alerts[0].data["net_flow"], "-3000.00");
    }

    #[test]
    fn test_sales_drop_detection() {
        let point = |period: &str, total: i64| SeriesPoint {
            period: period.to_string(),
            total: Money::from(total),
            count: 1,
        };
        let dropped = Report::Sales(VoucherReport {
            daily: vec![point("2024-05-15", 100_000), point("2024-06-15", 60_000)],
            ..Default::default()
        });
        let alerts = engine().scan_at(&dropped, now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::SalesDrop);
        assert_eq!(alerts[0].data["drop_percentage"], "40.0");

        let steady = Report::Sales(VoucherReport {
            daily: vec![point("2024-05-15", 100_000), point("2024-06-15", 95_000)],
            ..Default::default()
        });
        assert!(engine().scan_at(&steady, now()).is_empty());
    }

    #[test]
    fn test_reports_without_rules_yield_nothing() {
        let report = Report::ProfitLoss(Default::default());
        assert!(engine().scan_at(&report, now()).is_empty());
    }

    #[test]
    fn test_threshold_validation() {
        let bad = [
            AlertThresholds {
                low_stock_ratio: 0.0,
                ..Default::default()
            },
            AlertThresholds {
                critical_stock_ratio: 2.0,
                ..Default::default()
            },
            AlertThresholds {
                overdue_days: -1,
                ..Default::default()
            },
            AlertThresholds {
                negative_cash_flow_window_days: 0,
                ..Default::default()
            },
            AlertThresholds {
                sales_drop_percentage: 150.0,
                ..Default::default()
            },
            AlertThresholds {
                low_stock_ratio: f64::NAN,
                ..Default::default()
            },
            AlertThresholds {
                overdue_days: i64::MAX / 1000,
                ..Default::default()
            },
            AlertThresholds {
                negative_cash_flow_window_days: MAX_WINDOW_DAYS + 1,
                ..Default::default()
            },
            AlertThresholds {
                sales_drop_window_days: i64::MAX,
                ..Default::default()
            },
        ];
        for thresholds in bad {
            assert!(matches!(
                AlertEngine::new(thresholds),
                Err(PipelineError::InvalidThresholdConfig(_))
            ));
        }
        assert!(AlertThresholds::default().validate().is_ok());
    }

    #[test]
    fn test_longest_windows_scan_without_overflow() {
        let engine = AlertEngine::new(AlertThresholds {
            overdue_days: MAX_WINDOW_DAYS,
            negative_cash_flow_window_days: MAX_WINDOW_DAYS,
            sales_drop_window_days: MAX_WINDOW_DAYS,
            ..Default::default()
        })
        .unwrap();
        for report in [
            Report::Outstanding(OutstandingReport::default()),
            Report::CashFlow(CashFlowReport::default()),
            Report::Sales(VoucherReport::default()),
        ] {
            assert!(engine.scan_at(&report, now()).is_empty());
        }
    }
}
