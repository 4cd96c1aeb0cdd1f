use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::value_objects::money::Money;
use crate::domain::value_objects::quantity::Quantity;

/// A single field value as delivered by the accounting server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Date(NaiveDate),
    Number(BigDecimal),
    Text(String),
}

/// One accounting entity (voucher, stock item, ledger, bill allocation,
/// group) flattened into a field map.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    /// Upstream element name, e.g. `VOUCHER` or `STOCKITEM`
    pub entity: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl RawRecord {
    pub fn new(entity: impl Into<String>) -> Self {
        RawRecord {
            entity: entity.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style insert, used by the parser and by tests
    pub fn with(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn with_text(self, name: &str, value: &str) -> Self {
        self.with(name, FieldValue::Text(value.to_string()))
    }

    pub fn insert(&mut self, name: &str, value: FieldValue) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn is(&self, entity: &str) -> bool {
        self.entity.eq_ignore_ascii_case(entity)
    }

    /// Text of a field, empty when missing
    pub fn text(&self, name: &str) -> String {
        match self.fields.get(name) {
            Some(FieldValue::Text(s)) => s.trim().to_string(),
            Some(FieldValue::Number(n)) => n.to_string(),
            Some(FieldValue::Date(d)) => d.to_string(),
            None => String::new(),
        }
    }

    pub fn money(&self, name: &str) -> Money {
        match self.fields.get(name) {
            Some(FieldValue::Number(n)) => Money::new(n.clone()),
            Some(FieldValue::Text(s)) => Money::parse_lenient(s),
            _ => Money::zero(),
        }
    }

    pub fn quantity(&self, name: &str) -> Quantity {
        match self.fields.get(name) {
            Some(FieldValue::Number(n)) => Quantity::new(n.clone()),
            Some(FieldValue::Text(s)) => Quantity::parse_lenient(s),
            _ => Quantity::zero(),
        }
    }

    pub fn date(&self, name: &str) -> Option<NaiveDate> {
        match self.fields.get(name) {
            Some(FieldValue::Date(d)) => Some(*d),
            Some(FieldValue::Text(s)) => parse_tally_date(s),
            _ => None,
        }
    }
}

/// Dates arrive as `20240415` from exports, `2024-04-15` from some reports,
/// and `15-Apr-2024` when echoed back from request variables.
pub fn parse_tally_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    ["%Y%m%d", "%Y-%m-%d", "%d-%b-%Y", "%d-%b-%y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// Request-variable format expected by Tally (`01-Apr-2024`)
pub fn format_tally_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}
