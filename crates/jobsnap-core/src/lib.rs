//! Core domain model and currency parsing for jobsnap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobsnap-core";

/// Display tokens the source UI renders in place of a number.
const PLACEHOLDER_TOKENS: &[&str] = &["--", "n/a"];

/// True when the trimmed text is empty or one of the site's "no data" tokens.
pub fn is_placeholder(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty()
        || PLACEHOLDER_TOKENS
            .iter()
            .any(|token| trimmed.eq_ignore_ascii_case(token))
}

/// Convert displayed currency text into a signed amount.
///
/// Accepts currency symbols, thousands separators and accounting-style
/// parenthesised negatives. Empty, placeholder or unparseable input yields
/// `None`; the result is always finite when present.
pub fn parse_currency(raw: Option<&str>) -> Option<f64> {
    let text = raw?.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("n/a") {
        return None;
    }

    let negative_by_parens = text.starts_with('(') && text.ends_with(')');
    // Thousands separators are dropped along with symbols and whitespace.
    let cleaned = text
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-'))
        .collect::<String>();
    if cleaned.is_empty() {
        return None;
    }

    let value = cleaned.parse::<f64>().ok().filter(|v| v.is_finite())?;
    if negative_by_parens {
        Some(-value.abs())
    } else {
        Some(value)
    }
}

pub fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// The seven metrics read directly off the report views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKey {
    EstimateBuilderCost,
    EstimateClientPrice,
    JobCost,
    InvoiceTotal,
    InvoicePaid,
    ChangeOrderBuilderCost,
    ChangeOrderClientPrice,
}

impl MetricKey {
    pub const ALL: [MetricKey; 7] = [
        MetricKey::EstimateBuilderCost,
        MetricKey::EstimateClientPrice,
        MetricKey::JobCost,
        MetricKey::InvoiceTotal,
        MetricKey::InvoicePaid,
        MetricKey::ChangeOrderBuilderCost,
        MetricKey::ChangeOrderClientPrice,
    ];

    pub fn label(self) -> &'static str {
        match self {
            MetricKey::EstimateBuilderCost => "Estimate BC",
            MetricKey::EstimateClientPrice => "Estimate CP",
            MetricKey::JobCost => "Job Cost",
            MetricKey::InvoiceTotal => "Invoice Total",
            MetricKey::InvoicePaid => "Invoice Paid",
            MetricKey::ChangeOrderBuilderCost => "Change Order BC",
            MetricKey::ChangeOrderClientPrice => "Change Order CP",
        }
    }
}

/// One project's financial metrics as captured in a single pass.
///
/// Every field is optional: absent means the source showed nothing usable.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub estimate_builder_cost: Option<f64>,
    pub estimate_client_price: Option<f64>,
    pub job_cost: Option<f64>,
    pub invoice_total: Option<f64>,
    pub invoice_paid: Option<f64>,
    pub invoice_due: Option<f64>,
    pub change_order_builder_cost: Option<f64>,
    pub change_order_client_price: Option<f64>,
}

impl Metrics {
    pub fn get(&self, key: MetricKey) -> Option<f64> {
        match key {
            MetricKey::EstimateBuilderCost => self.estimate_builder_cost,
            MetricKey::EstimateClientPrice => self.estimate_client_price,
            MetricKey::JobCost => self.job_cost,
            MetricKey::InvoiceTotal => self.invoice_total,
            MetricKey::InvoicePaid => self.invoice_paid,
            MetricKey::ChangeOrderBuilderCost => self.change_order_builder_cost,
            MetricKey::ChangeOrderClientPrice => self.change_order_client_price,
        }
    }

    /// Store a reading; non-finite values are recorded as absent.
    pub fn set(&mut self, key: MetricKey, value: Option<f64>) {
        let value = value.filter(|v| v.is_finite());
        let slot = match key {
            MetricKey::EstimateBuilderCost => &mut self.estimate_builder_cost,
            MetricKey::EstimateClientPrice => &mut self.estimate_client_price,
            MetricKey::JobCost => &mut self.job_cost,
            MetricKey::InvoiceTotal => &mut self.invoice_total,
            MetricKey::InvoicePaid => &mut self.invoice_paid,
            MetricKey::ChangeOrderBuilderCost => &mut self.change_order_builder_cost,
            MetricKey::ChangeOrderClientPrice => &mut self.change_order_client_price,
        };
        *slot = value;
    }

    /// Overlay the present values of `other` onto `self`.
    pub fn merge(&mut self, other: &Metrics) {
        for key in MetricKey::ALL {
            if let Some(value) = other.get(key) {
                self.set(key, Some(value));
            }
        }
        if other.invoice_due.is_some() {
            self.invoice_due = other.invoice_due;
        }
    }

    /// Recompute `invoice_due` from total and paid; absent unless both are present.
    pub fn derive_invoice_due(&mut self) {
        self.invoice_due = match (self.invoice_total, self.invoice_paid) {
            (Some(total), Some(paid)) => Some(round_to_cents(total - paid)),
            _ => None,
        };
    }

    pub fn is_empty(&self) -> bool {
        MetricKey::ALL.iter().all(|key| self.get(*key).is_none()) && self.invoice_due.is_none()
    }
}

/// Dimension row: a construction project keyed by its street address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub address: String,
    pub external_id: Option<i64>,
    pub active: bool,
}

/// Fact row: an immutable point-in-time capture of a project's metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub project_id: i64,
    pub captured_at: DateTime<Utc>,
    #[serde(flatten)]
    pub metrics: Metrics,
}

/// Everything produced by scraping one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub project: Project,
    pub snapshot: Snapshot,
    pub metrics: Metrics,
}

/// Per-address result of a batch run, returned in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub address: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ScrapeOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchEntry {
    pub fn succeeded(address: impl Into<String>, outcome: ScrapeOutcome) -> Self {
        Self {
            address: address.into(),
            ok: true,
            result: Some(outcome),
            error: None,
        }
    }

    pub fn failed(address: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_absent_for_empty_and_placeholder_text() {
        assert_eq!(parse_currency(None), None);
        assert_eq!(parse_currency(Some("")), None);
        assert_eq!(parse_currency(Some("   ")), None);
        assert_eq!(parse_currency(Some("n/a")), None);
        assert_eq!(parse_currency(Some("N/A")), None);
        assert_eq!(parse_currency(Some("--")), None);
        assert_eq!(parse_currency(Some("abc")), None);
    }

    #[test]
    fn currency_parses_symbols_separators_and_parens() {
        assert_eq!(parse_currency(Some("$1,234.50")), Some(1234.50));
        assert_eq!(parse_currency(Some("(500.00)")), Some(-500.00));
        assert_eq!(parse_currency(Some("($2,000)")), Some(-2000.0));
        assert_eq!(parse_currency(Some(" -$75.25 ")), Some(-75.25));
        assert_eq!(parse_currency(Some("$0.00")), Some(0.0));
    }

    #[test]
    fn currency_rejects_malformed_residue() {
        assert_eq!(parse_currency(Some("1.2.3")), None);
        assert_eq!(parse_currency(Some("$-")), None);
    }

    #[test]
    fn placeholder_detection_is_case_insensitive() {
        assert!(is_placeholder(""));
        assert!(is_placeholder(" -- "));
        assert!(is_placeholder("N/a"));
        assert!(!is_placeholder("$0.00"));
    }

    #[test]
    fn invoice_due_requires_both_operands() {
        let mut metrics = Metrics {
            invoice_total: Some(1000.00),
            invoice_paid: Some(400.00),
            ..Metrics::default()
        };
        metrics.derive_invoice_due();
        assert_eq!(metrics.invoice_due, Some(600.00));

        metrics.invoice_total = None;
        metrics.derive_invoice_due();
        assert_eq!(metrics.invoice_due, None);
    }

    #[test]
    fn invoice_due_rounds_to_cents() {
        let mut metrics = Metrics {
            invoice_total: Some(100.10),
            invoice_paid: Some(33.37),
            ..Metrics::default()
        };
        metrics.derive_invoice_due();
        assert_eq!(metrics.invoice_due, Some(66.73));
    }

    #[test]
    fn merge_keeps_existing_values_when_other_is_absent() {
        let mut base = Metrics {
            job_cost: Some(10.0),
            ..Metrics::default()
        };
        let other = Metrics {
            estimate_builder_cost: Some(5.0),
            ..Metrics::default()
        };
        base.merge(&other);
        assert_eq!(base.job_cost, Some(10.0));
        assert_eq!(base.estimate_builder_cost, Some(5.0));
        assert!(!base.is_empty());
        assert!(Metrics::default().is_empty());
    }

    #[test]
    fn set_drops_non_finite_values() {
        let mut metrics = Metrics::default();
        metrics.set(MetricKey::JobCost, Some(f64::NAN));
        assert_eq!(metrics.job_cost, None);
    }

    #[test]
    fn batch_entry_serializes_result_or_error() {
        let failed = serde_json::to_value(BatchEntry::failed("12 Elm St", "job not found")).unwrap();
        assert_eq!(failed["ok"], false);
        assert_eq!(failed["error"], "job not found");
        assert!(failed.get("result").is_none());
    }
}
