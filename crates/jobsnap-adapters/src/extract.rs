//! Field-level reads off the four report views.

use jobsnap_core::{is_placeholder, parse_currency, MetricKey, Metrics};
use tracing::{debug, warn};

use crate::browser::{BrowserError, BrowserPage};
use crate::site::{ReportView, SiteConfig};

/// Footer column holding the job cost when no pending-cost column is shown.
pub const JOB_COST_COLUMN: usize = 5;
/// Footer column holding the job cost when the pending-cost column is shown.
pub const JOB_COST_COLUMN_WITH_PENDING: usize = 6;

/// Read one currency field. Missing elements, placeholders and unparseable
/// text come back as `Ok(None)`; only errors that make the page unusable
/// are returned.
pub async fn read_field(page: &dyn BrowserPage, selector: &str, metric: MetricKey) -> Result<Option<f64>, BrowserError> {
    let raw = match page.text(selector).await {
        Ok(raw) => raw,
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => {
            warn!(field = metric.label(), error = %err, "field could not be read");
            return Ok(None);
        }
    };

    let Some(raw) = raw else {
        warn!(field = metric.label(), %selector, "field element not found");
        return Ok(None);
    };
    if is_placeholder(&raw) {
        warn!(field = metric.label(), value = raw.trim(), "field shows a placeholder");
        return Ok(None);
    }

    let value = parse_currency(Some(&raw));
    match value {
        Some(value) => debug!(field = metric.label(), value, "read field"),
        None => warn!(field = metric.label(), value = raw.trim(), "field is not a currency amount"),
    }
    Ok(value)
}

/// Footer column for the job cost, chosen from the header row on each load.
/// `None` when there is no header row to choose from.
pub fn job_cost_column(headers: &[String], pending_marker: &str) -> Option<usize> {
    if headers.is_empty() {
        return None;
    }
    let marker = pending_marker.to_lowercase();
    let has_pending = headers
        .iter()
        .any(|header| header.to_lowercase().contains(&marker));
    if has_pending {
        Some(JOB_COST_COLUMN_WITH_PENDING)
    } else {
        Some(JOB_COST_COLUMN)
    }
}

/// Read every field a report view carries. The page must already show the view.
pub async fn read_view_fields(page: &dyn BrowserPage, site: &SiteConfig, view: ReportView) -> Result<Metrics, BrowserError> {
    let selectors = &site.selectors;
    let mut metrics = Metrics::default();

    match view {
        ReportView::Estimate => {
            let builder = read_field(page, &selectors.estimate.builder_cost, MetricKey::EstimateBuilderCost).await?;
            metrics.set(MetricKey::EstimateBuilderCost, builder);
            let client = read_field(page, &selectors.estimate.client_price, MetricKey::EstimateClientPrice).await?;
            metrics.set(MetricKey::EstimateClientPrice, client);
        }
        ReportView::JobCost => {
            let headers = match page.texts(&selectors.job_cost.header_cells).await {
                Ok(headers) => headers,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(error = %err, "job cost header row could not be read");
                    Vec::new()
                }
            };
            match job_cost_column(&headers, &selectors.job_cost.pending_header_text) {
                Some(column) => {
                    debug!(column, "job cost footer column");
                    let selector = selectors.job_cost.footer_cell(column);
                    let cost = read_field(page, &selector, MetricKey::JobCost).await?;
                    metrics.set(MetricKey::JobCost, cost);
                }
                None => warn!(field = MetricKey::JobCost.label(), "job cost table has no header row"),
            }
        }
        ReportView::Invoices => {
            let total = read_field(page, &selectors.invoices.total, MetricKey::InvoiceTotal).await?;
            metrics.set(MetricKey::InvoiceTotal, total);
            let paid = read_field(page, &selectors.invoices.paid, MetricKey::InvoicePaid).await?;
            metrics.set(MetricKey::InvoicePaid, paid);
            metrics.derive_invoice_due();
        }
        ReportView::ChangeOrders => {
            let builder = read_field(page, &selectors.change_orders.builder_cost, MetricKey::ChangeOrderBuilderCost).await?;
            metrics.set(MetricKey::ChangeOrderBuilderCost, builder);
            let client = read_field(page, &selectors.change_orders.client_price, MetricKey::ChangeOrderClientPrice).await?;
            metrics.set(MetricKey::ChangeOrderClientPrice, client);
        }
    }

    Ok(metrics)
}
