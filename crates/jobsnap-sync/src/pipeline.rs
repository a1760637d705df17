//! Page-level snapshot pipeline: visit every report view for the selected
//! job and merge what each one shows into a single metrics record.

use jobsnap_adapters::{navigate, read_view_fields, BrowserPage, ReportView, SiteConfig};
use jobsnap_core::Metrics;
use tracing::{debug, error};

use crate::ScrapeError;

/// Collect metrics for whichever job is currently selected on `page`.
///
/// A view that fails to load is logged and contributes no fields. Errors that
/// leave the page unusable, and a redirect to the login form, abort the item.
pub async fn collect_metrics(page: &dyn BrowserPage, site: &SiteConfig) -> Result<Metrics, ScrapeError> {
    let mut metrics = Metrics::default();

    for view in ReportView::ALL {
        let url = site.report_url(view);
        if let Err(err) = navigate(page, &url, site.browser.navigation_timeout()).await {
            if err.is_fatal() {
                return Err(err.into());
            }
            error!(%view, error = %err, "report view did not load; its fields are recorded absent");
            continue;
        }

        match page.exists(&site.selectors.login.username_input).await {
            Ok(true) => return Err(ScrapeError::SessionExpired { view }),
            Ok(false) => {}
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                error!(%view, error = %err, "could not inspect report view; its fields are recorded absent");
                continue;
            }
        }

        let fields = read_view_fields(page, site, view).await?;
        debug!(%view, ?fields, "read report view");
        metrics.merge(&fields);
    }

    metrics.derive_invoice_due();
    Ok(metrics)
}
