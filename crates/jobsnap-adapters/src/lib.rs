//! Browser-facing half of jobsnap: the browser seam and its Chromium driver,
//! the cached-session manager, job selection and report field extraction.

pub mod browser;
pub mod chromium;
pub mod extract;
pub mod select;
pub mod session;
pub mod site;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use browser::{
    navigate, same_label, wait_for_label, wait_for_network_quiet, wait_for_selector, wait_until_absent, BrowserError,
    BrowserLauncher, BrowserPage, LaunchOptions, NetworkEvent, OriginStorage, StorageState, StoredCookie, WaitOutcome,
};
pub use chromium::ChromiumLauncher;
pub use extract::{job_cost_column, read_field, read_view_fields};
pub use select::select_job;
pub use session::{interactive_login, AuthenticatedContext, Session, SessionError, SessionManager};
pub use site::{
    BrowserSettings, ChangeOrderSelectors, Credentials, EstimateSelectors, InvoiceSelectors, JobCostSelectors,
    JobSearchSelectors, LoginSelectors, ReportUrls, ReportView, Selectors, SiteConfig, SiteConfigError,
};

pub const CRATE_NAME: &str = "jobsnap-adapters";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_name_matches_package() {
        assert_eq!(CRATE_NAME, env!("CARGO_PKG_NAME"));
    }
}
