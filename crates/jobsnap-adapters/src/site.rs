//! Typed description of the target site: URLs, credentials, selectors, timing.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Placeholder the job-cost footer template uses for the column number.
pub const COLUMN_PLACEHOLDER: &str = "{n}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SiteConfigError {
    #[error("base_url must be an absolute http(s) URL, got {0:?}")]
    InvalidBaseUrl(String),
    #[error("urls.{0} must not be empty")]
    MissingUrl(&'static str),
    #[error("selectors.job_cost.footer_cell_template must contain {{n}}")]
    FooterTemplate,
    #[error("browser.{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportView {
    Estimate,
    JobCost,
    Invoices,
    ChangeOrders,
}

impl ReportView {
    pub const ALL: [ReportView; 4] = [
        ReportView::Estimate,
        ReportView::JobCost,
        ReportView::Invoices,
        ReportView::ChangeOrders,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ReportView::Estimate => "Estimate",
            ReportView::JobCost => "Job Cost",
            ReportView::Invoices => "Invoices",
            ReportView::ChangeOrders => "Change Orders",
        }
    }
}

impl fmt::Display for ReportView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub base_url: String,
    pub urls: ReportUrls,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub selectors: Selectors,
    #[serde(default)]
    pub browser: BrowserSettings,
}

/// Absolute URLs, or paths relative to `base_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportUrls {
    pub landing: String,
    pub estimate: String,
    pub job_cost: String,
    pub invoices: String,
    pub change_orders: String,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.username.trim().is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Selectors {
    pub login: LoginSelectors,
    pub job_search: JobSearchSelectors,
    pub estimate: EstimateSelectors,
    pub job_cost: JobCostSelectors,
    pub invoices: InvoiceSelectors,
    pub change_orders: ChangeOrderSelectors,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginSelectors {
    pub username_input: String,
    pub username_submit: String,
    pub challenge_frame: String,
    pub password_input: String,
    pub password_submit: String,
}

impl Default for LoginSelectors {
    fn default() -> Self {
        Self {
            username_input: "#userName".to_string(),
            username_submit: "#usernameSubmit".to_string(),
            challenge_frame: r#"iframe[title="reCAPTCHA"]"#.to_string(),
            password_input: r#"input[type="password"]"#.to_string(),
            password_submit: r#"button[type="submit"]"#.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSearchSelectors {
    pub search_input: String,
    pub clear_search: String,
    pub job_item: String,
}

impl Default for JobSearchSelectors {
    fn default() -> Self {
        Self {
            search_input: "input#JobSearch".to_string(),
            clear_search: r#"button[data-testid="clear-search"]"#.to_string(),
            job_item: "li.JobListItem div.ItemRowJobName".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateSelectors {
    pub builder_cost: String,
    pub client_price: String,
}

impl Default for EstimateSelectors {
    fn default() -> Self {
        Self {
            builder_cost: r#"div[data-testid="expression-total"] span.ant-statistic-content-value span"#
                .to_string(),
            client_price: r#"div[data-testid="expression-balance"] span.ant-statistic-content-value span"#
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeOrderSelectors {
    pub builder_cost: String,
    pub client_price: String,
}

impl Default for ChangeOrderSelectors {
    fn default() -> Self {
        Self {
            builder_cost: r#"td[data-testid="builderCost--footer"] span"#.to_string(),
            client_price: r#"td[data-testid="ownerPrice--footer"] span"#.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobCostSelectors {
    pub header_cells: String,
    pub pending_header_text: String,
    pub footer_cell_template: String,
}

impl Default for JobCostSelectors {
    fn default() -> Self {
        Self {
            header_cells: "tr.BudgetRowHeader th".to_string(),
            pending_header_text: "pending cost".to_string(),
            footer_cell_template: "tr.FooterRow td.ant-table-cell:nth-of-type({n}) span".to_string(),
        }
    }
}

impl JobCostSelectors {
    pub fn footer_cell(&self, column: usize) -> String {
        self.footer_cell_template
            .replace(COLUMN_PLACEHOLDER, &column.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvoiceSelectors {
    pub total: String,
    pub paid: String,
}

impl Default for InvoiceSelectors {
    fn default() -> Self {
        Self {
            total: r#"td[data-testid="invoiceAmount--footer"] span"#.to_string(),
            paid: r#"td[data-testid="amountPaid--footer"] span"#.to_string(),
        }
    }
}

/// Visibility and bounded-wait settings for routine (non-login) browsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    pub navigation_timeout_ms: u64,
    pub element_timeout_ms: u64,
    pub login_form_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            navigation_timeout_ms: 30_000,
            element_timeout_ms: 10_000,
            login_form_timeout_ms: 120_000,
            poll_interval_ms: 250,
        }
    }
}

impl BrowserSettings {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn element_timeout(&self) -> Duration {
        Duration::from_millis(self.element_timeout_ms)
    }

    pub fn login_form_timeout(&self) -> Duration {
        Duration::from_millis(self.login_form_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SiteConfig {
    pub fn new(base_url: impl Into<String>, urls: ReportUrls) -> Self {
        Self {
            base_url: base_url.into(),
            urls,
            credentials: Credentials::default(),
            selectors: Selectors::default(),
            browser: BrowserSettings::default(),
        }
    }

    pub fn validate(&self) -> Result<(), SiteConfigError> {
        let base = self.base_url.trim();
        let host = base
            .strip_prefix("https://")
            .or_else(|| base.strip_prefix("http://"));
        if host.map_or(true, |rest| rest.trim_matches('/').is_empty()) {
            return Err(SiteConfigError::InvalidBaseUrl(self.base_url.clone()));
        }

        let urls = [
            ("landing", &self.urls.landing),
            ("estimate", &self.urls.estimate),
            ("job_cost", &self.urls.job_cost),
            ("invoices", &self.urls.invoices),
            ("change_orders", &self.urls.change_orders),
        ];
        if let Some((name, _)) = urls.iter().find(|(_, url)| url.trim().is_empty()) {
            return Err(SiteConfigError::MissingUrl(*name));
        }

        if !self
            .selectors
            .job_cost
            .footer_cell_template
            .contains(COLUMN_PLACEHOLDER)
        {
            return Err(SiteConfigError::FooterTemplate);
        }

        let timeouts = [
            ("navigation_timeout_ms", self.browser.navigation_timeout_ms),
            ("element_timeout_ms", self.browser.element_timeout_ms),
            ("login_form_timeout_ms", self.browser.login_form_timeout_ms),
            ("poll_interval_ms", self.browser.poll_interval_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(SiteConfigError::ZeroTimeout(*name));
        }

        Ok(())
    }

    pub fn resolve(&self, target: &str) -> String {
        let target = target.trim();
        if target.starts_with("https://") || target.starts_with("http://") {
            return target.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim().trim_end_matches('/'),
            target.trim_start_matches('/')
        )
    }

    pub fn landing_url(&self) -> String {
        self.resolve(&self.urls.landing)
    }

    pub fn report_url(&self, view: ReportView) -> String {
        let target = match view {
            ReportView::Estimate => &self.urls.estimate,
            ReportView::JobCost => &self.urls.job_cost,
            ReportView::Invoices => &self.urls.invoices,
            ReportView::ChangeOrders => &self.urls.change_orders,
        };
        self.resolve(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SiteConfig {
        SiteConfig::new(
            "https://builder.example.com/",
            ReportUrls {
                landing: "/app/Summary".into(),
                estimate: "app/Estimate".into(),
                job_cost: "/app/JobCostingBudget".into(),
                invoices: "https://other.example.com/Invoices".into(),
                change_orders: "/app/ChangeOrders".into(),
            },
        )
    }

    #[test]
    fn relative_urls_resolve_against_base() {
        let site = sample();
        assert_eq!(site.landing_url(), "https://builder.example.com/app/Summary");
        assert_eq!(
            site.report_url(ReportView::Estimate),
            "https://builder.example.com/app/Estimate"
        );
        assert_eq!(
            site.report_url(ReportView::Invoices),
            "https://other.example.com/Invoices"
        );
    }

    #[test]
    fn validation_catches_broken_settings() {
        assert_eq!(sample().validate(), Ok(()));

        let mut site = sample();
        site.base_url = "builder.example.com".into();
        assert!(matches!(site.validate(), Err(SiteConfigError::InvalidBaseUrl(_))));

        let mut site = sample();
        site.urls.job_cost = "  ".into();
        assert_eq!(site.validate(), Err(SiteConfigError::MissingUrl("job_cost")));

        let mut site = sample();
        site.selectors.job_cost.footer_cell_template = "tr.FooterRow td:nth-of-type(5)".into();
        assert_eq!(site.validate(), Err(SiteConfigError::FooterTemplate));

        let mut site = sample();
        site.browser.poll_interval_ms = 0;
        assert_eq!(site.validate(), Err(SiteConfigError::ZeroTimeout("poll_interval_ms")));
    }

    #[test]
    fn footer_template_substitutes_column() {
        let selectors = JobCostSelectors::default();
        assert_eq!(
            selectors.footer_cell(6),
            "tr.FooterRow td.ant-table-cell:nth-of-type(6) span"
        );
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials {
            username: "pm@example.com".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("pm@example.com"));
        assert!(!rendered.contains("hunter2"));
        assert!(creds.is_complete());
        assert!(!Credentials::default().is_complete());
    }
}
