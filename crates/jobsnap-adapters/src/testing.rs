//! Scripted in-memory stand-in for the target site, driven through the
//! browser seam so session, selection and extraction run without Chromium.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::browser::{same_label, BrowserError, BrowserLauncher, BrowserPage, LaunchOptions, StorageState, StoredCookie};
use crate::site::{BrowserSettings, Credentials, ReportUrls, ReportView, SiteConfig};

const SESSION_COOKIE: &str = "jobsnap_session";
const COOKIE_DOMAIN: &str = "builder.test";

const HEADERS: [&str; 5] = ["Cost Code", "Budget", "Committed", "Actual", "Variance"];
const HEADERS_WITH_PENDING: [&str; 6] = ["Cost Code", "Budget", "Committed", "Actual", "Pending Cost", "Variance"];

/// What a job shows on each report view. `None` means the element is missing.
#[derive(Debug, Clone)]
pub struct JobFixture {
    pub estimate: (Option<String>, Option<String>),
    pub pending_cost_column: bool,
    pub job_cost_header: bool,
    pub job_cost_footer: Vec<String>,
    pub invoices: (Option<String>, Option<String>),
    pub change_orders: (Option<String>, Option<String>),
    pub selectable: bool,
    pub broken: bool,
}

impl Default for JobFixture {
    fn default() -> Self {
        Self {
            estimate: (None, None),
            pending_cost_column: false,
            job_cost_header: true,
            job_cost_footer: Vec::new(),
            invoices: (None, None),
            change_orders: (None, None),
            selectable: true,
            broken: false,
        }
    }
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

impl JobFixture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listed in the search results, but the entry detaches when clicked.
    pub fn unselectable() -> Self {
        Self {
            selectable: false,
            ..Self::default()
        }
    }

    /// Selectable, but opening any report view drops the browser connection.
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    pub fn estimate(mut self, builder_cost: Option<&str>, client_price: Option<&str>) -> Self {
        self.estimate = (owned(builder_cost), owned(client_price));
        self
    }

    /// Footer cells in column order, first cell is column 1.
    pub fn job_cost(mut self, pending_column: bool, footer: &[&str]) -> Self {
        self.pending_cost_column = pending_column;
        self.job_cost_footer = footer.iter().map(|cell| cell.to_string()).collect();
        self
    }

    /// The job cost table renders its footer but no header row.
    pub fn without_job_cost_header(mut self) -> Self {
        self.job_cost_header = false;
        self
    }

    pub fn invoices(mut self, total: Option<&str>, paid: Option<&str>) -> Self {
        self.invoices = (owned(total), owned(paid));
        self
    }

    pub fn change_orders(mut self, builder_cost: Option<&str>, client_price: Option<&str>) -> Self {
        self.change_orders = (owned(builder_cost), owned(client_price));
        self
    }
}

#[derive(Default)]
struct SiteState {
    jobs: Vec<(String, JobFixture)>,
    challenge_polls: usize,
    challenge_glitch: bool,
    reject_sessions: bool,
    valid_tokens: HashSet<String>,
    issued_tokens: usize,
    selected: Option<String>,
    launches: usize,
    visible_launches: usize,
    open_pages: usize,
}

impl SiteState {
    fn issue_token(&mut self) -> StoredCookie {
        self.issued_tokens += 1;
        let token = format!("token-{}", self.issued_tokens);
        self.valid_tokens.insert(token.clone());
        StoredCookie {
            name: SESSION_COOKIE.to_string(),
            value: token,
            domain: COOKIE_DOMAIN.to_string(),
            path: "/".to_string(),
            secure: true,
            http_only: true,
        }
    }

    fn honours(&self, cookies: &[StoredCookie]) -> bool {
        !self.reject_sessions
            && cookies
                .iter()
                .any(|cookie| cookie.name == SESSION_COOKIE && self.valid_tokens.contains(&cookie.value))
    }

    fn job(&self, address: &str) -> Option<&JobFixture> {
        self.jobs
            .iter()
            .find(|(name, _)| name == address)
            .map(|(_, fixture)| fixture)
    }
}

/// Shared handle to the scripted site. Clones observe the same state.
#[derive(Clone, Default)]
pub struct ScriptedSite {
    state: Arc<Mutex<SiteState>>,
}

impl ScriptedSite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Site configuration pointing at this scripted site, with millisecond waits.
    pub fn site_config() -> SiteConfig {
        let mut site = SiteConfig::new(
            "https://builder.test",
            ReportUrls {
                landing: "/app/Summary".to_string(),
                estimate: "/app/Estimate".to_string(),
                job_cost: "/app/JobCostingBudget".to_string(),
                invoices: "/app/Invoices".to_string(),
                change_orders: "/app/ChangeOrders".to_string(),
            },
        );
        site.credentials = Credentials {
            username: "pm@builder.test".to_string(),
            password: "correct horse".to_string(),
        };
        site.browser = BrowserSettings {
            headless: true,
            navigation_timeout_ms: 1_000,
            element_timeout_ms: 200,
            login_form_timeout_ms: 1_000,
            poll_interval_ms: 1,
        };
        site
    }

    fn lock(&self) -> MutexGuard<'_, SiteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_job(self, address: &str, fixture: JobFixture) -> Self {
        self.lock().jobs.push((address.to_string(), fixture));
        self
    }

    /// Show the human-verification widget for this many polls after the username step.
    pub fn with_challenge_polls(self, polls: usize) -> Self {
        self.lock().challenge_polls = polls;
        self
    }

    /// The second look at the verification widget fails the way a page
    /// replacing its document mid-script does.
    pub fn with_flaky_challenge(self) -> Self {
        self.lock().challenge_glitch = true;
        self
    }

    /// Sign-in succeeds, but no issued session is ever honoured afterwards.
    pub fn rejecting_sessions(self) -> Self {
        self.lock().reject_sessions = true;
        self
    }

    pub fn launcher(&self) -> Arc<dyn BrowserLauncher> {
        Arc::new(ScriptedLauncher { site: self.clone() })
    }

    /// Forget every issued session token, as a server-side expiry would.
    pub fn expire_sessions(&self) {
        self.lock().valid_tokens.clear();
    }

    /// A storage state the site currently honours, without going through sign-in.
    pub fn authenticated_state(&self) -> StorageState {
        let cookie = self.lock().issue_token();
        StorageState {
            cookies: vec![cookie],
            origins: Vec::new(),
        }
    }

    pub fn selected_job(&self) -> Option<String> {
        self.lock().selected.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.lock().launches
    }

    pub fn visible_launches(&self) -> usize {
        self.lock().visible_launches
    }

    pub fn open_pages(&self) -> usize {
        self.lock().open_pages
    }
}

pub struct ScriptedLauncher {
    site: ScriptedSite,
}

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn launch(&self, options: LaunchOptions) -> Result<Box<dyn BrowserPage>, BrowserError> {
        {
            let mut state = self.site.lock();
            state.launches += 1;
            if !options.headless {
                state.visible_launches += 1;
            }
            state.open_pages += 1;
        }
        Ok(Box::new(ScriptedPage {
            site: self.site.clone(),
            config: ScriptedSite::site_config(),
            page: Mutex::new(PageState::default()),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Screen {
    #[default]
    Blank,
    Username,
    Challenge {
        remaining: usize,
    },
    Password,
    Landing,
    Report(ReportView),
}

impl Screen {
    fn in_app(self) -> bool {
        matches!(self, Screen::Landing | Screen::Report(_))
    }
}

#[derive(Default)]
struct PageState {
    url: Option<String>,
    screen: Screen,
    cookies: Vec<StoredCookie>,
    search: String,
    challenge_checks: usize,
}

struct ScriptedPage {
    site: ScriptedSite,
    config: SiteConfig,
    page: Mutex<PageState>,
}

impl ScriptedPage {
    fn page(&self) -> MutexGuard<'_, PageState> {
        self.page.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listed_jobs(&self, search: &str) -> Vec<String> {
        let search = search.to_lowercase();
        self.site
            .lock()
            .jobs
            .iter()
            .map(|(address, _)| address.clone())
            .filter(|address| address.to_lowercase().contains(&search))
            .collect()
    }

    fn report_text(&self, view: ReportView, selector: &str) -> Option<String> {
        let selected = self.site.selected_job()?;
        let state = self.site.lock();
        let job = state.job(&selected)?;
        let selectors = &self.config.selectors;
        match view {
            ReportView::Estimate if selector == selectors.estimate.builder_cost => job.estimate.0.clone(),
            ReportView::Estimate if selector == selectors.estimate.client_price => job.estimate.1.clone(),
            ReportView::JobCost => (1..=job.job_cost_footer.len())
                .find(|column| selectors.job_cost.footer_cell(*column) == selector)
                .map(|column| job.job_cost_footer[column - 1].clone()),
            ReportView::Invoices if selector == selectors.invoices.total => job.invoices.0.clone(),
            ReportView::Invoices if selector == selectors.invoices.paid => job.invoices.1.clone(),
            ReportView::ChangeOrders if selector == selectors.change_orders.builder_cost => {
                job.change_orders.0.clone()
            }
            ReportView::ChangeOrders if selector == selectors.change_orders.client_price => {
                job.change_orders.1.clone()
            }
            _ => None,
        }
    }
}

#[async_trait]
impl BrowserPage for ScriptedPage {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        tokio::task::yield_now().await;

        let target = if url == self.config.landing_url() {
            Screen::Landing
        } else if let Some(view) = ReportView::ALL
            .into_iter()
            .find(|view| self.config.report_url(*view) == url)
        {
            Screen::Report(view)
        } else {
            return Err(BrowserError::Navigation {
                url: url.to_string(),
                reason: "net::ERR_NAME_NOT_RESOLVED".to_string(),
            });
        };

        let mut page = self.page();
        let state = self.site.lock();
        if let Screen::Report(_) = target {
            let broken = state
                .selected
                .as_deref()
                .and_then(|address| state.job(address))
                .is_some_and(|job| job.broken);
            if broken {
                return Err(BrowserError::Disconnected("target closed".to_string()));
            }
        }
        page.url = Some(url.to_string());
        page.screen = if state.honours(&page.cookies) {
            target
        } else {
            Screen::Username
        };
        Ok(())
    }

    async fn settle(&self, _timeout: Duration) -> Result<(), BrowserError> {
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn current_url(&self) -> Result<Option<String>, BrowserError> {
        Ok(self.page().url.clone())
    }

    async fn exists(&self, selector: &str) -> Result<bool, BrowserError> {
        let login = &self.config.selectors.login;
        let search = &self.config.selectors.job_search;
        let known = {
            let mut page = self.page();
            let screen = page.screen;
            if selector == login.challenge_frame {
                if let Screen::Challenge { .. } = screen {
                    page.challenge_checks += 1;
                    if page.challenge_checks == 2 && self.site.lock().challenge_glitch {
                        return Err(BrowserError::Script("Execution context was destroyed".to_string()));
                    }
                }
                match screen {
                    Screen::Challenge { remaining: 0 } => {
                        page.screen = Screen::Password;
                        Some(false)
                    }
                    Screen::Challenge { remaining } => {
                        if remaining != usize::MAX {
                            page.screen = Screen::Challenge { remaining: remaining - 1 };
                        }
                        Some(true)
                    }
                    _ => Some(false),
                }
            } else if selector == login.username_input {
                Some(screen == Screen::Username)
            } else if selector == login.password_input {
                Some(screen == Screen::Password)
            } else if selector == search.search_input {
                Some(screen.in_app())
            } else if selector == search.clear_search {
                Some(screen.in_app() && !page.search.is_empty())
            } else if selector == search.job_item {
                Some(screen.in_app() && !self.listed_jobs(&page.search).is_empty())
            } else {
                None
            }
        };
        match known {
            Some(found) => Ok(found),
            None => Ok(self.text(selector).await?.is_some()),
        }
    }

    async fn text(&self, selector: &str) -> Result<Option<String>, BrowserError> {
        let screen = self.page().screen;
        match screen {
            Screen::Report(view) => Ok(self.report_text(view, selector)),
            _ => Ok(None),
        }
    }

    async fn texts(&self, selector: &str) -> Result<Vec<String>, BrowserError> {
        let (screen, search) = {
            let page = self.page();
            (page.screen, page.search.clone())
        };
        if !screen.in_app() {
            return Ok(Vec::new());
        }

        if selector == self.config.selectors.job_search.job_item {
            return Ok(self.listed_jobs(&search));
        }

        if selector == self.config.selectors.job_cost.header_cells {
            if let Screen::Report(ReportView::JobCost) = screen {
                let layout = self
                    .site
                    .selected_job()
                    .and_then(|address| {
                        self.site
                            .lock()
                            .job(&address)
                            .map(|job| (job.job_cost_header, job.pending_cost_column))
                    });
                let headers: &[&str] = match layout {
                    Some((false, _)) => &[],
                    Some((true, true)) => &HEADERS_WITH_PENDING,
                    _ => &HEADERS,
                };
                return Ok(headers.iter().map(|header| header.to_string()).collect());
            }
            return Ok(Vec::new());
        }

        Ok(self.text(selector).await?.into_iter().collect())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        let login = &self.config.selectors.login;
        let mut page = self.page();
        let screen = page.screen;
        match screen {
            Screen::Username if selector == login.username_input => Ok(()),
            Screen::Password if selector == login.password_input => Ok(()),
            screen if screen.in_app() && selector == self.config.selectors.job_search.search_input => {
                page.search = value.to_string();
                Ok(())
            }
            _ => Err(BrowserError::NotFound(selector.to_string())),
        }
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let login = &self.config.selectors.login;
        let mut page = self.page();
        let screen = page.screen;
        match screen {
            Screen::Username if selector == login.username_submit => {
                let polls = self.site.lock().challenge_polls;
                page.screen = if polls > 0 {
                    Screen::Challenge { remaining: polls }
                } else {
                    Screen::Password
                };
                Ok(())
            }
            Screen::Password if selector == login.password_submit => {
                let cookie = self.site.lock().issue_token();
                page.cookies.push(cookie);
                page.screen = Screen::Landing;
                page.url = Some(self.config.landing_url());
                Ok(())
            }
            screen if screen.in_app() && selector == self.config.selectors.job_search.clear_search => {
                page.search.clear();
                Ok(())
            }
            _ => Err(BrowserError::NotFound(selector.to_string())),
        }
    }

    async fn click_exact(&self, selector: &str, label: &str) -> Result<usize, BrowserError> {
        let search = {
            let page = self.page();
            if !page.screen.in_app() || selector != self.config.selectors.job_search.job_item {
                return Ok(0);
            }
            page.search.clone()
        };

        let matches: Vec<String> = self
            .listed_jobs(&search)
            .into_iter()
            .filter(|address| same_label(address, label))
            .collect();
        let [address] = matches.as_slice() else {
            return Ok(matches.len());
        };
        let address = address.clone();

        let mut state = self.site.lock();
        if !state.job(&address).is_some_and(|job| job.selectable) {
            return Err(BrowserError::NotFound(format!("{selector} (detached)")));
        }
        state.selected = Some(address);
        Ok(1)
    }

    async fn storage_state(&self) -> Result<StorageState, BrowserError> {
        Ok(StorageState {
            cookies: self.page().cookies.clone(),
            origins: Vec::new(),
        })
    }

    async fn apply_storage_state(&self, state: &StorageState) -> Result<(), BrowserError> {
        self.page().cookies = state.cookies.clone();
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        let mut state = self.site.lock();
        state.open_pages = state.open_pages.saturating_sub(1);
        Ok(())
    }
}
