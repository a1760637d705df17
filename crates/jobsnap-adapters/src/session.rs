//! Cached authenticated session, single-flight interactive login, and
//! authenticated browsing contexts built from it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::{
    navigate, wait_for_selector, wait_until_absent, BrowserError, BrowserLauncher, BrowserPage, LaunchOptions,
    StorageState, WaitOutcome,
};
use crate::site::SiteConfig;

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("login is not configured: {0}")]
    Config(String),
    #[error(transparent)]
    Browser(Arc<BrowserError>),
    #[error("login was aborted")]
    Cancelled,
    #[error("site kept showing the login form after signing in")]
    Rejected,
}

impl From<BrowserError> for SessionError {
    fn from(err: BrowserError) -> Self {
        SessionError::Browser(Arc::new(err))
    }
}

/// Authenticated browsing state plus a flag cleared once the site stops honouring it.
#[derive(Debug)]
pub struct Session {
    state: StorageState,
    created_at: DateTime<Utc>,
    valid: AtomicBool,
}

impl Session {
    pub fn new(state: StorageState) -> Self {
        Self {
            state,
            created_at: Utc::now(),
            valid: AtomicBool::new(true),
        }
    }

    pub fn storage_state(&self) -> &StorageState {
        &self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

type LoginFuture = Shared<BoxFuture<'static, Result<Arc<Session>, SessionError>>>;

#[derive(Default)]
struct SessionSlot {
    cached: Option<Arc<Session>>,
    in_flight: Option<LoginFuture>,
    cancel: Option<CancellationToken>,
}

fn lock_slot(slot: &Mutex<SessionSlot>) -> MutexGuard<'_, SessionSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SessionManager {
    launcher: Arc<dyn BrowserLauncher>,
    site: Arc<SiteConfig>,
    slot: Arc<Mutex<SessionSlot>>,
    logins: Arc<AtomicUsize>,
}

impl SessionManager {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, site: Arc<SiteConfig>) -> Self {
        Self {
            launcher,
            site,
            slot: Arc::new(Mutex::new(SessionSlot::default())),
            logins: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn site(&self) -> &SiteConfig {
        &self.site
    }

    /// Number of interactive logins started by this manager.
    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::Acquire)
    }

    pub fn cached(&self) -> Option<Arc<Session>> {
        lock_slot(&self.slot)
            .cached
            .as_ref()
            .filter(|session| session.is_valid())
            .cloned()
    }

    /// Return the cached session, or join (or start) the single in-flight login.
    pub async fn acquire(&self) -> Result<Arc<Session>, SessionError> {
        let login = {
            let mut slot = lock_slot(&self.slot);
            match slot.cached.as_ref() {
                Some(session) if session.is_valid() => return Ok(Arc::clone(session)),
                Some(_) => {
                    debug!("discarding invalidated session");
                    slot.cached = None;
                }
                None => {}
            }
            match slot.in_flight.as_ref() {
                Some(login) => login.clone(),
                None => self.start_login(&mut slot),
            }
        };
        login.await
    }

    fn start_login(&self, slot: &mut SessionSlot) -> LoginFuture {
        let cancel = CancellationToken::new();
        let launcher = Arc::clone(&self.launcher);
        let site = Arc::clone(&self.site);
        let slot_handle = Arc::clone(&self.slot);
        let logins = Arc::clone(&self.logins);
        let token = cancel.clone();

        let login = async move {
            logins.fetch_add(1, Ordering::AcqRel);
            let result = interactive_login(launcher.as_ref(), &site, &token)
                .await
                .map(Arc::new);
            {
                let mut slot = lock_slot(&slot_handle);
                slot.in_flight = None;
                slot.cancel = None;
                if let Ok(session) = &result {
                    slot.cached = Some(Arc::clone(session));
                }
            }
            result
        }
        .boxed()
        .shared();

        slot.in_flight = Some(login.clone());
        slot.cancel = Some(cancel);
        login
    }

    /// Mark `session` unusable; the next `acquire` logs in again.
    pub fn invalidate(&self, session: &Arc<Session>) {
        session.invalidate();
        let mut slot = lock_slot(&self.slot);
        if slot
            .cached
            .as_ref()
            .is_some_and(|cached| Arc::ptr_eq(cached, session))
        {
            slot.cached = None;
            info!("cached session invalidated");
        }
    }

    /// Cancel the in-progress login, if any. Every waiter resolves to `Cancelled`.
    pub fn abort_login(&self) -> bool {
        match lock_slot(&self.slot).cancel.as_ref() {
            Some(cancel) => {
                cancel.cancel();
                info!("interactive login aborted");
                true
            }
            None => false,
        }
    }

    /// Open a routine browsing context seeded with `session` and parked on the landing page.
    pub async fn create_authenticated_context(
        &self,
        session: &Arc<Session>,
    ) -> Result<AuthenticatedContext, SessionError> {
        let page = self
            .launcher
            .launch(LaunchOptions {
                headless: self.site.browser.headless,
            })
            .await?;

        let prepared = async {
            page.apply_storage_state(session.storage_state()).await?;
            navigate(
                page.as_ref(),
                &self.site.landing_url(),
                self.site.browser.navigation_timeout(),
            )
            .await
        }
        .await;

        let context = AuthenticatedContext {
            page,
            session: Arc::clone(session),
        };
        match prepared {
            Ok(()) => Ok(context),
            Err(err) => {
                context.close().await;
                Err(err.into())
            }
        }
    }

    /// Acquire a session and open a context on it, re-logging in once if the
    /// site has stopped honouring the cached state.
    pub async fn open_context(&self) -> Result<AuthenticatedContext, SessionError> {
        for attempt in 0..2 {
            let session = self.acquire().await?;
            let context = self.create_authenticated_context(&session).await?;
            match context.shows_login_form(&self.site).await {
                Ok(false) => return Ok(context),
                Ok(true) => {
                    warn!(attempt, "landing page shows the login form; session expired");
                    context.close().await;
                    self.invalidate(&session);
                }
                Err(err) => {
                    context.close().await;
                    return Err(err.into());
                }
            }
        }
        Err(SessionError::Rejected)
    }

    /// Open a context, report where the landing page ended up, and close it.
    pub async fn verify_login(&self) -> Result<Option<String>, SessionError> {
        let context = self.open_context().await?;
        let url = context.page().current_url().await;
        context.close().await;
        let url = url?;
        info!(url = url.as_deref().unwrap_or("<unknown>"), "login verified");
        Ok(url)
    }
}

/// Drive the sign-in flow in a visible browser. The browser is closed on every path.
pub async fn interactive_login(
    launcher: &dyn BrowserLauncher,
    site: &SiteConfig,
    cancel: &CancellationToken,
) -> Result<Session, SessionError> {
    if !site.credentials.is_complete() {
        return Err(SessionError::Config(
            "credentials.username and credentials.password are required".to_string(),
        ));
    }

    let page = launcher.launch(LaunchOptions { headless: false }).await?;
    let result = tokio::select! {
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        result = sign_in(page.as_ref(), site, cancel) => result,
    };
    if let Err(err) = page.close().await {
        warn!(error = %err, "failed to close login browser");
    }

    let state = result?;
    info!(cookies = state.cookies.len(), "interactive login complete");
    Ok(Session::new(state))
}

async fn sign_in(
    page: &dyn BrowserPage,
    site: &SiteConfig,
    cancel: &CancellationToken,
) -> Result<StorageState, SessionError> {
    let login = &site.selectors.login;
    let timing = &site.browser;

    navigate(page, &site.landing_url(), timing.navigation_timeout()).await?;
    wait_for_selector(
        page,
        &login.username_input,
        timing.login_form_timeout(),
        timing.poll_interval(),
    )
    .await?;
    page.fill(&login.username_input, &site.credentials.username).await?;
    page.click(&login.username_submit).await?;
    page.settle(timing.navigation_timeout()).await?;

    if page.exists(&login.challenge_frame).await? {
        info!("human verification required; waiting for it to be completed in the browser window");
        if wait_until_absent(page, &login.challenge_frame, timing.poll_interval(), cancel).await?
            == WaitOutcome::Cancelled
        {
            return Err(SessionError::Cancelled);
        }
        debug!("human verification cleared");
    }

    wait_for_selector(
        page,
        &login.password_input,
        timing.login_form_timeout(),
        timing.poll_interval(),
    )
    .await?;
    page.fill(&login.password_input, &site.credentials.password).await?;
    page.click(&login.password_submit).await?;
    page.settle(timing.navigation_timeout()).await?;

    if page.exists(&login.password_input).await? {
        return Err(SessionError::Rejected);
    }

    Ok(page.storage_state().await?)
}

/// A browsing context seeded with a session. Release it with `close`.
pub struct AuthenticatedContext {
    page: Box<dyn BrowserPage>,
    session: Arc<Session>,
}

impl AuthenticatedContext {
    pub fn page(&self) -> &dyn BrowserPage {
        self.page.as_ref()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// True when the current page is the sign-in form rather than the app.
    pub async fn shows_login_form(&self, site: &SiteConfig) -> Result<bool, BrowserError> {
        self.page.exists(&site.selectors.login.username_input).await
    }

    pub async fn close(self) {
        if let Err(err) = self.page.close().await {
            warn!(error = %err, "failed to close browsing context");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::ScriptedSite;

    fn manager(site: &ScriptedSite) -> SessionManager {
        SessionManager::new(site.launcher(), Arc::new(ScriptedSite::site_config()))
    }

    #[tokio::test]
    async fn sequential_acquires_reuse_the_cached_session() {
        let site = ScriptedSite::new();
        let sessions = manager(&site);

        let first = sessions.acquire().await.unwrap();
        let second = sessions.acquire().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(sessions.login_count(), 1);
        assert_eq!(site.visible_launches(), 1);
        assert_eq!(site.open_pages(), 0);
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_login() {
        let site = ScriptedSite::new().with_challenge_polls(5);
        let sessions = manager(&site);

        let (a, b, c) = tokio::join!(sessions.acquire(), sessions.acquire(), sessions.acquire());
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
        assert_eq!(sessions.login_count(), 1);
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_launching() {
        let site = ScriptedSite::new();
        let mut config = ScriptedSite::site_config();
        config.credentials.password.clear();
        let sessions = SessionManager::new(site.launcher(), Arc::new(config));

        let err = sessions.acquire().await.unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
        assert_eq!(site.launch_count(), 0);

        // A failed login is not cached; the next caller tries again.
        let _ = sessions.acquire().await;
        assert_eq!(sessions.login_count(), 2);
    }

    #[tokio::test]
    async fn invalidated_session_triggers_a_fresh_login() {
        let site = ScriptedSite::new();
        let sessions = manager(&site);

        let first = sessions.acquire().await.unwrap();
        sessions.invalidate(&first);
        assert!(!first.is_valid());
        assert!(sessions.cached().is_none());

        let second = sessions.acquire().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(sessions.login_count(), 2);
    }

    #[tokio::test]
    async fn open_context_relogs_once_when_the_site_expired_the_session() {
        let site = ScriptedSite::new();
        let sessions = manager(&site);

        sessions.acquire().await.unwrap();
        site.expire_sessions();

        let context = sessions.open_context().await.unwrap();
        assert_eq!(sessions.login_count(), 2);
        assert!(context.session().is_valid());
        context.close().await;
        assert_eq!(site.open_pages(), 0);
    }

    #[tokio::test]
    async fn open_context_gives_up_when_fresh_sessions_are_rejected() {
        let site = ScriptedSite::new().rejecting_sessions();
        let sessions = manager(&site);

        let err = sessions.open_context().await.err().unwrap();
        assert!(matches!(err, SessionError::Rejected));
        assert_eq!(sessions.login_count(), 2);
        assert_eq!(site.open_pages(), 0);
    }

    #[tokio::test]
    async fn abort_releases_everyone_waiting_on_the_challenge() {
        let site = ScriptedSite::new().with_challenge_polls(usize::MAX);
        let sessions = manager(&site);

        let abort = async {
            while !sessions.abort_login() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        let (first, second, ()) = tokio::join!(sessions.acquire(), sessions.acquire(), abort);

        assert!(matches!(first.unwrap_err(), SessionError::Cancelled));
        assert!(matches!(second.unwrap_err(), SessionError::Cancelled));
        assert_eq!(sessions.login_count(), 1);
        assert_eq!(site.open_pages(), 0);
    }

    #[tokio::test]
    async fn challenge_wait_survives_a_page_error_while_the_human_is_busy() {
        let site = ScriptedSite::new().with_challenge_polls(3).with_flaky_challenge();
        let cancel = CancellationToken::new();

        let session = interactive_login(site.launcher().as_ref(), &ScriptedSite::site_config(), &cancel)
            .await
            .unwrap();
        assert!(session.is_valid());
        assert!(!session.storage_state().cookies.is_empty());
        assert_eq!(site.open_pages(), 0);
    }

    #[tokio::test]
    async fn verify_login_reports_the_landing_url() {
        let site = ScriptedSite::new();
        let sessions = manager(&site);

        let url = sessions.verify_login().await.unwrap();
        assert_eq!(url.as_deref(), Some(ScriptedSite::site_config().landing_url().as_str()));
        assert_eq!(site.open_pages(), 0);
    }
}
