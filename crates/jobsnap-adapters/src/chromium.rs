//! `BrowserLauncher` backed by a local Chromium over the DevTools protocol.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::browser::{
    same_label, wait_for_network_quiet, BrowserError, BrowserLauncher, BrowserPage, LaunchOptions, NetworkEvent,
    OriginStorage, StorageState, StoredCookie,
};

const SETTLE_POLL: Duration = Duration::from_millis(100);
/// Same idle window as the usual "network idle" load state.
const NETWORK_QUIET: Duration = Duration::from_millis(500);
const HANDLER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    executable: Option<PathBuf>,
    request_timeout: Duration,
    args: Vec<String>,
}

impl Default for ChromiumLauncher {
    fn default() -> Self {
        Self {
            executable: None,
            request_timeout: Duration::from_secs(30),
            args: vec!["--disable-gpu".to_string(), "--no-first-run".to_string()],
        }
    }
}

impl ChromiumLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self, options: LaunchOptions) -> Result<Box<dyn BrowserPage>, BrowserError> {
        let mut builder = BrowserConfig::builder().request_timeout(self.request_timeout);
        if !options.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        for arg in &self.args {
            builder = builder.arg(arg.as_str());
        }
        let config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "devtools handler event error");
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                let mut browser = browser;
                if let Err(close_err) = browser.close().await {
                    warn!(error = %close_err, "failed to close browser after page creation error");
                }
                handler_task.abort();
                return Err(BrowserError::Launch(err.to_string()));
            }
        };

        debug!(headless = options.headless, "launched chromium");
        Ok(Box::new(ChromiumPage {
            browser,
            page,
            handler_task,
        }))
    }
}

struct ChromiumPage {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
}

fn map_cdp(err: CdpError) -> BrowserError {
    match err {
        CdpError::Ws(_) | CdpError::ChannelSendError(_) | CdpError::NoResponse => {
            BrowserError::Disconnected(err.to_string())
        }
        CdpError::Timeout => BrowserError::Timeout {
            what: "devtools request".to_string(),
            timeout: Duration::ZERO,
        },
        CdpError::NotFound => BrowserError::NotFound("element".to_string()),
        other => BrowserError::Script(other.to_string()),
    }
}

fn js_string(value: &str) -> Result<String, BrowserError> {
    serde_json::to_string(value).map_err(|err| BrowserError::Script(err.to_string()))
}

impl ChromiumPage {
    async fn eval<T: DeserializeOwned>(&self, script: String) -> Result<T, BrowserError> {
        let result = self.page.evaluate(script).await.map_err(map_cdp)?;
        result
            .into_value::<T>()
            .map_err(|err| BrowserError::Script(err.to_string()))
    }

    async fn network_events(&self) -> Result<BoxStream<'static, NetworkEvent>, BrowserError> {
        let started = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(map_cdp)?
            .map(|event| NetworkEvent::Started(event.request_id.inner().clone()));
        let finished = self
            .page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(map_cdp)?
            .map(|event| NetworkEvent::Finished(event.request_id.inner().clone()));
        let failed = self
            .page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(map_cdp)?
            .map(|event| NetworkEvent::Finished(event.request_id.inner().clone()));
        Ok(stream::select_all([started.boxed(), finished.boxed(), failed.boxed()]).boxed())
    }
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        self.page
            .goto(url)
            .await
            .map_err(|err| match map_cdp(err) {
                BrowserError::Script(reason) => BrowserError::Navigation {
                    url: url.to_string(),
                    reason,
                },
                other => other,
            })?;
        Ok(())
    }

    async fn settle(&self, timeout: Duration) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        // Subscribe first so requests fired while the document finishes loading are seen.
        let network = self.network_events().await?;
        loop {
            let state: String = self.eval("document.readyState".to_string()).await?;
            if state == "complete" {
                break;
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout {
                    what: "page load".to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        wait_for_network_quiet(network, NETWORK_QUIET, remaining).await
    }

    async fn current_url(&self) -> Result<Option<String>, BrowserError> {
        self.page.url().await.map_err(map_cdp)
    }

    async fn exists(&self, selector: &str) -> Result<bool, BrowserError> {
        let script = format!("document.querySelector({}) !== null", js_string(selector)?);
        self.eval(script).await
    }

    async fn text(&self, selector: &str) -> Result<Option<String>, BrowserError> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); return el ? el.textContent : null; }})()",
            js_string(selector)?
        );
        self.eval(script).await
    }

    async fn texts(&self, selector: &str) -> Result<Vec<String>, BrowserError> {
        let script = format!(
            "Array.from(document.querySelectorAll({})).map(el => el.textContent || '')",
            js_string(selector)?
        );
        self.eval(script).await
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        let element = self.page.find_element(selector).await.map_err(|err| match map_cdp(err) {
            BrowserError::NotFound(_) => BrowserError::NotFound(selector.to_string()),
            other => other,
        })?;
        element.click().await.map_err(map_cdp)?;
        let clear = format!(
            "(() => {{ const el = document.querySelector({}); if (el) {{ el.value = ''; el.dispatchEvent(new Event('input', {{ bubbles: true }})); }} return true; }})()",
            js_string(selector)?
        );
        let _: bool = self.eval(clear).await?;
        element.type_str(value).await.map_err(map_cdp)?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self.page.find_element(selector).await.map_err(|err| match map_cdp(err) {
            BrowserError::NotFound(_) => BrowserError::NotFound(selector.to_string()),
            other => other,
        })?;
        element.click().await.map_err(map_cdp)?;
        Ok(())
    }

    async fn click_exact(&self, selector: &str, label: &str) -> Result<usize, BrowserError> {
        let elements = match self.page.find_elements(selector).await {
            Ok(elements) => elements,
            Err(CdpError::NotFound) => return Ok(0),
            Err(err) => return Err(map_cdp(err)),
        };
        let mut matches = Vec::new();
        for element in elements {
            let text = element.inner_text().await.map_err(map_cdp)?;
            if text.as_deref().is_some_and(|text| same_label(text, label)) {
                matches.push(element);
            }
        }
        if let [only] = matches.as_slice() {
            only.click().await.map_err(map_cdp)?;
        }
        Ok(matches.len())
    }

    async fn storage_state(&self) -> Result<StorageState, BrowserError> {
        let cookies = self
            .page
            .get_cookies()
            .await
            .map_err(map_cdp)?
            .into_iter()
            .map(|cookie| StoredCookie {
                name: cookie.name,
                value: cookie.value,
                domain: cookie.domain,
                path: cookie.path,
                secure: cookie.secure,
                http_only: cookie.http_only,
            })
            .collect();

        let origin: String = self.eval("location.origin".to_string()).await?;
        let local_storage: Vec<(String, String)> =
            self.eval("Object.entries(window.localStorage)".to_string()).await?;
        let origins = if origin.starts_with("http") && !local_storage.is_empty() {
            vec![OriginStorage { origin, local_storage }]
        } else {
            Vec::new()
        };

        Ok(StorageState { cookies, origins })
    }

    async fn apply_storage_state(&self, state: &StorageState) -> Result<(), BrowserError> {
        let mut params = Vec::with_capacity(state.cookies.len());
        for cookie in &state.cookies {
            let param = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone())
                .domain(cookie.domain.clone())
                .path(cookie.path.clone())
                .secure(cookie.secure)
                .http_only(cookie.http_only)
                .build()
                .map_err(BrowserError::Script)?;
            params.push(param);
        }
        if !params.is_empty() {
            self.page.set_cookies(params).await.map_err(map_cdp)?;
        }

        // Local storage is per origin, so each one has to be visited to be written.
        for origin in &state.origins {
            self.goto(&origin.origin).await?;
            for (key, value) in &origin.local_storage {
                let script = format!(
                    "(() => {{ window.localStorage.setItem({}, {}); return true; }})()",
                    js_string(key)?,
                    js_string(value)?
                );
                let _: bool = self.eval(script).await?;
            }
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        let ChromiumPage {
            mut browser,
            page: _,
            mut handler_task,
        } = *self;
        let closed = browser.close().await.map_err(map_cdp);
        if let Err(err) = browser.wait().await {
            debug!(error = %err, "waiting for chromium exit failed");
        }
        // The event stream ends once the websocket drops.
        if tokio::time::timeout(HANDLER_DRAIN, &mut handler_task).await.is_err() {
            warn!("devtools handler still running after close; aborting it");
            handler_task.abort();
        }
        closed.map(|_| ())
    }
}
