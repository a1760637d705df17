//! Browser seam: the small surface the session, selector and extractor drive.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },
    #[error("no element matches {0:?}")]
    NotFound(String),
    #[error("page script failed: {0}")]
    Script(String),
    #[error("browser connection lost: {0}")]
    Disconnected(String),
}

impl BrowserError {
    /// The page can no longer be driven; retrying on it is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrowserError::Disconnected(_) | BrowserError::Launch(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOptions {
    pub headless: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OriginStorage {
    pub origin: String,
    pub local_storage: Vec<(String, String)>,
}

/// Authenticated browsing state: cookies plus per-origin local storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    pub cookies: Vec<StoredCookie>,
    #[serde(default)]
    pub origins: Vec<OriginStorage>,
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Start a browser process with a single blank page.
    async fn launch(&self, options: LaunchOptions) -> Result<Box<dyn BrowserPage>, BrowserError>;
}

/// One page in its own browser process. Callers must `close` it.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;

    /// Wait for the in-flight navigation and network activity to quiet down.
    async fn settle(&self, timeout: Duration) -> Result<(), BrowserError>;

    async fn current_url(&self) -> Result<Option<String>, BrowserError>;

    async fn exists(&self, selector: &str) -> Result<bool, BrowserError>;

    /// Text content of the first match, `None` when nothing matches.
    async fn text(&self, selector: &str) -> Result<Option<String>, BrowserError>;

    async fn texts(&self, selector: &str) -> Result<Vec<String>, BrowserError>;

    /// Replace the value of an input.
    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError>;

    async fn click(&self, selector: &str) -> Result<(), BrowserError>;

    /// Count the matches of `selector` whose text is `label` (see [`same_label`])
    /// and click the match only when there is exactly one.
    async fn click_exact(&self, selector: &str, label: &str) -> Result<usize, BrowserError>;

    async fn storage_state(&self) -> Result<StorageState, BrowserError>;

    async fn apply_storage_state(&self, state: &StorageState) -> Result<(), BrowserError>;

    async fn close(self: Box<Self>) -> Result<(), BrowserError>;
}

/// Navigate and settle, both bounded by `timeout`.
pub async fn navigate(page: &dyn BrowserPage, url: &str, timeout: Duration) -> Result<(), BrowserError> {
    match tokio::time::timeout(timeout, page.goto(url)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(BrowserError::Timeout {
                what: format!("navigation to {url}"),
                timeout,
            })
        }
    }
    page.settle(timeout).await
}

/// Entry text names `label`, ignoring surrounding whitespace and case.
pub fn same_label(text: &str, label: &str) -> bool {
    text.trim().to_lowercase() == label.trim().to_lowercase()
}

// Check errors that leave the page usable (a navigation replacing the
// document mid-check) count as "not yet".
async fn poll_until<F, Fut>(what: String, timeout: Duration, poll: Duration, mut check: F) -> Result<(), BrowserError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, BrowserError>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => debug!(%what, error = %err, "wait check failed; retrying"),
        }
        if Instant::now() >= deadline {
            return Err(BrowserError::Timeout { what, timeout });
        }
        tokio::time::sleep(poll).await;
    }
}

pub async fn wait_for_selector(
    page: &dyn BrowserPage,
    selector: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<(), BrowserError> {
    poll_until(format!("selector {selector:?}"), timeout, poll, move || page.exists(selector)).await
}

/// Wait until some match of `selector` reads exactly `label`.
pub async fn wait_for_label(
    page: &dyn BrowserPage,
    selector: &str,
    label: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<(), BrowserError> {
    poll_until(
        format!("{selector:?} labelled {label:?}"),
        timeout,
        poll,
        move || async move {
            let texts = page.texts(selector).await?;
            Ok::<_, BrowserError>(texts.iter().any(|text| same_label(text, label)))
        },
    )
    .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Cleared,
    Cancelled,
}

/// Wait with no deadline until `selector` stops matching, or `cancel` fires.
///
/// Only a fatal browser error ends the wait early; anything else is logged
/// and the next poll tries again.
pub async fn wait_until_absent(
    page: &dyn BrowserPage,
    selector: &str,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<WaitOutcome, BrowserError> {
    loop {
        match page.exists(selector).await {
            Ok(false) => return Ok(WaitOutcome::Cleared),
            Ok(true) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => warn!(%selector, error = %err, "could not check the page; still waiting"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Request lifecycle as seen on the wire, keyed by request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Started(String),
    Finished(String),
}

/// Wait until no observed request has been in flight for `quiet`.
///
/// Requests already running when `events` was subscribed are not seen; a
/// finish for an unknown id is ignored.
pub async fn wait_for_network_quiet<S>(mut events: S, quiet: Duration, timeout: Duration) -> Result<(), BrowserError>
where
    S: Stream<Item = NetworkEvent> + Unpin,
{
    let deadline = Instant::now() + timeout;
    let mut in_flight = HashSet::new();
    let mut open = true;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                return Err(BrowserError::Timeout {
                    what: format!("network to go quiet ({} requests in flight)", in_flight.len()),
                    timeout,
                });
            }
            _ = tokio::time::sleep(quiet), if in_flight.is_empty() => return Ok(()),
            event = events.next(), if open => match event {
                Some(NetworkEvent::Started(id)) => {
                    in_flight.insert(id);
                }
                Some(NetworkEvent::Finished(id)) => {
                    in_flight.remove(&id);
                }
                None => open = false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc;

    use super::*;

    #[test]
    fn labels_compare_trimmed_and_case_insensitive() {
        assert!(same_label(" 12 Elm St\n", "12 elm st"));
        assert!(!same_label("112 Elm St", "12 Elm St"));
        assert!(!same_label("12 Elm St Unit B", "12 Elm St"));
    }

    #[tokio::test(start_paused = true)]
    async fn network_quiet_waits_for_in_flight_requests() {
        let (tx, rx) = mpsc::unbounded();
        tx.unbounded_send(NetworkEvent::Started("r1".to_string())).unwrap();
        let finisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            tx.unbounded_send(NetworkEvent::Finished("r1".to_string())).unwrap();
            tx
        });

        let started = Instant::now();
        wait_for_network_quiet(rx, Duration::from_millis(500), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(800));
        drop(finisher.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn network_that_never_quiets_times_out() {
        let (tx, rx) = mpsc::unbounded();
        tx.unbounded_send(NetworkEvent::Started("poll".to_string())).unwrap();

        let err = wait_for_network_quiet(rx, Duration::from_millis(500), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::Timeout { .. }));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_event_stream_with_nothing_in_flight_is_quiet() {
        let (tx, rx) = mpsc::unbounded::<NetworkEvent>();
        drop(tx);
        wait_for_network_quiet(rx, Duration::from_millis(500), Duration::from_secs(2))
            .await
            .unwrap();
    }
}
