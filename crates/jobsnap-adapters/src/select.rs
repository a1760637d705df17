use tracing::{debug, error, info};

use crate::browser::{wait_for_label, wait_for_selector, BrowserError, BrowserPage};
use crate::site::SiteConfig;

/// Make `address` the active job in the current page's job picker.
///
/// Only an entry reading exactly `address` (ignoring case and surrounding
/// whitespace) is clicked, and only when it is the sole such entry. Returns
/// false when the job cannot be found or activated; the cause is logged and
/// never propagated.
pub async fn select_job(page: &dyn BrowserPage, site: &SiteConfig, address: &str) -> bool {
    match try_select_job(page, site, address).await {
        Ok(1) => {
            info!(%address, "selected job");
            true
        }
        Ok(0) => {
            error!(%address, "job list has no entry matching the address");
            false
        }
        Ok(matches) => {
            error!(%address, matches, "several job list entries carry this address; not selecting any");
            false
        }
        Err(err) => {
            error!(%address, error = %err, "job selection failed");
            false
        }
    }
}

async fn try_select_job(page: &dyn BrowserPage, site: &SiteConfig, address: &str) -> Result<usize, BrowserError> {
    let search = &site.selectors.job_search;
    let timing = &site.browser;

    if page.exists(&search.clear_search).await? {
        debug!("clearing previous job search");
        page.click(&search.clear_search).await?;
    }

    wait_for_selector(page, &search.search_input, timing.element_timeout(), timing.poll_interval()).await?;
    page.fill(&search.search_input, address).await?;

    wait_for_label(
        page,
        &search.job_item,
        address,
        timing.element_timeout(),
        timing.poll_interval(),
    )
    .await?;
    let matches = page.click_exact(&search.job_item, address).await?;
    if matches == 1 {
        page.settle(timing.navigation_timeout()).await?;
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::LaunchOptions;
    use crate::testing::{JobFixture, ScriptedSite};

    async fn logged_in_page(site: &ScriptedSite) -> Box<dyn BrowserPage> {
        let page = site
            .launcher()
            .launch(LaunchOptions { headless: true })
            .await
            .unwrap();
        page.apply_storage_state(&site.authenticated_state()).await.unwrap();
        page.goto(&ScriptedSite::site_config().landing_url()).await.unwrap();
        page
    }

    #[tokio::test]
    async fn selects_a_listed_job_and_clears_the_previous_search() {
        let site = ScriptedSite::new()
            .with_job("12 Elm St", JobFixture::default())
            .with_job("40 Oak Ave", JobFixture::default());
        let config = ScriptedSite::site_config();
        let page = logged_in_page(&site).await;

        assert!(select_job(page.as_ref(), &config, "12 Elm St").await);
        assert_eq!(site.selected_job().as_deref(), Some("12 Elm St"));

        assert!(select_job(page.as_ref(), &config, "40 Oak Ave").await);
        assert_eq!(site.selected_job().as_deref(), Some("40 Oak Ave"));
        page.close().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_job_is_a_soft_failure() {
        let site = ScriptedSite::new().with_job("12 Elm St", JobFixture::default());
        let config = ScriptedSite::site_config();
        let page = logged_in_page(&site).await;

        assert!(!select_job(page.as_ref(), &config, "99 Nowhere Rd").await);
        assert_eq!(site.selected_job(), None);
        page.close().await.unwrap();
    }

    #[tokio::test]
    async fn listed_but_unclickable_job_is_a_soft_failure() {
        let site = ScriptedSite::new().with_job("12 Elm St", JobFixture::unselectable());
        let config = ScriptedSite::site_config();
        let page = logged_in_page(&site).await;

        assert!(!select_job(page.as_ref(), &config, "12 Elm St").await);
        page.close().await.unwrap();
    }

    #[tokio::test]
    async fn longer_address_listed_first_is_not_mistaken_for_the_target() {
        let site = ScriptedSite::new()
            .with_job("112 Elm St", JobFixture::default())
            .with_job("12 Elm St", JobFixture::default());
        let config = ScriptedSite::site_config();
        let page = logged_in_page(&site).await;

        assert!(select_job(page.as_ref(), &config, "12 Elm St").await);
        assert_eq!(site.selected_job().as_deref(), Some("12 Elm St"));
        page.close().await.unwrap();
    }

    #[tokio::test]
    async fn address_matching_ignores_case() {
        let site = ScriptedSite::new().with_job("12 Elm St", JobFixture::default());
        let config = ScriptedSite::site_config();
        let page = logged_in_page(&site).await;

        assert!(select_job(page.as_ref(), &config, "12 ELM ST").await);
        assert_eq!(site.selected_job().as_deref(), Some("12 Elm St"));
        page.close().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_entries_are_not_guessed_between() {
        let site = ScriptedSite::new()
            .with_job("12 Elm St", JobFixture::default())
            .with_job("12 ELM ST", JobFixture::default());
        let config = ScriptedSite::site_config();
        let page = logged_in_page(&site).await;

        assert!(!select_job(page.as_ref(), &config, "12 Elm St").await);
        assert_eq!(site.selected_job(), None);
        page.close().await.unwrap();
    }

    #[tokio::test]
    async fn address_that_only_prefixes_a_listed_job_is_not_found() {
        let site = ScriptedSite::new().with_job("12 Elm St Unit B", JobFixture::default());
        let config = ScriptedSite::site_config();
        let page = logged_in_page(&site).await;

        assert!(!select_job(page.as_ref(), &config, "12 Elm St").await);
        assert_eq!(site.selected_job(), None);
        page.close().await.unwrap();
    }
}
