use std::sync::Arc;
use std::time::Duration;

use headless_chrome::{Browser, LaunchOptions, Tab};

use crate::config::ScraperConfig;
use crate::utils::error::{MonitorError, Result};

/// One shared headless Chrome instance.
///
/// The pipeline is strictly sequential (the storefront's anti-automation
/// defenses punish parallel sessions), so a single browser with one tab per
/// page is all that is ever needed.
pub struct BrowserSession {
    browser: Browser,
    config: ScraperConfig,
}

impl BrowserSession {
    pub fn launch(config: &ScraperConfig) -> Result<Self> {
        let mut launch_options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false) // Often needed in containerized environments
            .args(vec![
                std::ffi::OsStr::new("--no-sandbox"),
                std::ffi::OsStr::new("--disable-dev-shm-usage"),
                std::ffi::OsStr::new("--disable-gpu"),
                std::ffi::OsStr::new("--disable-extensions"),
                std::ffi::OsStr::new("--disable-background-timer-throttling"),
                std::ffi::OsStr::new("--disable-backgrounding-occluded-windows"),
                std::ffi::OsStr::new("--disable-renderer-backgrounding"),
                std::ffi::OsStr::new("--window-size=1920,1080"),
            ])
            .build()
            .map_err(|e| MonitorError::Browser(format!("Failed to create launch options: {e}")))?;

        if let Some(chrome_path) = &config.chrome_path {
            launch_options.path = Some(std::path::PathBuf::from(chrome_path));
        }

        let browser = Browser::new(launch_options)
            .map_err(|e| MonitorError::Browser(format!("Failed to launch browser: {e}")))?;

        Ok(Self {
            browser,
            config: config.clone(),
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout)
    }

    /// Open a new tab on `url` and wait for navigation to settle.
    pub fn open(&self, url: &str) -> Result<Arc<Tab>> {
        let tab = self
            .browser
            .new_tab()
            .map_err(|e| MonitorError::Browser(format!("Failed to create tab: {e}")))?;

        tab.set_user_agent(&self.config.user_agent, None, None)
            .map_err(|e| MonitorError::Browser(format!("Failed to set user agent: {e}")))?;

        tab.navigate_to(url)
            .map_err(|e| MonitorError::Browser(format!("Navigation to {url} failed: {e}")))?;

        tab.wait_until_navigated()
            .map_err(|e| MonitorError::Browser(format!("Page load of {url} failed: {e}")))?;

        Ok(tab)
    }

    /// Fetch a fully rendered page, optionally waiting for a selector first.
    pub fn fetch_html(&self, url: &str, wait_for_selector: Option<&str>) -> Result<String> {
        let tab = self.open(url)?;

        if let Some(selector) = wait_for_selector {
            // The listing renders product cards from JS; missing cards are a
            // warning, not a failure — an empty catalog page parses to zero
            // products and is reported downstream.
            if let Err(e) = tab.wait_for_element_with_custom_timeout(selector, self.timeout()) {
                tracing::warn!(url, selector, error = %e, "wait for selector timed out");
            }
        }

        let html = tab
            .get_content()
            .map_err(|e| MonitorError::Browser(format!("Failed to get page content: {e}")))?;

        let _ = tab.close(true);
        Ok(html)
    }
}
