use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{BrowserError, Result};

/// What the scraper and archive resolver need from a live page.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<()>;

    async fn html(&self) -> Result<String>;

    async fn current_url(&self) -> Result<Option<String>>;

    /// Raw `href` attribute of every anchor on the page.
    async fn hrefs(&self) -> Result<Vec<String>>;

    /// Clicks the first visible control whose text contains one of `patterns`
    /// (case-insensitive). Returns the clicked control's text.
    async fn click_text(&self, patterns: &[&str]) -> Result<Option<String>>;

    async fn scroll_to_bottom(&self) -> Result<()>;

    async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

const HREFS_SCRIPT: &str = r#"
    Array.from(document.querySelectorAll('a[href]')).map((a) => a.getAttribute('href'))
"#;

const SCROLL_SCRIPT: &str = r#"
    window.scrollTo(0, document.body ? document.body.scrollHeight : 0); true
"#;

fn click_text_script(patterns: &[&str]) -> String {
    let needles = serde_json::to_string(
        &patterns
            .iter()
            .map(|p| p.to_lowercase())
            .collect::<Vec<_>>(),
    )
    .unwrap_or_else(|_| "[]".to_string());
    format!(
        r#"(() => {{
            const needles = {needles};
            const controls = document.querySelectorAll('button, a, [role="button"], input[type="submit"]');
            for (const el of controls) {{
                const rect = el.getBoundingClientRect();
                if (rect.width === 0 || rect.height === 0) continue;
                const text = (el.innerText || el.value || '').trim();
                const lower = text.toLowerCase();
                if (needles.some((n) => lower.includes(n))) {{
                    el.click();
                    return text;
                }}
            }}
            return null;
        }})()"#
    )
}

/// A CDP connection to one remote browser session.
pub struct CdpSession {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl CdpSession {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        info!(endpoint = %redact(endpoint), "connecting to remote browser");
        let (browser, mut handler) = Browser::connect(endpoint)
            .await
            .map_err(|e| BrowserError::Connect(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Self { browser, handler })
    }

    pub async fn new_page(&self) -> Result<CdpPage> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Connect(e.to_string()))?;
        Ok(CdpPage { page })
    }

    pub async fn close(mut self) {
        if let Err(err) = self.browser.close().await {
            debug!(error = %err, "browser close failed");
        }
        self.handler.abort();
    }
}

/// Strips query strings, which usually carry the vendor token.
fn redact(endpoint: &str) -> &str {
    endpoint.split('?').next().unwrap_or(endpoint)
}

pub struct CdpPage {
    page: Page,
}

impl CdpPage {
    async fn eval<T: serde::de::DeserializeOwned>(&self, script: String) -> Result<T> {
        self.page
            .evaluate(script)
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?
            .into_value()
            .map_err(|e| BrowserError::Script(e.to_string()))
    }

    pub async fn close(self) {
        if let Err(err) = self.page.close().await {
            debug!(error = %err, "page close failed");
        }
    }
}

#[async_trait]
impl BrowserPage for CdpPage {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<()> {
        debug!(url, "navigating");
        tokio::time::timeout(timeout, self.page.goto(url))
            .await
            .map_err(|_| BrowserError::Timeout {
                url: url.to_string(),
                seconds: timeout.as_secs(),
            })?
            .map_err(|e| BrowserError::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn html(&self) -> Result<String> {
        self.page
            .content()
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))
    }

    async fn current_url(&self) -> Result<Option<String>> {
        self.page
            .url()
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))
    }

    async fn hrefs(&self) -> Result<Vec<String>> {
        let hrefs: Vec<Option<String>> = self.eval(HREFS_SCRIPT.to_string()).await?;
        Ok(hrefs.into_iter().flatten().collect())
    }

    async fn click_text(&self, patterns: &[&str]) -> Result<Option<String>> {
        if patterns.is_empty() {
            return Ok(None);
        }
        self.eval(click_text_script(patterns)).await
    }

    async fn scroll_to_bottom(&self) -> Result<()> {
        let _: bool = self.eval(SCROLL_SCRIPT.to_string()).await?;
        Ok(())
    }
}
