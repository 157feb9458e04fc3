use std::sync::OnceLock;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::error::CrawlError;

// Process-wide lazy singleton; rebuilt when the connection drops.
static BROWSER: OnceLock<Mutex<Option<Browser>>> = OnceLock::new();

pub const DESKTOP_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Hides the obvious automation markers before any page script runs.
const STEALTH_INIT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'languages', { get: () => ['ja-JP', 'ja', 'en-US'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
window.chrome = window.chrome || { runtime: {} };
"#;

/// Common cookie-consent buttons; clicking the first match unblocks
/// pages that hide content behind the banner.
const CONSENT_SELECTORS: &[&str] = &[
    "#onetrust-accept-btn-handler",
    "button[aria-label='Accept all']",
    "button[aria-label='同意する']",
    ".fc-cta-consent",
    "#L2AGLb",
    "button[data-testid='GDPR-accept']",
];

/// Commercial bot-protection fingerprints. A match means the host is
/// hostile to automated clients and gets blocked for the process lifetime.
const BOT_PATTERNS: &[(&str, &str)] = &[
    ("captcha-delivery.com", "DataDome bot protection"),
    ("datadome", "DataDome bot protection"),
    ("cf-challenge", "Cloudflare challenge"),
    ("challenge-platform", "Cloudflare challenge"),
    ("Just a moment...", "Cloudflare challenge"),
    ("_pxhd", "PerimeterX bot protection"),
    ("px-captcha", "PerimeterX bot protection"),
    ("perimeterx", "PerimeterX bot protection"),
    ("distil_r_captcha", "Distil bot protection"),
    ("distilnetworks", "Distil bot protection"),
    ("errors.edgesuite.net", "Akamai access denied"),
];

/// Match fetched HTML against known challenge-page fingerprints.
/// Akamai additionally requires the "Access Denied" marker since its
/// error host shows up in legitimate pages too.
pub fn detect_bot_protection(html: &str) -> Option<&'static str> {
    for (pattern, reason) in BOT_PATTERNS {
        if html.contains(pattern) {
            if *reason == "Akamai access denied" && !html.contains("Access Denied") {
                continue;
            }
            return Some(reason);
        }
    }
    None
}

pub struct BrowserFetch {
    pub html: String,
    pub final_url: String,
}

/// Fetch a page through the headless browser: fresh page, stealth init,
/// consent click, half-page scroll, final HTML + URL.
pub async fn fetch_page(url: &str, timeout: Duration) -> Result<BrowserFetch, CrawlError> {
    let page = new_stealth_page().await?;
    let result = tokio::time::timeout(timeout, drive_page(&page, url)).await;
    let _ = page.close().await;
    match result {
        Ok(fetch) => fetch,
        Err(_) => Err(CrawlError::Timeout),
    }
}

/// Navigate and report the post-redirect URL without reading the body.
pub async fn resolve_final_url(url: &str, timeout: Duration) -> Result<String, CrawlError> {
    let page = new_stealth_page().await?;
    let result = tokio::time::timeout(timeout, async {
        navigate(&page, url).await?;
        current_url(&page).await
    })
    .await;
    let _ = page.close().await;
    match result {
        Ok(final_url) => final_url,
        Err(_) => Err(CrawlError::Timeout),
    }
}

/// Close the singleton. The next caller relaunches it.
pub async fn close_browser() {
    let cell = BROWSER.get_or_init(|| Mutex::new(None));
    let mut guard = cell.lock().await;
    if let Some(mut browser) = guard.take() {
        if let Err(e) = browser.close().await {
            tracing::debug!("Browser close failed: {}", e);
        }
        let _ = browser.wait().await;
        tracing::debug!("Headless browser closed");
    }
}

async fn drive_page(page: &Page, url: &str) -> Result<BrowserFetch, CrawlError> {
    navigate(page, url).await?;

    // Consent banners block the article body on a lot of news sites.
    for selector in CONSENT_SELECTORS {
        if let Ok(element) = page.find_element(*selector).await {
            if element.click().await.is_ok() {
                tracing::debug!("Clicked consent button {} on {}", selector, url);
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            break;
        }
    }

    // Scroll halfway down to trigger lazily loaded content.
    let _ = page
        .evaluate("window.scrollTo(0, document.body.scrollHeight / 2)")
        .await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let html = page
        .content()
        .await
        .map_err(|e| CrawlError::Transport(e.to_string()))?;
    let final_url = current_url(page).await?;

    Ok(BrowserFetch { html, final_url })
}

async fn navigate(page: &Page, url: &str) -> Result<(), CrawlError> {
    page.goto(url)
        .await
        .map_err(|e| CrawlError::Transport(e.to_string()))?;
    page.wait_for_navigation()
        .await
        .map_err(|e| CrawlError::Transport(e.to_string()))?;
    // Give straggling requests a moment to settle after the load event.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    Ok(())
}

async fn current_url(page: &Page) -> Result<String, CrawlError> {
    page.url()
        .await
        .map_err(|e| CrawlError::Transport(e.to_string()))?
        .ok_or_else(|| CrawlError::Transport("Browser reported no page URL".to_string()))
}

/// Get a fresh isolated page from the singleton browser, relaunching it
/// at most once if the previous instance has disconnected.
async fn new_stealth_page() -> Result<Page, CrawlError> {
    let cell = BROWSER.get_or_init(|| Mutex::new(None));
    let mut guard = cell.lock().await;

    for attempt in 0..2 {
        if guard.is_none() {
            *guard = Some(launch().await?);
        }
        let browser = guard.as_ref().expect("browser just launched");
        match browser.new_page("about:blank").await {
            Ok(page) => {
                drop(guard);
                prepare_page(&page).await?;
                return Ok(page);
            }
            Err(e) if attempt == 0 && is_disconnect(&e) => {
                tracing::warn!("Headless browser disconnected, relaunching: {}", e);
                *guard = None;
            }
            Err(e) => return Err(CrawlError::Transport(e.to_string())),
        }
    }

    Err(CrawlError::Transport(
        "Headless browser unavailable after relaunch".to_string(),
    ))
}

async fn prepare_page(page: &Page) -> Result<(), CrawlError> {
    page.set_user_agent(DESKTOP_UA)
        .await
        .map_err(|e| CrawlError::Transport(e.to_string()))?;

    let stealth = AddScriptToEvaluateOnNewDocumentParams::builder()
        .source(STEALTH_INIT)
        .build()
        .map_err(CrawlError::Transport)?;
    page.execute(stealth)
        .await
        .map_err(|e| CrawlError::Transport(e.to_string()))?;
    Ok(())
}

async fn launch() -> Result<Browser, CrawlError> {
    let config = BrowserConfig::builder()
        .window_size(1366, 900)
        .args(vec![
            "--no-sandbox",
            "--disable-blink-features=AutomationControlled",
            "--disable-gpu",
            "--hide-scrollbars",
            "--mute-audio",
            "--lang=ja-JP",
        ])
        .build()
        .map_err(CrawlError::Transport)?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| CrawlError::Transport(format!("Failed to launch browser: {}", e)))?;

    // The handler must be polled for the browser connection to make
    // progress; it ends when the browser goes away.
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                break;
            }
        }
    });

    tracing::info!("Headless browser launched");
    Ok(browser)
}

fn is_disconnect(err: &impl std::fmt::Display) -> bool {
    let message = err.to_string().to_lowercase();
    message.contains("closed") || message.contains("disconnect") || message.contains("connection")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_datadome() {
        let html = r#"<script src="https://ct.captcha-delivery.com/c.js"></script>"#;
        assert_eq!(detect_bot_protection(html), Some("DataDome bot protection"));
    }

    #[test]
    fn detects_cloudflare_challenge() {
        let html = "<title>Just a moment...</title>";
        assert_eq!(detect_bot_protection(html), Some("Cloudflare challenge"));
    }

    #[test]
    fn detects_perimeterx_and_distil() {
        assert_eq!(
            detect_bot_protection("var _pxhd = 'x';"),
            Some("PerimeterX bot protection")
        );
        assert_eq!(
            detect_bot_protection("<div id=\"distil_r_captcha\"></div>"),
            Some("Distil bot protection")
        );
    }

    #[test]
    fn akamai_requires_access_denied_marker() {
        assert_eq!(
            detect_bot_protection("<h1>Access Denied</h1> ref errors.edgesuite.net"),
            Some("Akamai access denied")
        );
        // The error host alone (e.g. quoted in an article) is not a hit.
        assert_eq!(
            detect_bot_protection("see errors.edgesuite.net for details"),
            None
        );
    }

    #[test]
    fn clean_page_is_not_flagged() {
        let html = "<html><body><article>Plain news text</article></body></html>";
        assert_eq!(detect_bot_protection(html), None);
    }
}
