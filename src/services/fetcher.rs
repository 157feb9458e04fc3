use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use regex::Regex;
use reqwest::{Client, StatusCode};

use crate::db::Repository;
use crate::error::CrawlError;
use crate::models::host_of;
use crate::services::browser;

pub const DIRECT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const REDIRECT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);
pub const BROWSER_FETCH_TIMEOUT: Duration = Duration::from_secs(45);

const AGGREGATOR_PATTERN: &str = r"news\.google\.com/rss/articles/([A-Za-z0-9_\-]+)";

pub struct FetchedPayload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub final_url: String,
}

/// Two-tier article fetcher: a lightweight direct client first, the
/// headless browser when the host pushes back.
pub struct Fetcher {
    client: Client,
    repo: Arc<Repository>,
    aggregator: Regex,
}

impl Fetcher {
    pub fn new(repo: Arc<Repository>) -> Self {
        let client = Client::builder()
            .user_agent(browser::DESKTOP_UA)
            .timeout(DIRECT_FETCH_TIMEOUT)
            .gzip(true)
            .brotli(true)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            repo,
            aggregator: Regex::new(AGGREGATOR_PATTERN).expect("valid aggregator pattern"),
        }
    }

    /// Fetch a URL per the escalation strategy: blocked hosts fail fast,
    /// 404 is final, 401/403 falls back to the browser, anything 2xx is
    /// returned as-is.
    pub async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedPayload, CrawlError> {
        let host = host_of(url)
            .ok_or_else(|| CrawlError::Transport(format!("Invalid URL: {}", url)))?;
        if self.is_blocked(&host).await? {
            return Err(CrawlError::Blocked(host));
        }

        let response = match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => response,
            Err(e) => return Err(CrawlError::from_request(&e)),
        };

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => Err(CrawlError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                tracing::debug!("HTTP {} for {}, falling back to browser", status, url);
                self.browser_fallback(url, &host, status).await
            }
            s if s.is_success() => {
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string());
                let final_url = response.url().to_string();
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| CrawlError::from_request(&e))?;
                Ok(FetchedPayload {
                    bytes: bytes.to_vec(),
                    content_type,
                    final_url,
                })
            }
            s => Err(CrawlError::from_status(s)),
        }
    }

    /// Resolve an aggregator redirect to its target. Returns `None` for
    /// URLs that are not aggregator-fronted. Structural decoding is tried
    /// first so most resolutions cost no network I/O.
    pub async fn resolve_redirect(&self, url: &str) -> Result<Option<String>, CrawlError> {
        let Some(payload) = self.aggregator_payload(url) else {
            return Ok(None);
        };

        if let Some(target) = decode_aggregator_payload(&payload) {
            tracing::debug!("Decoded aggregator URL {} -> {}", url, target);
            return Ok(Some(target));
        }

        // Opaque payload: let the browser follow the redirect chain.
        let final_url = browser::resolve_final_url(url, REDIRECT_RESOLVE_TIMEOUT).await?;
        tracing::debug!("Browser-resolved aggregator URL {} -> {}", url, final_url);
        Ok(Some(final_url))
    }

    pub fn is_aggregator_url(&self, url: &str) -> bool {
        self.aggregator.is_match(url)
    }

    fn aggregator_payload(&self, url: &str) -> Option<String> {
        self.aggregator
            .captures(url)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    async fn is_blocked(&self, host: &str) -> Result<bool, CrawlError> {
        self.repo
            .is_domain_blocked(host)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))
    }

    async fn browser_fallback(
        &self,
        url: &str,
        host: &str,
        status: StatusCode,
    ) -> Result<FetchedPayload, CrawlError> {
        match browser::fetch_page(url, BROWSER_FETCH_TIMEOUT).await {
            Ok(fetch) => {
                if let Some(reason) = browser::detect_bot_protection(&fetch.html) {
                    tracing::warn!("Bot protection on {} ({}), blocking host", host, reason);
                    self.block(host, reason).await?;
                    return Err(CrawlError::Blocked(host.to_string()));
                }
                Ok(FetchedPayload {
                    bytes: fetch.html.into_bytes(),
                    content_type: Some("text/html".to_string()),
                    final_url: fetch.final_url,
                })
            }
            Err(e) => {
                let reason = format!("HTTP {} + browser fetch failed", status.as_u16());
                tracing::warn!("Browser fallback for {} failed ({}), blocking host", url, e);
                self.block(host, &reason).await?;
                Err(CrawlError::Blocked(host.to_string()))
            }
        }
    }

    async fn block(&self, host: &str, reason: &str) -> Result<(), CrawlError> {
        self.repo
            .block_domain(host, reason)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))
    }
}

/// Pull an embedded `http(s)://` target out of the base64 payload of an
/// aggregator URL. The payload is a binary envelope; the target, when
/// present, appears as a printable ASCII run inside it.
pub fn decode_aggregator_payload(payload: &str) -> Option<String> {
    let trimmed = payload.trim_end_matches('=');
    let decoded = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .ok()?;

    let text = String::from_utf8_lossy(&decoded);
    let start = text.find("http")?;
    let candidate: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_graphic())
        .collect();

    let parsed = url::Url::parse(&candidate).ok()?;
    if parsed.scheme() == "http" || parsed.scheme() == "https" {
        Some(candidate)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(bytes: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(bytes)
    }

    #[test]
    fn decodes_embedded_https_url() {
        let mut payload = vec![0x08, 0x13, 0x22, 0x22];
        payload.extend_from_slice(b"https://site.example/a");
        payload.extend_from_slice(&[0xd2, 0x01, 0x00]);
        assert_eq!(
            decode_aggregator_payload(&encode(&payload)),
            Some("https://site.example/a".to_string())
        );
    }

    #[test]
    fn url_run_stops_at_binary_suffix() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"\x0a\x20https://site.example/path?id=42");
        payload.push(0x01);
        payload.extend_from_slice(b"trailing");
        assert_eq!(
            decode_aggregator_payload(&encode(&payload)),
            Some("https://site.example/path?id=42".to_string())
        );
    }

    #[test]
    fn rejects_payload_without_url() {
        let payload = encode(b"\x08\x13\x22\x06opaque");
        assert_eq!(decode_aggregator_payload(&payload), None);
    }

    #[test]
    fn rejects_invalid_base64() {
        assert_eq!(decode_aggregator_payload("***not-base64***"), None);
    }

    #[test]
    fn rejects_non_http_scheme() {
        let payload = encode(b"\x01httpxyz://nope");
        assert_eq!(decode_aggregator_payload(&payload), None);
    }

    #[test]
    fn aggregator_pattern_matches_article_links() {
        let re = Regex::new(AGGREGATOR_PATTERN).unwrap();
        assert!(re.is_match("https://news.google.com/rss/articles/CBMiK2h0?oc=5"));
        assert!(!re.is_match("https://news.google.com/topics/world"));
        assert!(!re.is_match("https://site.example/rss/articles/abc"));
    }
}
