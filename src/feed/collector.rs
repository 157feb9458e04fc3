use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use feed_rs::parser;
use futures::stream::{self, StreamExt};
use reqwest::Client;

use crate::db::Repository;
use crate::error::Result;
use crate::models::{CollectedArticle, Source};
use crate::services::browser;
use crate::services::Fetcher;

/// Redirect resolutions within a feed run in batches of this size to
/// bound peak concurrent browser contexts.
const RESOLVE_BATCH: usize = 5;

pub struct FeedCollector {
    client: Client,
    repo: Arc<Repository>,
    fetcher: Arc<Fetcher>,
}

impl FeedCollector {
    pub fn new(repo: Arc<Repository>, fetcher: Arc<Fetcher>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(browser::DESKTOP_UA)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            repo,
            fetcher,
        }
    }

    /// Collect candidate articles from every configured source,
    /// `concurrency` feeds at a time. A failing feed is logged and
    /// skipped; it never fails the cycle. The combined list is
    /// deduplicated by resolved URL (falling back to the feed URL).
    pub async fn collect_all(&self, concurrency: usize) -> Result<Vec<CollectedArticle>> {
        let sources = self.repo.get_all_sources().await?;

        let per_source: Vec<Vec<CollectedArticle>> = stream::iter(sources)
            .map(|source| async move {
                match self.collect_source(&source).await {
                    Ok(items) => {
                        tracing::debug!("Collected {} items from {}", items.len(), source.name);
                        items
                    }
                    Err(e) => {
                        tracing::warn!("Feed {} failed: {}", source.url, e);
                        Vec::new()
                    }
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut seen = HashSet::new();
        let mut combined = Vec::new();
        for item in per_source.into_iter().flatten() {
            if seen.insert(item.effective_url().to_string()) {
                combined.push(item);
            }
        }
        Ok(combined)
    }

    async fn collect_source(&self, source: &Source) -> Result<Vec<CollectedArticle>> {
        let bytes = self.load_feed(&source.url).await?;

        let feed = match parser::parse(&bytes[..]) {
            Ok(feed) => feed,
            Err(e) => {
                // Some feed endpoints sit behind scripted hosts that only
                // serve real XML to a browser.
                tracing::debug!("Direct parse of {} failed ({}), trying browser", source.url, e);
                let page =
                    browser::fetch_page(&source.url, Duration::from_secs(30))
                        .await
                        .map_err(|e| anyhow::anyhow!("Browser feed fetch failed: {}", e))?;
                parser::parse(page.html.as_bytes())?
            }
        };

        let mut candidates = Vec::new();
        for entry in feed.entries {
            let Some(link) = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .filter(|l| !l.is_empty())
            else {
                continue;
            };

            if self.repo.is_fully_processed(&link).await? {
                continue;
            }

            candidates.push(CollectedArticle {
                url: link,
                resolved_url: None,
                title: entry.title.map(|t| t.content),
                published_at: entry.published.or(entry.updated),
                feed_source: source.name.clone(),
            });
        }

        // Resolve aggregator redirects in bounded batches.
        let resolved: Vec<CollectedArticle> = stream::iter(candidates)
            .map(|item| self.resolve_item(item))
            .buffer_unordered(RESOLVE_BATCH)
            .collect()
            .await;

        Ok(resolved)
    }

    /// Fill in `resolved_url` for aggregator-fronted items. A resolution
    /// already cached on the stored article is reused; the browser is
    /// only consulted for fresh opaque payloads.
    async fn resolve_item(&self, mut item: CollectedArticle) -> CollectedArticle {
        if !self.fetcher.is_aggregator_url(&item.url) {
            return item;
        }

        match self.repo.get_article_by_url(&item.url).await {
            Ok(Some(existing)) if existing.resolved_url.is_some() => {
                item.resolved_url = existing.resolved_url;
                return item;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Cache lookup failed for {}: {}", item.url, e),
        }

        match self.fetcher.resolve_redirect(&item.url).await {
            Ok(resolved) => item.resolved_url = resolved,
            Err(e) => tracing::warn!("Redirect resolution failed for {}: {}", item.url, e),
        }
        item
    }

    async fn load_feed(&self, url: &str) -> Result<Vec<u8>> {
        // file:// sources are read-only local fixtures.
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(std::fs::read(path)?);
        }

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(
                anyhow::anyhow!("Failed to fetch feed: HTTP {}", response.status()).into(),
            );
        }
        Ok(response.bytes().await?.to_vec())
    }
}
