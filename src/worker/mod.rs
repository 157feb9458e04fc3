pub mod control;
mod queue;

pub use queue::DomainQueue;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::ai::Evaluator;
use crate::db::Repository;
use crate::error::{AppError, CrawlError, Result};
use crate::feed::FeedCollector;
use crate::models::{AppConfig, Article, ArticleUpsert, CollectedArticle, Phase, StatusUpdate};
use crate::services::{browser, extractor, Fetcher, Notifier, DIRECT_FETCH_TIMEOUT};

const DEFAULT_SOURCE_URL: &str = "https://hnrss.org/frontpage";
const DEFAULT_SOURCE_NAME: &str = "Hacker News";

const EVAL_READ_LIMIT: usize = 200;
const IMAGE_BACKFILL_LIMIT: usize = 100;
const IMAGE_BACKFILL_DELAY: Duration = Duration::from_secs(1);

const CRAWL_CONTEXT: &str = "domain-throttled crawl phase";
const EVAL_CONTEXT: &str = "evaluation batch";

/// The singleton ingestion worker. One `run` is one full cycle:
/// lease → collect → crawl → image backfill → evaluate → teardown.
pub struct Worker {
    repo: Arc<Repository>,
    fetcher: Arc<Fetcher>,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(repo: Arc<Repository>) -> Self {
        let fetcher = Arc::new(Fetcher::new(repo.clone()));
        Self {
            repo,
            fetcher,
            cancel: CancellationToken::new(),
        }
    }

    /// Token observed by every phase; cancelling it makes the worker
    /// finish in-flight work, abandon its queues and run teardown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self) -> Result<()> {
        if !self.try_acquire_lease().await? {
            tracing::warn!("Another crawler worker holds the lease, exiting");
            return Ok(());
        }

        let result = self.run_phases().await;
        if let Err(e) = &result {
            tracing::error!("Crawl cycle failed: {}", e);
        }
        self.teardown(&result).await;
        result
    }

    /// Acquire the singleton lease, reclaiming it from dead holders.
    /// Returns false when a different live process owns it.
    pub async fn try_acquire_lease(&self) -> Result<bool> {
        let status = self.repo.get_status().await?;
        let me = std::process::id() as i64;
        let parent = std::os::unix::process::parent_id() as i64;

        if status.is_crawling {
            match status.worker_pid {
                Some(pid) if pid == me || pid == parent => {
                    // Our own lease, written by the control surface at spawn.
                }
                Some(pid) if control::pid_is_alive(pid) => return Ok(false),
                Some(pid) => {
                    tracing::warn!("Reclaiming stale crawler lease from dead PID {}", pid);
                }
                None => {
                    tracing::warn!("Reclaiming crawler lease with no owner PID");
                }
            }
        }

        self.repo
            .update_status(StatusUpdate {
                is_crawling: Some(true),
                worker_pid: Some(Some(me)),
                last_run: Some(Utc::now()),
                current_task: Some("Initializing".to_string()),
                ..Default::default()
            })
            .await?;
        Ok(true)
    }

    /// Always runs, whatever the cycle did: release the lease and close
    /// the browser.
    pub async fn teardown(&self, result: &Result<()>) {
        let update = StatusUpdate {
            is_crawling: Some(false),
            current_task: Some("Idle".to_string()),
            worker_pid: Some(None),
            last_error: result.as_ref().err().map(|e| e.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.repo.update_status(update).await {
            tracing::error!("Failed to release crawler lease: {}", e);
        }
        browser::close_browser().await;
    }

    async fn run_phases(&self) -> Result<()> {
        let config = self.repo.get_config().await?;

        if self.repo.count_sources().await? == 0 {
            tracing::info!("No sources configured, seeding {}", DEFAULT_SOURCE_URL);
            self.repo
                .add_source(DEFAULT_SOURCE_URL.to_string(), DEFAULT_SOURCE_NAME.to_string())
                .await?;
        }

        // Phase 1: collect candidates from every feed.
        self.set_task("Phase 1: Collecting feeds").await;
        let collector = FeedCollector::new(self.repo.clone(), self.fetcher.clone());
        let collected = collector.collect_all(config.feed_fetch_concurrency).await?;
        tracing::info!("Collected {} candidate articles", collected.len());

        for item in &collected {
            match self.repo.get_article_by_url(&item.url).await? {
                None => {
                    self.repo
                        .upsert_article(ArticleUpsert {
                            url: item.url.clone(),
                            resolved_url: item.resolved_url.clone(),
                            original_title: item.title.clone(),
                            published_at: item.published_at,
                            ..Default::default()
                        })
                        .await?;
                }
                Some(existing) if existing.resolved_url.is_none() && item.resolved_url.is_some() => {
                    // Cache a resolution discovered this cycle.
                    self.repo
                        .upsert_article(ArticleUpsert {
                            url: item.url.clone(),
                            resolved_url: item.resolved_url.clone(),
                            ..Default::default()
                        })
                        .await?;
                }
                Some(_) => {}
            }
        }

        if self.cancel.is_cancelled() {
            return Ok(());
        }

        // Phase 2: domain-throttled crawl.
        self.crawl_phase(&config, collected).await?;
        browser::close_browser().await;

        if self.cancel.is_cancelled() {
            return Ok(());
        }

        // Phase 2.5: image backfill.
        self.image_backfill_phase().await?;

        if self.cancel.is_cancelled() {
            return Ok(());
        }

        // Phase 3: LLM evaluation.
        self.evaluation_phase(&config).await?;
        Ok(())
    }

    async fn crawl_phase(&self, config: &AppConfig, collected: Vec<CollectedArticle>) -> Result<()> {
        let total = collected.len();
        if total == 0 {
            return Ok(());
        }

        let mut queue = DomainQueue::new(
            config.max_concurrent_per_domain,
            config.max_total_concurrent,
            config.domain_delay_ms,
        );
        for item in collected {
            queue.push(item);
        }

        let mut in_flight = FuturesUnordered::new();
        let mut done = 0usize;
        let mut processed = 0i64;

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!(
                    "Stop requested, abandoning {} queued articles",
                    queue.queued()
                );
                break;
            }

            if let Some(item) = queue.next_available() {
                self.set_task(&format!(
                    "Phase 2: Crawling [{}/{}] ({} active, {} queued)",
                    done + in_flight.len() + 1,
                    total,
                    queue.active_total(),
                    queue.queued()
                ))
                .await;

                let repo = self.repo.clone();
                let fetcher = self.fetcher.clone();
                in_flight.push(async move {
                    let result = crawl_one(&repo, &fetcher, &item).await;
                    (item, result)
                });
                continue;
            }

            if in_flight.is_empty() {
                if queue.is_drained() {
                    break;
                }
                // Nothing dispatchable and nothing running: short nap.
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }

            let wait = queue.wait_time().max(Duration::from_millis(1));
            tokio::select! {
                Some((item, result)) = in_flight.next() => {
                    queue.mark_complete(&item);
                    done += 1;
                    if self.handle_crawl_result(&item, result).await {
                        processed += 1;
                        let _ = self
                            .repo
                            .update_status(StatusUpdate {
                                articles_processed: Some(processed),
                                ..Default::default()
                            })
                            .await;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
                _ = self.cancel.cancelled() => {}
            }
        }

        // Let in-flight requests finish their current work.
        while let Some((item, result)) = in_flight.next().await {
            queue.mark_complete(&item);
            done += 1;
            if self.handle_crawl_result(&item, result).await {
                processed += 1;
            }
        }

        let _ = self
            .repo
            .update_status(StatusUpdate {
                articles_processed: Some(processed),
                ..Default::default()
            })
            .await;
        tracing::info!("Crawl phase finished: {}/{} articles stored", processed, done);
        Ok(())
    }

    /// Returns true when the article was crawled and stored.
    async fn handle_crawl_result(
        &self,
        item: &CollectedArticle,
        result: std::result::Result<(), CrawlError>,
    ) -> bool {
        match result {
            Ok(()) => {
                tracing::debug!("Crawled {}", item.effective_url());
                true
            }
            Err(e) => {
                tracing::warn!("Crawl failed for {}: {}", item.url, e);
                if let Err(db_err) = self
                    .repo
                    .record_error(
                        &item.url,
                        item.title.clone(),
                        &e.to_string(),
                        Some(format!("{:?}", e)),
                        Phase::Crawl,
                        CRAWL_CONTEXT,
                    )
                    .await
                {
                    tracing::error!("Failed to record crawl error for {}: {}", item.url, db_err);
                }
                false
            }
        }
    }

    async fn image_backfill_phase(&self) -> Result<()> {
        self.set_task("Phase 2.5: Backfilling images").await;
        let articles = self
            .repo
            .get_articles_without_images(IMAGE_BACKFILL_LIMIT)
            .await?;
        if articles.is_empty() {
            return Ok(());
        }
        tracing::info!("Backfilling images for {} articles", articles.len());

        for article in articles {
            if self.cancel.is_cancelled() {
                break;
            }
            match self
                .fetcher
                .fetch(article.effective_url(), DIRECT_FETCH_TIMEOUT)
                .await
            {
                Ok(payload) => {
                    let html = String::from_utf8_lossy(&payload.bytes);
                    if let Some(image) = extractor::extract_meta_image(&html) {
                        if let Err(e) = self.repo.update_image_url(&article.url, &image).await {
                            tracing::debug!("Image update failed for {}: {}", article.url, e);
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("Image backfill fetch failed for {}: {}", article.url, e);
                }
            }
            tokio::time::sleep(IMAGE_BACKFILL_DELAY).await;
        }
        Ok(())
    }

    async fn evaluation_phase(&self, config: &AppConfig) -> Result<()> {
        self.set_task("Phase 3: Evaluating articles").await;

        let Some(api_key) = config.llm_api_key.clone() else {
            tracing::info!("LLM API key not configured, skipping evaluation");
            return Ok(());
        };
        let evaluator = Evaluator::new(api_key, config.llm_model.clone());
        let notifier = Notifier::new(config.webhook_url.clone());

        let unprocessed = self.repo.get_unprocessed_articles(EVAL_READ_LIMIT).await?;
        // A still-crawlable article has no usable content and is never
        // sent to the evaluator.
        let pending: Vec<Article> = unprocessed
            .into_iter()
            .filter(|a| !a.is_evaluated() && !a.is_crawlable())
            .collect();
        tracing::info!("Evaluating {} articles", pending.len());

        for batch in pending.chunks(config.eval_concurrency.max(1)) {
            if self.cancel.is_cancelled() {
                break;
            }

            // Settled semantics: every future in the batch runs to its
            // own conclusion regardless of sibling failures.
            let results = futures::future::join_all(batch.iter().map(|article| {
                let evaluator = &evaluator;
                let notifier = &notifier;
                async move {
                    let result = self
                        .evaluate_one(evaluator, notifier, config, article)
                        .await;
                    (article, result)
                }
            }))
            .await;

            for (article, result) in results {
                if let Err(e) = result {
                    tracing::warn!("Evaluation failed for {}: {}", article.url, e);
                    if let Err(db_err) = self
                        .repo
                        .record_error(
                            &article.url,
                            article.original_title.clone(),
                            &e.to_string(),
                            Some(format!("{:?}", e)),
                            Phase::Eval,
                            EVAL_CONTEXT,
                        )
                        .await
                    {
                        tracing::error!(
                            "Failed to record eval error for {}: {}",
                            article.url,
                            db_err
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn evaluate_one(
        &self,
        evaluator: &Evaluator,
        notifier: &Notifier,
        config: &AppConfig,
        article: &Article,
    ) -> std::result::Result<(), CrawlError> {
        let title = article.original_title.as_deref().unwrap_or(&article.url);
        let content = article.content.as_deref().unwrap_or_default();
        let evaluation = evaluator.evaluate(title, content).await?;

        self.repo
            .upsert_article(ArticleUpsert {
                url: article.url.clone(),
                translated_title: Some(evaluation.translated_title.clone()),
                summary: Some(evaluation.summary.clone()),
                short_summary: Some(evaluation.short_summary.clone()),
                scores: Some(evaluation.scores),
                average_score: Some(evaluation.average_score),
                ..Default::default()
            })
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        if evaluation.average_score >= config.score_threshold {
            if let Err(e) = notifier
                .notify(
                    article.effective_url(),
                    &article.url,
                    &evaluation,
                    article.image_url.as_deref(),
                )
                .await
            {
                // Delivery problems don't fail the evaluation.
                tracing::warn!("Webhook delivery failed for {}: {}", article.url, e);
                let _ = self
                    .repo
                    .record_error(
                        &article.url,
                        article.original_title.clone(),
                        &e.to_string(),
                        Some(format!("{:?}", e)),
                        Phase::Notify,
                        "webhook delivery",
                    )
                    .await;
                return Ok(());
            }
        }

        self.repo
            .clear_error(&article.url)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    /// The full crawl + evaluate pipeline for one URL, outside the phased
    /// cycle. Used by the ingest and retry entry points.
    pub async fn process_single(&self, url: &str) -> Result<()> {
        let config = self.repo.get_config().await?;

        let resolved_url = if self.fetcher.is_aggregator_url(url) {
            match self.repo.get_article_by_url(url).await? {
                Some(article) if article.resolved_url.is_some() => article.resolved_url,
                _ => self.fetcher.resolve_redirect(url).await.map_err(AppError::Crawl)?,
            }
        } else {
            None
        };

        let item = CollectedArticle {
            url: url.to_string(),
            resolved_url,
            title: None,
            published_at: None,
            feed_source: "manual".to_string(),
        };

        if let Err(e) = crawl_one(&self.repo, &self.fetcher, &item).await {
            self.repo
                .record_error(
                    &item.url,
                    None,
                    &e.to_string(),
                    Some(format!("{:?}", e)),
                    Phase::Crawl,
                    "manual ingest",
                )
                .await?;
            return Err(AppError::Crawl(e));
        }

        let Some(api_key) = config.llm_api_key.clone() else {
            return Ok(());
        };
        let evaluator = Evaluator::new(api_key, config.llm_model.clone());
        let notifier = Notifier::new(config.webhook_url.clone());

        let article = self
            .repo
            .get_article_by_url(url)
            .await?
            .ok_or_else(|| AppError::Config(format!("Article missing after crawl: {}", url)))?;

        if !article.is_crawlable() {
            if let Err(e) = self.evaluate_one(&evaluator, &notifier, &config, &article).await {
                self.repo
                    .record_error(
                        &article.url,
                        article.original_title.clone(),
                        &e.to_string(),
                        Some(format!("{:?}", e)),
                        Phase::Eval,
                        "manual ingest",
                    )
                    .await?;
                return Err(AppError::Crawl(e));
            }
        }
        Ok(())
    }

    async fn set_task(&self, task: &str) {
        if let Err(e) = self
            .repo
            .update_status(StatusUpdate {
                current_task: Some(task.to_string()),
                ..Default::default()
            })
            .await
        {
            tracing::error!("Failed to update crawler status: {}", e);
        }
    }
}

async fn crawl_one(
    repo: &Repository,
    fetcher: &Fetcher,
    item: &CollectedArticle,
) -> std::result::Result<(), CrawlError> {
    let target = item.effective_url();
    let payload = fetcher.fetch(target, DIRECT_FETCH_TIMEOUT).await?;
    let content = extractor::extract(
        payload.bytes,
        payload.content_type.as_deref(),
        &payload.final_url,
    )
    .await?;

    repo.upsert_article(ArticleUpsert {
        url: item.url.clone(),
        resolved_url: item.resolved_url.clone(),
        original_title: Some(content.title),
        content: Some(content.text),
        image_url: content.image_url,
        published_at: item.published_at,
        ..Default::default()
    })
    .await
    .map_err(|e| CrawlError::Storage(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_worker() -> (Worker, Arc<Repository>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let repo = Arc::new(Repository::new(db_path.to_str().unwrap()).await.unwrap());
        let worker = Worker::new(repo.clone());
        (worker, repo, dir)
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed() {
        let (worker, repo, _dir) = open_worker().await;

        // A dead PID left behind by a crashed worker.
        repo.update_status(StatusUpdate {
            is_crawling: Some(true),
            worker_pid: Some(Some(5_000_000)),
            ..Default::default()
        })
        .await
        .unwrap();

        assert!(worker.try_acquire_lease().await.unwrap());
        let status = repo.get_status().await.unwrap();
        assert!(status.is_crawling);
        assert_eq!(status.worker_pid, Some(std::process::id() as i64));
    }

    #[tokio::test]
    async fn live_foreign_lease_blocks_acquisition() {
        let (worker, repo, _dir) = open_worker().await;

        // A live process that is neither this one nor its parent.
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let child_pid = child.id() as i64;

        repo.update_status(StatusUpdate {
            is_crawling: Some(true),
            worker_pid: Some(Some(child_pid)),
            ..Default::default()
        })
        .await
        .unwrap();

        let acquired = worker.try_acquire_lease().await.unwrap();
        let status = repo.get_status().await.unwrap();

        let _ = child.kill();
        let _ = child.wait();

        assert!(!acquired);
        assert_eq!(status.worker_pid, Some(child_pid));
    }

    #[tokio::test]
    async fn own_pid_lease_is_not_a_conflict() {
        let (worker, repo, _dir) = open_worker().await;

        // The control surface writes the child PID before the child runs.
        repo.update_status(StatusUpdate {
            is_crawling: Some(true),
            worker_pid: Some(Some(std::process::id() as i64)),
            ..Default::default()
        })
        .await
        .unwrap();

        assert!(worker.try_acquire_lease().await.unwrap());
    }

    #[tokio::test]
    async fn teardown_releases_the_lease() {
        let (worker, repo, _dir) = open_worker().await;

        assert!(worker.try_acquire_lease().await.unwrap());
        worker.teardown(&Ok(())).await;

        let status = repo.get_status().await.unwrap();
        assert!(!status.is_crawling);
        assert_eq!(status.worker_pid, None);
        assert_eq!(status.current_task.as_deref(), Some("Idle"));
    }

    #[tokio::test]
    async fn teardown_records_the_cycle_error() {
        let (worker, repo, _dir) = open_worker().await;

        assert!(worker.try_acquire_lease().await.unwrap());
        worker
            .teardown(&Err(AppError::Config("boom".to_string())))
            .await;

        let status = repo.get_status().await.unwrap();
        assert!(!status.is_crawling);
        assert_eq!(status.last_error.as_deref(), Some("Config error: boom"));
    }
}
