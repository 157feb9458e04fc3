use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::Result;
use crate::models::{
    host_of, AppConfig, Article, ArticleError, ArticleUpsert, BlockedDomain, CrawlerStatus, Phase,
    Source, StatusUpdate,
};

use super::schema::{MIGRATIONS, SCHEMA};

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 30000;
            "#,
            )?;
            conn.execute_batch(SCHEMA)?;

            // Additive migration: older databases gain any column the
            // current schema carries.
            for (table, column, decl) in MIGRATIONS {
                let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
                let existing: Vec<String> = stmt
                    .query_map([], |row| row.get::<_, String>(1))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                if !existing.iter().any(|c| c == column) {
                    conn.execute_batch(&format!(
                        "ALTER TABLE {} ADD COLUMN {} {}",
                        table, column, decl
                    ))?;
                }
            }

            // Seed the singletons.
            conn.execute(
                "INSERT OR IGNORE INTO crawler_status (id, is_crawling, articles_processed) VALUES (1, 0, 0)",
                [],
            )?;
            conn.execute("INSERT OR IGNORE INTO config (id) VALUES (1)", [])?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    // Source operations

    pub async fn add_source(&self, url: String, name: String) -> Result<i64> {
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO sources (url, name) VALUES (?1, ?2)",
                    params![url, name],
                )?;
                let id: i64 = conn.query_row(
                    "SELECT id FROM sources WHERE url = ?1",
                    params![url],
                    |row| row.get(0),
                )?;
                Ok(id)
            })
            .await?;
        Ok(id)
    }

    pub async fn get_all_sources(&self) -> Result<Vec<Source>> {
        let sources = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, url, name FROM sources ORDER BY id")?;
                let sources = stmt
                    .query_map([], |row| {
                        Ok(Source {
                            id: row.get(0)?,
                            url: row.get(1)?,
                            name: row.get(2)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(sources)
            })
            .await?;
        Ok(sources)
    }

    pub async fn delete_source(&self, id: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM sources WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn count_sources(&self) -> Result<i64> {
        let count = self
            .conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM sources", [], |row| row.get(0))?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }

    // Article operations

    /// Upsert on `url`: supplied columns overwrite, omitted columns keep
    /// their stored value. Score fields arrive together so an article is
    /// never left with a partial score set.
    pub async fn upsert_article(&self, article: ArticleUpsert) -> Result<()> {
        self.conn
            .call(move |conn| {
                let (novelty, importance, reliability, context_value, thought_provoking) =
                    match &article.scores {
                        Some(s) => (
                            Some(s.novelty),
                            Some(s.importance),
                            Some(s.reliability),
                            Some(s.context_value),
                            Some(s.thought_provoking),
                        ),
                        None => (None, None, None, None, None),
                    };
                conn.execute(
                    r#"INSERT INTO articles
                           (url, resolved_url, original_title, translated_title, summary,
                            short_summary, content, image_url, published_at,
                            score_novelty, score_importance, score_reliability,
                            score_context_value, score_thought_provoking, average_score)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                       ON CONFLICT(url) DO UPDATE SET
                           resolved_url = COALESCE(excluded.resolved_url, articles.resolved_url),
                           original_title = COALESCE(excluded.original_title, articles.original_title),
                           translated_title = COALESCE(excluded.translated_title, articles.translated_title),
                           summary = COALESCE(excluded.summary, articles.summary),
                           short_summary = COALESCE(excluded.short_summary, articles.short_summary),
                           content = COALESCE(excluded.content, articles.content),
                           image_url = COALESCE(excluded.image_url, articles.image_url),
                           published_at = COALESCE(excluded.published_at, articles.published_at),
                           score_novelty = COALESCE(excluded.score_novelty, articles.score_novelty),
                           score_importance = COALESCE(excluded.score_importance, articles.score_importance),
                           score_reliability = COALESCE(excluded.score_reliability, articles.score_reliability),
                           score_context_value = COALESCE(excluded.score_context_value, articles.score_context_value),
                           score_thought_provoking = COALESCE(excluded.score_thought_provoking, articles.score_thought_provoking),
                           average_score = COALESCE(excluded.average_score, articles.average_score)"#,
                    params![
                        article.url,
                        article.resolved_url,
                        article.original_title,
                        article.translated_title,
                        article.summary,
                        article.short_summary,
                        article.content,
                        article.image_url,
                        article.published_at.map(|dt| dt.to_rfc3339()),
                        novelty,
                        importance,
                        reliability,
                        context_value,
                        thought_provoking,
                        article.average_score,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_article_by_url(&self, url: &str) -> Result<Option<Article>> {
        let url = url.to_string();
        let article = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM articles WHERE url = ?1",
                    ARTICLE_COLUMNS
                ))?;
                let article = stmt
                    .query_row(params![url], |row| Ok(article_from_row(row)))
                    .optional()?;
                Ok(article)
            })
            .await?;
        Ok(article)
    }

    pub async fn get_article_by_id(&self, id: i64) -> Result<Option<Article>> {
        let article = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM articles WHERE id = ?1",
                    ARTICLE_COLUMNS
                ))?;
                let article = stmt
                    .query_row(params![id], |row| Ok(article_from_row(row)))
                    .optional()?;
                Ok(article)
            })
            .await?;
        Ok(article)
    }

    /// Newest-first listing, filtered against blocked hosts.
    pub async fn get_articles(&self, limit: usize) -> Result<Vec<Article>> {
        let articles = self
            .conn
            .call(move |conn| {
                let blocked = blocked_set(conn)?;
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM articles ORDER BY created_at DESC, id DESC LIMIT ?1",
                    ARTICLE_COLUMNS
                ))?;
                let articles = stmt
                    .query_map(params![limit as i64], |row| Ok(article_from_row(row)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(filter_blocked(articles, &blocked))
            })
            .await?;
        Ok(articles)
    }

    /// Articles that still need work: crawlable (content missing or short)
    /// or not yet evaluated. Blocked hosts are never surfaced.
    pub async fn get_unprocessed_articles(&self, limit: usize) -> Result<Vec<Article>> {
        let articles = self
            .conn
            .call(move |conn| {
                let blocked = blocked_set(conn)?;
                let mut stmt = conn.prepare(&format!(
                    r#"SELECT {} FROM articles
                       WHERE content IS NULL OR length(content) < 200 OR average_score IS NULL
                       ORDER BY created_at DESC, id DESC LIMIT ?1"#,
                    ARTICLE_COLUMNS
                ))?;
                let articles = stmt
                    .query_map(params![limit as i64], |row| Ok(article_from_row(row)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(filter_blocked(articles, &blocked))
            })
            .await?;
        Ok(articles)
    }

    pub async fn get_articles_without_images(&self, limit: usize) -> Result<Vec<Article>> {
        let articles = self
            .conn
            .call(move |conn| {
                let blocked = blocked_set(conn)?;
                let mut stmt = conn.prepare(&format!(
                    r#"SELECT {} FROM articles
                       WHERE image_url IS NULL AND content IS NOT NULL
                       ORDER BY created_at DESC, id DESC LIMIT ?1"#,
                    ARTICLE_COLUMNS
                ))?;
                let articles = stmt
                    .query_map(params![limit as i64], |row| Ok(article_from_row(row)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(filter_blocked(articles, &blocked))
            })
            .await?;
        Ok(articles)
    }

    pub async fn update_image_url(&self, url: &str, image_url: &str) -> Result<()> {
        let url = url.to_string();
        let image_url = image_url.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE articles SET image_url = ?1 WHERE url = ?2",
                    params![image_url, url],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// True when the crawl and evaluation stages have both completed for
    /// this URL; such items are skipped at collection time.
    pub async fn is_fully_processed(&self, url: &str) -> Result<bool> {
        let url = url.to_string();
        let processed = self
            .conn
            .call(move |conn| {
                let processed: bool = conn
                    .query_row(
                        r#"SELECT content IS NOT NULL AND length(content) >= 200
                                  AND average_score IS NOT NULL
                           FROM articles WHERE url = ?1"#,
                        params![url],
                        |row| row.get(0),
                    )
                    .optional()?
                    .unwrap_or(false);
                Ok(processed)
            })
            .await?;
        Ok(processed)
    }

    // Error operations

    /// Record a failure for a URL, replacing any earlier record.
    pub async fn record_error(
        &self,
        url: &str,
        title_hint: Option<String>,
        error_message: &str,
        stack_trace: Option<String>,
        phase: Phase,
        context: &str,
    ) -> Result<()> {
        let url = url.to_string();
        let error_message = error_message.to_string();
        let context = context.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"INSERT OR REPLACE INTO article_errors
                           (url, title_hint, error_message, stack_trace, phase, context, created_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))"#,
                    params![
                        url,
                        title_hint,
                        error_message,
                        stack_trace,
                        phase.as_str(),
                        context
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn clear_error(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM article_errors WHERE url = ?1", params![url])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_error_by_url(&self, url: &str) -> Result<Option<ArticleError>> {
        let url = url.to_string();
        let error = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM article_errors WHERE url = ?1",
                    ERROR_COLUMNS
                ))?;
                let error = stmt
                    .query_row(params![url], |row| Ok(error_from_row(row)))
                    .optional()?;
                Ok(error)
            })
            .await?;
        Ok(error)
    }

    pub async fn get_error_by_id(&self, id: i64) -> Result<Option<ArticleError>> {
        let error = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM article_errors WHERE id = ?1",
                    ERROR_COLUMNS
                ))?;
                let error = stmt
                    .query_row(params![id], |row| Ok(error_from_row(row)))
                    .optional()?;
                Ok(error)
            })
            .await?;
        Ok(error)
    }

    pub async fn recent_errors(&self, limit: usize) -> Result<Vec<ArticleError>> {
        let errors = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM article_errors ORDER BY created_at DESC, id DESC LIMIT ?1",
                    ERROR_COLUMNS
                ))?;
                let errors = stmt
                    .query_map(params![limit as i64], |row| Ok(error_from_row(row)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(errors)
            })
            .await?;
        Ok(errors)
    }

    // Blocked domain operations

    pub async fn block_domain(&self, domain: &str, reason: &str) -> Result<()> {
        let domain = domain.to_string();
        let reason = reason.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO blocked_domains (domain, reason) VALUES (?1, ?2)",
                    params![domain, reason],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn is_domain_blocked(&self, domain: &str) -> Result<bool> {
        let domain = domain.to_string();
        let blocked = self
            .conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM blocked_domains WHERE domain = ?1",
                    params![domain],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await?;
        Ok(blocked)
    }

    pub async fn get_blocked_domains(&self) -> Result<Vec<BlockedDomain>> {
        let domains = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, domain, reason, created_at FROM blocked_domains ORDER BY id",
                )?;
                let domains = stmt
                    .query_map([], |row| {
                        Ok(BlockedDomain {
                            id: row.get(0)?,
                            domain: row.get(1)?,
                            reason: row.get(2)?,
                            created_at: row
                                .get::<_, String>(3)
                                .ok()
                                .and_then(|s| parse_datetime(&s))
                                .unwrap_or_else(Utc::now),
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(domains)
            })
            .await?;
        Ok(domains)
    }

    // Crawler status operations

    pub async fn get_status(&self) -> Result<CrawlerStatus> {
        let status = self
            .conn
            .call(|conn| {
                let status = conn.query_row(
                    r#"SELECT is_crawling, last_run, current_task, articles_processed,
                              last_error, worker_pid
                       FROM crawler_status WHERE id = 1"#,
                    [],
                    |row| {
                        Ok(CrawlerStatus {
                            is_crawling: row.get::<_, i64>(0)? != 0,
                            last_run: row
                                .get::<_, Option<String>>(1)?
                                .and_then(|s| parse_datetime(&s)),
                            current_task: row.get(2)?,
                            articles_processed: row.get(3)?,
                            last_error: row.get(4)?,
                            worker_pid: row.get(5)?,
                        })
                    },
                )?;
                Ok(status)
            })
            .await?;
        Ok(status)
    }

    /// Atomic partial update: only the provided fields change.
    pub async fn update_status(&self, update: StatusUpdate) -> Result<()> {
        self.conn
            .call(move |conn| {
                let mut sets: Vec<&str> = Vec::new();
                let mut values: Vec<Value> = Vec::new();

                if let Some(is_crawling) = update.is_crawling {
                    sets.push("is_crawling = ?");
                    values.push(Value::Integer(is_crawling as i64));
                }
                if let Some(last_run) = update.last_run {
                    sets.push("last_run = ?");
                    values.push(Value::Text(last_run.to_rfc3339()));
                }
                if let Some(current_task) = update.current_task {
                    sets.push("current_task = ?");
                    values.push(Value::Text(current_task));
                }
                if let Some(processed) = update.articles_processed {
                    sets.push("articles_processed = ?");
                    values.push(Value::Integer(processed));
                }
                if let Some(last_error) = update.last_error {
                    sets.push("last_error = ?");
                    values.push(Value::Text(last_error));
                }
                if let Some(worker_pid) = update.worker_pid {
                    sets.push("worker_pid = ?");
                    values.push(match worker_pid {
                        Some(pid) => Value::Integer(pid),
                        None => Value::Null,
                    });
                }

                if sets.is_empty() {
                    return Ok(());
                }

                let sql = format!("UPDATE crawler_status SET {} WHERE id = 1", sets.join(", "));
                conn.execute(&sql, params_from_iter(values))?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Config operations

    pub async fn get_config(&self) -> Result<AppConfig> {
        let config = self
            .conn
            .call(|conn| {
                let config = conn.query_row(
                    r#"SELECT llm_api_key, webhook_url, llm_model, score_threshold,
                              feed_fetch_concurrency, max_concurrent_per_domain,
                              max_total_concurrent, domain_delay_ms, eval_concurrency
                       FROM config WHERE id = 1"#,
                    [],
                    |row| {
                        Ok(AppConfig {
                            llm_api_key: row.get(0)?,
                            webhook_url: row.get(1)?,
                            llm_model: row.get(2)?,
                            score_threshold: row.get(3)?,
                            feed_fetch_concurrency: row.get::<_, i64>(4)? as usize,
                            max_concurrent_per_domain: row.get::<_, i64>(5)? as usize,
                            max_total_concurrent: row.get::<_, i64>(6)? as usize,
                            domain_delay_ms: row.get::<_, i64>(7)? as u64,
                            eval_concurrency: row.get::<_, i64>(8)? as usize,
                        })
                    },
                )?;
                Ok(config)
            })
            .await?;
        Ok(config)
    }

    pub async fn save_config(&self, config: AppConfig) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"UPDATE config SET
                           llm_api_key = ?1, webhook_url = ?2, llm_model = ?3,
                           score_threshold = ?4, feed_fetch_concurrency = ?5,
                           max_concurrent_per_domain = ?6, max_total_concurrent = ?7,
                           domain_delay_ms = ?8, eval_concurrency = ?9
                       WHERE id = 1"#,
                    params![
                        config.llm_api_key,
                        config.webhook_url,
                        config.llm_model,
                        config.score_threshold,
                        config.feed_fetch_concurrency as i64,
                        config.max_concurrent_per_domain as i64,
                        config.max_total_concurrent as i64,
                        config.domain_delay_ms as i64,
                        config.eval_concurrency as i64,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

const ARTICLE_COLUMNS: &str = "id, url, resolved_url, original_title, translated_title, summary, \
     short_summary, content, image_url, published_at, created_at, score_novelty, \
     score_importance, score_reliability, score_context_value, score_thought_provoking, \
     average_score";

const ERROR_COLUMNS: &str =
    "id, url, title_hint, error_message, stack_trace, phase, context, created_at";

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56+00:00")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

fn article_from_row(row: &Row) -> Article {
    Article {
        id: row.get(0).unwrap(),
        url: row.get(1).unwrap(),
        resolved_url: row.get(2).unwrap(),
        original_title: row.get(3).unwrap(),
        translated_title: row.get(4).unwrap(),
        summary: row.get(5).unwrap(),
        short_summary: row.get(6).unwrap(),
        content: row.get(7).unwrap(),
        image_url: row.get(8).unwrap(),
        published_at: row
            .get::<_, Option<String>>(9)
            .unwrap()
            .and_then(|s| parse_datetime(&s)),
        created_at: row
            .get::<_, String>(10)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
        score_novelty: row.get(11).unwrap(),
        score_importance: row.get(12).unwrap(),
        score_reliability: row.get(13).unwrap(),
        score_context_value: row.get(14).unwrap(),
        score_thought_provoking: row.get(15).unwrap(),
        average_score: row.get(16).unwrap(),
    }
}

fn error_from_row(row: &Row) -> ArticleError {
    ArticleError {
        id: row.get(0).unwrap(),
        url: row.get(1).unwrap(),
        title_hint: row.get(2).unwrap(),
        error_message: row.get(3).unwrap(),
        stack_trace: row.get(4).unwrap(),
        phase: Phase::parse(&row.get::<_, String>(5).unwrap()).unwrap_or(Phase::Crawl),
        context: row.get(6).unwrap(),
        created_at: row
            .get::<_, String>(7)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
    }
}

fn blocked_set(conn: &rusqlite::Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT domain FROM blocked_domains")?;
    let domains = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<HashSet<_>, _>>()?;
    Ok(domains)
}

fn filter_blocked(articles: Vec<Article>, blocked: &HashSet<String>) -> Vec<Article> {
    if blocked.is_empty() {
        return articles;
    }
    articles
        .into_iter()
        .filter(|a| match host_of(a.effective_url()) {
            Some(host) => !blocked.contains(&host),
            None => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scores;

    async fn open_repo() -> (Repository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let repo = Repository::new(path.to_str().unwrap()).await.unwrap();
        (repo, dir)
    }

    fn crawl_upsert(url: &str, content: &str) -> ArticleUpsert {
        ArticleUpsert {
            url: url.to_string(),
            original_title: Some("Title".to_string()),
            content: Some(content.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn seeds_singletons_with_defaults() {
        let (repo, _dir) = open_repo().await;

        let status = repo.get_status().await.unwrap();
        assert!(!status.is_crawling);
        assert_eq!(status.articles_processed, 0);
        assert_eq!(status.worker_pid, None);

        let config = repo.get_config().await.unwrap();
        assert_eq!(config.score_threshold, 3.5);
        assert_eq!(config.feed_fetch_concurrency, 5);
        assert_eq!(config.max_concurrent_per_domain, 2);
        assert_eq!(config.max_total_concurrent, 10);
        assert_eq!(config.domain_delay_ms, 1000);
        assert_eq!(config.eval_concurrency, 5);
    }

    #[tokio::test]
    async fn reopening_keeps_one_status_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let repo = Repository::new(path.to_str().unwrap()).await.unwrap();
        repo.update_status(StatusUpdate {
            articles_processed: Some(7),
            ..Default::default()
        })
        .await
        .unwrap();
        drop(repo);

        let repo = Repository::new(path.to_str().unwrap()).await.unwrap();
        let status = repo.get_status().await.unwrap();
        assert_eq!(status.articles_processed, 7);
    }

    #[tokio::test]
    async fn upsert_preserves_omitted_columns() {
        let (repo, _dir) = open_repo().await;

        repo.upsert_article(ArticleUpsert {
            url: "https://example.com/a".to_string(),
            resolved_url: Some("https://site.example/a".to_string()),
            original_title: Some("Original".to_string()),
            content: Some("x".repeat(400)),
            ..Default::default()
        })
        .await
        .unwrap();

        // Second write omits resolved_url and content: both must survive.
        repo.upsert_article(ArticleUpsert {
            url: "https://example.com/a".to_string(),
            translated_title: Some("翻訳タイトル".to_string()),
            summary: Some("summary".to_string()),
            short_summary: Some("short".to_string()),
            scores: Some(Scores {
                novelty: 5,
                importance: 4,
                reliability: 4,
                context_value: 3,
                thought_provoking: 5,
            }),
            average_score: Some(4.2),
            ..Default::default()
        })
        .await
        .unwrap();

        let article = repo
            .get_article_by_url("https://example.com/a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(article.resolved_url.as_deref(), Some("https://site.example/a"));
        assert_eq!(article.original_title.as_deref(), Some("Original"));
        assert_eq!(article.translated_title.as_deref(), Some("翻訳タイトル"));
        assert_eq!(article.content.as_deref().map(|c| c.len()), Some(400));
        assert_eq!(article.average_score, Some(4.2));
        assert_eq!(article.score_novelty, Some(5));
        assert_eq!(article.score_thought_provoking, Some(5));
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let (repo, _dir) = open_repo().await;

        let upsert = crawl_upsert("https://example.com/a", &"y".repeat(300));
        repo.upsert_article(upsert.clone()).await.unwrap();
        repo.upsert_article(upsert).await.unwrap();

        let articles = repo.get_articles(10).await.unwrap();
        assert_eq!(articles.len(), 1);
    }

    #[tokio::test]
    async fn unprocessed_respects_crawlable_boundary() {
        let (repo, _dir) = open_repo().await;

        // 199 chars: still crawlable even though evaluated.
        let mut short = crawl_upsert("https://example.com/short", &"a".repeat(199));
        short.average_score = Some(4.0);
        short.scores = Some(Scores {
            novelty: 4,
            importance: 4,
            reliability: 4,
            context_value: 4,
            thought_provoking: 4,
        });
        repo.upsert_article(short).await.unwrap();

        // Exactly 200 chars and evaluated: fully processed.
        let mut done = crawl_upsert("https://example.com/done", &"b".repeat(200));
        done.average_score = Some(4.0);
        done.scores = Some(Scores {
            novelty: 4,
            importance: 4,
            reliability: 4,
            context_value: 4,
            thought_provoking: 4,
        });
        repo.upsert_article(done).await.unwrap();

        // Long content but not evaluated.
        repo.upsert_article(crawl_upsert("https://example.com/uneval", &"c".repeat(300)))
            .await
            .unwrap();

        let unprocessed = repo.get_unprocessed_articles(10).await.unwrap();
        let urls: Vec<&str> = unprocessed.iter().map(|a| a.url.as_str()).collect();
        assert!(urls.contains(&"https://example.com/short"));
        assert!(urls.contains(&"https://example.com/uneval"));
        assert!(!urls.contains(&"https://example.com/done"));

        assert!(repo.is_fully_processed("https://example.com/done").await.unwrap());
        assert!(!repo.is_fully_processed("https://example.com/short").await.unwrap());
        assert!(!repo.is_fully_processed("https://example.com/missing").await.unwrap());
    }

    #[tokio::test]
    async fn blocked_domains_are_filtered_from_reads() {
        let (repo, _dir) = open_repo().await;

        repo.upsert_article(crawl_upsert("https://good.example/a", ""))
            .await
            .unwrap();
        repo.upsert_article(crawl_upsert("https://bad.example/b", ""))
            .await
            .unwrap();
        // Blocked via the resolved host, not the feed URL.
        repo.upsert_article(ArticleUpsert {
            url: "https://news.google.com/rss/articles/abc".to_string(),
            resolved_url: Some("https://bad.example/c".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

        repo.block_domain("bad.example", "DataDome bot protection")
            .await
            .unwrap();
        assert!(repo.is_domain_blocked("bad.example").await.unwrap());

        let unprocessed = repo.get_unprocessed_articles(10).await.unwrap();
        let urls: Vec<&str> = unprocessed.iter().map(|a| a.url.as_str()).collect();
        assert_eq!(urls, vec!["https://good.example/a"]);

        let all = repo.get_articles(10).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn block_domain_is_idempotent() {
        let (repo, _dir) = open_repo().await;
        repo.block_domain("x.example", "first").await.unwrap();
        repo.block_domain("x.example", "second").await.unwrap();
        let domains = repo.get_blocked_domains().await.unwrap();
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].reason, "first");
    }

    #[tokio::test]
    async fn error_records_replace_and_clear() {
        let (repo, _dir) = open_repo().await;

        repo.record_error(
            "https://example.com/a",
            Some("hint".to_string()),
            "Failed to reach source (Timeout)",
            None,
            Phase::Crawl,
            "domain-throttled crawl phase",
        )
        .await
        .unwrap();

        repo.record_error(
            "https://example.com/a",
            None,
            "AI returned invalid analysis data",
            None,
            Phase::Eval,
            "evaluation batch",
        )
        .await
        .unwrap();

        let errors = repo.recent_errors(50).await.unwrap();
        assert_eq!(errors.len(), 1);
        let error = &errors[0];
        assert_eq!(error.error_message, "AI returned invalid analysis data");
        assert_eq!(error.phase, Phase::Eval);

        repo.clear_error("https://example.com/a").await.unwrap();
        assert!(repo
            .get_error_by_url("https://example.com/a")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn status_partial_update_leaves_other_fields() {
        let (repo, _dir) = open_repo().await;

        repo.update_status(StatusUpdate {
            is_crawling: Some(true),
            worker_pid: Some(Some(1234)),
            current_task: Some("Initializing".to_string()),
            last_run: Some(Utc::now()),
            ..Default::default()
        })
        .await
        .unwrap();

        repo.update_status(StatusUpdate {
            current_task: Some("Phase 2: Crawling [3/10] (2 active, 5 queued)".to_string()),
            articles_processed: Some(3),
            ..Default::default()
        })
        .await
        .unwrap();

        let status = repo.get_status().await.unwrap();
        assert!(status.is_crawling);
        assert_eq!(status.worker_pid, Some(1234));
        assert_eq!(
            status.current_task.as_deref(),
            Some("Phase 2: Crawling [3/10] (2 active, 5 queued)")
        );
        assert_eq!(status.articles_processed, 3);

        // Clearing the pid needs the explicit Some(None).
        repo.update_status(StatusUpdate {
            is_crawling: Some(false),
            current_task: Some("Idle".to_string()),
            worker_pid: Some(None),
            ..Default::default()
        })
        .await
        .unwrap();

        let status = repo.get_status().await.unwrap();
        assert!(!status.is_crawling);
        assert_eq!(status.worker_pid, None);
    }

    #[tokio::test]
    async fn sources_are_unique_by_url() {
        let (repo, _dir) = open_repo().await;
        let first = repo
            .add_source("https://feeds.example/rss".to_string(), "Example".to_string())
            .await
            .unwrap();
        let second = repo
            .add_source("https://feeds.example/rss".to_string(), "Duplicate".to_string())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(repo.count_sources().await.unwrap(), 1);

        repo.delete_source(first).await.unwrap();
        assert_eq!(repo.count_sources().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn config_round_trip() {
        let (repo, _dir) = open_repo().await;
        let mut config = repo.get_config().await.unwrap();
        config.llm_api_key = Some("sk-test".to_string());
        config.webhook_url = Some("https://hooks.example/wh".to_string());
        config.score_threshold = 4.0;
        repo.save_config(config).await.unwrap();

        let config = repo.get_config().await.unwrap();
        assert_eq!(config.llm_api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.score_threshold, 4.0);
    }
}
