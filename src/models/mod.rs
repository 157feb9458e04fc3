use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A syndication feed registered by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub url: String,
    pub name: String,
}

/// A unit of content identified by its feed-given URL.
///
/// Fields populate in two stages: the crawl fills `resolved_url`,
/// `original_title`, `content`, `image_url` and `published_at`; the
/// evaluation fills the translated/summary/score fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub url: String,
    pub resolved_url: Option<String>,
    pub original_title: Option<String>,
    pub translated_title: Option<String>,
    pub summary: Option<String>,
    pub short_summary: Option<String>,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub score_novelty: Option<i64>,
    pub score_importance: Option<i64>,
    pub score_reliability: Option<i64>,
    pub score_context_value: Option<i64>,
    pub score_thought_provoking: Option<i64>,
    pub average_score: Option<f64>,
}

impl Article {
    /// An article still needs its content fetched while the stored text is
    /// missing or shorter than 200 characters (exactly 200 is enough).
    pub fn is_crawlable(&self) -> bool {
        match &self.content {
            None => true,
            Some(content) => content.chars().count() < 200,
        }
    }

    pub fn is_evaluated(&self) -> bool {
        self.average_score.is_some()
    }

    /// The URL used for host-level decisions: the resolved target when
    /// known, the feed-given URL otherwise.
    pub fn effective_url(&self) -> &str {
        self.resolved_url.as_deref().unwrap_or(&self.url)
    }
}

/// Column set for the upsert-on-url write. `None` means "not supplied":
/// the stored value is preserved on conflict.
#[derive(Debug, Clone, Default)]
pub struct ArticleUpsert {
    pub url: String,
    pub resolved_url: Option<String>,
    pub original_title: Option<String>,
    pub translated_title: Option<String>,
    pub summary: Option<String>,
    pub short_summary: Option<String>,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub scores: Option<Scores>,
    pub average_score: Option<f64>,
}

/// Pipeline stage an error was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Crawl,
    Eval,
    Notify,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Crawl => "CRAWL",
            Phase::Eval => "EVAL",
            Phase::Notify => "NOTIFY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CRAWL" => Some(Phase::Crawl),
            "EVAL" => Some(Phase::Eval),
            "NOTIFY" => Some(Phase::Notify),
            _ => None,
        }
    }
}

/// Durable failure record, one per URL; newer failures replace older ones.
#[derive(Debug, Clone)]
pub struct ArticleError {
    pub id: i64,
    pub url: String,
    pub title_hint: Option<String>,
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub phase: Phase,
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A host recorded as hostile; never fetched, never surfaced in reads.
#[derive(Debug, Clone)]
pub struct BlockedDomain {
    pub id: i64,
    pub domain: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// The singleton crawler-status row.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlerStatus {
    pub is_crawling: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub current_task: Option<String>,
    pub articles_processed: i64,
    pub last_error: Option<String>,
    pub worker_pid: Option<i64>,
}

/// Partial update of the crawler-status row; only provided fields change.
/// `worker_pid` is doubly optional so `Some(None)` can clear the column.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub is_crawling: Option<bool>,
    pub last_run: Option<DateTime<Utc>>,
    pub current_task: Option<String>,
    pub articles_processed: Option<i64>,
    pub last_error: Option<String>,
    pub worker_pid: Option<Option<i64>>,
}

/// The singleton runtime configuration row.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm_api_key: Option<String>,
    pub webhook_url: Option<String>,
    pub llm_model: String,
    pub score_threshold: f64,
    pub feed_fetch_concurrency: usize,
    pub max_concurrent_per_domain: usize,
    pub max_total_concurrent: usize,
    pub domain_delay_ms: u64,
    pub eval_concurrency: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm_api_key: None,
            webhook_url: None,
            llm_model: "gpt-4o-mini".to_string(),
            score_threshold: 3.5,
            feed_fetch_concurrency: 5,
            max_concurrent_per_domain: 2,
            max_total_concurrent: 10,
            domain_delay_ms: 1000,
            eval_concurrency: 5,
        }
    }
}

/// A candidate article emitted by the feed collector.
#[derive(Debug, Clone)]
pub struct CollectedArticle {
    pub url: String,
    pub resolved_url: Option<String>,
    pub title: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub feed_source: String,
}

impl CollectedArticle {
    pub fn effective_url(&self) -> &str {
        self.resolved_url.as_deref().unwrap_or(&self.url)
    }
}

/// The five integer scores returned by the evaluator, each in 1..=5.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scores {
    pub novelty: i64,
    pub importance: i64,
    pub reliability: i64,
    pub context_value: i64,
    pub thought_provoking: i64,
}

impl Scores {
    pub fn average(&self) -> f64 {
        (self.novelty
            + self.importance
            + self.reliability
            + self.context_value
            + self.thought_provoking) as f64
            / 5.0
    }
}

/// Validated evaluator output for one article.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub translated_title: String,
    pub summary: String,
    pub short_summary: String,
    pub scores: Scores,
    pub average_score: f64,
}

/// Host portion of a URL, used as the key for blocking and throttling.
pub fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article_with_content(content: Option<&str>) -> Article {
        Article {
            id: 1,
            url: "https://example.com/a".into(),
            resolved_url: None,
            original_title: None,
            translated_title: None,
            summary: None,
            short_summary: None,
            content: content.map(|c| c.to_string()),
            image_url: None,
            published_at: None,
            created_at: Utc::now(),
            score_novelty: None,
            score_importance: None,
            score_reliability: None,
            score_context_value: None,
            score_thought_provoking: None,
            average_score: None,
        }
    }

    #[test]
    fn crawlable_boundary_is_strict() {
        assert!(article_with_content(None).is_crawlable());
        assert!(article_with_content(Some(&"x".repeat(199))).is_crawlable());
        // Exactly 200 characters counts as fetched.
        assert!(!article_with_content(Some(&"x".repeat(200))).is_crawlable());
    }

    #[test]
    fn scores_average() {
        let scores = Scores {
            novelty: 5,
            importance: 4,
            reliability: 4,
            context_value: 3,
            thought_provoking: 5,
        };
        assert!((scores.average() - 4.2).abs() < f64::EPSILON);
    }

    #[test]
    fn host_extraction() {
        assert_eq!(
            host_of("https://news.example.com/a/b?c=d"),
            Some("news.example.com".to_string())
        );
        assert_eq!(host_of("not a url"), None);
    }
}
