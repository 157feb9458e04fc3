use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Feed parse error: {0}")]
    FeedParse(#[from] feed_rs::parser::ParseFeedError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("LLM API error: {0}")]
    LlmApi(String),

    #[error(transparent)]
    Crawl(#[from] CrawlError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Per-item pipeline failure. The Display string is what ends up in
/// `article_errors.error_message` and in API responses.
#[derive(Debug, Clone, Error)]
pub enum CrawlError {
    #[error("Failed to reach source (Timeout)")]
    Timeout,

    #[error("Article not found (404)")]
    NotFound,

    #[error("Domain blocked: {0}")]
    Blocked(String),

    #[error("Could not extract readable text from page")]
    ReadabilityFailed,

    #[error("AI returned invalid analysis data")]
    InvalidLlmResponse,

    #[error("{0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl CrawlError {
    /// Map a reqwest failure onto the pipeline error kinds.
    pub fn from_request(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return CrawlError::Timeout;
        }
        let mut message = err.to_string();
        if let Some(status) = err.status() {
            message = format!(
                "{} (HTTP {} {})",
                message,
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            );
        }
        if let Some(source) = std::error::Error::source(err) {
            message = format!("{} [{}]", message, source);
        }
        CrawlError::Transport(message)
    }

    /// Transport error for a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        CrawlError::Transport(format!(
            "Request failed (HTTP {} {})",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crawl_error_messages_are_stable() {
        assert_eq!(
            CrawlError::Timeout.to_string(),
            "Failed to reach source (Timeout)"
        );
        assert_eq!(
            CrawlError::NotFound.to_string(),
            "Article not found (404)"
        );
        assert_eq!(
            CrawlError::Blocked("example.com".into()).to_string(),
            "Domain blocked: example.com"
        );
        assert_eq!(
            CrawlError::ReadabilityFailed.to_string(),
            "Could not extract readable text from page"
        );
        assert_eq!(
            CrawlError::InvalidLlmResponse.to_string(),
            "AI returned invalid analysis data"
        );
    }

    #[test]
    fn transport_from_status_includes_code_and_reason() {
        let err = CrawlError::from_status(reqwest::StatusCode::BAD_GATEWAY);
        assert_eq!(err.to_string(), "Request failed (HTTP 502 Bad Gateway)");
    }
}
