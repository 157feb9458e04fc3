pub const SCHEMA: &str = r#"
-- sources table
CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sources_url ON sources(url);

-- articles table (url is the canonical identity)
CREATE TABLE IF NOT EXISTS articles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL UNIQUE,
    resolved_url TEXT,
    original_title TEXT,
    translated_title TEXT,
    summary TEXT,
    short_summary TEXT,
    content TEXT,
    image_url TEXT,
    published_at TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    score_novelty INTEGER,
    score_importance INTEGER,
    score_reliability INTEGER,
    score_context_value INTEGER,
    score_thought_provoking INTEGER,
    average_score REAL
);

CREATE INDEX IF NOT EXISTS idx_articles_url ON articles(url);
CREATE INDEX IF NOT EXISTS idx_articles_created_at ON articles(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_articles_average_score ON articles(average_score);

-- article_errors table (one record per failing url)
CREATE TABLE IF NOT EXISTS article_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL UNIQUE,
    title_hint TEXT,
    error_message TEXT NOT NULL,
    stack_trace TEXT,
    phase TEXT NOT NULL,
    context TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- blocked_domains table
CREATE TABLE IF NOT EXISTS blocked_domains (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL UNIQUE,
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- crawler_status singleton
CREATE TABLE IF NOT EXISTS crawler_status (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    is_crawling INTEGER NOT NULL DEFAULT 0,
    last_run TEXT,
    current_task TEXT,
    articles_processed INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    worker_pid INTEGER
);

-- config singleton
CREATE TABLE IF NOT EXISTS config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    llm_api_key TEXT,
    webhook_url TEXT,
    llm_model TEXT NOT NULL DEFAULT 'gpt-4o-mini',
    score_threshold REAL NOT NULL DEFAULT 3.5,
    feed_fetch_concurrency INTEGER NOT NULL DEFAULT 5,
    max_concurrent_per_domain INTEGER NOT NULL DEFAULT 2,
    max_total_concurrent INTEGER NOT NULL DEFAULT 10,
    domain_delay_ms INTEGER NOT NULL DEFAULT 1000,
    eval_concurrency INTEGER NOT NULL DEFAULT 5
);
"#;

/// Columns added after the initial schema shipped. Applied additively on
/// open when missing, so older databases upgrade in place.
pub const MIGRATIONS: &[(&str, &str, &str)] = &[
    ("articles", "resolved_url", "TEXT"),
    ("articles", "translated_title", "TEXT"),
    ("articles", "short_summary", "TEXT"),
    ("articles", "image_url", "TEXT"),
    ("articles", "score_novelty", "INTEGER"),
    ("articles", "score_importance", "INTEGER"),
    ("articles", "score_reliability", "INTEGER"),
    ("articles", "score_context_value", "INTEGER"),
    ("articles", "score_thought_provoking", "INTEGER"),
    ("articles", "average_score", "REAL"),
    ("article_errors", "title_hint", "TEXT"),
    ("article_errors", "stack_trace", "TEXT"),
    ("article_errors", "context", "TEXT"),
    ("crawler_status", "worker_pid", "INTEGER"),
    ("config", "llm_model", "TEXT NOT NULL DEFAULT 'gpt-4o-mini'"),
    ("config", "eval_concurrency", "INTEGER NOT NULL DEFAULT 5"),
];
