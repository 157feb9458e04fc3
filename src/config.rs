/// Resolve the database path from the environment.
///
/// Runtime knobs (credentials, concurrency limits, thresholds) live in the
/// `config` row of the database itself; only the store location comes from
/// the environment.
pub fn db_path() -> String {
    std::env::var("DB_PATH").unwrap_or_else(|_| "./rss_reader.db".to_string())
}
