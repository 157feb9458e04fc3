use std::sync::Arc;

mod ai;
mod config;
mod db;
mod error;
mod feed;
mod models;
mod services;
mod worker;

use db::Repository;
use error::{AppError, Result};
use worker::{control, Worker};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (informational and up by default)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("status");

    let repo = Arc::new(Repository::new(&config::db_path()).await?);

    match command {
        "--crawl" | "crawl" => run_crawl(repo).await?,

        "start" => {
            let pid = control::start(&repo).await?;
            println!("Crawler worker started (PID {})", pid);
        }

        "stop" => {
            control::stop(&repo).await?;
            println!("Crawler worker stopped");
        }

        "status" => print_status(&repo).await?,

        "articles" => {
            let limit = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(20);
            let articles = repo.get_articles(limit).await?;
            println!("{}", serde_json::to_string_pretty(&articles)?);
        }

        "ingest" => {
            let url = args
                .get(2)
                .ok_or_else(|| AppError::Config("Usage: newslens ingest <url>".to_string()))?;
            match control::ingest(&repo, url).await? {
                Some(article) => println!("{}", serde_json::to_string_pretty(&article)?),
                None => println!("No article stored for {}", url),
            }
        }

        "retry" => {
            let id: i64 = args
                .get(2)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| AppError::Config("Usage: newslens retry <id>".to_string()))?;
            match control::retry(&repo, id).await? {
                Some(article) => println!("{}", serde_json::to_string_pretty(&article)?),
                None => println!("No article stored"),
            }
        }

        "source" => source_command(&repo, &args[2..]).await?,

        "config" => config_command(&repo, &args[2..]).await?,

        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
        }
    }

    Ok(())
}

/// Run one full crawl cycle in-process. SIGTERM/SIGINT cancel the task
/// graph; the worker still runs its teardown before exiting.
async fn run_crawl(repo: Arc<Repository>) -> Result<()> {
    let worker = Worker::new(repo);
    let cancel = worker.cancel_token();

    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        tracing::info!("Stop requested, finishing in-flight work");
        cancel.cancel();
    });

    worker.run().await
}

async fn print_status(repo: &Arc<Repository>) -> Result<()> {
    let (status, errors) = control::status(repo).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    if !errors.is_empty() {
        println!("\nRecent errors:");
        for error in errors {
            println!("  [{}] {} - {}", error.phase.as_str(), error.url, error.error_message);
        }
    }

    let blocked = repo.get_blocked_domains().await?;
    if !blocked.is_empty() {
        println!("\nBlocked domains:");
        for domain in blocked {
            println!("  {} ({})", domain.domain, domain.reason);
        }
    }
    Ok(())
}

async fn source_command(repo: &Arc<Repository>, args: &[String]) -> Result<()> {
    match args.first().map(|s| s.as_str()) {
        Some("add") => {
            let url = args
                .get(1)
                .ok_or_else(|| AppError::Config("Usage: newslens source add <url> [name]".to_string()))?;
            let name = args.get(2).cloned().unwrap_or_else(|| url.clone());
            let id = repo.add_source(url.clone(), name).await?;
            println!("Source {} added (id {})", url, id);
        }
        Some("rm") => {
            let id: i64 = args
                .get(1)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| AppError::Config("Usage: newslens source rm <id>".to_string()))?;
            repo.delete_source(id).await?;
            println!("Source {} removed", id);
        }
        Some("list") | None => {
            for source in repo.get_all_sources().await? {
                println!("{}\t{}\t{}", source.id, source.name, source.url);
            }
        }
        Some(other) => {
            return Err(AppError::Config(format!("Unknown source command: {}", other)));
        }
    }
    Ok(())
}

async fn config_command(repo: &Arc<Repository>, args: &[String]) -> Result<()> {
    let mut config = repo.get_config().await?;

    let (Some(key), Some(value)) = (args.first(), args.get(1)) else {
        println!("{:#?}", config);
        return Ok(());
    };

    match key.as_str() {
        "llm_api_key" => config.llm_api_key = Some(value.clone()),
        "webhook_url" => config.webhook_url = Some(value.clone()),
        "llm_model" => config.llm_model = value.clone(),
        "score_threshold" => config.score_threshold = parse_value(key, value)?,
        "feed_fetch_concurrency" => config.feed_fetch_concurrency = parse_value(key, value)?,
        "max_concurrent_per_domain" => config.max_concurrent_per_domain = parse_value(key, value)?,
        "max_total_concurrent" => config.max_total_concurrent = parse_value(key, value)?,
        "domain_delay_ms" => config.domain_delay_ms = parse_value(key, value)?,
        "eval_concurrency" => config.eval_concurrency = parse_value(key, value)?,
        other => return Err(AppError::Config(format!("Unknown config key: {}", other))),
    }

    repo.save_config(config).await?;
    println!("Updated {}", key);
    Ok(())
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| AppError::Config(format!("Invalid value for {}: {}", key, value)))
}

fn print_usage() {
    eprintln!("Usage: newslens <command>");
    eprintln!("  crawl                     run one ingestion cycle in-process");
    eprintln!("  start | stop | status     control the detached worker");
    eprintln!("  articles [limit]          list stored articles");
    eprintln!("  ingest <url>              crawl and evaluate one URL now");
    eprintln!("  retry <id>                re-run the pipeline for an article or error id");
    eprintln!("  source add|rm|list        manage feed sources");
    eprintln!("  config [key value]        show or update runtime configuration");
}
