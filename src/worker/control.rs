use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::db::Repository;
use crate::error::Result;
use crate::models::{Article, ArticleError, CrawlerStatus, StatusUpdate};

/// Liveness probe: a PID is alive when signal 0 can be delivered (or is
/// refused with EPERM, which still proves the process exists).
pub fn pid_is_alive(pid: i64) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

fn send_sigterm(pid: i64) {
    unsafe {
        // Group first (the worker is spawned detached in its own group),
        // then the process itself.
        libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

/// Spawn the worker as a detached child running `--crawl` and record its
/// PID in the lease row. Refuses while a live worker holds the lease.
pub async fn start(repo: &Arc<Repository>) -> Result<i64> {
    let status = repo.get_status().await?;
    if status.is_crawling {
        if let Some(pid) = status.worker_pid {
            if pid_is_alive(pid) {
                return Err(crate::error::AppError::Config(format!(
                    "Crawler already running (PID {})",
                    pid
                )));
            }
        }
        tracing::warn!("Stale crawler lease found, taking over");
    }

    let exe = std::env::current_exe()?;
    let child = Command::new(exe)
        .arg("--crawl")
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let pid = child.id() as i64;
    repo.update_status(StatusUpdate {
        is_crawling: Some(true),
        worker_pid: Some(Some(pid)),
        current_task: Some("Starting".to_string()),
        ..Default::default()
    })
    .await?;

    tracing::info!("Crawler worker started (PID {})", pid);
    Ok(pid)
}

/// Terminate the worker's process group and clear the lease.
pub async fn stop(repo: &Arc<Repository>) -> Result<()> {
    let status = repo.get_status().await?;
    if let Some(pid) = status.worker_pid {
        send_sigterm(pid);
        tracing::info!("Sent SIGTERM to worker PID {} and its group", pid);
    }

    repo.update_status(StatusUpdate {
        is_crawling: Some(false),
        current_task: Some("Idle".to_string()),
        worker_pid: Some(None),
        ..Default::default()
    })
    .await?;
    Ok(())
}

/// The status singleton plus the latest 50 failure records.
pub async fn status(repo: &Arc<Repository>) -> Result<(CrawlerStatus, Vec<ArticleError>)> {
    let status = repo.get_status().await?;
    let errors = repo.recent_errors(50).await?;
    Ok((status, errors))
}

/// Run the full crawl + evaluate pipeline for a single URL, bypassing the
/// phased cycle but reusing its machinery.
pub async fn ingest(repo: &Arc<Repository>, url: &str) -> Result<Option<Article>> {
    let worker = super::Worker::new(repo.clone());
    worker.process_single(url).await?;
    repo.get_article_by_url(url).await
}

/// Re-run the pipeline for an article id, or failing that an error id.
pub async fn retry(repo: &Arc<Repository>, id: i64) -> Result<Option<Article>> {
    let url = if let Some(article) = repo.get_article_by_id(id).await? {
        article.url
    } else if let Some(error) = repo.get_error_by_id(id).await? {
        error.url
    } else {
        return Err(crate::error::AppError::Config(format!(
            "No article or error with id {}",
            id
        )));
    };
    ingest(repo, &url).await
}
