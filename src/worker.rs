//! Worker process: queue consumers plus everything sandbox-adjacent.
//!
//! Startup sequence: open the shared store, connect the sandbox runtime,
//! bootstrap the toolchain volume (logged, never fatal), sweep stale clone
//! directories left behind by a crash, then run the two consumers: scans at
//! concurrency 2 (read-only clones), improvements at concurrency 1 (the
//! serialization discipline for clone-and-generate). Ctrl-c stops consumers
//! between jobs; a dequeued job always runs to a terminal state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::db::{BotDb, DbHandle};
use crate::generator::{AIGenerator, GeminiCliBackend, GeneratorBackend, TestGenerator};
use crate::host::{GithubHost, RepositoryHost};
use crate::improve::ImproveCoverageUseCase;
use crate::queue::{IMPROVE_QUEUE, ImprovePayload, QueueJob, SCAN_QUEUE, ScanPayload, spawn_consumers};
use crate::sandbox::SandboxRunner;
use crate::scanner::CoverageScanner;
use crate::validator::{TestValidator, Validator};

const STALE_CLONE_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub async fn run_worker(config: Config) -> Result<()> {
    let db = DbHandle::new(BotDb::new(&config.db_path)?);

    let sandbox = SandboxRunner::connect(&config.sandbox_image)
        .await
        .context("Docker daemon unreachable; the worker cannot run sandboxed jobs")?;
    let sandbox = Arc::new(sandbox);

    if let Err(e) = sandbox.ensure_toolchain().await {
        eprintln!(
            "[worker] Toolchain bootstrap failed: {:#}; per-job runs will fail until resolved",
            e
        );
    }

    sweep_stale_clones(&config.clone_base_path).await;

    let host: Arc<dyn RepositoryHost> = Arc::new(GithubHost::new(
        config.github_token.clone(),
        config.clone_base_path.clone(),
    ));
    let scanner = Arc::new(CoverageScanner::new(Arc::clone(&sandbox)));
    let validator: Arc<dyn Validator> = Arc::new(TestValidator::new(Arc::clone(&sandbox)));
    let backend: Arc<dyn GeneratorBackend> = Arc::new(GeminiCliBackend::new(
        Arc::clone(&sandbox),
        config.gemini_model.clone(),
        config.gemini_api_key.clone(),
    ));
    let generator: Arc<dyn TestGenerator> = Arc::new(AIGenerator::new(backend, validator));
    let usecase = Arc::new(ImproveCoverageUseCase::new(
        db.clone(),
        Arc::clone(&host),
        generator,
    ));

    let scan_depth = db.call(|db| db.queue_depth(SCAN_QUEUE)).await.unwrap_or(0);
    let improve_depth = db.call(|db| db.queue_depth(IMPROVE_QUEUE)).await.unwrap_or(0);
    eprintln!(
        "[worker] Started, queued work: scan={}, improve={}",
        scan_depth, improve_depth
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            eprintln!("\n[worker] Shutting down after in-flight jobs...");
            shutdown.store(true, Ordering::Relaxed);
        });
    }

    let scan_handler = {
        let db = db.clone();
        let host = Arc::clone(&host);
        let scanner = Arc::clone(&scanner);
        move |job: QueueJob| {
            let db = db.clone();
            let host = Arc::clone(&host);
            let scanner = Arc::clone(&scanner);
            async move { handle_scan_job(db, host, scanner, job).await }
        }
    };
    let improve_handler = {
        let usecase = Arc::clone(&usecase);
        move |job: QueueJob| {
            let usecase = Arc::clone(&usecase);
            async move {
                let payload: ImprovePayload = serde_json::from_str(&job.payload)
                    .with_context(|| format!("Corrupt improve payload: {}", job.payload))?;
                usecase.execute(&payload.job_id).await
            }
        }
    };

    let mut handles = spawn_consumers(db.clone(), SCAN_QUEUE, 2, Arc::clone(&shutdown), scan_handler);
    handles.extend(spawn_consumers(
        db.clone(),
        IMPROVE_QUEUE,
        1,
        Arc::clone(&shutdown),
        improve_handler,
    ));

    for handle in handles {
        let _ = handle.await;
    }
    eprintln!("[worker] Stopped");
    Ok(())
}

/// One scan: clone read-only, measure, write the snapshot atomically,
/// reclaim the clone. An Err propagates to the queue for its retry policy
/// and leaves the repository's stored report untouched.
async fn handle_scan_job(
    db: DbHandle,
    host: Arc<dyn RepositoryHost>,
    scanner: Arc<CoverageScanner>,
    job: QueueJob,
) -> Result<()> {
    let payload: ScanPayload = serde_json::from_str(&job.payload)
        .with_context(|| format!("Corrupt scan payload: {}", job.payload))?;

    let repo = {
        let id = payload.repo_id.clone();
        db.call(move |db| db.get_repository(&id)).await?
    };
    let repo = match repo {
        Some(repo) => repo,
        None => {
            eprintln!("[scan] Repository {} not found, dropping", payload.repo_id);
            return Ok(());
        }
    };

    let path = host
        .clone_repository(&repo.url, None)
        .await
        .with_context(|| format!("Failed to clone {}", repo.url))?;

    let scan_result = scanner.scan(&path).await;

    let outcome = match scan_result {
        Ok(report) => {
            eprintln!(
                "[scan] {} measured: {} files",
                repo.url,
                report.len()
            );
            let id = repo.id.clone();
            db.call(move |db| db.set_coverage_report(&id, &report)).await
        }
        Err(e) => Err(anyhow::Error::from(e).context(format!("Scan of {} failed", repo.url))),
    };

    if let Err(e) = host.cleanup(&path).await {
        eprintln!("[scan] Cleanup of {} failed: {}", path.display(), e);
    }

    outcome
}

/// Crash recovery: clone directories whose cleanup never ran are reclaimed
/// once they are a day old.
async fn sweep_stale_clones(clone_base: &std::path::Path) {
    let entries = match std::fs::read_dir(clone_base) {
        Ok(e) => e,
        Err(_) => return,
    };
    let now = std::time::SystemTime::now();
    let mut swept = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| now.duration_since(m).ok());
        if let Some(age) = age {
            if age > STALE_CLONE_AGE {
                if tokio::fs::remove_dir_all(&path).await.is_ok() {
                    swept += 1;
                }
            }
        }
    }
    if swept > 0 {
        eprintln!("[worker] Swept {} stale clone directories", swept);
    }
}
