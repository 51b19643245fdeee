//! Durable work queues on the shared SQLite store.
//!
//! Two named queues distribute work from the API process to the worker:
//! `scan` (payload `{repoId}`, consumer concurrency 2) and `improve`
//! (payload `{jobId}`, consumer concurrency 1). Enqueues are idempotent on
//! `(queue, job_key)` while the row is retained; failed attempts retry with
//! exponential backoff from a 5 second base, bounded at 2 attempts; the last
//! 100 terminal rows per queue are kept for inspection.
//!
//! The improve queue's concurrency of 1 is the serialization discipline: at
//! most one clone-and-generate exists at a time per worker, so two jobs on
//! the same repository can never race on a clone directory.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::db::{BotDb, DbHandle};
use crate::models::now_rfc3339;

pub const SCAN_QUEUE: &str = "scan";
pub const IMPROVE_QUEUE: &str = "improve";

pub const MAX_ATTEMPTS: u32 = 2;
pub const BACKOFF_BASE_SECS: i64 = 5;
const RETAIN_TERMINAL_ROWS: i64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanPayload {
    pub repo_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImprovePayload {
    pub job_id: String,
}

/// Job key for a scan enqueue: second-granularity timestamp suffix, so rapid
/// duplicate triggers for the same repository collapse into one job.
pub fn scan_job_key(repo_id: &str) -> String {
    format!("scan-{}-{}", repo_id, chrono::Utc::now().timestamp())
}

/// One claimed unit of work handed to a consumer. Queue rows move through
/// `queued → active → completed | failed`, with `failed` attempts requeued
/// while attempts remain.
#[derive(Debug, Clone)]
pub struct QueueJob {
    pub id: i64,
    pub queue: String,
    pub job_key: String,
    pub payload: String,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl BotDb {
    /// Enqueue a payload. Returns false when a row with the same
    /// `(queue, job_key)` already exists — the duplicate is absorbed.
    pub fn enqueue(&self, queue: &str, job_key: &str, payload: &str) -> Result<bool> {
        let now = now_rfc3339();
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO queue_jobs
                    (queue, job_key, payload, status, attempts, max_attempts,
                     run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5, ?5, ?5)",
                params![queue, job_key, payload, MAX_ATTEMPTS, now],
            )
            .context("Failed to enqueue job")?;
        Ok(inserted > 0)
    }

    /// Claim the oldest runnable job on `queue`, marking it active and
    /// counting the attempt. Returns None when nothing is due.
    pub fn claim_next(&self, queue: &str) -> Result<Option<QueueJob>> {
        let now = now_rfc3339();
        let row: Option<(i64, String, String, u32, u32)> = self
            .conn
            .query_row(
                "SELECT id, job_key, payload, attempts, max_attempts FROM queue_jobs
                 WHERE queue = ?1 AND status = 'queued' AND run_at <= ?2
                 ORDER BY id LIMIT 1",
                params![queue, now],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query next queue job")?;

        let (id, job_key, payload, attempts, max_attempts) = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        self.conn
            .execute(
                "UPDATE queue_jobs
                 SET status = 'active', attempts = attempts + 1, updated_at = ?1
                 WHERE id = ?2",
                params![now_rfc3339(), id],
            )
            .context("Failed to claim queue job")?;

        Ok(Some(QueueJob {
            id,
            queue: queue.to_string(),
            job_key,
            payload,
            attempts: attempts + 1,
            max_attempts,
        }))
    }

    pub fn complete_queue_job(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE queue_jobs SET status = 'completed', updated_at = ?1 WHERE id = ?2",
                params![now_rfc3339(), id],
            )
            .context("Failed to complete queue job")?;
        self.prune_terminal_rows()
    }

    /// Record a failed attempt: requeue with backoff while attempts remain,
    /// otherwise park the job as failed with its last error.
    pub fn fail_queue_job(&self, job: &QueueJob, error: &str) -> Result<()> {
        if job.attempts < job.max_attempts {
            let delay = BACKOFF_BASE_SECS << job.attempts.saturating_sub(1);
            let run_at = (chrono::Utc::now() + chrono::Duration::seconds(delay))
                .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
            self.conn
                .execute(
                    "UPDATE queue_jobs
                     SET status = 'queued', run_at = ?1, last_error = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![run_at, error, now_rfc3339(), job.id],
                )
                .context("Failed to requeue job")?;
        } else {
            self.conn
                .execute(
                    "UPDATE queue_jobs
                     SET status = 'failed', last_error = ?1, updated_at = ?2
                     WHERE id = ?3",
                    params![error, now_rfc3339(), job.id],
                )
                .context("Failed to park queue job")?;
            self.prune_terminal_rows()?;
        }
        Ok(())
    }

    pub fn queue_depth(&self, queue: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM queue_jobs WHERE queue = ?1 AND status IN ('queued', 'active')",
                params![queue],
                |row| row.get(0),
            )
            .context("Failed to count queue depth")
    }

    fn prune_terminal_rows(&self) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM queue_jobs
                 WHERE status IN ('completed', 'failed')
                   AND id NOT IN (
                     SELECT id FROM queue_jobs q2
                     WHERE q2.queue = queue_jobs.queue
                       AND q2.status IN ('completed', 'failed')
                     ORDER BY q2.id DESC LIMIT ?1
                   )",
                params![RETAIN_TERMINAL_ROWS],
            )
            .context("Failed to prune terminal queue rows")?;
        Ok(())
    }
}

const POLL_INTERVAL_MS: u64 = 500;

/// Run `concurrency` consumer tasks draining `queue` until `shutdown` is
/// set. Each handler outcome maps to the queue's retry policy: Ok completes
/// the job, Err records the attempt and backs off or parks it.
pub fn spawn_consumers<F, Fut>(
    db: DbHandle,
    queue: &'static str,
    concurrency: usize,
    shutdown: Arc<AtomicBool>,
    handler: F,
) -> Vec<tokio::task::JoinHandle<()>>
where
    F: Fn(QueueJob) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    let mut handles = Vec::with_capacity(concurrency);
    for slot in 0..concurrency {
        let db = db.clone();
        let shutdown = Arc::clone(&shutdown);
        let handler = handler.clone();
        handles.push(tokio::spawn(async move {
            while !shutdown.load(Ordering::Relaxed) {
                let claimed = db.call(move |db| db.claim_next(queue)).await;
                let job = match claimed {
                    Ok(Some(job)) => job,
                    Ok(None) => {
                        tokio::time::sleep(std::time::Duration::from_millis(POLL_INTERVAL_MS))
                            .await;
                        continue;
                    }
                    Err(e) => {
                        eprintln!("[queue] {}#{}: claim failed: {:#}", queue, slot, e);
                        tokio::time::sleep(std::time::Duration::from_millis(POLL_INTERVAL_MS))
                            .await;
                        continue;
                    }
                };

                let outcome = handler(job.clone()).await;
                let record = {
                    let job = job.clone();
                    match outcome {
                        Ok(()) => db.call(move |db| db.complete_queue_job(job.id)).await,
                        Err(e) => {
                            let msg = format!("{:#}", e);
                            eprintln!(
                                "[queue] {}#{}: job {} attempt {}/{} failed: {}",
                                queue, slot, job.job_key, job.attempts, job.max_attempts, msg
                            );
                            db.call(move |db| db.fail_queue_job(&job, &msg)).await
                        }
                    }
                };
                if let Err(e) = record {
                    eprintln!(
                        "[queue] {}#{}: failed to record outcome for {}: {:#}",
                        queue, slot, job.job_key, e
                    );
                }
            }
        }));
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::BotDb;

    #[test]
    fn test_enqueue_and_claim() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        assert!(db.enqueue(SCAN_QUEUE, "scan-r1-1", r#"{"repoId":"r1"}"#)?);

        let job = db.claim_next(SCAN_QUEUE)?.expect("job should be claimable");
        assert_eq!(job.job_key, "scan-r1-1");
        assert_eq!(job.payload, r#"{"repoId":"r1"}"#);
        assert_eq!(job.attempts, 1);

        // Active jobs are not claimable again.
        assert!(db.claim_next(SCAN_QUEUE)?.is_none());
        Ok(())
    }

    #[test]
    fn test_duplicate_job_key_absorbed() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        assert!(db.enqueue(SCAN_QUEUE, "scan-r1-1", "{}")?);
        assert!(!db.enqueue(SCAN_QUEUE, "scan-r1-1", "{}")?);
        assert_eq!(db.queue_depth(SCAN_QUEUE)?, 1);
        Ok(())
    }

    #[test]
    fn test_same_key_on_different_queues_is_distinct() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        assert!(db.enqueue(SCAN_QUEUE, "k", "{}")?);
        assert!(db.enqueue(IMPROVE_QUEUE, "k", "{}")?);
        Ok(())
    }

    #[test]
    fn test_failed_attempt_requeues_with_backoff() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        db.enqueue(IMPROVE_QUEUE, "j1", "{}")?;

        let job = db.claim_next(IMPROVE_QUEUE)?.unwrap();
        db.fail_queue_job(&job, "clone failed")?;

        // Requeued, but the backoff pushes run_at into the future.
        let (status, run_at): (String, String) = db.conn.query_row(
            "SELECT status, run_at FROM queue_jobs WHERE id = ?1",
            params![job.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!(status, "queued");
        assert!(run_at > now_rfc3339());
        assert!(db.claim_next(IMPROVE_QUEUE)?.is_none());
        Ok(())
    }

    #[test]
    fn test_exhausted_attempts_park_as_failed() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        db.enqueue(IMPROVE_QUEUE, "j1", "{}")?;

        let first = db.claim_next(IMPROVE_QUEUE)?.unwrap();
        db.fail_queue_job(&first, "attempt 1")?;

        // Make the retry due immediately.
        db.conn.execute(
            "UPDATE queue_jobs SET run_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), first.id],
        )?;
        let second = db.claim_next(IMPROVE_QUEUE)?.unwrap();
        assert_eq!(second.attempts, 2);
        db.fail_queue_job(&second, "attempt 2")?;

        let (status, last_error): (String, String) = db.conn.query_row(
            "SELECT status, last_error FROM queue_jobs WHERE id = ?1",
            params![first.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!(status, "failed");
        assert_eq!(last_error, "attempt 2");
        Ok(())
    }

    #[test]
    fn test_completed_rows_pruned_beyond_retention() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        for i in 0..110 {
            db.enqueue(SCAN_QUEUE, &format!("k{}", i), "{}")?;
            let job = db.claim_next(SCAN_QUEUE)?.unwrap();
            db.complete_queue_job(job.id)?;
        }
        let terminal: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM queue_jobs WHERE queue = ?1 AND status = 'completed'",
            params![SCAN_QUEUE],
            |row| row.get(0),
        )?;
        assert_eq!(terminal, 100);
        Ok(())
    }

    #[test]
    fn test_claim_order_is_fifo() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        db.enqueue(SCAN_QUEUE, "first", "{}")?;
        db.enqueue(SCAN_QUEUE, "second", "{}")?;

        assert_eq!(db.claim_next(SCAN_QUEUE)?.unwrap().job_key, "first");
        assert_eq!(db.claim_next(SCAN_QUEUE)?.unwrap().job_key, "second");
        Ok(())
    }

    #[test]
    fn test_scan_job_key_shape() {
        let key = scan_job_key("abc");
        assert!(key.starts_with("scan-abc-"));
    }

    #[tokio::test]
    async fn test_consumer_drains_queue() -> Result<()> {
        let handle = DbHandle::new(BotDb::new_in_memory()?);
        handle
            .call(|db| db.enqueue(SCAN_QUEUE, "k1", r#"{"repoId":"r1"}"#).map(|_| ()))
            .await?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let handles = spawn_consumers(
            handle.clone(),
            SCAN_QUEUE,
            1,
            Arc::clone(&shutdown),
            move |job| {
                let seen = Arc::clone(&seen_clone);
                async move {
                    seen.lock().unwrap().push(job.payload);
                    Ok(())
                }
            },
        );

        // Let the consumer pick the job up, then stop it.
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        shutdown.store(true, Ordering::Relaxed);
        for h in handles {
            let _ = h.await;
        }

        assert_eq!(
            *seen.lock().unwrap(),
            vec![r#"{"repoId":"r1"}"#.to_string()]
        );
        assert_eq!(handle.call(|db| db.queue_depth(SCAN_QUEUE)).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_consumer_failure_follows_retry_policy() -> Result<()> {
        let handle = DbHandle::new(BotDb::new_in_memory()?);
        handle
            .call(|db| db.enqueue(IMPROVE_QUEUE, "j1", "{}").map(|_| ()))
            .await?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let handles = spawn_consumers(
            handle.clone(),
            IMPROVE_QUEUE,
            1,
            Arc::clone(&shutdown),
            |_job| async { anyhow::bail!("always fails") },
        );

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        shutdown.store(true, Ordering::Relaxed);
        for h in handles {
            let _ = h.await;
        }

        // First attempt failed; the job is requeued with backoff, not parked.
        let status: String = handle
            .call(|db| {
                db.conn
                    .query_row(
                        "SELECT status FROM queue_jobs WHERE job_key = 'j1'",
                        [],
                        |row| row.get(0),
                    )
                    .map_err(Into::into)
            })
            .await?;
        assert_eq!(status, "queued");
        Ok(())
    }
}
