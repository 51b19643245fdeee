use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{FileCoverage, ImprovementJob, JobStatus, TrackedRepository, now_rfc3339};

/// Async-safe handle to the bot database.
///
/// Wraps `BotDb` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, preventing synchronous SQLite I/O from
/// tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BotDb>>,
}

impl DbHandle {
    pub fn new(db: BotDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BotDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests only, never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, BotDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct BotDb {
    pub(crate) conn: Connection,
}

impl BotDb {
    /// Open (or create) the SQLite database at the given path and run
    /// migrations. The file is shared between the API and worker processes,
    /// so WAL mode and a busy timeout are set up front.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA foreign_keys = ON;",
            )
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS repositories (
                    id TEXT PRIMARY KEY,
                    url TEXT NOT NULL UNIQUE,
                    coverage_report TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS improvement_jobs (
                    id TEXT PRIMARY KEY,
                    repository_url TEXT NOT NULL,
                    file_path TEXT NOT NULL,
                    target_coverage REAL NOT NULL DEFAULT 80,
                    status TEXT NOT NULL DEFAULT 'QUEUED',
                    pr_link TEXT,
                    error_message TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS queue_jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    queue TEXT NOT NULL,
                    job_key TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL DEFAULT 2,
                    run_at TEXT NOT NULL,
                    last_error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(queue, job_key)
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_repo
                    ON improvement_jobs(repository_url);
                CREATE INDEX IF NOT EXISTS idx_jobs_status
                    ON improvement_jobs(repository_url, status);
                CREATE INDEX IF NOT EXISTS idx_queue_dispatch
                    ON queue_jobs(queue, status, run_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Repository store ──────────────────────────────────────────────

    pub fn upsert_repository(&self, repo: &TrackedRepository) -> Result<TrackedRepository> {
        let report_json = match &repo.last_coverage_report {
            Some(report) => {
                Some(serde_json::to_string(report).context("Failed to serialize coverage report")?)
            }
            None => None,
        };
        self.conn
            .execute(
                "INSERT INTO repositories (id, url, coverage_report, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    url = excluded.url,
                    coverage_report = excluded.coverage_report,
                    updated_at = excluded.updated_at",
                params![
                    repo.id,
                    repo.url,
                    report_json,
                    repo.created_at,
                    repo.updated_at
                ],
            )
            .context("Failed to upsert repository")?;
        self.get_repository(&repo.id)?
            .context("Repository not found after upsert")
    }

    pub fn get_repository(&self, id: &str) -> Result<Option<TrackedRepository>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, url, coverage_report, created_at, updated_at
                 FROM repositories WHERE id = ?1",
            )
            .context("Failed to prepare get_repository")?;
        let row = stmt
            .query_row(params![id], RepositoryRow::from_row)
            .optional()
            .context("Failed to query repository")?;
        row.map(RepositoryRow::into_repository).transpose()
    }

    pub fn find_repository_by_url(&self, url: &str) -> Result<Option<TrackedRepository>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, url, coverage_report, created_at, updated_at
                 FROM repositories WHERE url = ?1",
            )
            .context("Failed to prepare find_repository_by_url")?;
        let row = stmt
            .query_row(params![url], RepositoryRow::from_row)
            .optional()
            .context("Failed to query repository by url")?;
        row.map(RepositoryRow::into_repository).transpose()
    }

    pub fn list_repositories(&self) -> Result<Vec<TrackedRepository>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, url, coverage_report, created_at, updated_at
                 FROM repositories ORDER BY created_at DESC",
            )
            .context("Failed to prepare list_repositories")?;
        let rows = stmt
            .query_map([], RepositoryRow::from_row)
            .context("Failed to query repositories")?;
        let mut repos = Vec::new();
        for row in rows {
            repos.push(row.context("Failed to read repository row")?.into_repository()?);
        }
        Ok(repos)
    }

    /// Replace a repository's coverage report in one statement, so readers
    /// observe either the previous snapshot or the complete new one.
    pub fn set_coverage_report(&self, id: &str, report: &[FileCoverage]) -> Result<()> {
        let report_json =
            serde_json::to_string(report).context("Failed to serialize coverage report")?;
        let updated = self
            .conn
            .execute(
                "UPDATE repositories SET coverage_report = ?1, updated_at = ?2 WHERE id = ?3",
                params![report_json, now_rfc3339(), id],
            )
            .context("Failed to write coverage report")?;
        if updated == 0 {
            anyhow::bail!("Repository {} not found for coverage write", id);
        }
        Ok(())
    }

    // ── Job store ─────────────────────────────────────────────────────

    pub fn upsert_job(&self, job: &ImprovementJob) -> Result<ImprovementJob> {
        self.conn
            .execute(
                "INSERT INTO improvement_jobs
                    (id, repository_url, file_path, target_coverage, status,
                     pr_link, error_message, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    pr_link = excluded.pr_link,
                    error_message = excluded.error_message,
                    updated_at = excluded.updated_at",
                params![
                    job.id,
                    job.repository_url,
                    job.file_path,
                    job.target_coverage,
                    job.status.as_str(),
                    job.pr_link,
                    job.error_message,
                    job.created_at,
                    job.updated_at
                ],
            )
            .context("Failed to upsert job")?;
        self.get_job(&job.id)?.context("Job not found after upsert")
    }

    pub fn get_job(&self, id: &str) -> Result<Option<ImprovementJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE id = ?1", JOB_SELECT))
            .context("Failed to prepare get_job")?;
        let row = stmt
            .query_row(params![id], JobRow::from_row)
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn list_jobs(&self) -> Result<Vec<ImprovementJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY created_at DESC", JOB_SELECT))
            .context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map([], JobRow::from_row)
            .context("Failed to query jobs")?;
        collect_jobs(rows)
    }

    pub fn find_jobs_by_repo(&self, url: &str) -> Result<Vec<ImprovementJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE repository_url = ?1 ORDER BY created_at DESC",
                JOB_SELECT
            ))
            .context("Failed to prepare find_jobs_by_repo")?;
        let rows = stmt
            .query_map(params![url], JobRow::from_row)
            .context("Failed to query jobs by repo")?;
        collect_jobs(rows)
    }

    /// Oldest job for `url` whose status is in the active set, excluding
    /// `exclude_id`. Exists so a consumer can detect an in-flight peer if the
    /// improve concurrency bound is ever raised above 1.
    pub fn find_active_job_by_repo(
        &self,
        url: &str,
        exclude_id: &str,
    ) -> Result<Option<ImprovementJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE repository_url = ?1 AND id != ?2
                   AND status IN ('CLONING', 'ANALYZING', 'GENERATING', 'PUSHING')
                 ORDER BY created_at ASC LIMIT 1",
                JOB_SELECT
            ))
            .context("Failed to prepare find_active_job_by_repo")?;
        let row = stmt
            .query_row(params![url, exclude_id], JobRow::from_row)
            .optional()
            .context("Failed to query active job")?;
        row.map(JobRow::into_job).transpose()
    }

    /// Advance a job to a non-terminal status. `updated_at` moves forward on
    /// every transition.
    pub fn update_job_status(&self, id: &str, status: &JobStatus) -> Result<ImprovementJob> {
        self.conn
            .execute(
                "UPDATE improvement_jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now_rfc3339(), id],
            )
            .context("Failed to update job status")?;
        self.get_job(id)?.context("Job not found after status update")
    }

    /// Terminal success: PR_CREATED is only entered together with its link.
    pub fn complete_job(&self, id: &str, pr_link: &str) -> Result<ImprovementJob> {
        self.conn
            .execute(
                "UPDATE improvement_jobs
                 SET status = 'PR_CREATED', pr_link = ?1, updated_at = ?2 WHERE id = ?3",
                params![pr_link, now_rfc3339(), id],
            )
            .context("Failed to complete job")?;
        self.get_job(id)?.context("Job not found after completion")
    }

    /// Terminal failure: FAILED is only entered together with its message.
    pub fn fail_job(&self, id: &str, error_message: &str) -> Result<ImprovementJob> {
        self.conn
            .execute(
                "UPDATE improvement_jobs
                 SET status = 'FAILED', error_message = ?1, updated_at = ?2 WHERE id = ?3",
                params![error_message, now_rfc3339(), id],
            )
            .context("Failed to mark job failed")?;
        self.get_job(id)?.context("Job not found after failure")
    }
}

const JOB_SELECT: &str = "SELECT id, repository_url, file_path, target_coverage, status, \
                          pr_link, error_message, created_at, updated_at FROM improvement_jobs";

fn collect_jobs(
    rows: impl Iterator<Item = rusqlite::Result<JobRow>>,
) -> Result<Vec<ImprovementJob>> {
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row.context("Failed to read job row")?.into_job()?);
    }
    Ok(jobs)
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for repositories, converting the JSON coverage
/// column into typed values.
struct RepositoryRow {
    id: String,
    url: String,
    coverage_report: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RepositoryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            url: row.get(1)?,
            coverage_report: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_repository(self) -> Result<TrackedRepository> {
        let last_coverage_report = match self.coverage_report {
            Some(json) => Some(
                serde_json::from_str::<Vec<FileCoverage>>(&json)
                    .with_context(|| format!("Corrupt coverage report JSON for {}", self.id))?,
            ),
            None => None,
        };
        Ok(TrackedRepository {
            id: self.id,
            url: self.url,
            last_coverage_report,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for improvement jobs.
struct JobRow {
    id: String,
    repository_url: String,
    file_path: String,
    target_coverage: f64,
    status: String,
    pr_link: Option<String>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repository_url: row.get(1)?,
            file_path: row.get(2)?,
            target_coverage: row.get(3)?,
            status: row.get(4)?,
            pr_link: row.get(5)?,
            error_message: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_job(self) -> Result<ImprovementJob> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        Ok(ImprovementJob {
            id: self.id,
            repository_url: self.repository_url,
            file_path: self.file_path,
            target_coverage: self.target_coverage,
            status,
            pr_link: self.pr_link,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_tick() {
        // Timestamps carry microsecond precision; a short sleep guarantees
        // strict ordering between successive transitions.
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    #[test]
    fn test_migrations_create_tables() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
             AND name IN ('repositories', 'improvement_jobs', 'queue_jobs')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 3, "Expected 3 tables to exist");
        Ok(())
    }

    #[test]
    fn test_repository_roundtrip_deep_equal() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        let repo = TrackedRepository::new("https://github.com/o/r");
        let stored = db.upsert_repository(&repo)?;
        assert_eq!(stored.id, repo.id);
        assert_eq!(stored.url, repo.url);
        assert!(stored.last_coverage_report.is_none());

        let fetched = db.find_repository_by_url("https://github.com/o/r")?.unwrap();
        assert_eq!(fetched.id, repo.id);
        assert_eq!(fetched.created_at, repo.created_at);
        Ok(())
    }

    #[test]
    fn test_repository_url_unique() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        db.upsert_repository(&TrackedRepository::new("https://github.com/o/r"))?;
        let duplicate = TrackedRepository::new("https://github.com/o/r");
        assert!(db.upsert_repository(&duplicate).is_err());
        Ok(())
    }

    #[test]
    fn test_coverage_report_written_atomically() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        let repo = db.upsert_repository(&TrackedRepository::new("https://github.com/o/r"))?;

        let report = vec![
            FileCoverage {
                file_path: "src/a.ts".to_string(),
                lines_coverage: 75.0,
            },
            FileCoverage {
                file_path: "src/b.ts".to_string(),
                lines_coverage: 0.0,
            },
        ];
        sleep_tick();
        db.set_coverage_report(&repo.id, &report)?;

        let fetched = db.get_repository(&repo.id)?.unwrap();
        assert_eq!(fetched.last_coverage_report.as_deref(), Some(&report[..]));
        assert!(fetched.updated_at > repo.updated_at);
        Ok(())
    }

    #[test]
    fn test_set_coverage_report_unknown_repo_errors() {
        let db = BotDb::new_in_memory().unwrap();
        assert!(db.set_coverage_report("missing", &[]).is_err());
    }

    #[test]
    fn test_job_roundtrip_deep_equal() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        let job = ImprovementJob::new("https://github.com/o/r", "src/svc.ts");
        db.upsert_job(&job)?;

        let fetched = db.get_job(&job.id)?.unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.repository_url, job.repository_url);
        assert_eq!(fetched.file_path, job.file_path);
        assert_eq!(fetched.target_coverage, 80.0);
        assert_eq!(fetched.status, JobStatus::Queued);
        assert_eq!(fetched.created_at, job.created_at);
        assert_eq!(fetched.updated_at, job.updated_at);
        Ok(())
    }

    #[test]
    fn test_job_transitions_advance_updated_at() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        let job = ImprovementJob::new("https://github.com/o/r", "src/svc.ts");
        db.upsert_job(&job)?;

        sleep_tick();
        let cloning = db.update_job_status(&job.id, &JobStatus::Cloning)?;
        assert!(cloning.updated_at > job.updated_at);

        sleep_tick();
        let analyzing = db.update_job_status(&job.id, &JobStatus::Analyzing)?;
        assert!(analyzing.updated_at > cloning.updated_at);
        Ok(())
    }

    #[test]
    fn test_complete_job_sets_pr_link_with_status() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        let job = ImprovementJob::new("https://github.com/o/r", "src/svc.ts");
        db.upsert_job(&job)?;

        let done = db.complete_job(&job.id, "https://github.com/o/r/pull/7")?;
        assert_eq!(done.status, JobStatus::PrCreated);
        assert_eq!(done.pr_link.as_deref(), Some("https://github.com/o/r/pull/7"));
        Ok(())
    }

    #[test]
    fn test_fail_job_sets_error_with_status() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        let job = ImprovementJob::new("https://github.com/o/r", "src/svc.ts");
        db.upsert_job(&job)?;

        let failed = db.fail_job(&job.id, "Insufficient permissions to push")?;
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error_message.unwrap().contains("Insufficient permissions"));
        Ok(())
    }

    #[test]
    fn test_list_jobs_desc_created() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        let first = ImprovementJob::new("https://github.com/o/r", "src/a.ts");
        db.upsert_job(&first)?;
        sleep_tick();
        let second = ImprovementJob::new("https://github.com/o/r", "src/b.ts");
        db.upsert_job(&second)?;

        let jobs = db.list_jobs()?;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, second.id);
        assert_eq!(jobs[1].id, first.id);
        Ok(())
    }

    #[test]
    fn test_find_jobs_by_repo_filters() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        db.upsert_job(&ImprovementJob::new("https://github.com/o/r", "src/a.ts"))?;
        db.upsert_job(&ImprovementJob::new("https://github.com/o/other", "src/b.ts"))?;

        let jobs = db.find_jobs_by_repo("https://github.com/o/r")?;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].file_path, "src/a.ts");
        Ok(())
    }

    #[test]
    fn test_find_active_job_by_repo() -> Result<()> {
        let db = BotDb::new_in_memory()?;
        let queued = ImprovementJob::new("https://github.com/o/r", "src/a.ts");
        db.upsert_job(&queued)?;
        let active = ImprovementJob::new("https://github.com/o/r", "src/b.ts");
        db.upsert_job(&active)?;
        db.update_job_status(&active.id, &JobStatus::Generating)?;

        // QUEUED is not in the active set.
        assert!(db.find_active_job_by_repo("https://github.com/o/r", "none")?.is_some());
        let found = db
            .find_active_job_by_repo("https://github.com/o/r", "none")?
            .unwrap();
        assert_eq!(found.id, active.id);

        // Excluding the active job itself leaves nothing.
        assert!(db
            .find_active_job_by_repo("https://github.com/o/r", &active.id)?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call() -> Result<()> {
        let handle = DbHandle::new(BotDb::new_in_memory()?);
        let repo = TrackedRepository::new("https://github.com/o/r");
        let url = repo.url.clone();
        handle.call(move |db| db.upsert_repository(&repo)).await?;
        let fetched = handle
            .call(move |db| db.find_repository_by_url(&url))
            .await?;
        assert!(fetched.is_some());
        Ok(())
    }
}
