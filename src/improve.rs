//! End-to-end execution of one improvement job.
//!
//! ```text
//! QUEUED → CLONING → ANALYZING → GENERATING → PUSHING → PR_CREATED
//!    │         │          │            │          │
//!    └─────────┴──────────┴────────────┴──────────┴────────→ FAILED
//! ```
//!
//! Each transition is persisted before the next action begins, so an
//! external observer sees monotonic progress. Any error moves the job to
//! FAILED with its message; the clone directory is reclaimed on every exit
//! path once one has been recorded.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::db::DbHandle;
use crate::errors::JobError;
use crate::generator::TestGenerator;
use crate::host::RepositoryHost;
use crate::models::{ImprovementJob, JobStatus};

pub struct ImproveCoverageUseCase {
    db: DbHandle,
    host: Arc<dyn RepositoryHost>,
    generator: Arc<dyn TestGenerator>,
}

impl ImproveCoverageUseCase {
    pub fn new(
        db: DbHandle,
        host: Arc<dyn RepositoryHost>,
        generator: Arc<dyn TestGenerator>,
    ) -> Self {
        Self {
            db,
            host,
            generator,
        }
    }

    /// Run the job to a terminal state. Job-local failures are persisted on
    /// the entity and reported as success to the queue; an Err here means
    /// the infrastructure (store) broke and the queue should retry.
    pub async fn execute(&self, job_id: &str) -> Result<()> {
        let job = {
            let id = job_id.to_string();
            self.db.call(move |db| db.get_job(&id)).await?
        };
        let job = match job {
            Some(job) => job,
            None => {
                eprintln!("[improve] Job {} not found, dropping", job_id);
                return Ok(());
            }
        };

        let mut clone_path: Option<PathBuf> = None;
        let result = self.run(&job, &mut clone_path).await;

        match result {
            Ok(pr_link) => {
                let id = job.id.clone();
                self.db
                    .call(move |db| db.complete_job(&id, &pr_link))
                    .await?;
            }
            Err(e) => {
                let message = format!("{:#}", anyhow::Error::from(e));
                eprintln!("[improve] Job {} failed: {}", job.id, message);
                let id = job.id.clone();
                self.db.call(move |db| db.fail_job(&id, &message)).await?;
            }
        }

        // Cleanup is skipped when the clone itself never succeeded, and its
        // own failures are logged but never re-thrown.
        if let Some(path) = clone_path {
            if let Err(e) = self.host.cleanup(&path).await {
                eprintln!(
                    "[improve] Cleanup of {} failed: {}",
                    path.display(),
                    e
                );
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        job: &ImprovementJob,
        clone_path: &mut Option<PathBuf>,
    ) -> Result<String, JobError> {
        self.set_status(&job.id, JobStatus::Cloning).await?;

        if !self.host.check_permissions(&job.repository_url).await? {
            return Err(JobError::InsufficientPermissions {
                url: job.repository_url.clone(),
            });
        }

        let path = self.host.clone_repository(&job.repository_url, None).await?;
        *clone_path = Some(path.clone());

        if !path.join(&job.file_path).exists() {
            return Err(JobError::SourceMissing {
                path: job.file_path.clone(),
            });
        }

        let base_branch = self.host.default_branch(&path).await?;

        self.set_status(&job.id, JobStatus::Analyzing).await?;
        let test_rel = derived_test_path(&job.file_path);

        self.set_status(&job.id, JobStatus::Generating).await?;
        self.generator
            .generate_test(&job.file_path, &test_rel, &path, job.target_coverage)
            .await?;

        self.set_status(&job.id, JobStatus::Pushing).await?;
        let branch = format!("improve-coverage-{}", job.id);
        let stage = vec![test_rel.clone()];
        self.host
            .commit_and_push(
                &path,
                &branch,
                &HashMap::new(),
                &format!("test: improve coverage for {}", job.file_path),
                Some(&stage),
            )
            .await
            .map_err(|e| JobError::Push(e.to_string()))?;

        let pr_link = self
            .host
            .create_pull_request(
                &job.repository_url,
                &branch,
                &format!("Improve test coverage for {}", job.file_path),
                &format!(
                    "Automated test generation for `{}`.\n\n\
                     The added test was compiled, executed, and verified to lift \
                     measured coverage past {:.0}%.",
                    job.file_path, job.target_coverage
                ),
                &base_branch,
            )
            .await
            .map_err(|e| JobError::PrCreation(e.to_string()))?;

        Ok(pr_link)
    }

    async fn set_status(&self, job_id: &str, status: JobStatus) -> Result<(), JobError> {
        let id = job_id.to_string();
        self.db
            .call(move |db| db.update_job_status(&id, &status))
            .await
            .map_err(JobError::Other)?;
        Ok(())
    }
}

/// Generated tests live beside their source: `src/svc.ts` → `src/svc.test.ts`.
pub fn derived_test_path(source_rel: &str) -> String {
    match source_rel.strip_suffix(".ts") {
        Some(stem) => format!("{}.test.ts", stem),
        None => format!("{}.test.ts", source_rel),
    }
}
