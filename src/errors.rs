//! Typed error hierarchy for the coverage bot.
//!
//! Component boundaries return these tagged enums; `anyhow` carries context
//! inside a component. Queue consumers map each variant to either
//! fail-the-entity-and-return or re-throw-for-queue-retry.

use thiserror::Error;

/// Errors from the repository hosting provider.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Invalid repository URL: {0}")]
    InvalidRepoUrl(String),

    #[error("{0}")]
    Provider(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Unrecoverable coverage-scan failures. Test-assertion failures are NOT
/// errors; the summary is still consumed.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Dependency install failed: {0}")]
    InstallFailed(String),

    #[error("Test runner not available: {0}")]
    RunnerMissing(String),

    #[error("Sandbox timed out during {stage}")]
    Timeout { stage: &'static str },

    #[error("Output exceeded the {limit} byte buffer during {stage}")]
    OutputOverflow { stage: &'static str, limit: usize },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure of the bounded generate → validate → repair loop.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Test generation failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("Generator returned error: {0}")]
    Provider(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Job-local failures of one improvement run. Each moves the job to FAILED
/// with its message persisted; none are retried inside the job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Insufficient permissions to push to {url}")]
    InsufficientPermissions { url: String },

    #[error("Source file not found in repository: {path}")]
    SourceMissing { path: String },

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Push failed: {0}")]
    Push(String),

    #[error("Pull request creation failed: {0}")]
    PrCreation(String),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
