use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Measured line coverage for one source file, repo-relative with forward
/// slashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCoverage {
    pub file_path: String,
    pub lines_coverage: f64,
}

/// A repository registered for coverage tracking.
///
/// `last_coverage_report` is either absent (never scanned) or a complete
/// snapshot written atomically by a scan completion. It is never partially
/// written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedRepository {
    pub id: String,
    pub url: String,
    pub last_coverage_report: Option<Vec<FileCoverage>>,
    pub created_at: String,
    pub updated_at: String,
}

impl TrackedRepository {
    pub fn new(url: &str) -> Self {
        let now = now_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            last_coverage_report: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Cloning,
    Analyzing,
    Generating,
    Pushing,
    PrCreated,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Cloning => "CLONING",
            Self::Analyzing => "ANALYZING",
            Self::Generating => "GENERATING",
            Self::Pushing => "PUSHING",
            Self::PrCreated => "PR_CREATED",
            Self::Failed => "FAILED",
        }
    }

    /// Statuses during which the job owns a clone directory.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Cloning | Self::Analyzing | Self::Generating | Self::Pushing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PrCreated | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "CLONING" => Ok(Self::Cloning),
            "ANALYZING" => Ok(Self::Analyzing),
            "GENERATING" => Ok(Self::Generating),
            "PUSHING" => Ok(Self::Pushing),
            "PR_CREATED" => Ok(Self::PrCreated),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// One unit of work: generate a validated test for a single source file in a
/// single repository, push it, and open a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImprovementJob {
    pub id: String,
    pub repository_url: String,
    pub file_path: String,
    pub target_coverage: f64,
    pub status: JobStatus,
    pub pr_link: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub const DEFAULT_TARGET_COVERAGE: f64 = 80.0;

impl ImprovementJob {
    pub fn new(repository_url: &str, file_path: &str) -> Self {
        let now = now_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            repository_url: repository_url.to_string(),
            file_path: file_path.to_string(),
            target_coverage: DEFAULT_TARGET_COVERAGE,
            status: JobStatus::Queued,
            pr_link: None,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Current UTC timestamp in RFC 3339 with full sub-second precision, so
/// successive transitions compare strictly by string order.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for s in &[
            "QUEUED",
            "CLONING",
            "ANALYZING",
            "GENERATING",
            "PUSHING",
            "PR_CREATED",
            "FAILED",
        ] {
            let parsed: JobStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_active_set() {
        assert!(JobStatus::Cloning.is_active());
        assert!(JobStatus::Analyzing.is_active());
        assert!(JobStatus::Generating.is_active());
        assert!(JobStatus::Pushing.is_active());
        assert!(!JobStatus::Queued.is_active());
        assert!(!JobStatus::PrCreated.is_active());
        assert!(!JobStatus::Failed.is_active());
    }

    #[test]
    fn test_terminal_set() {
        assert!(JobStatus::PrCreated.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Pushing.is_terminal());
    }

    #[test]
    fn test_serde_produces_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&JobStatus::PrCreated).unwrap(),
            "\"PR_CREATED\""
        );
        assert_eq!(
            serde_json::from_str::<JobStatus>("\"GENERATING\"").unwrap(),
            JobStatus::Generating
        );
    }

    #[test]
    fn test_job_serializes_camel_case() {
        let job = ImprovementJob::new("https://github.com/o/r", "src/svc.ts");
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["repositoryUrl"], "https://github.com/o/r");
        assert_eq!(json["filePath"], "src/svc.ts");
        assert_eq!(json["targetCoverage"], 80.0);
        assert_eq!(json["status"], "QUEUED");
        assert!(json["createdAt"].is_string());
    }

    #[test]
    fn test_new_job_defaults() {
        let job = ImprovementJob::new("https://github.com/o/r", "src/a.ts");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.target_coverage, 80.0);
        assert!(job.pr_link.is_none());
        assert!(job.error_message.is_none());
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn test_file_coverage_serde() {
        let fc = FileCoverage {
            file_path: "src/user.service.ts".to_string(),
            lines_coverage: 42.5,
        };
        let json = serde_json::to_value(&fc).unwrap();
        assert_eq!(json["filePath"], "src/user.service.ts");
        assert_eq!(json["linesCoverage"], 42.5);
    }

    #[test]
    fn test_timestamps_order_by_string_comparison() {
        let a = now_rfc3339();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_rfc3339();
        assert!(b > a);
    }
}
