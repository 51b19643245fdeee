//! Per-file line-coverage measurement for a cloned repository.
//!
//! The scan installs dependencies (lockfile-aware, post-install scripts
//! skipped), runs the repository's test runner with coverage collection, and
//! parses the JSON summary into `FileCoverage` entries. Repositories without
//! a usable config get a temporary minimal one; repositories whose run
//! produces no summary fall back to a source-tree walk reporting every file
//! at 0 %.
//!
//! The exclusion set below is the single source of truth shared by the
//! synthesized coverage config, the fallback walker, and the post-filter of
//! parsed entries. If they diverge, deliberately excluded files come back as
//! spurious 0 % rows.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ScanError;
use crate::models::FileCoverage;
use crate::sandbox::{SandboxRunner, TIMEOUT_MARKER, tail};

pub const EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    "dist",
    "build",
    "coverage",
    ".git",
    "interfaces",
    "interface",
    "types",
    "type",
    "enums",
    "enum",
    "constants",
    "typings",
];

/// Matched against file basenames as suffixes (`*.d.ts`, `*app.ts`, ...).
pub const EXCLUDED_FILE_SUFFIXES: &[&str] = &[
    ".d.ts",
    ".interface.ts",
    ".interfaces.ts",
    ".types.ts",
    ".type.ts",
    ".enum.ts",
    ".enums.ts",
    ".constants.ts",
    ".constant.ts",
    ".spec.ts",
    ".test.ts",
    ".spec.tsx",
    ".test.tsx",
    "app.ts",
    "main.ts",
    "index.ts",
    ".module.ts",
    ".entity.ts",
];

const SCAN_CONFIG_FILE: &str = "jest.config.ci-scan.cjs";
const SUMMARY_FILE: &str = "coverage/coverage-summary.json";

const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);
const TEST_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_OUTPUT: usize = 10 * 1024 * 1024;

/// True when a repo-relative path is excluded from coverage accounting.
pub fn is_excluded(rel_path: &str) -> bool {
    let normalized = rel_path.replace('\\', "/");
    let mut components = normalized.split('/').peekable();
    while let Some(component) = components.next() {
        if components.peek().is_some() {
            // Directory component.
            if EXCLUDED_DIRS.contains(&component) {
                return true;
            }
        } else {
            // Basename.
            return EXCLUDED_FILE_SUFFIXES.iter().any(|s| component.ends_with(s));
        }
    }
    false
}

/// The exclusion set rendered as coverage ignore globs for the minimal
/// config, so the runner and the post-filter agree.
fn coverage_ignore_globs() -> Vec<String> {
    let mut globs = Vec::new();
    for dir in EXCLUDED_DIRS {
        globs.push(format!("!**/{}/**", dir));
    }
    for suffix in EXCLUDED_FILE_SUFFIXES {
        globs.push(format!("!**/*{}", suffix));
    }
    globs
}

pub struct CoverageScanner {
    sandbox: Arc<SandboxRunner>,
}

impl CoverageScanner {
    pub fn new(sandbox: Arc<SandboxRunner>) -> Self {
        Self { sandbox }
    }

    /// Measure per-file line coverage for the repository at `local_path`.
    /// Fails only on unrecoverable problems; failing test assertions still
    /// produce a report.
    pub async fn scan(&self, local_path: &Path) -> Result<Vec<FileCoverage>, ScanError> {
        self.install_dependencies(local_path).await?;

        let runner = self.select_runner(local_path);
        let wrote_config = self.ensure_config(local_path).await?;

        let run_result = self.run_tests(local_path, &runner, wrote_config).await;

        if wrote_config {
            let _ = tokio::fs::remove_file(local_path.join(SCAN_CONFIG_FILE)).await;
        }
        run_result?;

        let entries = parse_summary(local_path).await;
        match entries {
            Some(entries) if !entries.is_empty() => {
                let mut filtered: Vec<FileCoverage> = entries
                    .into_iter()
                    .filter(|fc| !is_excluded(&fc.file_path))
                    .collect();
                filtered.sort_by(|a, b| a.file_path.cmp(&b.file_path));
                Ok(filtered)
            }
            _ => {
                eprintln!(
                    "[scan] No coverage summary entries for {}, walking sources at 0%",
                    local_path.display()
                );
                Ok(walk_sources_at_zero(local_path))
            }
        }
    }

    async fn install_dependencies(&self, local_path: &Path) -> Result<(), ScanError> {
        if local_path.join("node_modules").exists() {
            return Ok(());
        }

        // Strict lock when a lockfile pins versions; permissive otherwise.
        // Post-install scripts are always skipped.
        let install_cmd = if local_path.join("package-lock.json").exists() {
            "npm ci --ignore-scripts"
        } else if local_path.join("yarn.lock").exists() {
            "yarn install --frozen-lockfile --ignore-scripts"
        } else if local_path.join("pnpm-lock.yaml").exists() {
            "pnpm install --frozen-lockfile --ignore-scripts"
        } else {
            "npm install --ignore-scripts"
        };

        let out = self
            .sandbox
            .run(
                "sh",
                &["-lc".to_string(), install_cmd.to_string()],
                local_path,
                &HashMap::new(),
                INSTALL_TIMEOUT,
                true,
                false,
            )
            .await;

        if out.output.len() > MAX_OUTPUT {
            return Err(ScanError::OutputOverflow {
                stage: "install",
                limit: MAX_OUTPUT,
            });
        }
        if !out.success {
            if out.output.contains(TIMEOUT_MARKER) {
                return Err(ScanError::Timeout { stage: "install" });
            }
            return Err(ScanError::InstallFailed(tail(&out.output, 4000).to_string()));
        }
        Ok(())
    }

    /// Prefer the repo's own jest binary; fall back to the shared toolchain.
    fn select_runner(&self, local_path: &Path) -> String {
        if local_path.join("node_modules/.bin/jest").exists() {
            "node_modules/.bin/jest".to_string()
        } else {
            "/toolchain/node_modules/.bin/jest".to_string()
        }
    }

    /// Honour an existing jest config; synthesize a minimal temporary one
    /// only when none exists. Returns whether a temp config was written.
    async fn ensure_config(&self, local_path: &Path) -> Result<bool, ScanError> {
        if has_own_config(local_path) {
            return Ok(false);
        }

        let mut collect_from = vec!["\"**/*.{ts,tsx}\"".to_string()];
        collect_from.extend(coverage_ignore_globs().iter().map(|g| format!("{:?}", g)));

        let config = format!(
            "module.exports = {{\n  preset: 'ts-jest',\n  testEnvironment: 'node',\n  collectCoverage: true,\n  collectCoverageFrom: [\n    {}\n  ],\n  coverageReporters: ['json-summary'],\n  passWithNoTests: true,\n}};\n",
            collect_from.join(",\n    ")
        );
        tokio::fs::write(local_path.join(SCAN_CONFIG_FILE), config)
            .await
            .map_err(|e| ScanError::Other(anyhow::anyhow!("Failed to write scan config: {}", e)))?;
        Ok(true)
    }

    async fn run_tests(
        &self,
        local_path: &Path,
        runner: &str,
        use_temp_config: bool,
    ) -> Result<(), ScanError> {
        let mut args: Vec<String> = vec![
            "--coverage".to_string(),
            "--coverageReporters=json-summary".to_string(),
            "--passWithNoTests".to_string(),
            "--forceExit".to_string(),
            "--ci".to_string(),
            "--silent".to_string(),
        ];
        if use_temp_config {
            args.extend(["--config".to_string(), SCAN_CONFIG_FILE.to_string()]);
        }

        let out = self
            .sandbox
            .run(
                runner,
                &args,
                local_path,
                &HashMap::new(),
                TEST_TIMEOUT,
                false,
                false,
            )
            .await;

        if out.output.len() > MAX_OUTPUT {
            return Err(ScanError::OutputOverflow {
                stage: "tests",
                limit: MAX_OUTPUT,
            });
        }
        if !out.success && out.output.contains(TIMEOUT_MARKER) {
            return Err(ScanError::Timeout { stage: "tests" });
        }
        // Any other non-zero exit is the soft case (failing assertions, no
        // tests found with older runners): the summary is still consumed.
        Ok(())
    }
}

fn has_own_config(local_path: &Path) -> bool {
    for name in [
        "jest.config.js",
        "jest.config.cjs",
        "jest.config.mjs",
        "jest.config.ts",
        "jest.config.json",
    ] {
        if local_path.join(name).exists() {
            return true;
        }
    }
    if let Ok(manifest) = std::fs::read_to_string(local_path.join("package.json")) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&manifest) {
            return value.get("jest").is_some();
        }
    }
    false
}

/// Read the runner's summary and resolve each entry to a repo-relative path.
/// Entries that escape the repository are discarded. Returns None when no
/// summary was produced.
async fn parse_summary(local_path: &Path) -> Option<Vec<FileCoverage>> {
    let raw = tokio::fs::read_to_string(local_path.join(SUMMARY_FILE))
        .await
        .ok()?;
    let summary: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let map = summary.as_object()?;

    let repo_real = local_path.canonicalize().unwrap_or_else(|_| local_path.to_path_buf());

    let mut entries = Vec::new();
    for (key, value) in map {
        if key == "total" {
            continue;
        }
        let pct = value
            .get("lines")
            .and_then(|l| l.get("pct"))
            .and_then(|p| p.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 100.0);

        // The runner saw the clone at /app; map back to the host path first.
        let host_path = match key.strip_prefix("/app/") {
            Some(rest) => repo_real.join(rest),
            None => PathBuf::from(key),
        };
        let real = host_path.canonicalize().unwrap_or(host_path);
        let rel = match real.strip_prefix(&repo_real) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue, // escapes the repository
        };
        entries.push(FileCoverage {
            file_path: rel,
            lines_coverage: pct,
        });
    }
    Some(entries)
}

/// Fallback: every non-excluded source file at 0 %, honoring the same
/// exclusion set as the runner config.
fn walk_sources_at_zero(local_path: &Path) -> Vec<FileCoverage> {
    let mut files = Vec::new();
    let mut stack = vec![local_path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if path.is_dir() {
                if !EXCLUDED_DIRS.contains(&name.as_ref()) {
                    stack.push(path);
                }
            } else if name.ends_with(".ts") || name.ends_with(".tsx") {
                if let Ok(rel) = path.strip_prefix(local_path) {
                    let rel = rel.to_string_lossy().replace('\\', "/");
                    if !is_excluded(&rel) {
                        files.push(FileCoverage {
                            file_path: rel,
                            lines_coverage: 0.0,
                        });
                    }
                }
            }
        }
    }
    files.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    files
}
