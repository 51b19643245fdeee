//! Two-phase validation of a generated test file.
//!
//! Phase 1 type-checks the file alone under a scoped config and
//! short-circuits on any compiler diagnostic outside a small ignorable set.
//! Phase 2 executes the file with coverage collection scoped to its target
//! source file, digs the JSON payload out of the runner's noisy output, and
//! enforces the coverage threshold. Scratch configs are removed on every
//! exit path.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize as _;

use crate::sandbox::{SandboxRunner, tail};

const TSCONFIG_FILE: &str = "tsconfig.validation.json";
const JEST_CONFIG_FILE: &str = "jest.config.verification.js";
const VALIDATOR_TIMEOUT: Duration = Duration::from_secs(120);

/// Diagnostics that do not block execution: missing modules and names,
/// properties absent from inferred types, assignability complaints. The
/// runner resolves what the scoped type check cannot see.
const IGNORABLE_TS_CODES: &[u32] = &[2304, 2307, 2322, 2339, 2345, 2552, 2580, 2582];

/// Prefixes the runner's JSON payload is known to start with; the last
/// occurrence wins because the runner may print noise first.
const JSON_PREFIXES: &[&str] = &["{\"numFailedTestSuites\"", "{\"success\"", "{\"testResults\""];

const UNCOVERED_SAMPLE_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub success: bool,
    pub error_text: Option<String>,
    pub measured_coverage: Option<f64>,
}

impl ValidationOutcome {
    fn failure(error_text: String) -> Self {
        Self {
            success: false,
            error_text: Some(error_text),
            measured_coverage: None,
        }
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    /// Validate the test at `test_rel` (repo-relative) against its target
    /// source file. Ok(outcome) carries the verdict; Err means the validator
    /// itself broke.
    async fn validate(
        &self,
        test_rel: &str,
        repo_path: &Path,
        target_coverage: f64,
    ) -> Result<ValidationOutcome>;
}

pub struct TestValidator {
    sandbox: Arc<SandboxRunner>,
}

impl TestValidator {
    pub fn new(sandbox: Arc<SandboxRunner>) -> Self {
        Self { sandbox }
    }

    async fn run_phases(
        &self,
        test_rel: &str,
        repo_path: &Path,
        target_coverage: f64,
    ) -> Result<ValidationOutcome> {
        // ── Phase 1: scoped compile check ─────────────────────────────
        let tsconfig = serde_json::json!({
            "compilerOptions": {
                "noEmit": true,
                "target": "ES2020",
                "module": "commonjs",
                "moduleResolution": "node",
                "esModuleInterop": true,
                "skipLibCheck": true,
                "isolatedModules": true,
                "types": ["jest", "node"],
            },
            "include": [test_rel],
        });
        tokio::fs::write(
            repo_path.join(TSCONFIG_FILE),
            serde_json::to_string_pretty(&tsconfig)?,
        )
        .await
        .context("Failed to write validation tsconfig")?;

        let compile = self
            .sandbox
            .run(
                "/toolchain/node_modules/.bin/tsc",
                &["-p".to_string(), TSCONFIG_FILE.to_string()],
                repo_path,
                &HashMap::new(),
                VALIDATOR_TIMEOUT,
                false,
                false,
            )
            .await;

        if let Some(fatal) = fatal_compile_error(&compile.output) {
            return Ok(ValidationOutcome::failure(format!(
                "Compilation failed ({}):\n{}",
                fatal,
                tail(&compile.output, 4000)
            )));
        }

        // ── Phase 2: scoped execution with coverage ───────────────────
        let source_rel = source_for_test(test_rel);
        let jest_config = format!(
            "module.exports = {{\n  preset: 'ts-jest',\n  testEnvironment: 'node',\n  collectCoverage: true,\n  collectCoverageFrom: [{:?}],\n  coverageReporters: ['json'],\n  testMatch: [{:?}],\n  passWithNoTests: false,\n}};\n",
            source_rel,
            format!("**/{}", test_rel)
        );
        tokio::fs::write(repo_path.join(JEST_CONFIG_FILE), jest_config)
            .await
            .context("Failed to write verification jest config")?;

        let run = self
            .sandbox
            .run(
                "/toolchain/node_modules/.bin/jest",
                &[
                    "--config".to_string(),
                    JEST_CONFIG_FILE.to_string(),
                    "--json".to_string(),
                    "--forceExit".to_string(),
                    "--ci".to_string(),
                    "--silent".to_string(),
                ],
                repo_path,
                &HashMap::new(),
                VALIDATOR_TIMEOUT,
                false,
                false,
            )
            .await;

        let payload = extract_json_payload(&run.output);
        let coverage_map = payload
            .as_ref()
            .and_then(|p| p.get("coverageMap"))
            .and_then(|m| m.as_object());

        let coverage_map = match coverage_map {
            Some(map) => map,
            None => {
                if !run.success {
                    return Ok(ValidationOutcome::failure(format!(
                        "Test execution failed:\n{}",
                        tail(&run.output, 4000)
                    )));
                }
                return Ok(ValidationOutcome::failure(format!(
                    "No coverage data produced for {}",
                    source_rel
                )));
            }
        };

        let entry = match find_coverage_entry(coverage_map, &source_rel) {
            Some(entry) => entry,
            None => {
                return Ok(ValidationOutcome::failure(format!(
                    "Source file {} is absent from the coverage map",
                    source_rel
                )));
            }
        };

        let (pct, uncovered) = statement_coverage(entry);
        if pct < target_coverage {
            let sample = uncovered
                .iter()
                .take(UNCOVERED_SAMPLE_LIMIT)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            return Ok(ValidationOutcome {
                success: false,
                error_text: Some(format!(
                    "Coverage {:.1}% is below the {:.0}% target. Uncovered statements: {}",
                    pct, target_coverage, sample
                )),
                measured_coverage: Some(pct),
            });
        }

        Ok(ValidationOutcome {
            success: true,
            error_text: None,
            measured_coverage: Some(pct),
        })
    }
}

#[async_trait]
impl Validator for TestValidator {
    async fn validate(
        &self,
        test_rel: &str,
        repo_path: &Path,
        target_coverage: f64,
    ) -> Result<ValidationOutcome> {
        let result = self.run_phases(test_rel, repo_path, target_coverage).await;
        // Scratch configs go away on success, failure, and error alike.
        let _ = tokio::fs::remove_file(repo_path.join(TSCONFIG_FILE)).await;
        let _ = tokio::fs::remove_file(repo_path.join(JEST_CONFIG_FILE)).await;
        result.context("Validator failed")
    }
}

/// Target source path for a verification test file: the
/// `.verification.test.ts` suffix swapped back to `.ts`.
fn source_for_test(test_rel: &str) -> String {
    match test_rel.strip_suffix(".verification.test.ts") {
        Some(stem) => format!("{}.ts", stem),
        None => test_rel
            .strip_suffix(".test.ts")
            .map(|stem| format!("{}.ts", stem))
            .unwrap_or_else(|| test_rel.to_string()),
    }
}

/// First compiler diagnostic whose code is not in the ignorable set, as
/// `TS<code>`.
fn fatal_compile_error(output: &str) -> Option<String> {
    let re = Regex::new(r"error TS(\d+)").expect("diagnostic regex");
    for line in output.lines() {
        if let Some(cap) = re.captures(line) {
            let code: u32 = cap[1].parse().unwrap_or(0);
            if !IGNORABLE_TS_CODES.contains(&code) {
                return Some(format!("TS{}", code));
            }
        }
    }
    None
}

/// Locate the runner's JSON payload in noisy output: the last occurrence of
/// a known prefix, parsed from there.
fn extract_json_payload(output: &str) -> Option<serde_json::Value> {
    let start = JSON_PREFIXES
        .iter()
        .filter_map(|p| output.rfind(p))
        .max()?;
    serde_json::from_str(&output[start..])
        .ok()
        .or_else(|| {
            // The payload may be followed by trailing noise; let serde stop
            // at the end of the first JSON value.
            let mut de = serde_json::Deserializer::from_str(&output[start..]);
            serde_json::Value::deserialize(&mut de).ok()
        })
}

/// Longest-suffix match of the source file against the coverage map keys,
/// falling back to its basename.
fn find_coverage_entry<'a>(
    map: &'a serde_json::Map<String, serde_json::Value>,
    source_rel: &str,
) -> Option<&'a serde_json::Value> {
    let basename = source_rel.rsplit('/').next().unwrap_or(source_rel);
    let mut best: Option<(usize, &serde_json::Value)> = None;
    for (key, value) in map {
        let normalized = key.replace('\\', "/");
        let score = if normalized == source_rel || normalized.ends_with(&format!("/{}", source_rel))
        {
            source_rel.len()
        } else if normalized.ends_with(&format!("/{}", basename)) {
            basename.len()
        } else {
            continue;
        };
        if best.map(|(s, _)| score > s).unwrap_or(true) {
            best = Some((score, value));
        }
    }
    best.map(|(_, v)| v)
}

/// Statement coverage percentage plus the identifiers of uncovered
/// statements. Prefers a published `pct`; otherwise computed from the
/// statement-hit map. A file with no statements counts as fully covered.
fn statement_coverage(entry: &serde_json::Value) -> (f64, Vec<String>) {
    let hits = entry.get("s").and_then(|s| s.as_object());

    let uncovered: Vec<String> = hits
        .map(|s| {
            let mut ids: Vec<String> = s
                .iter()
                .filter(|(_, v)| v.as_f64().unwrap_or(0.0) == 0.0)
                .map(|(k, _)| k.clone())
                .collect();
            ids.sort();
            ids
        })
        .unwrap_or_default();

    if let Some(pct) = entry
        .get("statements")
        .and_then(|s| s.get("pct"))
        .and_then(|p| p.as_f64())
    {
        return (pct, uncovered);
    }

    match hits {
        Some(s) if !s.is_empty() => {
            let total = s.len() as f64;
            let covered = s
                .values()
                .filter(|v| v.as_f64().unwrap_or(0.0) > 0.0)
                .count() as f64;
            (covered / total * 100.0, uncovered)
        }
        _ => (100.0, uncovered),
    }
}
