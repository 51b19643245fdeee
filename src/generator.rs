//! Test generation through the opaque generator CLI, with a bounded
//! generate → validate → repair loop.
//!
//! Each attempt writes the prompt and system instruction to scratch files in
//! the clone, invokes the generator inside the sandbox (network allowed,
//! credential in the environment), sanitizes the returned code, and writes
//! it to a verification sibling of the target test path. Only a test that
//! passes the validator is renamed into place; the validator's error text
//! feeds the next attempt's prompt. The loop converges within two or three
//! iterations for most files and is cut off at three.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::analyzer::DependencyAnalyzer;
use crate::errors::GenerationError;
use crate::sandbox::{SandboxOutput, SandboxRunner, tail};
use crate::validator::Validator;

pub const MAX_GENERATION_ATTEMPTS: u32 = 3;
const GENERATION_TIMEOUT: Duration = Duration::from_secs(120);

const PROMPT_FILE: &str = ".gemini-prompt.txt";
const SYSTEM_DIR: &str = ".gemini";
const SYSTEM_FILE: &str = ".gemini/system.md";

const SKIP_FILENAMES: &[&str] = &["app.ts", "main.ts", "index.ts", "jest.config.ts"];
const SKIP_DIRS: &[&str] = &[
    "interfaces",
    "dto",
    "entities",
    "migrations",
    "node_modules",
    "dist",
    "coverage",
    "types",
];
const SKIP_EXTENSIONS: &[&str] = &[
    ".interface.ts",
    ".d.ts",
    ".module.ts",
    ".entity.ts",
    ".dto.ts",
    ".spec.ts",
    ".test.ts",
];

/// Generate one validated test file for one source file.
#[async_trait]
pub trait TestGenerator: Send + Sync {
    async fn generate_test(
        &self,
        source_rel: &str,
        test_rel: &str,
        repo_path: &Path,
        target_coverage: f64,
    ) -> Result<(), GenerationError>;
}

/// Seam around the actual CLI invocation, so the repair loop is testable
/// without a sandbox.
#[async_trait]
pub trait GeneratorBackend: Send + Sync {
    async fn invoke(&self, repo_path: &Path) -> SandboxOutput;
}

/// Invokes the Gemini CLI from the toolchain volume inside the sandbox.
pub struct GeminiCliBackend {
    sandbox: Arc<SandboxRunner>,
    model: String,
    api_key: Option<String>,
}

impl GeminiCliBackend {
    pub fn new(sandbox: Arc<SandboxRunner>, model: String, api_key: Option<String>) -> Self {
        Self {
            sandbox,
            model,
            api_key,
        }
    }
}

#[async_trait]
impl GeneratorBackend for GeminiCliBackend {
    async fn invoke(&self, repo_path: &Path) -> SandboxOutput {
        let api_key = match &self.api_key {
            Some(key) => key.clone(),
            None => {
                return SandboxOutput {
                    success: false,
                    output: "GEMINI_API_KEY is not configured".to_string(),
                };
            }
        };

        let mut env = HashMap::new();
        env.insert("GEMINI_API_KEY".to_string(), api_key);
        env.insert("GEMINI_SYSTEM_MD".to_string(), SYSTEM_FILE.to_string());

        self.sandbox
            .run(
                "sh",
                &[
                    "-lc".to_string(),
                    format!(
                        "gemini --output-format json -m '{}' -p \"$(cat {})\"",
                        self.model, PROMPT_FILE
                    ),
                ],
                repo_path,
                &env,
                GENERATION_TIMEOUT,
                true,
                false,
            )
            .await
    }
}

pub struct AIGenerator {
    backend: Arc<dyn GeneratorBackend>,
    validator: Arc<dyn Validator>,
    analyzer: DependencyAnalyzer,
}

impl AIGenerator {
    pub fn new(backend: Arc<dyn GeneratorBackend>, validator: Arc<dyn Validator>) -> Self {
        Self {
            backend,
            validator,
            analyzer: DependencyAnalyzer::new(),
        }
    }
}

#[async_trait]
impl TestGenerator for AIGenerator {
    async fn generate_test(
        &self,
        source_rel: &str,
        test_rel: &str,
        repo_path: &Path,
        target_coverage: f64,
    ) -> Result<(), GenerationError> {
        if should_skip(source_rel) {
            eprintln!("[generator] Skipping {} (excluded file class)", source_rel);
            return Ok(());
        }

        // Gather context in parallel: the source text, the declared package
        // set, and the dependency signatures.
        let source_abs = repo_path.join(source_rel);
        let (source, packages, signatures) = tokio::join!(
            tokio::fs::read_to_string(&source_abs),
            read_declared_packages(repo_path),
            self.analyzer.analyze(&source_abs, repo_path),
        );
        let source = source.map_err(|e| {
            GenerationError::Other(anyhow::anyhow!("Failed to read {}: {}", source_rel, e))
        })?;
        let signatures_block = DependencyAnalyzer::format_block(&signatures);

        let import_path = derive_import_path(test_rel, source_rel);
        let verification_rel = verification_path_for(test_rel);
        let verification_abs = repo_path.join(&verification_rel);
        let test_abs = repo_path.join(test_rel);

        let mut last_error = String::from("generator produced no output");

        for attempt in 1..=MAX_GENERATION_ATTEMPTS {
            let prior = if attempt > 1 { Some(last_error.as_str()) } else { None };
            let prompt = build_prompt(
                source_rel,
                test_rel,
                &import_path,
                &source,
                &packages,
                &signatures_block,
                prior,
            );

            write_prompt_files(repo_path, &prompt, target_coverage)
                .await
                .map_err(GenerationError::Other)?;
            let out = self.backend.invoke(repo_path).await;
            remove_prompt_files(repo_path).await;

            let text = match parse_generator_response(&out.output) {
                Ok(text) => text,
                Err(message) => {
                    eprintln!(
                        "[generator] {} attempt {}/{} failed: {}",
                        source_rel, attempt, MAX_GENERATION_ATTEMPTS, message
                    );
                    last_error = message;
                    continue;
                }
            };

            let code = extract_code_block(&text);
            if let Err(e) = tokio::fs::write(&verification_abs, &code).await {
                return Err(GenerationError::Other(anyhow::anyhow!(
                    "Failed to write verification file {}: {}",
                    verification_rel,
                    e
                )));
            }

            let outcome = self
                .validator
                .validate(&verification_rel, repo_path, target_coverage)
                .await
                .map_err(GenerationError::Other)?;

            if outcome.success {
                tokio::fs::rename(&verification_abs, &test_abs)
                    .await
                    .map_err(|e| {
                        GenerationError::Other(anyhow::anyhow!(
                            "Failed to move validated test into place: {}",
                            e
                        ))
                    })?;
                eprintln!(
                    "[generator] {} validated at {:.1}% coverage on attempt {}",
                    source_rel,
                    outcome.measured_coverage.unwrap_or(0.0),
                    attempt
                );
                return Ok(());
            }

            last_error = outcome
                .error_text
                .unwrap_or_else(|| "validation failed without detail".to_string());
            eprintln!(
                "[generator] {} attempt {}/{} rejected: {}",
                source_rel,
                attempt,
                MAX_GENERATION_ATTEMPTS,
                tail(&last_error, 300)
            );
        }

        let _ = tokio::fs::remove_file(&verification_abs).await;
        Err(GenerationError::Exhausted {
            attempts: MAX_GENERATION_ATTEMPTS,
            last_error,
        })
    }
}

/// Files the generator refuses up front: entry points, config, declaration
/// and wiring files, and anything already a test.
pub fn should_skip(source_rel: &str) -> bool {
    let normalized = source_rel.replace('\\', "/");
    let basename = normalized.rsplit('/').next().unwrap_or(&normalized);

    if SKIP_FILENAMES.contains(&basename) {
        return true;
    }
    if SKIP_EXTENSIONS.iter().any(|ext| basename.ends_with(ext)) {
        return true;
    }
    normalized
        .split('/')
        .rev()
        .skip(1) // basename
        .any(|dir| SKIP_DIRS.contains(&dir))
}

/// Relative import specifier from the test file's directory to the source
/// module, extension stripped, `./`-prefixed within the same directory.
fn derive_import_path(test_rel: &str, source_rel: &str) -> String {
    let test_dir: Vec<&str> = {
        let mut parts: Vec<&str> = test_rel.split('/').collect();
        parts.pop();
        parts
    };
    let source_parts: Vec<&str> = source_rel.split('/').collect();

    let mut common = 0;
    while common < test_dir.len()
        && common + 1 < source_parts.len()
        && test_dir[common] == source_parts[common]
    {
        common += 1;
    }

    let mut parts: Vec<String> = std::iter::repeat("..".to_string())
        .take(test_dir.len() - common)
        .collect();
    parts.extend(source_parts[common..].iter().map(|s| s.to_string()));

    let mut joined = parts.join("/");
    if let Some(stripped) = joined.strip_suffix(".ts") {
        joined = stripped.to_string();
    }
    if !joined.starts_with("../") {
        joined = format!("./{}", joined);
    }
    joined
}

/// Verification sibling of the target test path: the unvalidated candidate
/// never overwrites the real test file.
pub fn verification_path_for(test_rel: &str) -> String {
    if let Some(stem) = test_rel.strip_suffix(".spec.ts") {
        return format!("{}.verification.test.ts", stem);
    }
    if let Some(stem) = test_rel.strip_suffix(".test.ts") {
        return format!("{}.verification.test.ts", stem);
    }
    format!("{}.verification.test.ts", test_rel)
}

fn system_instruction(target_coverage: f64) -> String {
    format!(
        "You are an expert TypeScript test engineer.\n\
         Write a complete jest test file for the source file in the prompt.\n\
         Requirements:\n\
         - Reach at least {:.0}% statement coverage of the target source file.\n\
         - Mock every constructor dependency; match the provided signatures exactly.\n\
         - Use only packages the repository already declares.\n\
         - Cover error paths and edge cases, not just the happy path.\n\
         - Output only the test file contents, no commentary.\n",
        target_coverage
    )
}

#[allow(clippy::too_many_arguments)]
fn build_prompt(
    source_rel: &str,
    test_rel: &str,
    import_path: &str,
    source: &str,
    packages: &[String],
    signatures_block: &str,
    prior_error: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Generate a jest unit test.\n\n\
         Source file path: {}\n\
         Save the test to: {}\n\
         Import the subject from: '{}'\n\n\
         Declared packages: {}\n",
        source_rel,
        test_rel,
        import_path,
        if packages.is_empty() {
            "(none)".to_string()
        } else {
            packages.join(", ")
        },
    );
    if !signatures_block.is_empty() {
        prompt.push_str(&format!("\n{}\n", signatures_block));
    }
    prompt.push_str(&format!("\nSource code:\n```typescript\n{}\n```\n", source));
    if let Some(error) = prior_error {
        prompt.push_str(&format!(
            "\nThe previous attempt failed validation with:\n{}\n\
             Fix the problem and output the corrected complete test file.\n",
            error
        ));
    }
    prompt
}

async fn write_prompt_files(
    repo_path: &Path,
    prompt: &str,
    target_coverage: f64,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(repo_path.join(SYSTEM_DIR)).await?;
    tokio::fs::write(repo_path.join(SYSTEM_FILE), system_instruction(target_coverage)).await?;
    tokio::fs::write(repo_path.join(PROMPT_FILE), prompt).await?;
    Ok(())
}

/// Prompt scratch files live only within one attempt.
async fn remove_prompt_files(repo_path: &Path) {
    let _ = tokio::fs::remove_file(repo_path.join(PROMPT_FILE)).await;
    let _ = tokio::fs::remove_file(repo_path.join(SYSTEM_FILE)).await;
    let _ = tokio::fs::remove_dir(repo_path.join(SYSTEM_DIR)).await;
}

async fn read_declared_packages(repo_path: &Path) -> Vec<String> {
    let manifest = match tokio::fs::read_to_string(repo_path.join("package.json")).await {
        Ok(m) => m,
        Err(_) => return Vec::new(),
    };
    let value: serde_json::Value = match serde_json::from_str(&manifest) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    let mut packages = Vec::new();
    for section in ["dependencies", "devDependencies"] {
        if let Some(deps) = value.get(section).and_then(|d| d.as_object()) {
            packages.extend(deps.keys().cloned());
        }
    }
    packages.sort();
    packages
}

/// Parse the CLI's JSON across its known shapes: an array of candidate
/// objects, `response`, `text`, or the raw candidates tree. A non-empty
/// `error` fails the attempt with the provider's message.
fn parse_generator_response(raw: &str) -> Result<String, String> {
    let value = parse_json_lenient(raw)
        .ok_or_else(|| format!("Generator output was not JSON: {}", tail(raw.trim(), 300)))?;

    let value = match value.as_array() {
        Some(arr) => arr.first().cloned().unwrap_or(serde_json::Value::Null),
        None => value,
    };

    if let Some(error) = value.get("error") {
        if !error.is_null() {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            if !message.is_empty() && message != "\"\"" {
                return Err(message);
            }
        }
    }

    for field in ["response", "text"] {
        if let Some(text) = value.get(field).and_then(|v| v.as_str()) {
            if !text.is_empty() {
                return Ok(text.to_string());
            }
        }
    }
    if let Some(text) = value
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(|v| v.as_str())
    {
        return Ok(text.to_string());
    }

    Err("Generator output carried no recognizable text field".to_string())
}

fn parse_json_lenient(raw: &str) -> Option<serde_json::Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    // The CLI may print noise around the payload; take the outermost
    // brace-balanced object.
    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in trimmed[start..].char_indices() {
        match ch {
            '"' if !escaped => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&trimmed[start..start + i + 1]).ok();
                }
            }
            _ => {}
        }
        escaped = ch == '\\' && !escaped;
    }
    None
}

/// Body of the first fenced code block when one exists, the trimmed text
/// otherwise.
fn extract_code_block(text: &str) -> String {
    let re = Regex::new(r"(?s)```(?:typescript|ts|javascript|js)?\s*\n(.*?)```")
        .expect("fence regex");
    match re.captures(text) {
        Some(cap) => cap[1].to_string(),
        None => text.trim().to_string(),
    }
}
