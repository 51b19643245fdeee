//! Static extraction of dependency signatures for prompt context.
//!
//! Looks at the constructor parameters of the classes declared in a target
//! source file, finds where each parameter type is defined in the repository,
//! and collects that type's public method signatures verbatim. The generator
//! inserts the formatted block into its prompt so mocks match real
//! signatures instead of hallucinated ones. Extraction is best-effort: any
//! failure produces an empty collection and a log line, never an error.

use std::path::{Path, PathBuf};

use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub struct MethodSignature {
    pub method_name: String,
    pub params_text: String,
    pub return_type_text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DependencySignatures {
    pub type_name: String,
    pub methods: Vec<MethodSignature>,
}

/// Framework and infrastructure types that are noise in a prompt.
const TYPE_DENY_LIST: &[&str] = &[
    "Logger",
    "ConfigService",
    "Reflector",
    "ModuleRef",
    "HttpService",
    "EventEmitter2",
    "DataSource",
    "EntityManager",
    "Repository",
    "Connection",
    "JwtService",
    "CacheManager",
];

const WALK_SKIP_DIRS: &[&str] = &["node_modules", "dist", "build", "coverage", ".git"];

pub struct DependencyAnalyzer;

impl DependencyAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Signatures of the types the file's classes take as constructor
    /// parameters. Empty on any failure.
    pub async fn analyze(&self, source_path: &Path, repo_path: &Path) -> Vec<DependencySignatures> {
        let source = match tokio::fs::read_to_string(source_path).await {
            Ok(s) => s,
            Err(e) => {
                eprintln!(
                    "[analyzer] Failed to read {}: {}",
                    source_path.display(),
                    e
                );
                return Vec::new();
            }
        };

        let type_names = extract_constructor_types(&source);
        if type_names.is_empty() {
            return Vec::new();
        }

        let repo = repo_path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            let files = collect_ts_files(&repo);
            let mut out = Vec::new();
            for type_name in type_names {
                if let Some(methods) = find_type_methods(&files, &type_name) {
                    out.push(DependencySignatures { type_name, methods });
                }
            }
            out
        })
        .await;

        match result {
            Ok(signatures) => signatures,
            Err(e) => {
                eprintln!("[analyzer] Signature extraction task panicked: {}", e);
                Vec::new()
            }
        }
    }

    /// Human-readable block for insertion into a generation prompt.
    pub fn format_block(signatures: &[DependencySignatures]) -> String {
        if signatures.is_empty() {
            return String::new();
        }
        let mut block = String::from("Dependency signatures (mock against these exactly):\n");
        for dep in signatures {
            block.push_str(&format!("\n{}:\n", dep.type_name));
            for m in &dep.methods {
                block.push_str(&format!(
                    "  - {}({}): {}\n",
                    m.method_name, m.params_text, m.return_type_text
                ));
            }
        }
        block
    }
}

impl Default for DependencyAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Type names appearing as constructor parameters of any class in `source`,
/// minus primitives and the deny-list.
fn extract_constructor_types(source: &str) -> Vec<String> {
    let ctor_re = Regex::new(r"(?s)constructor\s*\((.*?)\)").expect("constructor regex");
    let type_re = Regex::new(r":\s*([A-Za-z_][A-Za-z0-9_]*)").expect("param type regex");

    let mut types = Vec::new();
    for ctor in ctor_re.captures_iter(source) {
        for param in ctor[1].split(',') {
            if let Some(cap) = type_re.captures(param) {
                let name = cap[1].to_string();
                let first = name.chars().next().unwrap_or('a');
                if first.is_lowercase() {
                    continue; // primitive or inline type
                }
                if TYPE_DENY_LIST.contains(&name.as_str()) {
                    continue;
                }
                if !types.contains(&name) {
                    types.push(name);
                }
            }
        }
    }
    types
}

fn collect_ts_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !WALK_SKIP_DIRS.contains(&name.as_ref()) && !name.starts_with('.') {
                    stack.push(path);
                }
            } else if path.extension().map(|e| e == "ts").unwrap_or(false) {
                files.push(path);
            }
        }
    }
    files
}

/// Locate the file declaring `type_name` and scrape its public method
/// signatures. Parameter and return-type text is kept verbatim, without
/// truncation.
fn find_type_methods(files: &[PathBuf], type_name: &str) -> Option<Vec<MethodSignature>> {
    let decl_re = Regex::new(&format!(
        r"(?:class|interface)\s+{}\b",
        regex::escape(type_name)
    ))
    .ok()?;
    let method_re = Regex::new(
        r"(?m)^\s*(?:public\s+)?(?:async\s+)?([A-Za-z_]\w*)\s*(?:<[^>]*>)?\s*\(([^)]*)\)\s*:\s*([^;{]+)",
    )
    .ok()?;

    for file in files {
        let content = match std::fs::read_to_string(file) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let decl = match decl_re.find(&content) {
            Some(m) => m,
            None => continue,
        };

        let body = &content[decl.start()..];
        let mut methods = Vec::new();
        for cap in method_re.captures_iter(body) {
            let name = cap[1].to_string();
            if name == "constructor" || name == "return" {
                continue;
            }
            methods.push(MethodSignature {
                method_name: name,
                params_text: cap[2].trim().to_string(),
                return_type_text: cap[3].trim().to_string(),
            });
        }
        return Some(methods);
    }
    None
}
