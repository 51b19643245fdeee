use std::path::PathBuf;

use anyhow::Result;

/// Runtime configuration, read once from the environment at process startup
/// and passed explicitly through the call graph.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    pub github_token: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub clone_base_path: PathBuf,
    pub sandbox_image: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("PORT must be a number, got '{}'", v))?,
            Err(_) => 3000,
        };

        let github_token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
        if github_token.is_none() {
            eprintln!(
                "[config] GITHUB_TOKEN is not set; running in development mode \
                 (permission checks pass, pull requests are mocked)"
            );
        }

        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty());
        if gemini_api_key.is_none() {
            eprintln!("[config] GEMINI_API_KEY is not set; test generation will fail per job");
        }

        Ok(Self {
            port,
            db_path: std::env::var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("database.sqlite")),
            github_token,
            gemini_api_key,
            gemini_model: std::env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| "gemini-2.0-flash-lite".to_string()),
            clone_base_path: std::env::var("HOST_CLONE_BASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/clones")),
            sandbox_image: std::env::var("SANDBOX_IMAGE")
                .unwrap_or_else(|_| "node:20-bookworm-slim".to_string()),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            db_path: PathBuf::from("database.sqlite"),
            github_token: None,
            gemini_api_key: None,
            gemini_model: "gemini-2.0-flash-lite".to_string(),
            clone_base_path: PathBuf::from("/tmp/clones"),
            sandbox_image: "node:20-bookworm-slim".to_string(),
        }
    }
}
