//! Repository-hosting provider operations.
//!
//! `GithubHost` talks to the GitHub REST API for everything that needs no
//! checkout (manifest inspection, permission check, pull-request creation)
//! and to the `git` CLI for clone/branch/push. Credentials never appear in
//! remote URLs (auth rides an injected HTTP header) and commits are
//! attributed to a fixed bot identity. Without a configured token the host
//! runs in development mode: permission checks pass and pull requests
//! return a synthesized mock URL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use crate::errors::HostError;
use crate::sandbox::run_on_host;

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = "coverage-bot";
const BOT_NAME: &str = "coverage-bot";
const BOT_EMAIL: &str = "coverage-bot@users.noreply.github.com";

const GIT_TIMEOUT: Duration = Duration::from_secs(300);
const GIT_MAX_BUFFER: usize = 10 * 1024 * 1024;

/// Provider-side operations the core depends on. Test doubles implement the
/// same surface.
#[async_trait]
pub trait RepositoryHost: Send + Sync {
    /// True iff every name in `deps` appears in the manifest's declared
    /// runtime or development dependencies. Reads the manifest via the API,
    /// no clone.
    async fn has_required_dependencies(&self, url: &str, deps: &[&str])
    -> Result<bool, HostError>;

    /// True iff the configured credential has write or admin rights.
    async fn check_permissions(&self, url: &str) -> Result<bool, HostError>;

    /// Clone into a unique directory under the configured base. A given
    /// branch is cloned shallowly as the sole branch.
    async fn clone_repository(
        &self,
        url: &str,
        branch: Option<&str>,
    ) -> Result<PathBuf, HostError>;

    /// Branch name the fresh checkout reports, `"main"` when it reports none.
    async fn default_branch(&self, local_path: &Path) -> Result<String, HostError>;

    /// Create and check out `branch_name`, write `file_map`, stage only the
    /// explicit `paths_to_stage` (or the map's keys), commit, and push with
    /// upstream tracking. Never stages everything.
    async fn commit_and_push(
        &self,
        local_path: &Path,
        branch_name: &str,
        file_map: &HashMap<String, String>,
        commit_message: &str,
        paths_to_stage: Option<&[String]>,
    ) -> Result<(), HostError>;

    async fn create_pull_request(
        &self,
        url: &str,
        head_branch: &str,
        title: &str,
        body: &str,
        base_branch: &str,
    ) -> Result<String, HostError>;

    /// Recursively remove a clone directory; absent paths are silent.
    async fn cleanup(&self, local_path: &Path) -> Result<(), HostError>;
}

/// Extract `(owner, repo)` from the URL formats the bot accepts.
pub fn parse_owner_repo(url: &str) -> Result<(String, String), HostError> {
    let trimmed = url.trim().trim_end_matches('/').trim_end_matches(".git");

    if let Some(pos) = trimmed.find("github.com/") {
        let rest = &trimmed[pos + "github.com/".len()..];
        let parts: Vec<&str> = rest.splitn(3, '/').collect();
        if parts.len() >= 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            return Ok((parts[0].to_string(), parts[1].to_string()));
        }
    }
    if let Some(rest) = trimmed.strip_prefix("git@github.com:") {
        let parts: Vec<&str> = rest.splitn(3, '/').collect();
        if parts.len() >= 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            return Ok((parts[0].to_string(), parts[1].to_string()));
        }
    }
    // Bare "owner/repo"
    let parts: Vec<&str> = trimmed.split('/').collect();
    if parts.len() == 2
        && !parts[0].is_empty()
        && !parts[1].is_empty()
        && !parts[0].contains(':')
        && !parts[0].contains('.')
    {
        return Ok((parts[0].to_string(), parts[1].to_string()));
    }

    Err(HostError::InvalidRepoUrl(url.to_string()))
}

/// Canonical form used for uniqueness checks and storage.
pub fn normalize_url(url: &str) -> Result<String, HostError> {
    let (owner, repo) = parse_owner_repo(url)?;
    Ok(format!("https://github.com/{}/{}", owner, repo))
}

pub struct GithubHost {
    client: reqwest::Client,
    token: Option<String>,
    clone_base: PathBuf,
}

#[derive(Deserialize)]
struct RepoPermissions {
    #[serde(default)]
    admin: bool,
    #[serde(default)]
    push: bool,
}

#[derive(Deserialize)]
struct RepoInfo {
    permissions: Option<RepoPermissions>,
}

#[derive(Deserialize)]
struct PackageManifest {
    #[serde(default)]
    dependencies: HashMap<String, serde_json::Value>,
    #[serde(default, rename = "devDependencies")]
    dev_dependencies: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct CreatedPullRequest {
    html_url: String,
}

impl GithubHost {
    pub fn new(token: Option<String>, clone_base: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            clone_base,
        }
    }

    fn api_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", GITHUB_API, path))
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json");
        if let Some(ref token) = self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req
    }

    /// `-c http.extraheader=...` arguments injecting auth into git's HTTP
    /// transport, keeping the token out of the remote URL and of `git
    /// remote -v` output.
    fn git_auth_args(&self) -> Vec<String> {
        match &self.token {
            Some(token) => {
                let basic = BASE64.encode(format!("x-access-token:{}", token));
                vec![
                    "-c".to_string(),
                    format!("http.extraheader=AUTHORIZATION: basic {}", basic),
                ]
            }
            None => Vec::new(),
        }
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String, HostError> {
        let out = run_on_host("git", args, cwd, GIT_TIMEOUT, GIT_MAX_BUFFER, &HashMap::new())
            .await
            .map_err(|e| HostError::Provider(format!("{:#}", e)))?;
        Ok(out.stdout)
    }
}

#[async_trait]
impl RepositoryHost for GithubHost {
    async fn has_required_dependencies(
        &self,
        url: &str,
        deps: &[&str],
    ) -> Result<bool, HostError> {
        let (owner, repo) = parse_owner_repo(url)?;
        let response = self
            .api_request(
                reqwest::Method::GET,
                &format!("/repos/{}/{}/contents/package.json", owner, repo),
            )
            .header("Accept", "application/vnd.github.raw")
            .send()
            .await
            .map_err(|e| HostError::Provider(format!("Manifest fetch failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let manifest: PackageManifest = response
            .error_for_status()
            .map_err(|e| HostError::Provider(format!("Manifest fetch failed: {}", e)))?
            .json()
            .await
            .map_err(|e| HostError::Provider(format!("Manifest is not valid JSON: {}", e)))?;

        Ok(deps.iter().all(|d| {
            manifest.dependencies.contains_key(*d) || manifest.dev_dependencies.contains_key(*d)
        }))
    }

    async fn check_permissions(&self, url: &str) -> Result<bool, HostError> {
        let (owner, repo) = parse_owner_repo(url)?;
        if self.token.is_none() {
            eprintln!(
                "[host] No GITHUB_TOKEN configured, skipping permission check for {}/{}",
                owner, repo
            );
            return Ok(true);
        }
        let info: RepoInfo = self
            .api_request(reqwest::Method::GET, &format!("/repos/{}/{}", owner, repo))
            .send()
            .await
            .map_err(|e| HostError::Provider(format!("Permission check failed: {}", e)))?
            .error_for_status()
            .map_err(|e| HostError::Provider(format!("Permission check failed: {}", e)))?
            .json()
            .await
            .map_err(|e| HostError::Provider(format!("Permission response invalid: {}", e)))?;

        Ok(info
            .permissions
            .map(|p| p.admin || p.push)
            .unwrap_or(false))
    }

    async fn clone_repository(
        &self,
        url: &str,
        branch: Option<&str>,
    ) -> Result<PathBuf, HostError> {
        let (owner, repo) = parse_owner_repo(url)?;
        let remote = format!("https://github.com/{}/{}.git", owner, repo);

        tokio::fs::create_dir_all(&self.clone_base)
            .await
            .map_err(|e| HostError::Provider(format!("Failed to create clone base: {}", e)))?;

        let dir_name = format!("{}-{}", repo, uuid::Uuid::new_v4().simple());
        let target = self.clone_base.join(dir_name);
        let target_str = target.to_string_lossy().to_string();

        let mut args: Vec<String> = self.git_auth_args();
        args.push("clone".to_string());
        if let Some(b) = branch {
            args.extend([
                "--branch".to_string(),
                b.to_string(),
                "--single-branch".to_string(),
                "--depth".to_string(),
                "1".to_string(),
            ]);
        }
        args.push(remote);
        args.push(target_str);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git(&self.clone_base, &arg_refs).await?;

        // Bot identity for any commits made in this clone.
        self.git(&target, &["config", "user.name", BOT_NAME]).await?;
        self.git(&target, &["config", "user.email", BOT_EMAIL]).await?;

        Ok(target)
    }

    async fn default_branch(&self, local_path: &Path) -> Result<String, HostError> {
        match self
            .git(local_path, &["symbolic-ref", "--short", "HEAD"])
            .await
        {
            Ok(out) => {
                let branch = out.trim().to_string();
                if branch.is_empty() {
                    Ok("main".to_string())
                } else {
                    Ok(branch)
                }
            }
            Err(_) => Ok("main".to_string()),
        }
    }

    async fn commit_and_push(
        &self,
        local_path: &Path,
        branch_name: &str,
        file_map: &HashMap<String, String>,
        commit_message: &str,
        paths_to_stage: Option<&[String]>,
    ) -> Result<(), HostError> {
        self.git(local_path, &["checkout", "-b", branch_name]).await?;

        for (rel_path, content) in file_map {
            let full = local_path.join(rel_path);
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    HostError::Provider(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
            tokio::fs::write(&full, content).await.map_err(|e| {
                HostError::Provider(format!("Failed to write {}: {}", full.display(), e))
            })?;
        }

        // Stage only what was asked for: coverage artifacts and injected
        // configs must never leak into the commit.
        let staged: Vec<String> = match paths_to_stage {
            Some(paths) => paths.to_vec(),
            None => file_map.keys().cloned().collect(),
        };
        if staged.is_empty() {
            return Err(HostError::Provider("Nothing to stage for commit".to_string()));
        }
        let mut add_args = vec!["add", "--"];
        add_args.extend(staged.iter().map(String::as_str));
        self.git(local_path, &add_args).await?;

        self.git(local_path, &["commit", "-m", commit_message]).await?;

        let mut push_args: Vec<String> = self.git_auth_args();
        push_args.extend([
            "push".to_string(),
            "-u".to_string(),
            "origin".to_string(),
            branch_name.to_string(),
        ]);
        let push_refs: Vec<&str> = push_args.iter().map(String::as_str).collect();
        self.git(local_path, &push_refs).await?;

        Ok(())
    }

    async fn create_pull_request(
        &self,
        url: &str,
        head_branch: &str,
        title: &str,
        body: &str,
        base_branch: &str,
    ) -> Result<String, HostError> {
        let (owner, repo) = parse_owner_repo(url)?;

        if self.token.is_none() {
            let mock = format!(
                "https://github.com/{}/{}/pull/mock-{}",
                owner,
                repo,
                uuid::Uuid::new_v4().simple()
            );
            eprintln!(
                "[host] No GITHUB_TOKEN configured, returning mock pull request URL {}",
                mock
            );
            return Ok(mock);
        }

        let created: CreatedPullRequest = self
            .api_request(
                reqwest::Method::POST,
                &format!("/repos/{}/{}/pulls", owner, repo),
            )
            .json(&serde_json::json!({
                "title": title,
                "head": head_branch,
                "base": base_branch,
                "body": body,
            }))
            .send()
            .await
            .map_err(|e| HostError::Provider(format!("Pull request creation failed: {}", e)))?
            .error_for_status()
            .map_err(|e| HostError::Provider(format!("Pull request creation failed: {}", e)))?
            .json()
            .await
            .map_err(|e| HostError::Provider(format!("Pull request response invalid: {}", e)))?;

        Ok(created.html_url)
    }

    async fn cleanup(&self, local_path: &Path) -> Result<(), HostError> {
        match tokio::fs::remove_dir_all(local_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HostError::Provider(format!(
                "Failed to remove {}: {}",
                local_path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_https_url() {
        let (o, r) = parse_owner_repo("https://github.com/octo/widgets").unwrap();
        assert_eq!(o, "octo");
        assert_eq!(r, "widgets");
    }

    #[test]
    fn test_parse_url_strips_git_suffix_and_slash() {
        let (o, r) = parse_owner_repo("https://github.com/octo/widgets.git/").unwrap();
        assert_eq!(o, "octo");
        assert_eq!(r, "widgets");
    }

    #[test]
    fn test_parse_ssh_url() {
        let (o, r) = parse_owner_repo("git@github.com:octo/widgets.git").unwrap();
        assert_eq!(o, "octo");
        assert_eq!(r, "widgets");
    }

    #[test]
    fn test_parse_bare_owner_repo() {
        let (o, r) = parse_owner_repo("octo/widgets").unwrap();
        assert_eq!(o, "octo");
        assert_eq!(r, "widgets");
    }

    #[test]
    fn test_parse_invalid_url_fails_fast() {
        assert!(matches!(
            parse_owner_repo("not a url"),
            Err(HostError::InvalidRepoUrl(_))
        ));
        assert!(matches!(
            parse_owner_repo("https://github.com/onlyowner"),
            Err(HostError::InvalidRepoUrl(_))
        ));
    }

    #[test]
    fn test_normalize_url_variants_converge() {
        for input in &[
            "https://github.com/octo/widgets",
            "https://github.com/octo/widgets.git",
            "octo/widgets",
            "git@github.com:octo/widgets.git",
        ] {
            assert_eq!(
                normalize_url(input).unwrap(),
                "https://github.com/octo/widgets"
            );
        }
    }

    #[test]
    fn test_git_auth_args_absent_without_token() {
        let host = GithubHost::new(None, PathBuf::from("/tmp/clones"));
        assert!(host.git_auth_args().is_empty());
    }

    #[test]
    fn test_git_auth_args_do_not_embed_raw_token() {
        let host = GithubHost::new(Some("sekrit".to_string()), PathBuf::from("/tmp/clones"));
        let args = host.git_auth_args();
        assert_eq!(args.len(), 2);
        assert!(args[1].starts_with("http.extraheader=AUTHORIZATION: basic "));
        assert!(!args[1].contains("sekrit"));
    }

    #[tokio::test]
    async fn test_mock_pr_url_without_token() {
        let host = GithubHost::new(None, PathBuf::from("/tmp/clones"));
        let url = host
            .create_pull_request(
                "https://github.com/octo/widgets",
                "improve-coverage-1",
                "Improve test coverage for src/a.ts",
                "",
                "main",
            )
            .await
            .unwrap();
        assert!(url.starts_with("https://github.com/octo/widgets/pull/mock-"));
    }

    #[tokio::test]
    async fn test_cleanup_missing_path_is_silent() {
        let host = GithubHost::new(None, PathBuf::from("/tmp/clones"));
        host.cleanup(Path::new("/tmp/covbot-does-not-exist"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("clone");
        std::fs::create_dir_all(target.join("src")).unwrap();
        std::fs::write(target.join("src/a.ts"), "x").unwrap();

        let host = GithubHost::new(None, dir.path().to_path_buf());
        host.cleanup(&target).await.unwrap();
        assert!(!target.exists());
    }
}
