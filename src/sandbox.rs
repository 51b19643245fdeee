//! Sandboxed execution of commands that touch untrusted repository code.
//!
//! Every clone, install, test run, type-check, and generator invocation runs
//! in an ephemeral Docker container: the job's clone directory is mounted
//! read-write at `/app`, the shared toolchain volume read-only at
//! `/toolchain`, and `NODE_PATH` points at the toolchain's `node_modules` so
//! the runner, type checker, and generator CLI resolve without per-job
//! installation. Network is denied unless a call site opts in (dependency
//! install, generator invocation), and the container user is unprivileged
//! unless populating the toolchain.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::models::HostConfig;
use futures_util::StreamExt;
use tokio::io::AsyncReadExt;

/// Marker appended to the combined output when a sandboxed command is killed
/// by its timeout.
pub const TIMEOUT_MARKER: &str = "TIMEOUT";

const TOOLCHAIN_VOLUME: &str = "coverage-bot-toolchain";
const TOOLCHAIN_PACKAGES: &str = "jest ts-jest typescript @types/jest @google/gemini-cli";
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(600);

/// Result of one sandboxed command: non-zero exit, spawn failure, and
/// timeout all surface as `success = false` with the reason in the output.
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub success: bool,
    pub output: String,
}

/// Result of a host-side bookkeeping command.
#[derive(Debug, Clone)]
pub struct HostOutput {
    pub stdout: String,
    pub stderr: String,
}

struct ContainerRun<'a> {
    cmd: Vec<String>,
    host_dir: Option<&'a Path>,
    env: Vec<String>,
    timeout: Duration,
    allow_network: bool,
    run_as_root: bool,
    toolchain_writable: bool,
}

/// Process-wide sandbox handle. Created once by the worker at startup; no
/// other component allocates its own Docker connection.
pub struct SandboxRunner {
    docker: Docker,
    image: String,
}

impl SandboxRunner {
    /// Connect to the Docker daemon via the unix socket. Returns None if the
    /// daemon is unreachable.
    pub async fn connect(image: &str) -> Option<Self> {
        let docker = Docker::connect_with_socket_defaults().ok()?;
        if docker.ping().await.is_err() {
            return None;
        }
        let runner = Self {
            docker,
            image: image.to_string(),
        };
        runner.ensure_image().await;
        Some(runner)
    }

    /// Pull the sandbox image if it is not present locally. Failures are
    /// logged; per-run container creation will then fail explicitly.
    async fn ensure_image(&self) {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            return;
        }
        eprintln!("[sandbox] Pulling image {}", self.image);
        let options = bollard::image::CreateImageOptions {
            from_image: self.image.clone(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            if let Err(e) = progress {
                eprintln!("[sandbox] Image pull failed: {}", e);
                return;
            }
        }
    }

    /// Execute a command inside an ephemeral container with `host_dir`
    /// mounted read-write at `/app`.
    pub async fn run(
        &self,
        command: &str,
        args: &[String],
        host_dir: &Path,
        env: &HashMap<String, String>,
        timeout: Duration,
        allow_network: bool,
        run_as_root: bool,
    ) -> SandboxOutput {
        let mut cmd = vec![command.to_string()];
        cmd.extend(args.iter().cloned());
        let env_vec: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        self.execute(ContainerRun {
            cmd,
            host_dir: Some(host_dir),
            env: env_vec,
            timeout,
            allow_network,
            run_as_root,
            toolchain_writable: false,
        })
        .await
    }

    async fn execute(&self, run: ContainerRun<'_>) -> SandboxOutput {
        let name = format!("covbot-{}", uuid::Uuid::new_v4().simple());

        let mut binds = Vec::new();
        if let Some(dir) = run.host_dir {
            binds.push(format!("{}:/app:rw", dir.display()));
        }
        let toolchain_mode = if run.toolchain_writable { "rw" } else { "ro" };
        binds.push(format!("{}:/toolchain:{}", TOOLCHAIN_VOLUME, toolchain_mode));

        let mut env = run.env;
        env.push("NODE_PATH=/toolchain/node_modules".to_string());
        env.push("PATH=/toolchain/node_modules/.bin:/usr/local/bin:/usr/bin:/bin".to_string());

        let network_mode = if run.allow_network { "bridge" } else { "none" };
        let user = if run.run_as_root {
            Some("root".to_string())
        } else {
            Some("1000:1000".to_string())
        };

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(run.cmd),
            env: Some(env),
            working_dir: run.host_dir.map(|_| "/app".to_string()),
            user,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                binds: Some(binds),
                network_mode: Some(network_mode.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        if let Err(e) = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
        {
            return SandboxOutput {
                success: false,
                output: format!("Failed to create sandbox container: {}", e),
            };
        }

        if let Err(e) = self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(&name).await;
            return SandboxOutput {
                success: false,
                output: format!("Failed to start sandbox container: {}", e),
            };
        }

        let mut wait_stream = self
            .docker
            .wait_container(&name, None::<WaitContainerOptions<String>>);

        let exit_code = match tokio::time::timeout(run.timeout, wait_stream.next()).await {
            Ok(Some(Ok(response))) => response.status_code,
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => code,
            Ok(Some(Err(e))) => {
                let logs = self.collect_logs(&name).await;
                self.remove(&name).await;
                return SandboxOutput {
                    success: false,
                    output: format!("{}\nSandbox wait failed: {}", logs, e),
                };
            }
            Ok(None) => {
                self.remove(&name).await;
                return SandboxOutput {
                    success: false,
                    output: "Sandbox wait stream ended unexpectedly".to_string(),
                };
            }
            Err(_) => {
                let logs = self.collect_logs(&name).await;
                self.remove(&name).await;
                return SandboxOutput {
                    success: false,
                    output: format!(
                        "{}\n{}: command exceeded {}s",
                        logs,
                        TIMEOUT_MARKER,
                        run.timeout.as_secs()
                    ),
                };
            }
        };

        let output = self.collect_logs(&name).await;
        self.remove(&name).await;

        SandboxOutput {
            success: exit_code == 0,
            output,
        }
    }

    /// Combined stdout/stderr of a finished (or killed) container.
    async fn collect_logs(&self, name: &str) -> String {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            tail: "all".to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut combined = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => combined.push_str(&log.to_string()),
                Err(_) => break,
            }
        }
        combined
    }

    async fn remove(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(options)).await {
            eprintln!("[sandbox] Failed to remove container {}: {}", name, e);
        }
    }

    // ── Toolchain cold start ──────────────────────────────────────────

    /// Probe the toolchain volume for its marker binaries; populate it with
    /// a one-off privileged install when they are missing. Failures are
    /// reported to the caller, which logs and continues; per-job runs will
    /// then fail explicitly.
    pub async fn ensure_toolchain(&self) -> Result<()> {
        if self.toolchain_ready().await {
            return Ok(());
        }

        eprintln!("[sandbox] Toolchain volume is empty, installing packages");
        let install = self
            .execute(ContainerRun {
                cmd: vec![
                    "sh".to_string(),
                    "-lc".to_string(),
                    format!(
                        "mkdir -p /toolchain && npm install --prefix /toolchain \
                         --no-save --no-audit --no-fund {}",
                        TOOLCHAIN_PACKAGES
                    ),
                ],
                host_dir: None,
                env: Vec::new(),
                timeout: BOOTSTRAP_TIMEOUT,
                allow_network: true,
                run_as_root: true,
                toolchain_writable: true,
            })
            .await;

        if !install.success {
            anyhow::bail!("Toolchain install failed: {}", tail(&install.output, 2000));
        }
        if !self.toolchain_ready().await {
            anyhow::bail!("Toolchain install completed but marker binaries are still missing");
        }
        eprintln!("[sandbox] Toolchain ready");
        Ok(())
    }

    async fn toolchain_ready(&self) -> bool {
        let probe = self
            .execute(ContainerRun {
                cmd: vec![
                    "sh".to_string(),
                    "-lc".to_string(),
                    "test -e /toolchain/node_modules/.bin/jest \
                     && test -e /toolchain/node_modules/.bin/tsc \
                     && test -e /toolchain/node_modules/.bin/gemini"
                        .to_string(),
                ],
                host_dir: None,
                env: Vec::new(),
                timeout: Duration::from_secs(30),
                allow_network: false,
                run_as_root: false,
                toolchain_writable: false,
            })
            .await;
        probe.success
    }
}

/// Run a local bookkeeping command that never executes untrusted code.
/// Non-zero exit and oversized output are errors; a timeout kills the child
/// (`kill_on_drop`) and errors.
pub async fn run_on_host(
    command: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
    max_buffer: usize,
    env: &HashMap<String, String>,
) -> Result<HostOutput> {
    let mut cmd = tokio::process::Command::new(command);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    for (k, v) in env {
        cmd.env(k, v);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", command))?;

    let mut stdout_pipe = child.stdout.take().context("Child stdout not captured")?;
    let mut stderr_pipe = child.stderr.take().context("Child stderr not captured")?;

    let result = tokio::time::timeout(timeout, async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (a, b, status) = tokio::join!(
            stdout_pipe.read_to_end(&mut stdout),
            stderr_pipe.read_to_end(&mut stderr),
            child.wait()
        );
        a.context("Failed to read stdout")?;
        b.context("Failed to read stderr")?;
        let status = status.context("Failed to wait for child")?;
        Ok::<_, anyhow::Error>((stdout, stderr, status))
    })
    .await;

    let (stdout, stderr, status) = match result {
        Ok(inner) => inner?,
        Err(_) => anyhow::bail!("{} timed out after {}s", command, timeout.as_secs()),
    };

    if stdout.len() + stderr.len() > max_buffer {
        anyhow::bail!(
            "{} produced more than {} bytes of output",
            command,
            max_buffer
        );
    }

    let stdout = String::from_utf8_lossy(&stdout).to_string();
    let stderr = String::from_utf8_lossy(&stderr).to_string();

    if !status.success() {
        anyhow::bail!(
            "{} exited with {:?}: {}",
            command,
            status.code(),
            tail(stderr.trim(), 2000)
        );
    }

    Ok(HostOutput { stdout, stderr })
}

/// Last `n` bytes of a string, on a char boundary.
pub fn tail(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s;
    }
    let mut start = s.len() - n;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
