//! Docker-backed sandbox driver.
//!
//! Each job gets a fresh container created from the language image with
//! networking disabled, an unprivileged user, kernel-level memory/CPU/pid
//! caps, and tmpfs-backed writable directories. The container idles on
//! `sleep infinity`; source injection, compilation, and the run itself all
//! happen through execs inside it. The container is force-removed on every
//! exit path.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::Docker;
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;

use super::{RunConfig, RunOutput, Sandbox, SandboxError};

/// Working directory inside the container; tmpfs-backed, so source injection
/// must go through an exec's stdin (the bulk copy API rejects tmpfs targets).
const WORK_DIR: &str = "/home/sandbox";

/// Process-count cap, low enough to defeat fork bombs.
const PIDS_LIMIT: i64 = 64;

/// One full CPU core (quota over the default 100ms period).
const CPU_QUOTA: i64 = 100_000;

pub struct DockerSandbox {
    docker: Docker,
}

impl DockerSandbox {
    pub fn new() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::engine("connect", e))?;
        Ok(Self { docker })
    }

    async fn create_container(&self, cfg: &RunConfig) -> Result<String, SandboxError> {
        let memory_bytes = cfg.memory_limit_kb as i64 * 1024;

        let host_config = HostConfig {
            memory: Some(memory_bytes),
            // Swap equal to memory means no swap
            memory_swap: Some(memory_bytes),
            cpu_quota: Some(CPU_QUOTA),
            pids_limit: Some(PIDS_LIMIT),
            network_mode: Some("none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            tmpfs: Some(HashMap::from([
                (
                    WORK_DIR.to_string(),
                    "rw,exec,nosuid,size=64m,mode=1777".to_string(),
                ),
                (
                    "/tmp".to_string(),
                    "rw,noexec,nosuid,size=16m,mode=1777".to_string(),
                ),
            ])),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(cfg.image.clone()),
            // Keep the container alive while we exec into it
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(WORK_DIR.to_string()),
            user: Some("nobody".to_string()),
            network_disabled: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(format!("crucible-{}", Uuid::new_v4())),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| SandboxError::engine("create container", e))?;
        Ok(created.id)
    }

    async fn run_in_container(
        &self,
        container_id: &str,
        cfg: &RunConfig,
        deadline: Instant,
        create_started: Instant,
    ) -> Result<RunOutput, SandboxError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions>)
            .await
            .map_err(|e| SandboxError::engine("start container", e))?;
        metrics::global()
            .container_creation_ms
            .observe(create_started.elapsed().as_millis() as u64);

        self.write_source(container_id, cfg).await?;

        if !cfg.compile_cmd.is_empty() {
            let compiled = self.compile(container_id, cfg).await?;
            if compiled.exit_code != 0 {
                // Compile failure is a program outcome, not a sandbox failure
                return Ok(compiled);
            }
        }

        self.run_program(container_id, cfg, deadline).await
    }

    /// Write the source text to the working directory by streaming it into
    /// `cat` over an exec's stdin.
    async fn write_source(&self, container_id: &str, cfg: &RunConfig) -> Result<(), SandboxError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions::<String> {
                    cmd: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        format!("cat > {}/{}", WORK_DIR, cfg.source_file),
                    ]),
                    attach_stdin: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::engine("create write exec", e))?;

        match self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| SandboxError::engine("start write exec", e))?
        {
            StartExecResults::Attached { mut input, mut output } => {
                input
                    .write_all(cfg.source_code.as_bytes())
                    .await
                    .map_err(|e| SandboxError::io("source write", e))?;
                input
                    .shutdown()
                    .await
                    .map_err(|e| SandboxError::io("source write", e))?;
                drop(input);
                // Drain until the exec finishes
                while let Some(chunk) = output.next().await {
                    chunk.map_err(|e| SandboxError::engine("write exec stream", e))?;
                }
            }
            StartExecResults::Detached => {
                return Err(SandboxError::Internal("write exec ran detached".into()));
            }
        }

        debug!(container = %container_id, file = %cfg.source_file, "source written via exec");
        Ok(())
    }

    async fn compile(&self, container_id: &str, cfg: &RunConfig) -> Result<RunOutput, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions::<String> {
                    cmd: Some(cfg.compile_cmd.clone()),
                    working_dir: Some(WORK_DIR.to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::engine("create compile exec", e))?;

        let output = match self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| SandboxError::engine("start compile exec", e))?
        {
            StartExecResults::Attached { output, .. } => demux(output).await?,
            StartExecResults::Detached => {
                return Err(SandboxError::Internal("compile exec ran detached".into()));
            }
        };

        let exit_code = self.exec_exit_code(&exec.id, "inspect compile exec").await?;
        Ok(RunOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code,
            time_ms: 0,
            memory_kb: 0,
        })
    }

    async fn run_program(
        &self,
        container_id: &str,
        cfg: &RunConfig,
        deadline: Instant,
    ) -> Result<RunOutput, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions::<String> {
                    cmd: Some(cfg.run_cmd.clone()),
                    working_dir: Some(WORK_DIR.to_string()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::engine("create run exec", e))?;

        let started = Instant::now();
        let output = match self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| SandboxError::engine("start run exec", e))?
        {
            StartExecResults::Attached { mut input, output } => {
                if !cfg.stdin.is_empty() {
                    input
                        .write_all(cfg.stdin.as_bytes())
                        .await
                        .map_err(|e| SandboxError::io("stdin write", e))?;
                }
                // Close the write side so programs reading stdin see EOF
                input
                    .shutdown()
                    .await
                    .map_err(|e| SandboxError::io("stdin write", e))?;
                drop(input);

                tokio::select! {
                    captured = demux(output) => captured?,
                    _ = tokio::time::sleep_until(deadline) => {
                        return Err(SandboxError::DeadlineExceeded);
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(SandboxError::Internal("run exec ran detached".into()));
            }
        };
        let elapsed = started.elapsed();

        let exit_code = self.exec_exit_code(&exec.id, "inspect run exec").await?;
        Ok(RunOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code,
            time_ms: elapsed.as_millis() as u64,
            // The exec API does not report a memory peak; 0 means unavailable
            memory_kb: 0,
        })
    }

    async fn exec_exit_code(
        &self,
        exec_id: &str,
        stage: &'static str,
    ) -> Result<i32, SandboxError> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| SandboxError::engine(stage, e))?;
        Ok(inspect.exit_code.unwrap_or(-1) as i32)
    }

    /// Force-remove, never bounded by the job deadline. Failures are logged,
    /// not propagated; the run outcome has already been decided.
    async fn remove_container(&self, container_id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_container(container_id, Some(options))
            .await
        {
            warn!(container = %container_id, error = %e, "failed to remove container");
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn run(&self, cfg: RunConfig, deadline: Instant) -> Result<RunOutput, SandboxError> {
        let create_started = Instant::now();
        let container_id = self.create_container(&cfg).await?;
        let result = self
            .run_in_container(&container_id, &cfg, deadline, create_started)
            .await;
        self.remove_container(&container_id).await;
        result
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        // The pull only completes once the stream is fully drained
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| SandboxError::engine("pull image", e))?;
        }
        info!(image, "image pulled");
        Ok(())
    }
}

struct Captured {
    stdout: String,
    stderr: String,
}

/// Demultiplex an exec's attached output stream into stdout and stderr.
async fn demux<S>(mut output: S) -> Result<Captured, SandboxError>
where
    S: Stream<Item = Result<LogOutput, bollard::errors::Error>> + Unpin,
{
    let mut stdout = String::new();
    let mut stderr = String::new();
    while let Some(chunk) = output.next().await {
        match chunk.map_err(|e| SandboxError::engine("output stream", e))? {
            LogOutput::StdOut { message } => stdout.push_str(&String::from_utf8_lossy(&message)),
            LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
            _ => {}
        }
    }
    Ok(Captured { stdout, stderr })
}
