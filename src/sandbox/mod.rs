//! Isolated execution of untrusted programs.
//!
//! The [`Sandbox`] trait is the capability the rest of the pipeline consumes:
//! run one program once, and make sure an image is present. The production
//! driver sits on the local Docker daemon; tests substitute in-memory fakes.

mod docker;

pub use docker::DockerSandbox;

use async_trait::async_trait;
use tokio::time::Instant;

/// Everything needed to run one program once.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub image: String,
    pub source_code: String,
    pub source_file: String,
    /// Empty for interpreted languages
    pub compile_cmd: Vec<String>,
    pub run_cmd: Vec<String>,
    pub stdin: String,
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
}

/// Outcome of a sandboxed run. Compile failures and non-zero exits are
/// outcomes, not errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub time_ms: u64,
    /// Peak memory in KB; 0 when the backend cannot report it
    pub memory_kb: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The job deadline fired during the run step.
    #[error("execution deadline exceeded")]
    DeadlineExceeded,
    /// A container-engine call failed.
    #[error("docker {stage} failed: {source}")]
    Engine {
        stage: &'static str,
        #[source]
        source: bollard::errors::Error,
    },
    /// Stream I/O against an exec's attached stdio failed.
    #[error("stream i/o during {stage} failed: {source}")]
    Io {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("sandbox failure: {0}")]
    Internal(String),
}

impl SandboxError {
    pub(crate) fn engine(stage: &'static str, source: bollard::errors::Error) -> Self {
        Self::Engine { stage, source }
    }

    pub(crate) fn io(stage: &'static str, source: std::io::Error) -> Self {
        Self::Io { stage, source }
    }
}

/// Capability set over an isolated execution backend.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run one program once, honoring `deadline` during the run step.
    ///
    /// Returns `Ok` for program outcomes (including compile failures and
    /// non-zero exits), `Err(SandboxError::DeadlineExceeded)` when the
    /// deadline fires first, and other errors for backend failures.
    async fn run(&self, cfg: RunConfig, deadline: Instant) -> Result<RunOutput, SandboxError>;

    /// Idempotently make `image` available locally, pulling it if absent.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError>;
}
