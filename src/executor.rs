//! Turns an execution request into a classified result.
//!
//! The executor resolves the language, hands a run-config to the sandbox,
//! and interprets the outcome. It does not enforce time or memory itself;
//! those are kernel-level sandbox limits plus the per-job deadline.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::languages::Registry;
use crate::sandbox::{RunConfig, RunOutput, Sandbox, SandboxError};

/// Per-request execution options, already converted to ms/KB.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub language: String,
    pub source_code: String,
    pub stdin: String,
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
}

/// Top-level outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    RuntimeError,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::RuntimeError => "runtime_error",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refinement of `Status::Error`, and the full wire taxonomy for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ErrorType {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "Invalid Language")]
    InvalidLanguage,
    #[serde(rename = "Time Limit Exceeded")]
    TimeLimitExceeded,
    #[serde(rename = "Memory Limit Exceeded")]
    MemoryLimitExceeded,
    #[serde(rename = "Compile Error")]
    CompileError,
    #[serde(rename = "Sandbox Failure")]
    SandboxFailure,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::None => "",
            ErrorType::InvalidLanguage => "Invalid Language",
            ErrorType::TimeLimitExceeded => "Time Limit Exceeded",
            ErrorType::MemoryLimitExceeded => "Memory Limit Exceeded",
            ErrorType::CompileError => "Compile Error",
            ErrorType::SandboxFailure => "Sandbox Failure",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the client gets back for a job that ran (or was classified without
/// running). Field names match the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionResult {
    pub status: Status,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub time_ms: u64,
    pub memory_kb: u64,
    pub error_type: ErrorType,
}

impl ExecutionResult {
    /// Result for a job rejected before (or instead of) running.
    pub fn rejected(error_type: ErrorType) -> Self {
        Self {
            status: Status::Error,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            time_ms: 0,
            memory_kb: 0,
            error_type,
        }
    }

    fn from_output(output: RunOutput) -> Self {
        let status = if output.exit_code == 0 {
            Status::Success
        } else {
            Status::RuntimeError
        };
        Self {
            status,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            time_ms: output.time_ms,
            memory_kb: output.memory_kb,
            error_type: ErrorType::None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("sandbox execution failed: {0}")]
    Sandbox(#[from] SandboxError),
}

pub struct Executor {
    registry: Arc<Registry>,
    sandbox: Arc<dyn Sandbox>,
}

impl Executor {
    pub fn new(registry: Arc<Registry>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self { registry, sandbox }
    }

    /// Execute one program. Program outcomes (including an unknown language
    /// and a deadline hit) come back as `Ok(ExecutionResult)`; only backend
    /// failures are errors.
    pub async fn execute(
        &self,
        opts: &ExecuteOptions,
        deadline: Instant,
    ) -> Result<ExecutionResult, ExecuteError> {
        let lang = match self.registry.get(&opts.language) {
            Ok(lang) => lang,
            Err(_) => return Ok(ExecutionResult::rejected(ErrorType::InvalidLanguage)),
        };

        let cfg = RunConfig {
            image: lang.image,
            source_code: opts.source_code.clone(),
            source_file: lang.source_file,
            compile_cmd: lang.compile_cmd,
            run_cmd: lang.run_cmd,
            stdin: opts.stdin.clone(),
            time_limit_ms: opts.time_limit_ms,
            memory_limit_kb: opts.memory_limit_kb,
        };

        match self.sandbox.run(cfg, deadline).await {
            Ok(output) => Ok(ExecutionResult::from_output(output)),
            Err(SandboxError::DeadlineExceeded) => {
                Ok(ExecutionResult::rejected(ErrorType::TimeLimitExceeded))
            }
            Err(e) => Err(ExecuteError::Sandbox(e)),
        }
    }
}
