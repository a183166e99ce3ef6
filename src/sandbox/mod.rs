// ABOUTME: Isolation primitive for running untrusted commands in a sandboxed environment
// One trait, two strategies: Linux namespaces via bubblewrap, or a flagged no-isolation fallback

pub mod fallback;
pub mod namespace;
pub mod probe;
mod process;

pub use fallback::UnsandboxedIsolator;
pub use namespace::NamespaceIsolator;
pub use probe::{select_isolator, IsolationMode};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default wall-clock limit when the caller does not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Cap on captured bytes per stream; anything beyond is discarded with a
/// trailing marker so a runaway print loop cannot exhaust memory.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn sandboxed process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("namespace isolation unavailable: {0}")]
    Unavailable(String),

    #[error("namespace isolation unavailable and fallback execution is disabled")]
    FallbackDisabled,

    #[error("invalid execution request: {0}")]
    InvalidRequest(String),
}

/// A host directory (or file) made visible inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

impl BindMount {
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }

    pub fn writable(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }
}

/// Everything needed to run one command inside the sandbox.
///
/// `env` is the complete environment for the child; nothing from the host
/// environment leaks through. A `PATH` is filled in when absent so lookups
/// like `python3` keep working.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub command: Vec<String>,
    pub bind_mounts: Vec<BindMount>,
    pub isolate_network: bool,
    pub isolate_pid: bool,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
}

impl ExecutionRequest {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            bind_mounts: Vec::new(),
            isolate_network: true,
            isolate_pid: true,
            working_dir: PathBuf::from("/workspace"),
            timeout: DEFAULT_TIMEOUT,
            env: BTreeMap::new(),
        }
    }

    pub fn with_bind_mount(mut self, mount: BindMount) -> Self {
        self.bind_mounts.push(mount);
        self
    }

    pub fn with_bind_mounts(mut self, mounts: impl IntoIterator<Item = BindMount>) -> Self {
        self.bind_mounts.extend(mounts);
        self
    }

    pub fn with_network_isolation(mut self, isolate: bool) -> Self {
        self.isolate_network = isolate;
        self
    }

    pub fn with_pid_isolation(mut self, isolate: bool) -> Self {
        self.isolate_pid = isolate;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SandboxError> {
        if self.command.is_empty() {
            return Err(SandboxError::InvalidRequest("empty command".to_string()));
        }
        if !self.working_dir.is_absolute() {
            return Err(SandboxError::InvalidRequest(format!(
                "working directory must be absolute: {}",
                self.working_dir.display()
            )));
        }
        for mount in &self.bind_mounts {
            if !mount.target.is_absolute() {
                return Err(SandboxError::InvalidRequest(format!(
                    "mount target must be absolute: {}",
                    mount.target.display()
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of one sandboxed command. Timeouts are reported here, never as
/// errors: `timed_out` is set and `exit_code` is -1.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Strategy interface for running one command in (or without) isolation.
///
/// Selected once per process by [`select_isolator`]; everything above this
/// trait is strategy-agnostic.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Isolator: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// False for the no-isolation fallback; callers surface this loudly.
    fn is_secure(&self) -> bool;

    async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError>;
}
