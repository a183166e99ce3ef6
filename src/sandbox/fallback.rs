// ABOUTME: No-isolation fallback strategy for hosts without usable namespaces
// Rewrites sandbox mount targets back to host paths so staged commands run unchanged

use crate::sandbox::process::run_prepared;
use crate::sandbox::{BindMount, ExecutionRequest, ExecutionResult, Isolator, SandboxError};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::warn;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runs commands directly on the host. Nothing is enforced: read-only mounts
/// are writable, network isolation is absent. Only selected when the operator
/// explicitly allows degraded execution, and each run is logged loudly.
pub struct UnsandboxedIsolator;

impl UnsandboxedIsolator {
    pub fn new() -> Self {
        Self
    }

    /// Maps a sandbox-absolute string back to its host location using the
    /// request's mounts. Longest target wins so nested targets resolve to the
    /// most specific mount.
    fn rewrite(mounts: &[&BindMount], value: &str) -> String {
        for mount in mounts {
            let target = mount.target.to_string_lossy();
            if value == target {
                return mount.source.to_string_lossy().into_owned();
            }
            let prefix = format!("{}/", target);
            if let Some(rest) = value.strip_prefix(prefix.as_str()) {
                return mount.source.join(rest).to_string_lossy().into_owned();
            }
        }
        value.to_string()
    }

    fn mounts_by_specificity(request: &ExecutionRequest) -> Vec<&BindMount> {
        let mut mounts: Vec<&BindMount> = request.bind_mounts.iter().collect();
        mounts.sort_by_key(|m| std::cmp::Reverse(m.target.to_string_lossy().len()));
        mounts
    }
}

impl Default for UnsandboxedIsolator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Isolator for UnsandboxedIsolator {
    fn name(&self) -> &'static str {
        "unsandboxed"
    }

    fn is_secure(&self) -> bool {
        false
    }

    async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        request.validate()?;

        warn!(
            command = %request.command.join(" "),
            "running WITHOUT isolation: read-only mounts and network limits are not enforced"
        );

        let mounts = Self::mounts_by_specificity(request);
        let rewritten: Vec<String> = request
            .command
            .iter()
            .map(|arg| Self::rewrite(&mounts, arg))
            .collect();
        let working_dir = PathBuf::from(Self::rewrite(
            &mounts,
            &request.working_dir.to_string_lossy(),
        ));

        let mut cmd = Command::new(&rewritten[0]);
        cmd.args(&rewritten[1..]);
        cmd.current_dir(working_dir);

        cmd.env_clear();
        for (key, value) in &request.env {
            cmd.env(key, Self::rewrite(&mounts, value));
        }
        if !request.env.contains_key("PATH") {
            cmd.env("PATH", DEFAULT_PATH);
        }

        run_prepared(cmd, request.timeout).await
    }
}
