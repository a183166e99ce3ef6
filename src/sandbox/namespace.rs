// ABOUTME: Namespace isolation strategy composing bubblewrap (bwrap) invocations
// System directories are bound read-only; only the request's mounts are writable

use crate::sandbox::process::run_prepared;
use crate::sandbox::{ExecutionRequest, ExecutionResult, Isolator, SandboxError};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// System paths every sandbox can read; `--ro-bind-try` tolerates the ones a
/// given distro does not have.
const SYSTEM_RO_BINDS: &[&str] = &[
    "/usr",
    "/lib",
    "/lib64",
    "/bin",
    "/sbin",
    "/etc/alternatives",
    "/etc/ssl",
    "/etc/pki",
    "/etc/ca-certificates",
    "/usr/share/ca-certificates",
];

/// Runs commands inside Linux namespaces via bubblewrap.
pub struct NamespaceIsolator {
    bwrap_path: String,
    extra_ro_binds: Vec<PathBuf>,
}

impl NamespaceIsolator {
    pub fn new() -> Self {
        Self {
            bwrap_path: "bwrap".to_string(),
            extra_ro_binds: Vec::new(),
        }
    }

    /// Additional host paths (interpreters, shared datasets) bound read-only
    /// into every sandbox.
    pub fn with_extra_ro_binds(mut self, binds: Vec<PathBuf>) -> Self {
        self.extra_ro_binds = binds;
        self
    }

    /// Pure argv construction so the exact sandbox shape is unit-testable.
    fn build_args(&self, request: &ExecutionRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--die-with-parent".into(),
            "--new-session".into(),
            "--unshare-user".into(),
            "--unshare-ipc".into(),
            "--unshare-uts".into(),
        ];

        if request.isolate_pid {
            args.push("--unshare-pid".into());
        }
        if request.isolate_network {
            args.push("--unshare-net".into());
        }

        for path in SYSTEM_RO_BINDS {
            args.push("--ro-bind-try".into());
            args.push((*path).into());
            args.push((*path).into());
        }
        for path in &self.extra_ro_binds {
            let p = path.to_string_lossy().into_owned();
            args.push("--ro-bind-try".into());
            args.push(p.clone());
            args.push(p);
        }

        // Name resolution only makes sense while the host network is shared.
        if !request.isolate_network {
            args.push("--ro-bind-try".into());
            args.push("/etc/resolv.conf".into());
            args.push("/etc/resolv.conf".into());
        }

        args.push("--proc".into());
        args.push("/proc".into());
        args.push("--dev".into());
        args.push("/dev".into());
        args.push("--tmpfs".into());
        args.push("/tmp".into());

        for mount in &request.bind_mounts {
            args.push(if mount.read_only { "--ro-bind" } else { "--bind" }.into());
            args.push(mount.source.to_string_lossy().into_owned());
            args.push(mount.target.to_string_lossy().into_owned());
        }

        args.push("--chdir".into());
        args.push(request.working_dir.to_string_lossy().into_owned());

        args
    }
}

impl Default for NamespaceIsolator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Isolator for NamespaceIsolator {
    fn name(&self) -> &'static str {
        "namespace"
    }

    fn is_secure(&self) -> bool {
        true
    }

    async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        request.validate()?;

        let mut cmd = Command::new(&self.bwrap_path);
        cmd.args(self.build_args(request));
        cmd.args(&request.command);

        // The child sees exactly the request's environment, nothing inherited.
        cmd.env_clear();
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        if !request.env.contains_key("PATH") {
            cmd.env("PATH", DEFAULT_PATH);
        }

        debug!(
            command = %request.command.join(" "),
            net_isolated = request.isolate_network,
            pid_isolated = request.isolate_pid,
            "running command under bubblewrap"
        );

        let result = run_prepared(cmd, request.timeout).await?;

        if !result.success() && result.stderr.contains("Creating new namespace failed") {
            warn!(
                "bubblewrap could not create namespaces; the host may restrict \
                 unprivileged user namespaces"
            );
        }

        Ok(result)
    }
}
