// ABOUTME: Runtime capability probe choosing the isolation strategy once per process
// Checks that bwrap exists and can actually create namespaces on this host

use crate::sandbox::{
    Isolator, NamespaceIsolator, SandboxError, UnsandboxedIsolator,
};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Operator-facing strategy selection. `Auto` probes the host; the explicit
/// modes force one strategy and fail (or warn) accordingly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    #[default]
    Auto,
    Namespace,
    None,
}

lazy_static! {
    // Probed once per process; every session shares the answer.
    static ref NAMESPACE_SUPPORT: Result<(), String> = detect_namespace_support();
}

/// Verifies bwrap is installed and namespaces work here, by running a
/// trivial command through it. Containers and hardened kernels commonly ship
/// bwrap but refuse unprivileged user namespaces, so presence alone proves
/// nothing.
fn detect_namespace_support() -> Result<(), String> {
    match std::process::Command::new("bwrap").arg("--version").output() {
        Err(err) => return Err(format!("bwrap not found: {}", err)),
        Ok(out) if !out.status.success() => {
            return Err("bwrap --version exited non-zero".to_string())
        }
        Ok(_) => {}
    }

    let smoke = std::process::Command::new("bwrap")
        .args([
            "--unshare-all",
            "--die-with-parent",
            "--ro-bind",
            "/usr",
            "/usr",
            "--ro-bind-try",
            "/bin",
            "/bin",
            "--ro-bind-try",
            "/lib",
            "/lib",
            "--ro-bind-try",
            "/lib64",
            "/lib64",
            "true",
        ])
        .output();

    match smoke {
        Err(err) => Err(format!("failed to run bwrap: {}", err)),
        Ok(out) if out.status.success() => Ok(()),
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let reason = stderr.lines().next().unwrap_or("unknown failure");
            Err(format!("bwrap smoke test failed: {}", reason))
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Strategy {
    Namespace,
    Unsandboxed,
}

/// Pure selection policy, split out from the cached probe so every branch is
/// testable without touching the host.
fn choose(
    mode: IsolationMode,
    support_err: Option<&str>,
    allow_fallback: bool,
) -> Result<Strategy, SandboxError> {
    match mode {
        IsolationMode::Namespace => match support_err {
            None => Ok(Strategy::Namespace),
            Some(reason) => Err(SandboxError::Unavailable(reason.to_string())),
        },
        IsolationMode::None => Ok(Strategy::Unsandboxed),
        IsolationMode::Auto => match support_err {
            None => Ok(Strategy::Namespace),
            Some(_) if allow_fallback => Ok(Strategy::Unsandboxed),
            Some(_) => Err(SandboxError::FallbackDisabled),
        },
    }
}

/// Selects the isolation strategy for this process.
///
/// The underlying host probe runs once and is cached; calling this again
/// returns a strategy backed by the same answer.
pub fn select_isolator(
    mode: IsolationMode,
    allow_fallback: bool,
    extra_ro_binds: Vec<PathBuf>,
) -> Result<Arc<dyn Isolator>, SandboxError> {
    let support_err = NAMESPACE_SUPPORT.as_ref().err().map(String::as_str);

    match choose(mode, support_err, allow_fallback)? {
        Strategy::Namespace => {
            info!("namespace isolation selected (bubblewrap)");
            Ok(Arc::new(
                NamespaceIsolator::new().with_extra_ro_binds(extra_ro_binds),
            ))
        }
        Strategy::Unsandboxed => {
            match mode {
                IsolationMode::None => {
                    warn!("isolation disabled by configuration; commands run directly on the host")
                }
                _ => warn!(
                    reason = support_err.unwrap_or("unknown"),
                    "namespace isolation unavailable; degrading to UNSANDBOXED execution"
                ),
            }
            Ok(Arc::new(UnsandboxedIsolator::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_auto_prefers_namespace_when_supported() {
        let strategy = choose(IsolationMode::Auto, None, false).unwrap();
        assert_eq!(strategy, Strategy::Namespace);
    }

    #[test]
    fn test_auto_without_support_respects_fallback_policy() {
        let degraded = choose(IsolationMode::Auto, Some("no userns"), true).unwrap();
        assert_eq!(degraded, Strategy::Unsandboxed);

        let refused = choose(IsolationMode::Auto, Some("no userns"), false);
        assert!(matches!(refused, Err(SandboxError::FallbackDisabled)));
    }

    #[test]
    fn test_forced_namespace_fails_without_support() {
        let err = choose(IsolationMode::Namespace, Some("no userns"), true).unwrap_err();
        match err {
            SandboxError::Unavailable(reason) => assert_eq!(reason, "no userns"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_forced_none_always_degrades() {
        let strategy = choose(IsolationMode::None, None, false).unwrap();
        assert_eq!(strategy, Strategy::Unsandboxed);
    }

    #[test]
    fn test_mode_serde_names() {
        assert_eq!(
            serde_json::from_str::<IsolationMode>("\"auto\"").unwrap(),
            IsolationMode::Auto
        );
        assert_eq!(
            serde_json::from_str::<IsolationMode>("\"namespace\"").unwrap(),
            IsolationMode::Namespace
        );
        assert_eq!(
            serde_json::from_str::<IsolationMode>("\"none\"").unwrap(),
            IsolationMode::None
        );
    }
}
