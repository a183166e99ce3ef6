// ABOUTME: Capability library: curated script directories mounted read-only into every sandbox
// Scripts are addressed as {capability}/{script}; names are validated against path traversal

use crate::sandbox::BindMount;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Where capability directories appear inside the sandbox.
pub const CAPABILITY_MOUNT_ROOT: &str = "/opt/capabilities";

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability root does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("capability '{capability}' has no script '{script}'")]
    UnknownScript { capability: String, script: String },

    #[error("invalid {kind} name: '{name}'")]
    InvalidName { kind: &'static str, name: String },
}

/// What to do when a configured capability root is absent on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MissingRootPolicy {
    /// Refuse to start. The default: a missing root usually means a broken
    /// deployment, not an intentionally empty library.
    #[default]
    Block,
    /// Log and continue without the root's capabilities.
    Degrade,
}

/// A script resolved to both its host location and its in-sandbox path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScript {
    pub capability: String,
    pub script: String,
    pub host_path: PathBuf,
    pub sandbox_path: PathBuf,
}

impl ResolvedScript {
    /// Builds the argv for invoking this script inside the sandbox. Python
    /// scripts go through the interpreter; anything else is executed directly
    /// and must carry its own exec bit.
    pub fn command(&self, python_bin: &str, args: &[String]) -> Vec<String> {
        let script = self.sandbox_path.to_string_lossy().to_string();
        let mut command = if self.script.ends_with(".py") {
            vec![python_bin.to_string(), script]
        } else {
            vec![script]
        };
        command.extend(args.iter().cloned());
        command
    }
}

/// The set of capabilities discovered from the configured roots.
///
/// Each immediate subdirectory of a root is one capability; when two roots
/// carry the same capability name the earlier root wins.
#[derive(Debug, Default)]
pub struct CapabilityLibrary {
    capabilities: BTreeMap<String, PathBuf>,
}

impl CapabilityLibrary {
    pub fn discover(
        roots: &[PathBuf],
        on_missing: MissingRootPolicy,
    ) -> Result<Self, CapabilityError> {
        let mut capabilities = BTreeMap::new();
        for root in roots {
            if !root.is_dir() {
                match on_missing {
                    MissingRootPolicy::Block => {
                        return Err(CapabilityError::MissingRoot(root.clone()));
                    }
                    MissingRootPolicy::Degrade => {
                        warn!(root = %root.display(), "capability root missing, continuing without it");
                        continue;
                    }
                }
            }
            let entries = std::fs::read_dir(root)
                .map_err(|_| CapabilityError::MissingRoot(root.clone()))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if validate_component(name, "capability").is_err() {
                    warn!(name, "skipping capability with unusable name");
                    continue;
                }
                capabilities
                    .entry(name.to_string())
                    .or_insert_with(|| path.clone());
            }
        }
        debug!(count = capabilities.len(), "capability library discovered");
        Ok(Self { capabilities })
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.capabilities.keys().map(String::as_str).collect()
    }

    /// Read-only mounts exposing every capability at
    /// `/opt/capabilities/{name}`. Attached to each sandbox environment so
    /// cells and invocations see the same library.
    pub fn mounts(&self) -> Vec<BindMount> {
        self.capabilities
            .iter()
            .map(|(name, host_dir)| {
                BindMount::read_only(host_dir, Path::new(CAPABILITY_MOUNT_ROOT).join(name))
            })
            .collect()
    }

    /// Resolves `{capability}/{script}` to a script that exists on disk.
    /// Both components are validated before touching the filesystem, so a
    /// hostile name cannot escape the capability directory.
    pub fn resolve(&self, capability: &str, script: &str) -> Result<ResolvedScript, CapabilityError> {
        validate_component(capability, "capability")?;
        validate_component(script, "script")?;

        let host_dir = self
            .capabilities
            .get(capability)
            .ok_or_else(|| CapabilityError::UnknownCapability(capability.to_string()))?;

        let host_path = host_dir.join(script);
        if !host_path.is_file() {
            return Err(CapabilityError::UnknownScript {
                capability: capability.to_string(),
                script: script.to_string(),
            });
        }

        Ok(ResolvedScript {
            capability: capability.to_string(),
            script: script.to_string(),
            host_path,
            sandbox_path: Path::new(CAPABILITY_MOUNT_ROOT).join(capability).join(script),
        })
    }
}

fn validate_component(name: &str, kind: &'static str) -> Result<(), CapabilityError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        return Err(CapabilityError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}
