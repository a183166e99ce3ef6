// ABOUTME: Prepared execution environment: directory layout, capability mounts, per-session proxy endpoint
// Environments are process-local and disposable; everything durable lives in the session directory

use crate::gateway::{Gateway, SessionSocket};
use crate::policy::NetworkMode;
use crate::sandbox::{BindMount, ExecutionRequest};
use crate::session::SessionError;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// In-sandbox directory where a session's gateway socket appears.
pub const SOCKET_MOUNT_DIR: &str = "/cell/sock";

/// Everything a cell or capability invocation needs from its session, ready
/// to mount: the workspace, the interpreter state directory, the capability
/// library, and (under restricted networking) a private gateway endpoint.
pub struct Environment {
    id: Uuid,
    network_mode: NetworkMode,
    session_dir: PathBuf,
    capability_mounts: Vec<BindMount>,
    proxy: Option<SessionSocket>,
    created_at: DateTime<Utc>,
}

impl Environment {
    /// Prepares the session directory layout and, when the network mode
    /// routes through the gateway, binds a unix socket endpoint only this
    /// session's sandboxes will see.
    pub(crate) async fn build(
        session_dir: PathBuf,
        network_mode: NetworkMode,
        gateway: Option<&Arc<Gateway>>,
        capability_mounts: Vec<BindMount>,
    ) -> Result<Self, SessionError> {
        let id = Uuid::new_v4();
        std::fs::create_dir_all(session_dir.join("workspace").join(".artifacts"))?;
        std::fs::create_dir_all(session_dir.join("state").join("runs"))?;

        let proxy = match (network_mode.uses_gateway(), gateway) {
            (true, Some(gateway)) => {
                let socket_dir = session_dir.join("state").join("sock");
                std::fs::create_dir_all(&socket_dir)?;
                // Per-environment name: teardown of a replaced environment
                // must never unlink its successor's endpoint.
                let mut short_id = id.simple().to_string();
                short_id.truncate(8);
                let socket = gateway
                    .bind_session_socket(&socket_dir.join(format!("gateway-{short_id}.sock")))
                    .await?;
                Some(socket)
            }
            (true, None) => {
                warn!(
                    environment = %id,
                    "restricted network requested but no gateway is configured; cells get no egress"
                );
                None
            }
            _ => None,
        };

        debug!(environment = %id, mode = %network_mode, dir = %session_dir.display(), "environment prepared");
        Ok(Self {
            id,
            network_mode,
            session_dir,
            capability_mounts,
            proxy,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.network_mode
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The durable working directory; survives environment teardown.
    pub fn workspace_dir(&self) -> PathBuf {
        self.session_dir.join("workspace")
    }

    /// Interpreter state: notebook, namespace snapshot, transient run dirs.
    pub fn state_dir(&self) -> PathBuf {
        self.session_dir.join("state")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir().join("runs")
    }

    pub fn namespace_snapshot_path(&self) -> PathBuf {
        self.state_dir().join("namespace.pkl")
    }

    pub fn notebook_path(&self) -> PathBuf {
        self.state_dir().join("notebook.json")
    }

    pub fn capability_mounts(&self) -> &[BindMount] {
        &self.capability_mounts
    }

    /// Host path of this session's gateway socket, when one is bound.
    pub fn gateway_socket(&self) -> Option<&Path> {
        self.proxy.as_ref().map(SessionSocket::socket_path)
    }

    /// Attaches the gateway endpoint to a request: the socket directory is
    /// mounted writable and `EXECBOX_GATEWAY_SOCKET` names the in-sandbox
    /// path. A no-op for environments without a proxy leg.
    pub fn attach_gateway(&self, request: ExecutionRequest) -> ExecutionRequest {
        let Some(socket) = self.gateway_socket() else {
            return request;
        };
        let (Some(parent), Some(name)) = (socket.parent(), socket.file_name()) else {
            return request;
        };
        let target = Path::new(SOCKET_MOUNT_DIR).join(name);
        request
            .with_bind_mount(BindMount::writable(parent, SOCKET_MOUNT_DIR))
            .with_env("EXECBOX_GATEWAY_SOCKET", target.to_string_lossy())
    }

    /// True while the directories and any proxy endpoint are still usable;
    /// an unhealthy environment is rebuilt on the next acquisition.
    pub fn is_healthy(&self) -> bool {
        if !self.workspace_dir().is_dir() || !self.state_dir().is_dir() {
            return false;
        }
        self.proxy.as_ref().map_or(true, SessionSocket::is_alive)
    }
}
