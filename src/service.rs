// ABOUTME: External boundary of the subsystem: execute cells, invoke capabilities, mark sensitivity
// Wires the isolation strategy, gateway, capability library, and session manager together once

use crate::capabilities::{CapabilityError, CapabilityLibrary};
use crate::config::{AppConfig, ConfigError};
use crate::gateway::{Allowlist, Gateway, GatewayError};
use crate::models::{Session, SessionKey};
use crate::notebook::{export, CellExecutor, CellState, NotebookError, NotebookStore, Output};
use crate::policy::DataSensitivity;
use crate::sandbox::{
    select_isolator, BindMount, ExecutionRequest, ExecutionResult, Isolator, SandboxError,
};
use crate::session::{SessionError, SessionManager, SessionStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Notebook(#[from] NotebookError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// How a cell ended up: the terminal state plus everything it produced.
/// This is the whole response to an `execute` call; no live handles leak out.
#[derive(Debug, Clone, Serialize)]
pub struct CellRecord {
    pub index: usize,
    pub state: CellState,
    pub execution_count: Option<u32>,
    pub outputs: Vec<Output>,
}

pub struct ExecService {
    config: AppConfig,
    isolator: Arc<dyn Isolator>,
    gateway: Option<Arc<Gateway>>,
    capabilities: CapabilityLibrary,
    manager: SessionManager,
    executor: CellExecutor,
}

impl ExecService {
    /// Builds the whole subsystem from configuration. The isolation strategy
    /// is probed and fixed here, once; a host that can neither isolate nor
    /// fall back fails now rather than on the first execution.
    pub fn new(config: AppConfig) -> Result<Self, ServiceError> {
        let isolator = select_isolator(
            config.isolation.mode,
            config.isolation.allow_fallback,
            config.isolation.extra_ro_binds.clone(),
        )?;
        info!(
            strategy = isolator.name(),
            secure = isolator.is_secure(),
            "isolation strategy selected"
        );

        let gateway = if config.gateway.allow.is_empty() {
            None
        } else {
            let allowlist = Allowlist::parse(&config.gateway.allow)?;
            Some(Arc::new(Gateway::new(allowlist)))
        };

        let capabilities =
            CapabilityLibrary::discover(&config.capabilities.roots, config.capabilities.on_missing)?;
        if !capabilities.is_empty() {
            info!(capabilities = ?capabilities.names(), "capability library ready");
        }

        let store = SessionStore::new(config.sessions_dir()?);
        let manager = SessionManager::new(store, gateway.clone(), capabilities.mounts());

        let executor = CellExecutor::new(Arc::clone(&isolator))
            .with_python_bin(&config.execution.python_bin)
            .with_default_timeout(config.default_timeout())
            .with_output_limits(config.execution.max_text_bytes, config.execution.table_max_rows);

        Ok(Self {
            config,
            isolator,
            gateway,
            capabilities,
            manager,
            executor,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn gateway(&self) -> Option<&Arc<Gateway>> {
        self.gateway.as_ref()
    }

    /// Runs `source` as the next cell of the session's notebook and returns
    /// the finished cell. Creates the session on first reference. Cells of
    /// one session run strictly one at a time.
    pub async fn execute(
        &self,
        key: &SessionKey,
        source: &str,
        timeout: Option<Duration>,
    ) -> Result<CellRecord, ServiceError> {
        let slot = self.manager.get_or_create(key).await?;
        let _permit = slot.exec_permit().await;
        let environment = self.manager.acquire_environment(&slot).await?;

        let store = NotebookStore::new(environment.notebook_path());
        let mut notebook = store.load_or_default()?;
        let index = self
            .executor
            .execute_cell(&environment, &store, &mut notebook, source, timeout)
            .await?;
        self.manager.touch(&slot)?;

        let cell = notebook.cell(index)?;
        info!(session = %key, cell = index, state = ?cell.state, "cell finished");
        Ok(CellRecord {
            index,
            state: cell.state,
            execution_count: cell.execution_count,
            outputs: cell.outputs.clone(),
        })
    }

    /// Runs one capability script inside the session's sandbox. The script
    /// sees the same workspace and network posture a cell would.
    pub async fn invoke_capability(
        &self,
        key: &SessionKey,
        capability: &str,
        script: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, ServiceError> {
        let resolved = self.capabilities.resolve(capability, script)?;

        let slot = self.manager.get_or_create(key).await?;
        let _permit = slot.exec_permit().await;
        let environment = self.manager.acquire_environment(&slot).await?;

        let request = ExecutionRequest::new(
            resolved.command(&self.config.execution.python_bin, args),
        )
        .with_bind_mount(BindMount::writable(environment.workspace_dir(), "/workspace"))
        .with_bind_mounts(environment.capability_mounts().iter().cloned())
        .with_network_isolation(environment.network_mode().isolates_network())
        .with_pid_isolation(true)
        .with_working_dir("/workspace")
        .with_timeout(timeout.unwrap_or_else(|| self.config.default_timeout()))
        .with_env("HOME", "/tmp")
        .with_env("PYTHONDONTWRITEBYTECODE", "1")
        .with_env("PYTHONUNBUFFERED", "1");
        let request = environment.attach_gateway(request);

        let result = self.isolator.run(&request).await?;
        self.manager.touch(&slot)?;

        info!(
            session = %key,
            capability,
            script,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            "capability invoked"
        );
        Ok(result)
    }

    /// Raises the session's data sensitivity; never lowers it. Takes effect
    /// before the next execution.
    pub async fn mark_sensitivity(
        &self,
        key: &SessionKey,
        level: DataSensitivity,
    ) -> Result<Session, ServiceError> {
        Ok(self.manager.mark_sensitivity(key, level).await?)
    }

    /// Renders the session's notebook as a Jupyter document.
    pub async fn export_notebook(&self, key: &SessionKey) -> Result<serde_json::Value, ServiceError> {
        let slot = self.manager.get_or_create(key).await?;
        let environment = self.manager.acquire_environment(&slot).await?;
        let notebook = NotebookStore::new(environment.notebook_path()).load_or_default()?;
        Ok(export::to_ipynb(&notebook, &environment.workspace_dir()))
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>, ServiceError> {
        Ok(self.manager.list_sessions()?)
    }

    /// Destroys environments idle past the configured threshold. Their
    /// sessions stay on disk and come back lazily.
    pub fn cleanup_idle(&self) -> usize {
        self.manager.cleanup_idle(self.config.idle_timeout())
    }

    /// Permanently deletes a session, workspace included.
    pub fn delete_session(&self, key: &SessionKey) -> Result<(), ServiceError> {
        Ok(self.manager.delete(key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolationConfig;
    use crate::sandbox::IsolationMode;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> AppConfig {
        AppConfig {
            data_dir: Some(dir.path().to_path_buf()),
            isolation: IsolationConfig {
                // Direct execution keeps these tests independent of host
                // bwrap support.
                mode: IsolationMode::None,
                ..IsolationConfig::default()
            },
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn test_gateway_exists_only_with_allowlist_entries() {
        let dir = TempDir::new().unwrap();
        let service = ExecService::new(test_config(&dir)).unwrap();
        assert!(service.gateway().is_none());

        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.gateway.allow = vec!["api.example.com".to_string()];
        let service = ExecService::new(config).unwrap();
        assert!(service.gateway().is_some());
    }

    #[tokio::test]
    async fn test_bad_allowlist_entry_fails_construction() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.gateway.allow = vec!["*".to_string()];
        assert!(matches!(
            ExecService::new(config),
            Err(ServiceError::Gateway(_))
        ));
    }

    #[tokio::test]
    async fn test_export_of_fresh_session_is_an_empty_notebook() {
        let dir = TempDir::new().unwrap();
        let service = ExecService::new(test_config(&dir)).unwrap();
        let key = SessionKey::new("acme", "fresh");

        let ipynb = service.export_notebook(&key).await.unwrap();
        assert_eq!(ipynb["nbformat"], 4);
        assert_eq!(ipynb["cells"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_mark_sensitivity_is_visible_in_listing() {
        let dir = TempDir::new().unwrap();
        let service = ExecService::new(test_config(&dir)).unwrap();
        let key = SessionKey::new("acme", "sensitive");

        let session = service
            .mark_sensitivity(&key, DataSensitivity::Secret)
            .await
            .unwrap();
        assert_eq!(session.sensitivity, DataSensitivity::Secret);

        let listed = service.list_sessions().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].sensitivity, DataSensitivity::Secret);
    }

    #[tokio::test]
    async fn test_unknown_capability_is_rejected_before_any_session_work() {
        let dir = TempDir::new().unwrap();
        let service = ExecService::new(test_config(&dir)).unwrap();
        let key = SessionKey::new("acme", "caps");

        let result = service
            .invoke_capability(&key, "nope", "script.py", &[], None)
            .await;
        assert!(matches!(result, Err(ServiceError::Capability(_))));
        // The failed dispatch never created the session.
        assert!(service.list_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_idle_with_no_sessions_is_zero() {
        let dir = TempDir::new().unwrap();
        let service = ExecService::new(test_config(&dir)).unwrap();
        assert_eq!(service.cleanup_idle(), 0);
    }
}
