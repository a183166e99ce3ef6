// ABOUTME: Session manager: lazy get_or_create, sensitivity-driven environment tightening, idle cleanup
// Tightening constructs the stricter environment before the old one is dropped; a failed build keeps the old

use crate::gateway::Gateway;
use crate::models::{Session, SessionKey};
use crate::policy::DataSensitivity;
use crate::sandbox::BindMount;
use crate::session::{Environment, SessionError, SessionStore};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// In-memory handle for one session: the persisted record, the live
/// environment (if any), and a gate serializing executions so concurrent
/// cells cannot interleave namespace snapshots.
pub struct SessionSlot {
    record: RwLock<Session>,
    environment: RwLock<Option<Arc<Environment>>>,
    exec_gate: tokio::sync::Mutex<()>,
}

impl SessionSlot {
    fn new(record: Session) -> Self {
        Self {
            record: RwLock::new(record),
            environment: RwLock::new(None),
            exec_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// A point-in-time copy of the persisted record.
    pub fn snapshot(&self) -> Session {
        self.record.read().expect("session record lock poisoned").clone()
    }

    /// Holds off other executions in the same session until dropped.
    pub async fn exec_permit(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.exec_gate.lock().await
    }

    fn current_environment(&self) -> Option<Arc<Environment>> {
        self.environment
            .read()
            .expect("environment lock poisoned")
            .clone()
    }
}

pub struct SessionManager {
    store: SessionStore,
    gateway: Option<Arc<Gateway>>,
    capability_mounts: Vec<BindMount>,
    sessions: RwLock<HashMap<SessionKey, Arc<SessionSlot>>>,
}

impl SessionManager {
    pub fn new(
        store: SessionStore,
        gateway: Option<Arc<Gateway>>,
        capability_mounts: Vec<BindMount>,
    ) -> Self {
        Self {
            store,
            gateway,
            capability_mounts,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Returns the session for `key`, creating it on first reference. An
    /// existing session directory from a previous process is picked up
    /// transparently; its workspace and sensitivity level carry over.
    pub async fn get_or_create(&self, key: &SessionKey) -> Result<Arc<SessionSlot>, SessionError> {
        validate_key(key)?;

        if let Some(slot) = self.sessions.read().expect("session map lock poisoned").get(key) {
            return Ok(Arc::clone(slot));
        }

        let record = match self.store.load(key)? {
            Some(record) => {
                debug!(session = %key, "session restored from disk");
                record
            }
            None => {
                let dir = self.store.session_dir(key);
                std::fs::create_dir_all(dir.join("workspace"))?;
                let record = Session::new(key, dir.join("workspace"));
                self.store.save(&record)?;
                info!(session = %key, "session created");
                record
            }
        };

        let slot = Arc::new(SessionSlot::new(record));
        let mut map = self.sessions.write().expect("session map lock poisoned");
        let entry = map.entry(key.clone()).or_insert(slot);
        Ok(Arc::clone(entry))
    }

    /// Returns an environment matching the session's current requirement,
    /// building one lazily and rebuilding when the requirement tightened or
    /// the old environment went unhealthy. The replacement is fully
    /// constructed before the previous environment is released, and a failed
    /// build leaves the previous one in place.
    pub async fn acquire_environment(
        &self,
        slot: &Arc<SessionSlot>,
    ) -> Result<Arc<Environment>, SessionError> {
        let (key, required) = {
            let record = slot.record.read().expect("session record lock poisoned");
            (record.key(), record.required_mode())
        };

        if let Some(env) = slot.current_environment() {
            if env.network_mode() == required && env.is_healthy() {
                return Ok(env);
            }
            debug!(
                session = %key,
                current = %env.network_mode(),
                required = %required,
                "environment no longer fits, rebuilding"
            );
        }

        let built = Environment::build(
            self.store.session_dir(&key),
            required,
            self.gateway.as_ref(),
            self.capability_mounts.clone(),
        )
        .await?;
        let built = Arc::new(built);

        let previous = slot
            .environment
            .write()
            .expect("environment lock poisoned")
            .replace(Arc::clone(&built));
        if let Some(previous) = previous {
            info!(
                session = %key,
                old = %previous.id(),
                new = %built.id(),
                mode = %built.network_mode(),
                "environment replaced"
            );
        }

        {
            let mut record = slot.record.write().expect("session record lock poisoned");
            record.set_network_mode(required);
        }
        self.store.save(&slot.snapshot())?;

        Ok(built)
    }

    /// Raises the session's sensitivity level. Marks take the session's
    /// execution gate, so a tighten never interleaves with a running cell or
    /// with another mark racing its persist. The record is persisted before
    /// any environment work, so the ratchet survives even when the stricter
    /// environment cannot be built yet; until it can, executions fail closed
    /// rather than run at the old mode.
    pub async fn mark_sensitivity(
        &self,
        key: &SessionKey,
        level: DataSensitivity,
    ) -> Result<Session, SessionError> {
        let slot = self.get_or_create(key).await?;
        let _permit = slot.exec_permit().await;

        let (changed, snapshot) = {
            let mut record = slot.record.write().expect("session record lock poisoned");
            let changed = record.mark_sensitivity(level);
            (changed, record.clone())
        };
        self.store.save(&snapshot)?;

        if changed {
            info!(
                session = %key,
                level = %snapshot.sensitivity,
                mode = %snapshot.required_mode(),
                "sensitivity raised"
            );
            if slot.current_environment().is_some() {
                self.acquire_environment(&slot).await?;
            }
        }

        Ok(slot.snapshot())
    }

    /// Records activity on the session and persists the timestamp.
    pub fn touch(&self, slot: &SessionSlot) -> Result<(), SessionError> {
        {
            let mut record = slot.record.write().expect("session record lock poisoned");
            record.touch();
        }
        self.store.save(&slot.snapshot())
    }

    /// Destroys environments idle past `threshold` and evicts their slots.
    /// Session records and workspaces stay on disk; the next reference
    /// recreates the environment around them. Returns how many environments
    /// were destroyed.
    pub fn cleanup_idle(&self, threshold: Duration) -> usize {
        let threshold = chrono::Duration::from_std(threshold)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        let mut destroyed = 0;

        let mut map = self.sessions.write().expect("session map lock poisoned");
        map.retain(|key, slot| {
            let idle = slot.record.read().expect("session record lock poisoned").idle_for();
            if idle < threshold {
                return true;
            }
            let environment = slot
                .environment
                .write()
                .expect("environment lock poisoned")
                .take();
            if let Some(environment) = environment {
                info!(
                    session = %key,
                    environment = %environment.id(),
                    idle_secs = idle.num_seconds(),
                    "destroying idle environment"
                );
                destroyed += 1;
            }
            false
        });

        destroyed
    }

    /// Every persisted session, with in-memory records taking precedence
    /// over what is on disk.
    pub fn list_sessions(&self) -> Result<Vec<Session>, SessionError> {
        let mut sessions = self.store.list()?;
        let map = self.sessions.read().expect("session map lock poisoned");
        for session in &mut sessions {
            if let Some(slot) = map.get(&session.key()) {
                *session = slot.snapshot();
            }
        }
        Ok(sessions)
    }

    /// Permanently deletes a session: environment, record, workspace.
    pub fn delete(&self, key: &SessionKey) -> Result<(), SessionError> {
        validate_key(key)?;
        let removed = self
            .sessions
            .write()
            .expect("session map lock poisoned")
            .remove(key);
        if removed.is_some() {
            debug!(session = %key, "session evicted from memory");
        }
        self.store.delete(key)?;
        warn!(session = %key, "session deleted, workspace included");
        Ok(())
    }
}

/// Key components become directory names, so anything that could escape the
/// store root is rejected up front.
fn validate_key(key: &SessionKey) -> Result<(), SessionError> {
    for component in [&key.tenant_id, &key.session_id] {
        let invalid = component.is_empty()
            || component.starts_with('.')
            || component.contains('/')
            || component.contains('\\')
            || component.contains('\0');
        if invalid {
            return Err(SessionError::InvalidKey(component.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::NetworkMode;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> SessionManager {
        SessionManager::new(SessionStore::new(dir.path()), None, Vec::new())
    }

    fn key(session: &str) -> SessionKey {
        SessionKey::new("acme", session)
    }

    #[tokio::test]
    async fn test_get_or_create_is_lazy_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let slot = manager.get_or_create(&key("a1")).await.unwrap();
        assert!(slot.snapshot().workspace_path.is_dir());
        assert!(dir.path().join("acme/a1/meta.json").is_file());

        let again = manager.get_or_create(&key("a1")).await.unwrap();
        assert!(Arc::ptr_eq(&slot, &again));
    }

    #[tokio::test]
    async fn test_hostile_key_components_are_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        for bad in ["../escape", "a/b", "", ".hidden"] {
            let result = manager.get_or_create(&SessionKey::new("acme", bad)).await;
            assert!(
                matches!(result, Err(SessionError::InvalidKey(_))),
                "session id {bad:?} should be rejected"
            );
            let result = manager.get_or_create(&SessionKey::new(bad, "ok")).await;
            assert!(matches!(result, Err(SessionError::InvalidKey(_))));
        }
    }

    #[tokio::test]
    async fn test_session_survives_a_new_manager_instance() {
        let dir = TempDir::new().unwrap();
        let k = key("durable");

        let created = {
            let manager = manager(&dir);
            let slot = manager.get_or_create(&k).await.unwrap();
            manager
                .mark_sensitivity(&k, DataSensitivity::Confidential)
                .await
                .unwrap();
            std::fs::write(slot.snapshot().workspace_path.join("data.csv"), "a,b\n").unwrap();
            slot.snapshot()
        };

        let manager = manager(&dir);
        let restored = manager.get_or_create(&k).await.unwrap().snapshot();
        assert_eq!(restored.sensitivity, DataSensitivity::Confidential);
        assert_eq!(restored.created_at, created.created_at);
        assert!(restored.workspace_path.join("data.csv").is_file());
    }

    #[tokio::test]
    async fn test_acquire_environment_reuses_until_requirement_changes() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let slot = manager.get_or_create(&key("env")).await.unwrap();

        let first = manager.acquire_environment(&slot).await.unwrap();
        assert_eq!(first.network_mode(), NetworkMode::Full);

        let second = manager.acquire_environment(&slot).await.unwrap();
        assert_eq!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_tightening_replaces_the_environment() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let k = key("tighten");
        let slot = manager.get_or_create(&k).await.unwrap();

        let loose = manager.acquire_environment(&slot).await.unwrap();
        manager
            .mark_sensitivity(&k, DataSensitivity::Confidential)
            .await
            .unwrap();

        let strict = manager.acquire_environment(&slot).await.unwrap();
        assert_ne!(loose.id(), strict.id());
        assert_eq!(strict.network_mode(), NetworkMode::Restricted);

        // Secret tightens further, to no networking at all.
        manager
            .mark_sensitivity(&k, DataSensitivity::Secret)
            .await
            .unwrap();
        let sealed = manager.acquire_environment(&slot).await.unwrap();
        assert_eq!(sealed.network_mode(), NetworkMode::None);
    }

    #[tokio::test]
    async fn test_mark_sensitivity_waits_for_the_exec_gate() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(manager(&dir));
        let k = key("gated");
        let slot = manager.get_or_create(&k).await.unwrap();

        // Simulate a cell in flight.
        let permit = slot.exec_permit().await;

        let mark = {
            let manager = Arc::clone(&manager);
            let k = k.clone();
            tokio::spawn(async move { manager.mark_sensitivity(&k, DataSensitivity::Secret).await })
        };

        // While the gate is held the mark must not touch the record.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!mark.is_finished());
        assert_eq!(slot.snapshot().sensitivity, DataSensitivity::Public);

        drop(permit);
        let marked = mark.await.unwrap().unwrap();
        assert_eq!(marked.sensitivity, DataSensitivity::Secret);
        let persisted = manager.store().load(&k).unwrap().unwrap();
        assert_eq!(persisted.sensitivity, DataSensitivity::Secret);
    }

    #[tokio::test]
    async fn test_concurrent_marks_persist_the_strictest_level() {
        let dir = TempDir::new().unwrap();
        let k = key("ratchet");

        {
            let manager = Arc::new(manager(&dir));
            manager.get_or_create(&k).await.unwrap();

            let mut marks = Vec::new();
            for n in 0..12 {
                let manager = Arc::clone(&manager);
                let k = k.clone();
                let level = if n == 5 {
                    DataSensitivity::Secret
                } else {
                    DataSensitivity::Confidential
                };
                marks.push(tokio::spawn(
                    async move { manager.mark_sensitivity(&k, level).await },
                ));
            }
            for mark in marks {
                mark.await.unwrap().unwrap();
            }
        }

        // A fresh manager sees the strictest level ever marked, regardless
        // of how the marks interleaved their saves.
        let restored = manager(&dir).get_or_create(&k).await.unwrap().snapshot();
        assert_eq!(restored.sensitivity, DataSensitivity::Secret);
    }

    #[tokio::test]
    async fn test_cleanup_idle_destroys_environment_but_keeps_workspace() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let k = key("idle");
        let slot = manager.get_or_create(&k).await.unwrap();
        manager.acquire_environment(&slot).await.unwrap();

        let workspace = slot.snapshot().workspace_path;
        std::fs::write(workspace.join("keep.txt"), "still here").unwrap();

        // Nothing is idle yet.
        assert_eq!(manager.cleanup_idle(Duration::from_secs(60)), 0);

        {
            let mut record = slot.record.write().unwrap();
            record.last_activity = chrono::Utc::now() - chrono::Duration::hours(2);
        }
        assert_eq!(manager.cleanup_idle(Duration::from_secs(60)), 1);

        // The record and workspace survive; the next reference reloads them.
        let restored = manager.get_or_create(&k).await.unwrap();
        assert!(restored.snapshot().workspace_path.join("keep.txt").is_file());
        assert!(restored.current_environment().is_none());
    }

    #[tokio::test]
    async fn test_list_sessions_merges_disk_and_memory() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.get_or_create(&key("one")).await.unwrap();
        manager.get_or_create(&key("two")).await.unwrap();

        let sessions = manager.list_sessions().unwrap();
        let ids: Vec<&str> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let k = key("doomed");
        let slot = manager.get_or_create(&k).await.unwrap();
        let workspace = slot.snapshot().workspace_path;

        manager.delete(&k).unwrap();
        assert!(!workspace.exists());
        assert!(manager.store().load(&k).unwrap().is_none());
    }
}
