// ABOUTME: Session data model for a tenant-scoped sandboxed execution environment

use crate::policy::{self, DataSensitivity, NetworkMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// External reference to a session. This is the only identity callers ever
/// hold; environment handles and mount paths stay inside the subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub tenant_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(tenant_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.session_id)
    }
}

/// Persisted session record. Everything here survives process restarts and
/// environment recreation; the live environment handle is tracked separately
/// by the session manager and is deliberately not part of this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub tenant_id: String,
    pub session_id: String,
    pub workspace_path: PathBuf,
    #[serde(default)]
    pub sensitivity: DataSensitivity,
    pub network_mode: NetworkMode,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(key: &SessionKey, workspace_path: PathBuf) -> Self {
        let now = Utc::now();
        let sensitivity = DataSensitivity::default();

        Self {
            tenant_id: key.tenant_id.clone(),
            session_id: key.session_id.clone(),
            workspace_path,
            sensitivity,
            network_mode: policy::required_network_mode(sensitivity),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.tenant_id, &self.session_id)
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Ratchets the sensitivity level. Returns true when the level actually
    /// rose; marking at or below the current level is a no-op.
    pub fn mark_sensitivity(&mut self, level: DataSensitivity) -> bool {
        let next = self.sensitivity.escalate(level);
        if next == self.sensitivity {
            return false;
        }
        self.sensitivity = next;
        self.touch();
        true
    }

    /// The network mode this session must run under right now.
    pub fn required_mode(&self) -> NetworkMode {
        policy::effective_network_mode(self.network_mode, self.sensitivity)
    }

    /// Records that the environment now runs under `mode`. Refuses to loosen.
    pub fn set_network_mode(&mut self, mode: NetworkMode) {
        self.network_mode = self.network_mode.max(mode);
    }

    pub fn idle_for(&self) -> chrono::Duration {
        Utc::now() - self.last_activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Session {
        let key = SessionKey::new("acme", "assistant-1");
        Session::new(&key, PathBuf::from("/tmp/acme/assistant-1/workspace"))
    }

    #[test]
    fn test_new_session_starts_public_and_full() {
        let session = sample();
        assert_eq!(session.sensitivity, DataSensitivity::Public);
        assert_eq!(session.network_mode, NetworkMode::Full);
        assert_eq!(session.required_mode(), NetworkMode::Full);
    }

    #[test]
    fn test_mark_sensitivity_ratchets() {
        let mut session = sample();
        assert!(session.mark_sensitivity(DataSensitivity::Confidential));
        assert_eq!(session.sensitivity, DataSensitivity::Confidential);
        assert_eq!(session.required_mode(), NetworkMode::Restricted);

        // Lower marks do not move the level back down.
        assert!(!session.mark_sensitivity(DataSensitivity::Public));
        assert_eq!(session.sensitivity, DataSensitivity::Confidential);

        // Repeating the current level is a no-op as well.
        assert!(!session.mark_sensitivity(DataSensitivity::Confidential));
    }

    #[test]
    fn test_set_network_mode_never_loosens() {
        let mut session = sample();
        session.set_network_mode(NetworkMode::None);
        session.set_network_mode(NetworkMode::Full);
        assert_eq!(session.network_mode, NetworkMode::None);
    }

    #[test]
    fn test_key_round_trip() {
        let session = sample();
        let key = session.key();
        assert_eq!(key.tenant_id, "acme");
        assert_eq!(key.session_id, "assistant-1");
        assert_eq!(key.to_string(), "acme/assistant-1");
    }

    #[test]
    fn test_record_serializes_without_runtime_state() {
        let session = sample();
        let json = serde_json::to_string_pretty(&session).unwrap();
        let restored: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.tenant_id, session.tenant_id);
        assert_eq!(restored.workspace_path, session.workspace_path);
        assert_eq!(restored.network_mode, session.network_mode);
        assert!(!json.contains("environment"));
    }
}
