// ABOUTME: Durable session metadata: one meta.json per session directory under {root}/{tenant}/{session}
// Listing skips unreadable entries with a warning; loading a named session reports corruption

use crate::models::{Session, SessionKey};
use crate::session::SessionError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const META_FILE: &str = "meta.json";

pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, key: &SessionKey) -> PathBuf {
        self.root.join(&key.tenant_id).join(&key.session_id)
    }

    pub fn save(&self, session: &Session) -> Result<(), SessionError> {
        let dir = self.session_dir(&session.key());
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(session)?;
        fs::write(dir.join(META_FILE), json)?;
        Ok(())
    }

    /// Loads one session's metadata. A missing file is simply `None`; a file
    /// that exists but does not parse is an error, because silently treating
    /// it as absent would recreate the session at default sensitivity.
    pub fn load(&self, key: &SessionKey) -> Result<Option<Session>, SessionError> {
        let path = self.session_dir(key).join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let session = serde_json::from_str(&content)?;
        Ok(Some(session))
    }

    /// Walks `{root}/{tenant}/{session}/meta.json` for every persisted
    /// session. Unreadable entries are skipped with a warning so one bad
    /// file cannot hide the rest.
    pub fn list(&self) -> Result<Vec<Session>, SessionError> {
        let mut sessions = Vec::new();
        if !self.root.is_dir() {
            return Ok(sessions);
        }
        for tenant in fs::read_dir(&self.root)? {
            let tenant_dir = tenant?.path();
            if !tenant_dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&tenant_dir)? {
                let meta = entry?.path().join(META_FILE);
                if !meta.is_file() {
                    continue;
                }
                match fs::read_to_string(&meta)
                    .map_err(SessionError::from)
                    .and_then(|text| serde_json::from_str(&text).map_err(SessionError::from))
                {
                    Ok(session) => sessions.push(session),
                    Err(err) => {
                        warn!(path = %meta.display(), "skipping unreadable session metadata: {}", err);
                    }
                }
            }
        }
        sessions.sort_by(|a: &Session, b: &Session| a.key().to_string().cmp(&b.key().to_string()));
        Ok(sessions)
    }

    /// Removes a session entirely, workspace included. Only for explicit
    /// deletion; idle cleanup never calls this.
    pub fn delete(&self, key: &SessionKey) -> Result<(), SessionError> {
        let dir = self.session_dir(key);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}
