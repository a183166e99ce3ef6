// ABOUTME: Session lifecycle: lazy creation, durable workspaces, sensitivity tightening, idle cleanup

pub mod environment;
pub mod manager;
pub mod persistence;

pub use environment::Environment;
pub use manager::{SessionManager, SessionSlot};
pub use persistence::SessionStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session key component: '{0}'")]
    InvalidKey(String),

    #[error("session storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("session metadata is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error(transparent)]
    Gateway(#[from] crate::gateway::GatewayError),
}
