// ABOUTME: Selective-connectivity egress gateway: an allow-list forward proxy
// Restricted sessions reach approved hosts through it; everything else is refused

pub mod allowlist;
pub mod proxy;

pub use allowlist::Allowlist;
pub use proxy::{Gateway, SessionSocket, TcpGatewayHandle};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind gateway listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("invalid allow-list entry '{entry}': {reason}")]
    InvalidAllowlistEntry { entry: String, reason: String },

    #[error("malformed proxy request: {0}")]
    BadRequest(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
