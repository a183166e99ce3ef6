// ABOUTME: Network governor mapping session data sensitivity to a sandbox network mode
// The mapping only ever tightens: once a session has seen sensitive data it never loosens

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classification of the most sensitive data a session has been exposed to.
///
/// Ordered from least to most sensitive; the ordering is what makes the
/// ratchet in [`DataSensitivity::escalate`] a one-liner.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DataSensitivity {
    #[default]
    Public,
    Internal,
    Confidential,
    Secret,
}

impl DataSensitivity {
    /// Ratchet upward: returns the stricter of the two levels.
    pub fn escalate(self, requested: DataSensitivity) -> DataSensitivity {
        self.max(requested)
    }
}

impl fmt::Display for DataSensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataSensitivity::Public => "public",
            DataSensitivity::Internal => "internal",
            DataSensitivity::Confidential => "confidential",
            DataSensitivity::Secret => "secret",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for DataSensitivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(DataSensitivity::Public),
            "internal" => Ok(DataSensitivity::Internal),
            "confidential" => Ok(DataSensitivity::Confidential),
            "secret" => Ok(DataSensitivity::Secret),
            other => Err(format!(
                "unknown sensitivity level '{}' (expected public, internal, confidential or secret)",
                other
            )),
        }
    }
}

/// Network reachability granted to a session's sandbox.
///
/// Ordered from least to most restrictive, so `a < b` means "b is stricter".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Unrestricted egress.
    Full,
    /// Egress only through the allow-list gateway.
    Restricted,
    /// No network at all.
    None,
}

impl NetworkMode {
    /// Whether the sandbox for this mode runs in its own network namespace.
    pub fn isolates_network(self) -> bool {
        !matches!(self, NetworkMode::Full)
    }

    /// Whether egress is routed through the gateway socket.
    pub fn uses_gateway(self) -> bool {
        matches!(self, NetworkMode::Restricted)
    }

    pub fn is_stricter_than(self, other: NetworkMode) -> bool {
        self > other
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkMode::Full => "full",
            NetworkMode::Restricted => "restricted",
            NetworkMode::None => "none",
        };
        write!(f, "{}", s)
    }
}

/// The governor itself: pure mapping from sensitivity to the minimum
/// network mode a session must run under. Re-evaluated on every access.
pub fn required_network_mode(sensitivity: DataSensitivity) -> NetworkMode {
    match sensitivity {
        DataSensitivity::Public | DataSensitivity::Internal => NetworkMode::Full,
        DataSensitivity::Confidential => NetworkMode::Restricted,
        DataSensitivity::Secret => NetworkMode::None,
    }
}

/// Effective mode for a session: the required mode, unless the session is
/// already running stricter. Never loosens.
pub fn effective_network_mode(current: NetworkMode, sensitivity: DataSensitivity) -> NetworkMode {
    current.max(required_network_mode(sensitivity))
}
