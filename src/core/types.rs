//! Small shared enums: transport mode, lifecycle phase and error class.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol carrying a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportMode {
    /// QUIC over UDP.
    Quic,
    /// TCP with TLS 1.3.
    Tcp,
}

impl TransportMode {
    /// Wire name of the mode (`"QUIC"` / `"TCP"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quic => "QUIC",
            Self::Tcp => "TCP",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    /// Initial state, or after an explicit close.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Link established.
    Connected,
    /// Link dropped; a reconnection attempt is pending or running.
    Reconnecting,
    /// Last attempt failed. Terminal once retries are exhausted.
    Failed,
}

impl Phase {
    /// Upper-case name of the phase.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Failed => "FAILED",
        }
    }

    /// All phases, in lifecycle order.
    pub const ALL: [Phase; 5] = [
        Self::Disconnected,
        Self::Connecting,
        Self::Connected,
        Self::Reconnecting,
        Self::Failed,
    ];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a failure can be recovered by retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Timeouts, resets, keep-alive loss. Retried with backoff.
    Transient,
    /// Handshake or auth rejection, protocol violations. Never retried.
    Permanent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_serialization() {
        assert_eq!(serde_json::to_string(&TransportMode::Quic).unwrap(), "\"QUIC\"");
        assert_eq!(serde_json::to_string(&TransportMode::Tcp).unwrap(), "\"TCP\"");
        assert_eq!(TransportMode::Tcp.to_string(), "TCP");
    }

    #[test]
    fn test_phase_display_matches_serde() {
        for phase in Phase::ALL {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{phase}\""));
        }
        assert_eq!(Phase::default(), Phase::Disconnected);
    }
}
