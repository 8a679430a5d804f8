//! Peer Device State
//!
//! Connection lifecycle, bonding and policy values shared by the state
//! machines, the policy store and the service.
//!
//! ## Connection Lifecycle
//!
//! 1. **Disconnected**: initial state, and the end of every cycle
//! 2. **Connecting**: connect issued (or announced by the stack), timer armed
//! 3. **Connected**: the stack reported an established connection
//! 4. **Disconnecting**: disconnect in progress, connect/disconnect requests
//!    are deferred until it completes
//!
//! The radio stack reports states as integer codes; [`ConnectionState::from_native`]
//! maps them and rejects anything out of range.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected (initial state)
    #[default]
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Connected and ready
    Connected,
    /// Disconnection in progress
    Disconnecting,
}

impl ConnectionState {
    /// Map a native stack connection state code
    ///
    /// Codes: 0 = disconnected, 1 = connecting, 2 = connected,
    /// 3 = disconnecting. Anything else yields `None`.
    pub fn from_native(code: i32) -> Option<Self> {
        match code {
            0 => Some(ConnectionState::Disconnected),
            1 => Some(ConnectionState::Connecting),
            2 => Some(ConnectionState::Connected),
            3 => Some(ConnectionState::Disconnecting),
            _ => None,
        }
    }

    /// Native stack code for this state
    pub fn to_native(self) -> i32 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Disconnecting => 3,
        }
    }

    /// Check if the peer is connected
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if a transition is in flight (connecting or disconnecting)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Disconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnecting => "DISCONNECTING",
        };
        f.write_str(name)
    }
}

/// Bond state of a peer, owned by the pairing layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BondState {
    /// Not bonded
    #[default]
    None,
    /// Bonding in progress
    Bonding,
    /// Bonded
    Bonded,
}

/// Per-device connection policy for the set coordinator profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPolicy {
    /// No decision recorded
    #[default]
    Unknown,
    /// The profile may connect
    Allowed,
    /// The profile must not connect
    Forbidden,
}
