//! Transition notifications broadcast by the arbiter
//!
//! These are informational: subscribers (IPC clients, the log loop in
//! `main`) observe attach/detach progress but cannot veto anything.

use serde::{Deserialize, Serialize};

/// How a transition was carried to the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPath {
    /// Audio agent service call
    Rpc,
    /// Permission record written to the relay's QubesDB
    Qubesdb,
}

/// Events emitted while arbitrating the microphone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MicEvent {
    AttachRequested {
        guest: String,
        relay: String,
        path: TransitionPath,
    },

    Attached { guest: String, relay: String },

    AttachFailed { guest: String, reason: String },

    DetachRequested {
        guest: String,
        relay: String,
        path: TransitionPath,
    },

    Detached { guest: String, relay: String },

    DetachFailed { guest: String, reason: String },

    /// Permission copied to a guest's new relay
    PermissionMigrated {
        guest: String,
        from: String,
        to: String,
        value: String,
    },

    /// Stale keys for a guest removed from a relay
    PermissionCleared { guest: String, relay: String },
}

impl MicEvent {
    pub fn guest(&self) -> &str {
        match self {
            MicEvent::AttachRequested { guest, .. }
            | MicEvent::Attached { guest, .. }
            | MicEvent::AttachFailed { guest, .. }
            | MicEvent::DetachRequested { guest, .. }
            | MicEvent::Detached { guest, .. }
            | MicEvent::DetachFailed { guest, .. }
            | MicEvent::PermissionMigrated { guest, .. }
            | MicEvent::PermissionCleared { guest, .. } => guest,
        }
    }
}

impl std::fmt::Display for MicEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MicEvent::AttachRequested { guest, relay, path } => {
                write!(f, "ATTACH_REQUESTED {guest} via {relay} ({path:?})")
            }
            MicEvent::Attached { guest, relay } => write!(f, "ATTACHED {guest} via {relay}"),
            MicEvent::AttachFailed { guest, reason } => {
                write!(f, "ATTACH_FAILED {guest}: {reason}")
            }
            MicEvent::DetachRequested { guest, relay, path } => {
                write!(f, "DETACH_REQUESTED {guest} via {relay} ({path:?})")
            }
            MicEvent::Detached { guest, relay } => write!(f, "DETACHED {guest} via {relay}"),
            MicEvent::DetachFailed { guest, reason } => {
                write!(f, "DETACH_FAILED {guest}: {reason}")
            }
            MicEvent::PermissionMigrated {
                guest,
                from,
                to,
                value,
            } => write!(f, "PERMISSION_MIGRATED {guest} {from} -> {to} ({value})"),
            MicEvent::PermissionCleared { guest, relay } => {
                write!(f, "PERMISSION_CLEARED {guest} on {relay}")
            }
        }
    }
}
