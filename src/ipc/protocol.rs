//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceAssignment, DeviceOptions, MicDevice};
use crate::error::ArbiterError;
use crate::events::MicEvent;
use crate::state::MicState;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Requests from clients (management tools, lifecycle hooks) to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Ping to check connectivity
    Ping,

    /// Request current daemon status
    GetStatus,

    /// Subscribe to mic transition notifications
    Subscribe,

    ListDevices { vm: String },

    GetDevice { vm: String, ident: String },

    ListAttached {
        vm: String,
        #[serde(default)]
        persistent: Option<bool>,
    },

    Attach {
        vm: String,
        #[serde(default)]
        options: DeviceOptions,
    },

    Detach { vm: String },

    /// Validate and store an assignment
    Assign { assignment: DeviceAssignment },

    /// Change a guest's audio relay
    SetAudiovm {
        vm: String,
        audiovm: Option<String>,
    },

    /// A domain's QubesDB was (re)created
    QdbCreated { vm: String },

    DomainStarted { vm: String },

    DomainShutdown { vm: String },
}

/// One attached device in a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedDevice {
    pub device: MicDevice,
    pub options: DeviceOptions,
}

/// Responses from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Pong response to ping
    Pong,

    /// Current daemon status
    Status(DaemonStatus),

    /// Subscription confirmed
    Subscribed,

    Devices { devices: Vec<MicDevice> },

    Attached { devices: Vec<AttachedDevice> },

    /// Request applied
    Ok,

    /// Pushed to subscribed clients
    Notification { event: MicEvent },

    /// Error response
    Error { code: String, message: String },
}

impl Response {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unknown_domain(vm: &str) -> Self {
        Self::error("unknown_domain", format!("no such domain: {vm}"))
    }
}

impl From<ArbiterError> for Response {
    fn from(err: ArbiterError) -> Self {
        Response::error(err.code(), err.to_string())
    }
}

/// Full daemon status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Domain owning the microphone
    pub admin_domain: String,

    /// Number of known domains
    pub domains: usize,

    /// Last known mic state per guest
    pub guests: BTreeMap<String, MicState>,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl Default for DaemonStatus {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            admin_domain: String::new(),
            domains: 0,
            guests: BTreeMap::new(),
            uptime_secs: 0,
        }
    }
}
