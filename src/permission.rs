//! Per-guest audio-input permission record
//!
//! The record lives in the relay's QubesDB at `/audio-input-config/<guest>`
//! and is one of: absent, `"0"`, `"1"`. It is written by software running at
//! relay trust level, so anything read back goes through [`decode`] before it
//! is acted upon.

use crate::error::ArbiterError;

/// Current permission record prefix
pub const CONFIG_PREFIX: &str = "/audio-input-config/";
/// Legacy status prefix, cleared on relay start
pub const STATUS_PREFIX: &str = "/audio-input/";
/// Reserved request prefix, cleared on relay start
pub const REQUEST_PREFIX: &str = "/audio-input-request/";

pub fn config_path(guest: &str) -> String {
    format!("{CONFIG_PREFIX}{guest}")
}

/// Every key the arbiter owns for `guest` on a relay
pub fn all_paths(guest: &str) -> [String; 3] {
    [
        config_path(guest),
        format!("{STATUS_PREFIX}{guest}"),
        format!("{REQUEST_PREFIX}{guest}"),
    ]
}

/// Validated permission value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Disabled,
    Enabled,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Disabled => "0",
            Permission::Enabled => "1",
        }
    }

    pub fn as_bytes(self) -> &'static [u8] {
        self.as_str().as_bytes()
    }
}

impl From<bool> for Permission {
    fn from(enabled: bool) -> Self {
        if enabled {
            Permission::Enabled
        } else {
            Permission::Disabled
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode an untrusted record read from `relay` for `guest`.
///
/// `Ok(None)` when the key is absent. Non-ASCII bytes or any value other
/// than `0`/`1` is an integrity error.
pub fn decode(
    guest: &str,
    relay: &str,
    untrusted: Option<&[u8]>,
) -> Result<Option<Permission>, ArbiterError> {
    let Some(untrusted) = untrusted else {
        return Ok(None);
    };
    if !untrusted.is_ascii() {
        return Err(ArbiterError::Integrity {
            guest: guest.to_string(),
            message: format!(
                "Cannot decode ASCII value for '{}' from {relay}",
                config_path(guest)
            ),
        });
    }
    match untrusted {
        b"0" => Ok(Some(Permission::Disabled)),
        b"1" => Ok(Some(Permission::Enabled)),
        other => Err(ArbiterError::Integrity {
            guest: guest.to_string(),
            message: format!(
                "Invalid value '{}' for '{}' from {relay}",
                String::from_utf8_lossy(other).escape_default(),
                config_path(guest)
            ),
        }),
    }
}

/// Probe-only interpretation: exactly `1` means enabled, anything else not
pub fn is_enabled(untrusted: Option<&[u8]>) -> bool {
    untrusted == Some(&b"1"[..])
}
