//! Error types for microphone arbitration
//!
//! `ArbiterError` is what every arbitration operation returns. The transport
//! errors below it are produced by the key-value and RPC backends and are
//! folded into `ArbiterError` (or swallowed, for probing queries) by the
//! arbiter.

use thiserror::Error;

/// Failure of a single arbitration operation
#[derive(Debug, Error)]
pub enum ArbiterError {
    /// Caller passed something the device does not accept (e.g. options)
    #[error("{0}")]
    Usage(String),

    /// Guest has no audio relay bound
    #[error("{0}")]
    Configuration(String),

    /// Bound audio relay exists but is not running
    #[error("{message}")]
    NotRunning { domain: String, message: String },

    /// Remote procedure on the relay failed
    #[error("{message}")]
    Relay { guest: String, message: String },

    /// Untrusted permission record could not be validated
    #[error("{message}")]
    Integrity { guest: String, message: String },

    /// Caller broke the handler contract (wrong device passed in)
    #[error("contract violation: {0}")]
    Contract(String),

    /// Key-value store could not be reached for a write
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl ArbiterError {
    /// Stable identifier used in IPC error responses
    pub fn code(&self) -> &'static str {
        match self {
            ArbiterError::Usage(_) => "usage",
            ArbiterError::Configuration(_) => "configuration",
            ArbiterError::NotRunning { .. } => "not_running",
            ArbiterError::Relay { .. } => "relay",
            ArbiterError::Integrity { .. } => "integrity",
            ArbiterError::Contract(_) => "contract",
            ArbiterError::Channel(_) => "channel",
        }
    }
}

/// Failure talking to a domain's key-value store
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("qubesdb of {domain} unavailable: {reason}")]
    Unavailable { domain: String, reason: String },

    #[error("qubesdb of {domain} did not answer within {secs}s")]
    Timeout { domain: String, secs: u64 },

    #[error("qubesdb command failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure running a remote procedure
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("service {service} in {domain} exited with status {status}")]
    Failed {
        domain: String,
        service: String,
        status: i32,
    },

    #[error("service {service} in {domain} timed out")]
    Timeout { domain: String, service: String },

    #[error("qrexec client failed: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            ArbiterError::Usage("u".into()),
            ArbiterError::Configuration("c".into()),
            ArbiterError::NotRunning {
                domain: "sys-audio".into(),
                message: "m".into(),
            },
            ArbiterError::Relay {
                guest: "work".into(),
                message: "m".into(),
            },
            ArbiterError::Integrity {
                guest: "work".into(),
                message: "m".into(),
            },
            ArbiterError::Contract("x".into()),
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_channel_error_wraps() {
        let err: ArbiterError = ChannelError::Unavailable {
            domain: "sys-audio".into(),
            reason: "gone".into(),
        }
        .into();
        assert_eq!(err.code(), "channel");
        assert!(err.to_string().contains("sys-audio"));
    }
}
