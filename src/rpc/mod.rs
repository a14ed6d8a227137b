//! Remote procedures on the audio relay
//!
//! Relays that ship an audio agent advertise `supported-rpc.<svc>` features.
//! The arbiter calls the service when advertised and falls back to writing
//! QubesDB otherwise.

mod qrexec;

pub use qrexec::QrexecInvoker;

use async_trait::async_trait;

use crate::domain::DomainRegistry;
use crate::error::InvokeError;

/// Direction of an audio-input toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioInputCall {
    Enable,
    Disable,
}

impl AudioInputCall {
    fn method(self) -> &'static str {
        match self {
            AudioInputCall::Enable => "AudioInputEnable",
            AudioInputCall::Disable => "AudioInputDisable",
        }
    }

    /// `<namespace>.AudioInputEnable`
    pub fn service(self, namespace: &str) -> String {
        format!("{namespace}.{}", self.method())
    }

    /// Service name with the guest as argument
    pub fn service_for(self, namespace: &str, guest: &str) -> String {
        format!("{}+{guest}", self.service(namespace))
    }

    /// Feature a relay sets when it implements the service
    pub fn feature(self, namespace: &str) -> String {
        format!("supported-rpc.{}", self.service(namespace))
    }
}

/// Whether `relay` advertises `call`, with netvm inheritance and a false default
pub fn supports(
    registry: &dyn DomainRegistry,
    relay: &str,
    namespace: &str,
    call: AudioInputCall,
) -> bool {
    registry.check_with_netvm(relay, &call.feature(namespace), false)
}

/// Runs a named service in a domain and waits for it to finish
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn run_service(&self, domain: &str, service: &str) -> Result<(), InvokeError>;
}

/// Invoker for setups without qrexec; every call fails
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableInvoker;

#[async_trait]
impl RemoteInvoker for UnavailableInvoker {
    async fn run_service(&self, domain: &str, service: &str) -> Result<(), InvokeError> {
        Err(InvokeError::Failed {
            domain: domain.to_string(),
            service: service.to_string(),
            status: -1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainRecord, MemoryRegistry};

    #[tokio::test]
    async fn test_unavailable_invoker_fails() {
        let err = UnavailableInvoker
            .run_service("sys-audio", "qubes.AudioInputEnable+work")
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Failed { status: -1, .. }));
    }

    #[test]
    fn test_names() {
        let call = AudioInputCall::Enable;
        assert_eq!(call.service("qubes"), "qubes.AudioInputEnable");
        assert_eq!(call.service_for("qubes", "work"), "qubes.AudioInputEnable+work");
        assert_eq!(
            AudioInputCall::Disable.feature("qubes"),
            "supported-rpc.qubes.AudioInputDisable"
        );
    }

    #[test]
    fn test_supports_defaults_false() {
        let reg = MemoryRegistry::new();
        reg.insert(DomainRecord::guest("sys-audio"));
        assert!(!supports(&reg, "sys-audio", "qubes", AudioInputCall::Enable));
        reg.set_feature("sys-audio", "supported-rpc.qubes.AudioInputEnable", "1");
        assert!(supports(&reg, "sys-audio", "qubes", AudioInputCall::Enable));
        assert!(!supports(&reg, "sys-audio", "qubes", AudioInputCall::Disable));
    }
}
