//! Device module for the system microphone
//!
//! There is exactly one logical microphone. It is physically attached to the
//! admin domain and exposed to guests only through their audio relay.

mod assignment;

pub use assignment::{AssignmentMode, DeviceAssignment};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Device class handled by the arbiter
pub const MIC_CLASS: &str = "mic";

/// Identifier (port) of the single microphone
pub const MIC_IDENT: &str = "mic";

/// Interface tag of the microphone ("unknown" interface in device terms)
pub const MIC_INTERFACE: &str = "******";

/// Per-attachment options. The microphone accepts none.
pub type DeviceOptions = BTreeMap<String, String>;

/// The microphone as seen by device queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicDevice {
    /// Domain the device is physically attached to
    pub backend_domain: String,
    pub ident: String,
    pub devclass: String,
    pub product: String,
    pub manufacturer: String,
    pub interfaces: Vec<String>,
}

impl MicDevice {
    /// The microphone owned by `backend_domain`
    pub fn new(backend_domain: impl Into<String>) -> Self {
        Self {
            backend_domain: backend_domain.into(),
            ident: MIC_IDENT.to_string(),
            devclass: MIC_CLASS.to_string(),
            product: "microphone".to_string(),
            manufacturer: "build-in".to_string(),
            interfaces: vec![MIC_INTERFACE.to_string()],
        }
    }

    /// Identity used by assignments to match this device
    pub fn device_id(&self) -> String {
        self.interfaces.concat()
    }
}

impl PartialEq for MicDevice {
    fn eq(&self, other: &Self) -> bool {
        self.backend_domain == other.backend_domain
            && self.devclass == other.devclass
            && self.ident == other.ident
    }
}

impl Eq for MicDevice {}

impl std::fmt::Display for MicDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.backend_domain, self.ident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_description() {
        let a = MicDevice::new("dom0");
        let mut b = MicDevice::new("dom0");
        b.product = "something else".into();
        assert_eq!(a, b);
        assert_ne!(a, MicDevice::new("sys-audio"));
    }

    #[test]
    fn test_identity() {
        let mic = MicDevice::new("dom0");
        assert_eq!(mic.ident, "mic");
        assert_eq!(mic.devclass, "mic");
        assert_eq!(mic.device_id(), MIC_INTERFACE);
        assert_eq!(mic.to_string(), "dom0:mic");
    }
}
