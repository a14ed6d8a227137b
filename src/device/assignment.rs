//! Device assignment policy records
//!
//! An assignment binds a guest to a device pattern. Patterns may leave the
//! port or the device identity open; more concrete patterns win when several
//! assignments match the same device.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{DeviceOptions, MicDevice, MIC_CLASS};

/// When an assigned device gets attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentMode {
    /// Attach at guest start, refuse to start otherwise (treated as auto here)
    Required,
    /// Attach at guest start
    AutoAttach,
    /// Attach at guest start after the user confirms
    AskToAttach,
}

impl AssignmentMode {
    pub fn needs_confirmation(self) -> bool {
        matches!(self, AssignmentMode::AskToAttach)
    }
}

/// Binding of a guest to a device pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    pub guest: String,
    pub backend_domain: String,
    #[serde(default = "default_class")]
    pub devclass: String,
    /// Concrete port, `None` matches any
    #[serde(default)]
    pub port: Option<String>,
    /// Device identity, `None` or `"*"` matches any
    #[serde(default)]
    pub device_id: Option<String>,
    pub mode: AssignmentMode,
    #[serde(default)]
    pub options: DeviceOptions,
}

fn default_class() -> String {
    MIC_CLASS.to_string()
}

impl DeviceAssignment {
    /// Auto-attach assignment for the microphone of `backend_domain`
    pub fn mic(guest: impl Into<String>, backend_domain: impl Into<String>) -> Self {
        Self {
            guest: guest.into(),
            backend_domain: backend_domain.into(),
            devclass: default_class(),
            port: None,
            device_id: None,
            mode: AssignmentMode::AutoAttach,
            options: DeviceOptions::new(),
        }
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_mode(mut self, mode: AssignmentMode) -> Self {
        self.mode = mode;
        self
    }

    fn device_id_pattern(&self) -> Option<&str> {
        self.device_id.as_deref().filter(|id| *id != "*")
    }

    /// 0 for a full wildcard, 3 for port and identity both pinned
    pub fn specificity(&self) -> u8 {
        let port = u8::from(self.port.is_some());
        let ident = u8::from(self.device_id_pattern().is_some());
        port * 2 + ident
    }

    /// Whether this assignment names `device`
    pub fn matches(&self, device: &MicDevice) -> bool {
        if self.devclass != device.devclass || self.backend_domain != device.backend_domain {
            return false;
        }
        if let Some(port) = &self.port {
            if *port != device.ident {
                return false;
            }
        }
        match self.device_id_pattern() {
            Some(id) => id == device.device_id(),
            None => true,
        }
    }

    /// Most specific first
    pub fn cmp_specificity(&self, other: &Self) -> Ordering {
        other.specificity().cmp(&self.specificity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MIC_INTERFACE;

    #[test]
    fn test_specificity_order() {
        let any = DeviceAssignment::mic("work", "dom0");
        let ident = any.clone().with_device_id(MIC_INTERFACE);
        let port = any.clone().with_port("mic");
        let full = port.clone().with_device_id(MIC_INTERFACE);

        let mut all = vec![any.clone(), full.clone(), ident.clone(), port.clone()];
        all.sort_by(DeviceAssignment::cmp_specificity);
        assert_eq!(all, vec![full, port, ident, any]);
    }

    #[test]
    fn test_star_is_wildcard() {
        let a = DeviceAssignment::mic("work", "dom0").with_device_id("*");
        assert_eq!(a.specificity(), 0);
        assert!(a.matches(&MicDevice::new("dom0")));
    }

    #[test]
    fn test_matching() {
        let mic = MicDevice::new("dom0");
        assert!(DeviceAssignment::mic("work", "dom0").with_port("mic").matches(&mic));
        assert!(!DeviceAssignment::mic("work", "dom0").with_port("cam").matches(&mic));
        assert!(!DeviceAssignment::mic("work", "sys-usb").matches(&mic));
        assert!(!DeviceAssignment::mic("work", "dom0")
            .with_device_id("0000:0000")
            .matches(&mic));
    }

    #[test]
    fn test_deserialize_defaults() {
        let json = r#"{"guest":"work","backend_domain":"dom0","mode":"ask-to-attach"}"#;
        let a: DeviceAssignment = serde_json::from_str(json).unwrap();
        assert_eq!(a.devclass, "mic");
        assert!(a.options.is_empty());
        assert!(a.mode.needs_confirmation());
    }
}
