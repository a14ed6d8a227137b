//! Domain module: the view of VMs the arbiter needs
//!
//! The arbiter never walks a live object graph. It asks a `DomainRegistry`
//! for relay bindings, running state, feature flags and assignments.

mod memory;

pub use memory::{Inventory, MemoryRegistry};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::device::DeviceAssignment;

/// Kind of domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainKind {
    /// Administrative domain, owner of the physical microphone
    Admin,
    /// Any other VM
    Guest,
}

/// Everything known about one domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: DomainKind,
    #[serde(default)]
    pub running: bool,
    /// Audio relay this domain's sound goes through
    #[serde(default)]
    pub audiovm: Option<String>,
    /// Network provider, consulted for inherited features
    #[serde(default)]
    pub netvm: Option<String>,
    #[serde(default)]
    pub features: BTreeMap<String, String>,
    #[serde(default)]
    pub assignments: Vec<DeviceAssignment>,
}

fn default_kind() -> DomainKind {
    DomainKind::Guest
}

impl DomainRecord {
    pub fn guest(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DomainKind::Guest,
            running: false,
            audiovm: None,
            netvm: None,
            features: BTreeMap::new(),
            assignments: Vec::new(),
        }
    }

    pub fn admin(name: impl Into<String>) -> Self {
        Self {
            kind: DomainKind::Admin,
            running: true,
            ..Self::guest(name)
        }
    }
}

/// Relay lookup and domain state queries
pub trait DomainRegistry: Send + Sync {
    fn kind(&self, name: &str) -> Option<DomainKind>;

    fn is_running(&self, name: &str) -> bool;

    /// Relay currently bound to `guest`
    fn audiovm(&self, guest: &str) -> Option<String>;

    /// Look up `feature` on `name`, then along its netvm chain
    fn check_with_netvm(&self, name: &str, feature: &str, default: bool) -> bool;

    /// Guests whose relay is `relay`
    fn guests_of(&self, relay: &str) -> Vec<String>;

    /// Assignments of `guest` for the given device class
    fn assignments(&self, guest: &str, devclass: &str) -> Vec<DeviceAssignment>;
}

/// Interpret a feature value as a flag: any non-empty value is set
pub fn feature_enabled(value: &str) -> bool {
    !value.is_empty()
}
