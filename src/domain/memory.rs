//! In-process domain registry
//!
//! Loaded from a JSON inventory at startup and kept current by lifecycle
//! requests arriving over IPC.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{feature_enabled, DomainKind, DomainRecord, DomainRegistry};
use crate::device::DeviceAssignment;

/// On-disk inventory format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub domains: Vec<DomainRecord>,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read inventory {}", path.display()))?;
        serde_json::from_slice(&data).context("failed to parse inventory")
    }
}

/// Registry backed by a map guarded by a `RwLock`
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    domains: RwLock<BTreeMap<String, DomainRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an inventory. `admin` is always present, running and of
    /// admin kind, whatever the inventory says about it.
    pub fn from_inventory(inventory: Inventory, admin: &str) -> Self {
        let registry = Self::new();
        for record in inventory.domains {
            registry.insert(record);
        }
        registry.write(|domains| match domains.get_mut(admin) {
            Some(rec) => {
                if rec.kind != DomainKind::Admin {
                    warn!(domain = admin, "inventory lists the admin domain as a guest");
                }
                rec.kind = DomainKind::Admin;
                rec.running = true;
            }
            None => {
                domains.insert(admin.to_string(), DomainRecord::admin(admin));
            }
        });
        registry
    }

    pub fn insert(&self, record: DomainRecord) {
        let mut domains = self.domains.write().unwrap_or_else(|e| e.into_inner());
        domains.insert(record.name.clone(), record);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read(|domains| domains.contains_key(name))
    }

    /// Returns false if the domain is unknown
    pub fn set_running(&self, name: &str, running: bool) -> bool {
        self.write(|domains| match domains.get_mut(name) {
            Some(rec) => {
                rec.running = running;
                true
            }
            None => false,
        })
    }

    /// Rebind `guest` to `audiovm`, returning the previous relay.
    /// `None` if the guest is unknown.
    pub fn set_audiovm(&self, guest: &str, audiovm: Option<String>) -> Option<Option<String>> {
        self.write(|domains| {
            domains
                .get_mut(guest)
                .map(|rec| std::mem::replace(&mut rec.audiovm, audiovm))
        })
    }

    /// Put back `previous` only if `guest` is still bound to `expected`.
    /// Returns whether the binding was restored.
    pub fn restore_audiovm(
        &self,
        guest: &str,
        expected: Option<&str>,
        previous: Option<String>,
    ) -> bool {
        self.write(|domains| match domains.get_mut(guest) {
            Some(rec) if rec.audiovm.as_deref() == expected => {
                rec.audiovm = previous;
                true
            }
            _ => false,
        })
    }

    pub fn set_feature(&self, name: &str, feature: &str, value: &str) -> bool {
        self.write(|domains| match domains.get_mut(name) {
            Some(rec) => {
                rec.features.insert(feature.to_string(), value.to_string());
                true
            }
            None => false,
        })
    }

    pub fn add_assignment(&self, assignment: DeviceAssignment) -> bool {
        self.write(|domains| match domains.get_mut(&assignment.guest) {
            Some(rec) => {
                rec.assignments.push(assignment);
                true
            }
            None => false,
        })
    }

    pub fn snapshot(&self) -> Vec<DomainRecord> {
        self.read(|domains| domains.values().cloned().collect())
    }

    fn read<T>(&self, f: impl FnOnce(&BTreeMap<String, DomainRecord>) -> T) -> T {
        let domains = self.domains.read().unwrap_or_else(|e| e.into_inner());
        f(&domains)
    }

    fn write<T>(&self, f: impl FnOnce(&mut BTreeMap<String, DomainRecord>) -> T) -> T {
        let mut domains = self.domains.write().unwrap_or_else(|e| e.into_inner());
        f(&mut domains)
    }
}

impl DomainRegistry for MemoryRegistry {
    fn kind(&self, name: &str) -> Option<DomainKind> {
        self.read(|domains| domains.get(name).map(|rec| rec.kind))
    }

    fn is_running(&self, name: &str) -> bool {
        self.read(|domains| domains.get(name).is_some_and(|rec| rec.running))
    }

    fn audiovm(&self, guest: &str) -> Option<String> {
        self.read(|domains| domains.get(guest).and_then(|rec| rec.audiovm.clone()))
    }

    fn check_with_netvm(&self, name: &str, feature: &str, default: bool) -> bool {
        self.read(|domains| {
            let mut visited = HashSet::new();
            let mut current = Some(name.to_string());
            while let Some(vm) = current {
                if !visited.insert(vm.clone()) {
                    debug!(vm = %vm, "netvm loop while resolving feature");
                    break;
                }
                let Some(rec) = domains.get(&vm) else { break };
                if let Some(value) = rec.features.get(feature) {
                    return feature_enabled(value);
                }
                current = rec.netvm.clone();
            }
            default
        })
    }

    fn guests_of(&self, relay: &str) -> Vec<String> {
        self.read(|domains| {
            domains
                .values()
                .filter(|rec| rec.audiovm.as_deref() == Some(relay))
                .map(|rec| rec.name.clone())
                .collect()
        })
    }

    fn assignments(&self, guest: &str, devclass: &str) -> Vec<DeviceAssignment> {
        self.read(|domains| {
            domains
                .get(guest)
                .map(|rec| {
                    rec.assignments
                        .iter()
                        .filter(|a| a.devclass == devclass)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MemoryRegistry {
        let registry = MemoryRegistry::new();
        registry.insert(DomainRecord::admin("dom0"));
        let mut net = DomainRecord::guest("sys-net");
        net.features
            .insert("supported-rpc.qubes.AudioInputEnable".into(), "1".into());
        registry.insert(net);
        let mut audio = DomainRecord::guest("sys-audio");
        audio.netvm = Some("sys-net".into());
        registry.insert(audio);
        let mut work = DomainRecord::guest("work");
        work.audiovm = Some("sys-audio".into());
        registry.insert(work);
        registry
    }

    #[test]
    fn test_feature_inherited_from_netvm() {
        let reg = registry();
        assert!(reg.check_with_netvm("sys-audio", "supported-rpc.qubes.AudioInputEnable", false));
        assert!(!reg.check_with_netvm("sys-audio", "supported-rpc.qubes.AudioInputDisable", false));
        assert!(reg.check_with_netvm("unknown", "x", true));
    }

    #[test]
    fn test_own_feature_wins() {
        let reg = registry();
        reg.set_feature("sys-audio", "supported-rpc.qubes.AudioInputEnable", "");
        assert!(!reg.check_with_netvm("sys-audio", "supported-rpc.qubes.AudioInputEnable", true));
    }

    #[test]
    fn test_netvm_loop_falls_back() {
        let reg = MemoryRegistry::new();
        let mut a = DomainRecord::guest("a");
        a.netvm = Some("b".into());
        let mut b = DomainRecord::guest("b");
        b.netvm = Some("a".into());
        reg.insert(a);
        reg.insert(b);
        assert!(!reg.check_with_netvm("a", "f", false));
    }

    #[test]
    fn test_rebind_and_guests_of() {
        let reg = registry();
        assert_eq!(reg.guests_of("sys-audio"), vec!["work".to_string()]);
        let old = reg.set_audiovm("work", Some("dom0".into()));
        assert_eq!(old, Some(Some("sys-audio".into())));
        assert!(reg.guests_of("sys-audio").is_empty());
        assert_eq!(reg.set_audiovm("nope", None), None);
    }

    #[test]
    fn test_restore_only_own_binding() {
        let reg = registry();
        reg.set_audiovm("work", Some("sys-audio-new".into()));
        assert!(reg.restore_audiovm("work", Some("sys-audio-new"), Some("sys-audio".into())));
        assert_eq!(reg.audiovm("work").as_deref(), Some("sys-audio"));

        // someone else rebound it in between
        reg.set_audiovm("work", Some("dom0".into()));
        assert!(!reg.restore_audiovm("work", Some("sys-audio-new"), Some("sys-audio".into())));
        assert_eq!(reg.audiovm("work").as_deref(), Some("dom0"));

        assert!(!reg.restore_audiovm("nope", None, None));
    }

    #[test]
    fn test_from_inventory_forces_admin_kind() {
        let inv: Inventory = serde_json::from_str(
            r#"{"domains":[{"name":"dom0"},{"name":"work","audiovm":"dom0"}]}"#,
        )
        .unwrap();
        let reg = MemoryRegistry::from_inventory(inv, "dom0");
        assert_eq!(reg.kind("dom0"), Some(DomainKind::Admin));
        assert!(reg.is_running("dom0"));
        assert_eq!(reg.kind("work"), Some(DomainKind::Guest));
    }

    #[test]
    fn test_from_inventory_adds_admin() {
        let inv: Inventory =
            serde_json::from_str(r#"{"domains":[{"name":"work","audiovm":"dom0"}]}"#).unwrap();
        let reg = MemoryRegistry::from_inventory(inv, "dom0");
        assert_eq!(reg.kind("dom0"), Some(DomainKind::Admin));
        assert!(reg.is_running("dom0"));
        assert!(!reg.is_running("work"));
    }
}
