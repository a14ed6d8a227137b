//! Microphone arbitration
//!
//! Decides which guest may read the shared microphone and carries every
//! decision to the guest's audio relay, either through the relay's audio
//! agent service or by writing the permission record into its QubesDB.
//!
//! The arbiter keeps no persistent state of its own. Anything that must
//! survive a restart lives in the relay's QubesDB.
//!
//! Writes to a guest's permission record are serialised per guest: attach,
//! detach and relay rebinding all hold that guest's lock across their
//! read-validate-write (or single write).

mod lifecycle;
mod relay;
mod transition;

#[cfg(test)]
mod testing;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::debug;

use crate::confirm::Confirmer;
use crate::device::{DeviceOptions, MicDevice, MIC_CLASS, MIC_IDENT};
use crate::domain::{DomainKind, DomainRegistry};
use crate::error::ArbiterError;
use crate::events::{Dispatcher, Event, EventKind, Handler, MicEvent, Outcome};
use crate::permission;
use crate::qdb::KvChannel;
use crate::rpc::RemoteInvoker;
use crate::state::{MicState, Transitions};

/// Property holding a guest's relay
pub const AUDIOVM_PROPERTY: &str = "audiovm";

/// Systems the arbiter talks to
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn DomainRegistry>,
    pub qdb: Arc<dyn KvChannel>,
    pub invoker: Arc<dyn RemoteInvoker>,
    pub confirmer: Arc<dyn Confirmer>,
}

/// Names the arbiter needs to address things
#[derive(Debug, Clone)]
pub struct ArbiterSettings {
    /// Domain the microphone is attached to
    pub admin_domain: String,
    /// Namespace of the audio agent services (`qubes`)
    pub rpc_namespace: String,
}

/// Cheap to clone; clones share state
#[derive(Clone)]
pub struct MicArbiter {
    inner: Arc<Inner>,
}

struct Inner {
    deps: Collaborators,
    settings: ArbiterSettings,
    transitions: Transitions,
    locks: GuestLocks,
}

impl MicArbiter {
    pub fn new(
        deps: Collaborators,
        settings: ArbiterSettings,
        event_tx: broadcast::Sender<MicEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                settings,
                transitions: Transitions::new(event_tx),
                locks: GuestLocks::default(),
            }),
        }
    }

    /// Hook this arbiter into every mic-related event
    pub fn register(&self, dispatcher: &mut Dispatcher) {
        let handler: Arc<dyn Handler> = Arc::new(self.clone());
        let class = MIC_CLASS.to_string();
        for kind in [
            EventKind::DeviceList(class.clone()),
            EventKind::DeviceGet(class.clone()),
            EventKind::DeviceListAttached(class.clone()),
            EventKind::DevicePreAttach(class.clone()),
            EventKind::DevicePreDetach(class.clone()),
            EventKind::DevicePreAssign(class),
            EventKind::PropertySet(AUDIOVM_PROPERTY.to_string()),
            EventKind::DomainQdbCreate,
            EventKind::DomainStart,
            EventKind::DomainShutdown,
        ] {
            dispatcher.register(kind, Arc::clone(&handler));
        }
    }

    /// The one microphone in the system
    pub fn device(&self) -> MicDevice {
        MicDevice::new(self.inner.settings.admin_domain.clone())
    }

    pub fn transitions(&self) -> &Transitions {
        &self.inner.transitions
    }

    pub fn state(&self, guest: &str) -> MicState {
        self.inner.transitions.state(guest)
    }

    /// Microphone exposed by `vm`: only the admin domain has one
    pub fn list_available(&self, vm: &str) -> Vec<MicDevice> {
        self.get_device(vm, MIC_IDENT).into_iter().collect()
    }

    /// Microphone exposed by `vm` under `ident`
    pub fn get_device(&self, vm: &str, ident: &str) -> Option<MicDevice> {
        if self.registry().kind(vm) != Some(DomainKind::Admin) {
            return None;
        }
        if ident != MIC_IDENT {
            return None;
        }
        Some(MicDevice::new(vm))
    }

    /// Microphone attached to `vm`, if any.
    ///
    /// Never fails: a missing or stopped relay, an unreachable QubesDB, or any
    /// record other than exactly `1` all mean "not attached".
    pub async fn list_attached(
        &self,
        vm: &str,
        persistent: Option<bool>,
    ) -> Vec<(MicDevice, DeviceOptions)> {
        // never a persistent device
        if persistent == Some(true) {
            return Vec::new();
        }

        let Some(relay) = self.registry().audiovm(vm) else {
            return Vec::new();
        };
        if !self.registry().is_running(&relay) {
            return Vec::new();
        }

        let untrusted = match self.qdb().read(&relay, &permission::config_path(vm)).await {
            Ok(value) => value,
            Err(e) => {
                debug!(guest = vm, relay = %relay, error = %e, "cannot read mic permission");
                return Vec::new();
            }
        };

        let enabled = permission::is_enabled(untrusted.as_deref());
        self.inner.transitions.observe(
            vm,
            if enabled {
                MicState::Attached
            } else {
                MicState::Detached
            },
        );
        if enabled {
            vec![(self.device(), DeviceOptions::new())]
        } else {
            Vec::new()
        }
    }

    fn registry(&self) -> &dyn DomainRegistry {
        self.inner.deps.registry.as_ref()
    }

    fn qdb(&self) -> &dyn KvChannel {
        self.inner.deps.qdb.as_ref()
    }

    fn invoker(&self) -> &dyn RemoteInvoker {
        self.inner.deps.invoker.as_ref()
    }

    fn confirmer(&self) -> &dyn Confirmer {
        self.inner.deps.confirmer.as_ref()
    }

    fn namespace(&self) -> &str {
        &self.inner.settings.rpc_namespace
    }

    async fn lock_guest(&self, guest: &str) -> OwnedMutexGuard<()> {
        self.inner.locks.lock(guest).await
    }
}

#[async_trait]
impl Handler for MicArbiter {
    async fn handle(&self, event: &Event) -> Result<Outcome, ArbiterError> {
        match event {
            Event::DeviceList { vm, .. } => Ok(Outcome::Devices(self.list_available(vm))),
            Event::DeviceGet { vm, ident, .. } => Ok(Outcome::Devices(
                self.get_device(vm, ident).into_iter().collect(),
            )),
            Event::DeviceListAttached { vm, persistent, .. } => {
                Ok(Outcome::Attached(self.list_attached(vm, *persistent).await))
            }
            Event::DevicePreAttach {
                vm,
                device,
                options,
                ..
            } => {
                self.attach(vm, device, options).await?;
                Ok(Outcome::Nothing)
            }
            Event::DevicePreDetach { vm, port, .. } => {
                self.detach(vm, port).await?;
                Ok(Outcome::Nothing)
            }
            Event::DevicePreAssign { assignment, .. } => {
                self.validate_assignment(assignment)?;
                Ok(Outcome::Nothing)
            }
            Event::PropertySet { vm, new, old, .. } => {
                self.on_relay_changed(vm, new.as_deref(), old.as_deref())
                    .await?;
                Ok(Outcome::Nothing)
            }
            Event::DomainQdbCreate { vm } => {
                self.on_qdb_created(vm).await?;
                Ok(Outcome::Nothing)
            }
            Event::DomainStart { vm } => {
                // fire and forget
                let _ = self.on_domain_start(vm);
                Ok(Outcome::Nothing)
            }
            Event::DomainShutdown { vm } => {
                let _ = self.on_domain_shutdown(vm);
                Ok(Outcome::Nothing)
            }
        }
    }
}

/// One async mutex per guest name
#[derive(Default)]
struct GuestLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GuestLocks {
    async fn lock(&self, guest: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(guest.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Fixture;
    use super::*;
    use crate::events::{collect_attached, collect_devices};
    use crate::rpc::MockRemoteInvoker;

    #[tokio::test]
    async fn test_only_admin_lists_mic() {
        let fx = Fixture::new(MockRemoteInvoker::new());
        assert_eq!(fx.arbiter.list_available("dom0"), vec![MicDevice::new("dom0")]);
        assert!(fx.arbiter.list_available("work").is_empty());
        assert!(fx.arbiter.list_available("sys-audio").is_empty());
        assert!(fx.arbiter.list_available("missing").is_empty());
    }

    #[tokio::test]
    async fn test_get_device_exact_ident() {
        let fx = Fixture::new(MockRemoteInvoker::new());
        assert!(fx.arbiter.get_device("dom0", "mic").is_some());
        assert!(fx.arbiter.get_device("dom0", "mic2").is_none());
        assert!(fx.arbiter.get_device("dom0", "MIC").is_none());
        assert!(fx.arbiter.get_device("work", "mic").is_none());
    }

    #[tokio::test]
    async fn test_list_attached_follows_record() {
        let fx = Fixture::new(MockRemoteInvoker::new());
        assert!(fx.arbiter.list_attached("work", None).await.is_empty());

        fx.qdb.set("sys-audio", "/audio-input-config/work", b"1");
        let attached = fx.arbiter.list_attached("work", None).await;
        assert_eq!(attached, vec![(MicDevice::new("dom0"), DeviceOptions::new())]);
        assert_eq!(fx.arbiter.state("work"), MicState::Attached);

        fx.qdb.set("sys-audio", "/audio-input-config/work", b"0");
        assert!(fx.arbiter.list_attached("work", None).await.is_empty());
        assert_eq!(fx.arbiter.state("work"), MicState::Detached);
    }

    #[tokio::test]
    async fn test_list_attached_persistent_is_empty() {
        let fx = Fixture::new(MockRemoteInvoker::new());
        fx.qdb.set("sys-audio", "/audio-input-config/work", b"1");
        assert!(fx.arbiter.list_attached("work", Some(true)).await.is_empty());
        assert_eq!(fx.arbiter.list_attached("work", Some(false)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_list_attached_never_fails() {
        let fx = Fixture::new(MockRemoteInvoker::new());
        fx.qdb.set("sys-audio", "/audio-input-config/work", b"1");

        fx.qdb.set_unreachable("sys-audio", true);
        assert!(fx.arbiter.list_attached("work", None).await.is_empty());
        fx.qdb.set_unreachable("sys-audio", false);

        fx.registry.set_running("sys-audio", false);
        assert!(fx.arbiter.list_attached("work", None).await.is_empty());
        fx.registry.set_running("sys-audio", true);

        fx.qdb.set("sys-audio", "/audio-input-config/work", &[0xff]);
        assert!(fx.arbiter.list_attached("work", None).await.is_empty());

        assert!(fx.arbiter.list_attached("norelay", None).await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_through_registry() {
        let fx = Fixture::new(MockRemoteInvoker::new());
        let mut dispatcher = Dispatcher::new();
        fx.arbiter.register(&mut dispatcher);
        assert_eq!(dispatcher.handler_count(&EventKind::DomainStart), 1);

        let devices = dispatcher
            .fire(&Event::DeviceList {
                vm: "dom0".into(),
                devclass: "mic".into(),
            })
            .await
            .unwrap();
        assert_eq!(collect_devices(devices).len(), 1);

        // other classes are not ours
        let usb = dispatcher
            .fire(&Event::DeviceList {
                vm: "dom0".into(),
                devclass: "usb".into(),
            })
            .await
            .unwrap();
        assert!(usb.is_empty());

        fx.qdb.set("sys-audio", "/audio-input-config/work", b"1");
        let attached = dispatcher
            .fire(&Event::DeviceListAttached {
                vm: "work".into(),
                devclass: "mic".into(),
                persistent: None,
            })
            .await
            .unwrap();
        assert_eq!(collect_attached(attached).len(), 1);
    }

    #[tokio::test]
    async fn test_guest_lock_is_per_guest() {
        let locks = GuestLocks::default();
        let _work = locks.lock("work").await;
        // a different guest is not blocked
        let _personal = locks.lock("personal").await;
        let again = tokio::time::timeout(std::time::Duration::from_millis(20), locks.lock("work")).await;
        assert!(again.is_err());
    }
}
