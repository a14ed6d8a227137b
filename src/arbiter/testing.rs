//! Shared fixture for arbiter tests
//!
//! Domains:
//! - `dom0`: admin, owns the microphone
//! - `sys-net`: running, netvm of `sys-audio`
//! - `sys-audio`: running relay
//! - `sys-audio-2`: relay that is not running
//! - `work`: running guest on `sys-audio`
//! - `personal`: running guest on `sys-audio`
//! - `norelay`: running guest without a relay
//! - `stopped-relay`: running guest on `sys-audio-2`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{ArbiterSettings, Collaborators, MicArbiter};
use crate::confirm::Confirmer;
use crate::device::MicDevice;
use crate::domain::{DomainRecord, MemoryRegistry};
use crate::permission;
use crate::qdb::MemoryQubesDb;
use crate::rpc::MockRemoteInvoker;

/// Confirmer answering with a fixed guest name
#[derive(Default)]
pub struct ScriptedConfirmer {
    pub answer: Mutex<Option<String>>,
    pub asked: AtomicUsize,
}

impl ScriptedConfirmer {
    pub fn answer(&self, guest: Option<&str>) {
        *self.answer.lock().unwrap() = guest.map(str::to_string);
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Confirmer for ScriptedConfirmer {
    async fn confirm(&self, _guest: &str, _device: &MicDevice) -> Option<String> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answer.lock().unwrap().clone()
    }
}

pub struct Fixture {
    pub registry: Arc<MemoryRegistry>,
    pub qdb: Arc<MemoryQubesDb>,
    pub confirmer: Arc<ScriptedConfirmer>,
    pub arbiter: MicArbiter,
}

impl Fixture {
    pub fn new(invoker: MockRemoteInvoker) -> Self {
        let registry = Arc::new(MemoryRegistry::new());
        registry.insert(DomainRecord::admin("dom0"));

        let mut net = DomainRecord::guest("sys-net");
        net.running = true;
        registry.insert(net);

        let mut audio = DomainRecord::guest("sys-audio");
        audio.running = true;
        audio.netvm = Some("sys-net".into());
        registry.insert(audio);

        registry.insert(DomainRecord::guest("sys-audio-2"));

        for (name, relay) in [
            ("work", Some("sys-audio")),
            ("personal", Some("sys-audio")),
            ("norelay", None),
            ("stopped-relay", Some("sys-audio-2")),
        ] {
            let mut guest = DomainRecord::guest(name);
            guest.running = true;
            guest.audiovm = relay.map(str::to_string);
            registry.insert(guest);
        }

        let qdb = Arc::new(MemoryQubesDb::new());
        let confirmer = Arc::new(ScriptedConfirmer::default());
        let (event_tx, _) = broadcast::channel(64);
        let arbiter = MicArbiter::new(
            Collaborators {
                registry: registry.clone(),
                qdb: qdb.clone(),
                invoker: Arc::new(invoker),
                confirmer: confirmer.clone(),
            },
            ArbiterSettings {
                admin_domain: "dom0".into(),
                rpc_namespace: "qubes".into(),
            },
            event_tx,
        );

        Self {
            registry,
            qdb,
            confirmer,
            arbiter,
        }
    }

    pub fn mic(&self) -> MicDevice {
        MicDevice::new("dom0")
    }

    /// Permission record for `guest` on `relay`
    pub fn record(&self, relay: &str, guest: &str) -> Option<Vec<u8>> {
        self.qdb.get(relay, &permission::config_path(guest))
    }

    /// Advertise `qubes.<method>` on `vm`
    pub fn enable_rpc(&self, vm: &str, method: &str) {
        self.registry
            .set_feature(vm, &format!("supported-rpc.qubes.{method}"), "1");
    }
}
