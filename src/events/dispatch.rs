//! Typed lifecycle and device events and their dispatcher
//!
//! Handlers are registered per `EventKind` and run one after another in
//! registration order. The first error stops dispatch and is returned to the
//! caller, which treats it as a veto.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::device::{DeviceAssignment, DeviceOptions, MicDevice};
use crate::error::ArbiterError;

/// Event with its payload
#[derive(Debug, Clone)]
pub enum Event {
    /// Devices of `devclass` exposed by `vm`
    DeviceList { vm: String, devclass: String },

    /// Single device of `devclass` exposed by `vm`
    DeviceGet {
        vm: String,
        devclass: String,
        ident: String,
    },

    /// Devices of `devclass` attached to `vm`
    DeviceListAttached {
        vm: String,
        devclass: String,
        persistent: Option<bool>,
    },

    DevicePreAttach {
        vm: String,
        devclass: String,
        device: MicDevice,
        options: DeviceOptions,
    },

    DevicePreDetach {
        vm: String,
        devclass: String,
        port: String,
    },

    DevicePreAssign {
        vm: String,
        devclass: String,
        assignment: DeviceAssignment,
    },

    /// Property `name` of `vm` changed from `old` to `new`
    PropertySet {
        vm: String,
        name: String,
        new: Option<String>,
        old: Option<String>,
    },

    /// QubesDB of `vm` was (re)created
    DomainQdbCreate { vm: String },

    DomainStart { vm: String },

    DomainShutdown { vm: String },
}

/// Registration key for handlers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    DeviceList(String),
    DeviceGet(String),
    DeviceListAttached(String),
    DevicePreAttach(String),
    DevicePreDetach(String),
    DevicePreAssign(String),
    /// Keyed by property name
    PropertySet(String),
    DomainQdbCreate,
    DomainStart,
    DomainShutdown,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::DeviceList { devclass, .. } => EventKind::DeviceList(devclass.clone()),
            Event::DeviceGet { devclass, .. } => EventKind::DeviceGet(devclass.clone()),
            Event::DeviceListAttached { devclass, .. } => {
                EventKind::DeviceListAttached(devclass.clone())
            }
            Event::DevicePreAttach { devclass, .. } => EventKind::DevicePreAttach(devclass.clone()),
            Event::DevicePreDetach { devclass, .. } => EventKind::DevicePreDetach(devclass.clone()),
            Event::DevicePreAssign { devclass, .. } => EventKind::DevicePreAssign(devclass.clone()),
            Event::PropertySet { name, .. } => EventKind::PropertySet(name.clone()),
            Event::DomainQdbCreate { .. } => EventKind::DomainQdbCreate,
            Event::DomainStart { .. } => EventKind::DomainStart,
            Event::DomainShutdown { .. } => EventKind::DomainShutdown,
        }
    }

    /// Domain the event fired on
    pub fn vm(&self) -> &str {
        match self {
            Event::DeviceList { vm, .. }
            | Event::DeviceGet { vm, .. }
            | Event::DeviceListAttached { vm, .. }
            | Event::DevicePreAttach { vm, .. }
            | Event::DevicePreDetach { vm, .. }
            | Event::DevicePreAssign { vm, .. }
            | Event::PropertySet { vm, .. }
            | Event::DomainQdbCreate { vm }
            | Event::DomainStart { vm }
            | Event::DomainShutdown { vm } => vm,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::DeviceList(class) => write!(f, "device-list:{class}"),
            EventKind::DeviceGet(class) => write!(f, "device-get:{class}"),
            EventKind::DeviceListAttached(class) => write!(f, "device-list-attached:{class}"),
            EventKind::DevicePreAttach(class) => write!(f, "device-pre-attach:{class}"),
            EventKind::DevicePreDetach(class) => write!(f, "device-pre-detach:{class}"),
            EventKind::DevicePreAssign(class) => write!(f, "device-pre-assign:{class}"),
            EventKind::PropertySet(name) => write!(f, "property-set:{name}"),
            EventKind::DomainQdbCreate => write!(f, "domain-qdb-create"),
            EventKind::DomainStart => write!(f, "domain-start"),
            EventKind::DomainShutdown => write!(f, "domain-shutdown"),
        }
    }
}

/// What a handler produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Nothing,
    Devices(Vec<MicDevice>),
    Attached(Vec<(MicDevice, DeviceOptions)>),
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<Outcome, ArbiterError>;
}

/// Ordered handler registry
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<EventKind, Vec<Arc<dyn Handler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn Handler>) {
        debug!(%kind, "registering handler");
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub fn handler_count(&self, kind: &EventKind) -> usize {
        self.handlers.get(kind).map_or(0, Vec::len)
    }

    /// Run every handler for the event's kind, in order
    pub async fn fire(&self, event: &Event) -> Result<Vec<Outcome>, ArbiterError> {
        let kind = event.kind();
        let Some(handlers) = self.handlers.get(&kind) else {
            debug!(%kind, vm = event.vm(), "no handlers for event");
            return Ok(Vec::new());
        };

        let mut outcomes = Vec::with_capacity(handlers.len());
        for handler in handlers {
            match handler.handle(event).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(%kind, vm = event.vm(), error = %e, "handler vetoed event");
                    return Err(e);
                }
            }
        }
        Ok(outcomes)
    }
}

/// Flatten device outcomes, dropping everything else
pub fn collect_devices(outcomes: Vec<Outcome>) -> Vec<MicDevice> {
    outcomes
        .into_iter()
        .flat_map(|o| match o {
            Outcome::Devices(devices) => devices,
            _ => Vec::new(),
        })
        .collect()
}

/// Flatten attached-device outcomes, dropping everything else
pub fn collect_attached(outcomes: Vec<Outcome>) -> Vec<(MicDevice, DeviceOptions)> {
    outcomes
        .into_iter()
        .flat_map(|o| match o {
            Outcome::Attached(pairs) => pairs,
            _ => Vec::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle(&self, _event: &Event) -> Result<Outcome, ArbiterError> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                Err(ArbiterError::Usage(format!("{} says no", self.name)))
            } else {
                Ok(Outcome::Devices(vec![MicDevice::new(self.name)]))
            }
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Arc<dyn Handler> {
        Arc::new(Recorder {
            name,
            log: Arc::clone(log),
            fail,
        })
    }

    fn start(vm: &str) -> Event {
        Event::DomainStart { vm: vm.into() }
    }

    #[tokio::test]
    async fn test_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(EventKind::DomainStart, recorder("first", &log, false));
        dispatcher.register(EventKind::DomainStart, recorder("second", &log, false));
        dispatcher.register(EventKind::DomainShutdown, recorder("other", &log, false));

        let outcomes = dispatcher.fire(&start("work")).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        let devices = collect_devices(outcomes);
        assert_eq!(devices, vec![MicDevice::new("first"), MicDevice::new("second")]);
    }

    #[tokio::test]
    async fn test_error_stops_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(EventKind::DomainStart, recorder("veto", &log, true));
        dispatcher.register(EventKind::DomainStart, recorder("never", &log, false));

        let err = dispatcher.fire(&start("work")).await.unwrap_err();
        assert_eq!(err.code(), "usage");
        assert_eq!(*log.lock().unwrap(), vec!["veto"]);
    }

    #[tokio::test]
    async fn test_unhandled_event() {
        let dispatcher = Dispatcher::new();
        assert!(dispatcher.fire(&start("work")).await.unwrap().is_empty());
    }

    #[test]
    fn test_kind_keys_include_class() {
        let event = Event::DeviceList {
            vm: "dom0".into(),
            devclass: "mic".into(),
        };
        assert_eq!(event.kind(), EventKind::DeviceList("mic".into()));
        assert_ne!(event.kind(), EventKind::DeviceList("usb".into()));
        assert_eq!(event.kind().to_string(), "device-list:mic");
        assert_eq!(
            EventKind::PropertySet("audiovm".into()).to_string(),
            "property-set:audiovm"
        );
    }
}
