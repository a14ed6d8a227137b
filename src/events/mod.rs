//! Events module
//!
//! Inbound lifecycle/device events with their dispatcher, and the outbound
//! transition notifications the arbiter broadcasts.

mod dispatch;
mod notify;

pub use dispatch::{collect_attached, collect_devices, Dispatcher, Event, EventKind, Handler, Outcome};
pub use notify::{MicEvent, TransitionPath};
