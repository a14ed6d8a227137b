//! Per-guest microphone transition tracking
//!
//! Authoritative attachment state lives in the relay's QubesDB. This tracker
//! only records what the arbiter is doing right now and what it last
//! completed, and emits a `MicEvent` for every step.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::{MicEvent, TransitionPath};

/// Observed state of one guest's microphone access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicState {
    #[default]
    Detached,
    Attaching,
    Attached,
    Detaching,
}

impl MicState {
    pub fn is_transient(self) -> bool {
        matches!(self, MicState::Attaching | MicState::Detaching)
    }
}

impl std::fmt::Display for MicState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MicState::Detached => write!(f, "Detached"),
            MicState::Attaching => write!(f, "Attaching"),
            MicState::Attached => write!(f, "Attached"),
            MicState::Detaching => write!(f, "Detaching"),
        }
    }
}

/// Direction of a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Attach,
    Detach,
}

impl Direction {
    fn pending(self) -> MicState {
        match self {
            Direction::Attach => MicState::Attaching,
            Direction::Detach => MicState::Detaching,
        }
    }

    fn settled(self) -> MicState {
        match self {
            Direction::Attach => MicState::Attached,
            Direction::Detach => MicState::Detached,
        }
    }
}

/// Token for a started transition, handed back on completion
#[derive(Debug)]
pub struct Pending {
    guest: String,
    relay: String,
    direction: Direction,
    prior: MicState,
    started_at: Instant,
}

/// Tracks transitions for all guests
pub struct Transitions {
    states: Mutex<BTreeMap<String, MicState>>,
    event_tx: broadcast::Sender<MicEvent>,
}

impl Transitions {
    pub fn new(event_tx: broadcast::Sender<MicEvent>) -> Self {
        Self {
            states: Mutex::new(BTreeMap::new()),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MicEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self, guest: &str) -> MicState {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(guest).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, MicState> {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Enter Attaching/Detaching
    pub fn begin(&self, guest: &str, relay: &str, direction: Direction, path: TransitionPath) -> Pending {
        let prior = self.set(guest, direction.pending());
        if prior.is_transient() {
            warn!(guest, state = %prior, "transition started while another was pending");
        }

        let event = match direction {
            Direction::Attach => MicEvent::AttachRequested {
                guest: guest.to_string(),
                relay: relay.to_string(),
                path,
            },
            Direction::Detach => MicEvent::DetachRequested {
                guest: guest.to_string(),
                relay: relay.to_string(),
                path,
            },
        };
        self.emit(event);

        Pending {
            guest: guest.to_string(),
            relay: relay.to_string(),
            direction,
            prior,
            started_at: Instant::now(),
        }
    }

    /// Enter Attached/Detached
    pub fn finish(&self, pending: Pending) {
        let to = pending.direction.settled();
        self.set(&pending.guest, to);
        info!(
            guest = %pending.guest,
            relay = %pending.relay,
            from = %pending.prior,
            to = %to,
            duration_ms = pending.started_at.elapsed().as_millis() as u64,
            "mic transition"
        );

        let event = match pending.direction {
            Direction::Attach => MicEvent::Attached {
                guest: pending.guest,
                relay: pending.relay,
            },
            Direction::Detach => MicEvent::Detached {
                guest: pending.guest,
                relay: pending.relay,
            },
        };
        self.emit(event);
    }

    /// Nothing was applied: go back to where we were
    pub fn fail(&self, pending: Pending, reason: &str) {
        self.set(&pending.guest, pending.prior);
        let event = match pending.direction {
            Direction::Attach => MicEvent::AttachFailed {
                guest: pending.guest,
                reason: reason.to_string(),
            },
            Direction::Detach => MicEvent::DetachFailed {
                guest: pending.guest,
                reason: reason.to_string(),
            },
        };
        self.emit(event);
    }

    /// Record a state learned outside a transition (probe, cleanup)
    pub fn observe(&self, guest: &str, state: MicState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        match states.get(guest) {
            Some(current) if current.is_transient() => {}
            _ => {
                states.insert(guest.to_string(), state);
            }
        }
    }

    pub fn emit(&self, event: MicEvent) {
        debug!(%event, "emitting mic event");
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn set(&self, guest: &str, state: MicState) -> MicState {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .insert(guest.to_string(), state)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_transitions() -> (Transitions, broadcast::Receiver<MicEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (Transitions::new(tx), rx)
    }

    #[test]
    fn test_initial_state() {
        let (t, _) = create_transitions();
        assert_eq!(t.state("work"), MicState::Detached);
    }

    #[test]
    fn test_attach_cycle() {
        let (t, mut rx) = create_transitions();

        let pending = t.begin("work", "sys-audio", Direction::Attach, TransitionPath::Qubesdb);
        assert_eq!(t.state("work"), MicState::Attaching);
        t.finish(pending);
        assert_eq!(t.state("work"), MicState::Attached);

        assert!(matches!(rx.try_recv().unwrap(), MicEvent::AttachRequested { .. }));
        assert!(matches!(rx.try_recv().unwrap(), MicEvent::Attached { .. }));
    }

    #[test]
    fn test_failed_detach_restores_prior() {
        let (t, mut rx) = create_transitions();
        t.observe("work", MicState::Attached);

        let pending = t.begin("work", "sys-audio", Direction::Detach, TransitionPath::Rpc);
        assert_eq!(t.state("work"), MicState::Detaching);
        t.fail(pending, "agent gone");
        assert_eq!(t.state("work"), MicState::Attached);

        let _ = rx.try_recv().unwrap();
        match rx.try_recv().unwrap() {
            MicEvent::DetachFailed { guest, reason } => {
                assert_eq!(guest, "work");
                assert_eq!(reason, "agent gone");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_observe_does_not_clobber_pending() {
        let (t, _) = create_transitions();
        let _pending = t.begin("work", "sys-audio", Direction::Attach, TransitionPath::Rpc);
        t.observe("work", MicState::Detached);
        assert_eq!(t.state("work"), MicState::Attaching);
    }

    #[test]
    fn test_guests_are_independent() {
        let (t, _) = create_transitions();
        let pending = t.begin("work", "sys-audio", Direction::Attach, TransitionPath::Rpc);
        t.finish(pending);
        assert_eq!(t.state("personal"), MicState::Detached);
        assert_eq!(t.snapshot().len(), 1);
    }
}
