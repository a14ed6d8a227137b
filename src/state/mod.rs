//! State module for microphone transitions
//!
//! Every guest is in one of four states:
//! - Detached: no access to the microphone
//! - Attaching: enable request in flight to the relay
//! - Attached: relay told to forward microphone input
//! - Detaching: disable request in flight to the relay

mod machine;

pub use machine::{Direction, MicState, Transitions};
