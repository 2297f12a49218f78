#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Owns the belt drive: mutually exclusive direction relays, a command-silence
//! safety timer, reversal pauses and bounded recovery from relay faults.

/// Belt owner task, safety watchdog and command handle.
#[path = "../controller/main.rs"]
pub mod controller;

/// Relay outputs.
#[path = "../relay.rs"]
pub mod relay;

pub use controller::{BeltError, BeltPhase, BeltSnapshot, ConveyorSafetyController, SafetyTrip};
pub use relay::{RelayDriver, RelayPair, RelayWrite, SimulatedRelayDriver};
