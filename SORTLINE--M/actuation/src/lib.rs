#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Turns classification decisions into precisely timed, mutually exclusive
//! actuator commands and executes them on per-actuator owner tasks.

/// Per-actuator owner tasks, watchdogs and the command surface.
#[path = "../coordinator/main.rs"]
pub mod coordinator;

/// Actuator output drivers.
#[path = "../driver.rs"]
pub mod driver;

/// Move → hold → return interpolation state machine.
#[path = "../motion.rs"]
pub mod motion;

/// Decision → timed event planning.
#[path = "../scheduler.rs"]
pub mod scheduler;

pub use coordinator::{
    guard::IntervalGuard, ActuationError, ActuatorCoordinator, ActuatorSnapshot, ActuatorSpec,
};
pub use driver::{ActuatorDriver, PoseCommand, SimulatedActuatorDriver};
pub use motion::{MotionProfile, MotionStep};
pub use scheduler::{travel_delay, ActuationScheduler};
