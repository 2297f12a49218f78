#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Shared building blocks of the sorting line: the domain model flowing from
//! detections to actuator commands, the line clock, bounded retry policy,
//! configuration loading and the telemetry handle used by every control domain.

/// Line clock abstraction (real and virtual).
pub mod clock;
/// TOML configuration document.
pub mod config;
/// Error taxonomy shared across crates.
pub mod error;
/// Bounded retry with exponential pause.
pub mod retry;
/// Structured log + event bus handle.
pub mod telemetry;
/// Detections, decisions, actuation events and belt state.
pub mod types;

pub use clock::{Clock, ManualClock, Timestamp, TokioClock};
pub use config::{
    ActuationConfig, BeltConfig, ConsensusConfig, DiverterConfig, LineConfig, MarkerConfig,
    ServoGeometry,
};
pub use error::{ConfigError, HardwareError};
pub use retry::{RetryOutcome, RetryPolicy};
pub use telemetry::{LineTelemetry, LineTelemetryBuilder};
pub use types::{
    ActuationEvent, ActuationKind, ActuatorId, ActuatorState, BeltDirection, BeltKinematics,
    BeltState, BoundingBox, Category, ClassificationDecision, DecisionOutcome, Detection,
    Direction, QualityGrade, RawDetection, RelayCommand, TrackId,
};
