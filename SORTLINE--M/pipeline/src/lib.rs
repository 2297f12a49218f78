#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Line runtime: detection source → consensus → scheduling → actuators, with
//! the belt controller alongside and one command surface over all of it.

/// Runtime error type.
#[path = "../error.rs"]
pub mod error;

/// Task wiring and the operator command surface.
#[path = "../runtime/main.rs"]
pub mod runtime;

/// Detection sources.
#[path = "../source.rs"]
pub mod source;

pub use error::PipelineError;
pub use runtime::{LineControl, LineDrivers, LineRuntime, LineStatus, SchedulerStatus};
pub use source::{ChannelDetectionSource, DetectionSource, JsonlDetectionSource};
