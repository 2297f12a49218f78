#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Temporal consensus classification: turns noisy per-frame detections into
//! one trustworthy category and quality decision per tracked item.

/// The classifier owned by the classification task.
#[path = "../classifier.rs"]
pub mod classifier;

/// Quality blend and grading.
#[path = "../quality.rs"]
pub mod quality;

/// Per-category adaptive acceptance thresholds.
#[path = "../threshold.rs"]
pub mod threshold;

/// Evidence buffers and weighted voting.
#[path = "../tracks/main.rs"]
pub mod tracks;

pub use classifier::{ClassifierStats, TemporalConsensusClassifier};
pub use quality::{blend_score, QualityWeights};
pub use threshold::{AdaptiveThreshold, DriftTransition, ThresholdSnapshot};
pub use tracks::{vote::VoteSummary, Track, TrackBook};
