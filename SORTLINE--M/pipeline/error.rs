use sortline_actuation::ActuationError;
use sortline_conveyor::BeltError;
use sortline_core::ConfigError;
use thiserror::Error;

/// Failures surfaced by the line runtime and its command surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The configuration was refused.
    #[error("invalid line configuration: {0}")]
    Config(#[from] ConfigError),
    /// Reading the detection source failed.
    #[error("detection source i/o: {0}")]
    Io(#[from] std::io::Error),
    /// An actuator command failed.
    #[error(transparent)]
    Actuation(#[from] ActuationError),
    /// A belt command failed.
    #[error(transparent)]
    Belt(#[from] BeltError),
    /// A pipeline task ended abnormally.
    #[error("line task `{0}` stopped unexpectedly")]
    TaskFailed(&'static str),
}
