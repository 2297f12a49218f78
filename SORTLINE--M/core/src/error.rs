use thiserror::Error;

use crate::types::Category;

/// I/O failure reported by an actuator or relay driver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HardwareError {
    /// Writing to the output channel failed.
    #[error("i/o failure on channel {channel}: {reason}")]
    Io {
        /// Pin or PWM channel.
        channel: u8,
        /// Driver-provided description.
        reason: String,
    },
    /// The device did not answer in time.
    #[error("device on channel {0} did not respond")]
    Unresponsive(u8),
    /// The driver was used before initialization.
    #[error("device on channel {0} is not initialized")]
    NotInitialized(u8),
}

/// Configuration validation failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// A field holds a value outside its accepted range.
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        /// Dotted field path.
        field: &'static str,
        /// Why the value was refused.
        reason: String,
    },
    /// Two diverters claim the same category.
    #[error("category {0} has more than one diverter")]
    DuplicateDiverter(Category),
    /// Two outputs share a channel.
    #[error("channel {0} is assigned more than once")]
    DuplicateChannel(u8),
    /// A label is not in the category lookup table.
    #[error("unknown category label `{0}`")]
    UnknownCategory(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
