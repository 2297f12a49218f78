use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sortline_core::HardwareError;

/// Output stage for servo-driven actuators.
#[async_trait]
pub trait ActuatorDriver: Send + Sync + fmt::Debug {
    /// Commands `channel` to `angle` using a `pulse_us` wide pulse.
    async fn set_pose(&self, channel: u8, angle: f32, pulse_us: u16) -> Result<(), HardwareError>;

    /// Stops driving `channel`.
    async fn release(&self, channel: u8) -> Result<(), HardwareError>;
}

/// One command recorded by [`SimulatedActuatorDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseCommand {
    /// Output channel.
    pub channel: u8,
    /// Commanded angle, degrees; `None` for a release.
    pub angle: Option<f32>,
    /// Pulse width, µs; zero for a release.
    pub pulse_us: u16,
}

#[derive(Debug, Default)]
struct SimState {
    history: Vec<PoseCommand>,
    failures: HashMap<u8, u32>,
    stuck: HashSet<u8>,
}

/// In-memory servo bank recording every command, with fault injection.
#[derive(Debug, Default)]
pub struct SimulatedActuatorDriver {
    state: Mutex<SimState>,
}

impl SimulatedActuatorDriver {
    /// Creates an empty bank.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commands on `channel` fail.
    pub fn fail_next(&self, channel: u8, count: u32) {
        self.state.lock().failures.insert(channel, count);
    }

    /// Makes later commands on `channel` never complete, as an unresponsive
    /// servo would.
    pub fn stick(&self, channel: u8) {
        self.state.lock().stuck.insert(channel);
    }

    /// Lets later commands on `channel` complete again.
    pub fn unstick(&self, channel: u8) {
        self.state.lock().stuck.remove(&channel);
    }

    /// Every command issued, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<PoseCommand> {
        self.state.lock().history.clone()
    }

    /// Commands issued on one channel.
    #[must_use]
    pub fn history_for(&self, channel: u8) -> Vec<PoseCommand> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|command| command.channel == channel)
            .copied()
            .collect()
    }

    /// Last angle commanded on `channel`.
    #[must_use]
    pub fn last_pose(&self, channel: u8) -> Option<f32> {
        self.state
            .lock()
            .history
            .iter()
            .rev()
            .find(|command| command.channel == channel)
            .and_then(|command| command.angle)
    }

    fn apply(&self, command: PoseCommand) -> Result<bool, HardwareError> {
        let mut state = self.state.lock();
        if state.stuck.contains(&command.channel) {
            return Ok(false);
        }
        if let Some(remaining) = state.failures.get_mut(&command.channel) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(HardwareError::Io {
                    channel: command.channel,
                    reason: "injected failure".into(),
                });
            }
        }
        state.history.push(command);
        Ok(true)
    }
}

#[async_trait]
impl ActuatorDriver for SimulatedActuatorDriver {
    async fn set_pose(&self, channel: u8, angle: f32, pulse_us: u16) -> Result<(), HardwareError> {
        let applied = self.apply(PoseCommand {
            channel,
            angle: Some(angle),
            pulse_us,
        })?;
        if !applied {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn release(&self, channel: u8) -> Result<(), HardwareError> {
        let applied = self.apply(PoseCommand {
            channel,
            angle: None,
            pulse_us: 0,
        })?;
        if !applied {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_injects_failures() {
        let driver = SimulatedActuatorDriver::new();
        driver.set_pose(12, 45.0, 1_250).await.unwrap();
        driver.fail_next(12, 1);
        assert!(driver.set_pose(12, 0.0, 1_000).await.is_err());
        driver.set_pose(12, 0.0, 1_000).await.unwrap();
        driver.release(12).await.unwrap();
        assert_eq!(driver.history_for(12).len(), 3);
        assert_eq!(driver.last_pose(12), None);
        assert_eq!(driver.history()[0].pulse_us, 1_250);
    }
}
