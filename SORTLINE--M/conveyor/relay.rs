use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sortline_core::{BeltConfig, Clock, HardwareError, RelayCommand, Timestamp};

/// Digital outputs wired to the belt relays.
#[async_trait]
pub trait RelayDriver: Send + Sync + fmt::Debug {
    /// Drives `channel` to the raw pin `level`.
    async fn write(&self, channel: u8, level: bool) -> Result<(), HardwareError>;
}

/// The forward/backward relay pair and its polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPair {
    /// Forward relay pin.
    pub forward_channel: u8,
    /// Backward relay pin.
    pub backward_channel: u8,
    /// The board asserts a relay on a low level.
    pub active_low: bool,
}

impl RelayPair {
    /// Pair described by the belt section.
    #[must_use]
    pub const fn from_config(config: &BeltConfig) -> Self {
        Self {
            forward_channel: config.forward_channel,
            backward_channel: config.backward_channel,
            active_low: config.active_low,
        }
    }

    /// Pin level that puts a relay in the `asserted` logical state.
    #[must_use]
    pub const fn pin_level(&self, asserted: bool) -> bool {
        asserted != self.active_low
    }

    /// Writes `command` to the pair, deasserting before asserting.
    pub async fn apply(
        &self,
        driver: &dyn RelayDriver,
        command: RelayCommand,
    ) -> Result<(), HardwareError> {
        let (forward, backward) = command.levels();
        let writes = if forward {
            [(self.backward_channel, false), (self.forward_channel, true)]
        } else {
            [(self.forward_channel, false), (self.backward_channel, backward)]
        };
        for (channel, asserted) in writes {
            driver.write(channel, self.pin_level(asserted)).await?;
        }
        Ok(())
    }
}

/// One write recorded by [`SimulatedRelayDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelayWrite {
    /// Pin written.
    pub channel: u8,
    /// Logical state after the write.
    pub asserted: bool,
    /// Line time of the write.
    pub at: Timestamp,
}

#[derive(Debug, Default)]
struct SimRelays {
    writes: Vec<RelayWrite>,
    asserted: HashMap<u8, bool>,
    failures: u32,
    peak_asserted: usize,
}

/// Relay board simulation that timestamps every write and tracks how many
/// relays were ever asserted at once.
#[derive(Debug)]
pub struct SimulatedRelayDriver {
    clock: Arc<dyn Clock>,
    active_low: bool,
    state: Mutex<SimRelays>,
}

impl SimulatedRelayDriver {
    /// Board with the given polarity, timestamped on `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, active_low: bool) -> Self {
        Self {
            clock,
            active_low,
            state: Mutex::new(SimRelays::default()),
        }
    }

    /// Makes the next `count` writes fail.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures = count;
    }

    /// Every successful write, oldest first.
    #[must_use]
    pub fn writes(&self) -> Vec<RelayWrite> {
        self.state.lock().writes.clone()
    }

    /// Logical state of `channel`.
    #[must_use]
    pub fn is_asserted(&self, channel: u8) -> bool {
        self.state
            .lock()
            .asserted
            .get(&channel)
            .copied()
            .unwrap_or(false)
    }

    /// Largest number of relays asserted at the same time.
    #[must_use]
    pub fn peak_asserted(&self) -> usize {
        self.state.lock().peak_asserted
    }

    /// Times `channel` went from released to asserted.
    #[must_use]
    pub fn assertions(&self, channel: u8) -> Vec<Timestamp> {
        self.edges(channel, true)
    }

    /// Times `channel` went from asserted to released.
    #[must_use]
    pub fn releases(&self, channel: u8) -> Vec<Timestamp> {
        self.edges(channel, false)
    }

    fn edges(&self, channel: u8, rising: bool) -> Vec<Timestamp> {
        let state = self.state.lock();
        let mut previous = false;
        let mut edges = Vec::new();
        for write in state.writes.iter().filter(|w| w.channel == channel) {
            if write.asserted != previous && write.asserted == rising {
                edges.push(write.at);
            }
            previous = write.asserted;
        }
        edges
    }
}

#[async_trait]
impl RelayDriver for SimulatedRelayDriver {
    async fn write(&self, channel: u8, level: bool) -> Result<(), HardwareError> {
        let at = self.clock.now();
        let mut state = self.state.lock();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(HardwareError::Io {
                channel,
                reason: "injected relay failure".into(),
            });
        }
        let asserted = level != self.active_low;
        state.asserted.insert(channel, asserted);
        state.writes.push(RelayWrite {
            channel,
            asserted,
            at,
        });
        let live = state.asserted.values().filter(|on| **on).count();
        state.peak_asserted = state.peak_asserted.max(live);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortline_core::ManualClock;

    #[tokio::test]
    async fn pair_never_overlaps_and_honours_polarity() {
        let clock = Arc::new(ManualClock::new());
        let driver = SimulatedRelayDriver::new(clock, true);
        let pair = RelayPair::from_config(&BeltConfig::default());
        assert!(!pair.pin_level(true));

        pair.apply(&driver, RelayCommand::Forward).await.unwrap();
        assert!(driver.is_asserted(22));
        pair.apply(&driver, RelayCommand::Backward).await.unwrap();
        assert!(!driver.is_asserted(22));
        assert!(driver.is_asserted(23));
        pair.apply(&driver, RelayCommand::Released).await.unwrap();

        assert_eq!(driver.peak_asserted(), 1);
        assert_eq!(driver.assertions(22).len(), 1);
        assert_eq!(driver.releases(23).len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let clock = Arc::new(ManualClock::new());
        let driver = SimulatedRelayDriver::new(clock, false);
        driver.fail_next(1);
        assert!(driver.write(22, true).await.is_err());
        driver.write(22, true).await.unwrap();
        assert!(driver.is_asserted(22));
        assert_eq!(driver.writes().len(), 1);
    }
}
