use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use sortline_core::{ActuatorId, Timestamp};

/// Staggers activation starts across different actuators so their inrush
/// currents never coincide.
#[derive(Debug, Clone, Default)]
pub struct IntervalGuard {
    margin: Duration,
    last: Arc<Mutex<Option<(ActuatorId, Timestamp)>>>,
}

impl IntervalGuard {
    /// Guard enforcing `margin` between starts of different actuators.
    #[must_use]
    pub fn new(margin: Duration) -> Self {
        Self {
            margin,
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Reserves the earliest start at or after `earliest` for `actuator`.
    pub fn reserve(&self, actuator: ActuatorId, earliest: Timestamp) -> Timestamp {
        let mut last = self.last.lock();
        let start = match *last {
            Some((other, at)) if other != actuator => earliest.latest(at + self.margin),
            _ => earliest,
        };
        *last = Some((actuator, start));
        start
    }

    /// Configured margin.
    #[must_use]
    pub const fn margin(&self) -> Duration {
        self.margin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortline_core::Category;

    #[test]
    fn different_actuators_are_staggered() {
        let guard = IntervalGuard::new(Duration::from_millis(50));
        let t = Timestamp::from_secs(1.0);
        assert_eq!(guard.reserve(ActuatorId::Marker, t), t);
        let second = guard.reserve(ActuatorId::Diverter(Category::Apple), t);
        assert!((second.as_secs() - 1.05).abs() < 1e-9);
        let third = guard.reserve(ActuatorId::Diverter(Category::Apple), second);
        assert_eq!(third, second);
        let late = guard.reserve(ActuatorId::Marker, Timestamp::from_secs(3.0));
        assert!((late.as_secs() - 3.0).abs() < 1e-9);
    }
}
