use serde::{Deserialize, Serialize};
use sortline_core::{Category, ConsensusConfig};

/// Prior mean confidence of a category before any decision.
pub const PRIOR_MEAN: f32 = 0.75;
/// Prior confidence deviation.
pub const PRIOR_STD: f32 = 0.10;
/// Bounds of the learned acceptance floor.
const FLOOR_RANGE: (f32, f32) = (0.5, 0.95);
/// Deviations below the mean at which the learned floor sits.
const FLOOR_SIGMAS: f32 = 1.5;

/// Exponentially weighted moving average.
#[must_use]
pub fn ewma(previous: f32, next: f32, alpha: f32) -> f32 {
    let alpha = alpha.clamp(0.0, 1.0);
    alpha.mul_add(next, (1.0 - alpha) * previous)
}

/// Direction of a drift transition reported by [`AdaptiveThreshold::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftTransition {
    /// Mean fell below the tolerated band.
    Entered,
    /// Mean came back inside the band.
    Recovered,
}

/// Running confidence statistics of one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveThreshold {
    category: Category,
    mean: f32,
    std: f32,
    updates: u64,
    drifting: bool,
}

/// Serializable view of an [`AdaptiveThreshold`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSnapshot {
    /// Category.
    pub category: Category,
    /// EMA of decision confidence.
    pub mean_confidence: f32,
    /// EMA of absolute deviation.
    pub std_confidence: f32,
    /// Decisions folded in.
    pub updates: u64,
    /// Floor currently applied to new decisions.
    pub acceptance_floor: f32,
    /// Mean is below the tolerated band.
    pub drifting: bool,
}

impl AdaptiveThreshold {
    /// Starts from the prior.
    #[must_use]
    pub const fn new(category: Category) -> Self {
        Self {
            category,
            mean: PRIOR_MEAN,
            std: PRIOR_STD,
            updates: 0,
            drifting: false,
        }
    }

    /// Folds one decision confidence into the statistics. Returns a drift
    /// transition when the mean crosses the tolerated band.
    pub fn update(&mut self, confidence: f32, config: &ConsensusConfig) -> Option<DriftTransition> {
        let rate = config.learning_rate;
        self.mean = ewma(self.mean, confidence, rate);
        let deviation = (confidence - self.mean).abs();
        self.std = ewma(self.std, deviation, rate);
        self.updates += 1;

        let below = self.mean < PRIOR_MEAN - config.drift_tolerance;
        match (below, self.drifting) {
            (true, false) => {
                self.drifting = true;
                Some(DriftTransition::Entered)
            }
            (false, true) => {
                self.drifting = false;
                Some(DriftTransition::Recovered)
            }
            _ => None,
        }
    }

    /// Minimum decision confidence accepted for this category.
    #[must_use]
    pub fn acceptance_floor(&self, config: &ConsensusConfig) -> f32 {
        if self.updates < config.warmup_decisions {
            return config.min_confidence;
        }
        FLOOR_SIGMAS
            .mul_add(-self.std, self.mean)
            .clamp(FLOOR_RANGE.0, FLOOR_RANGE.1)
    }

    /// EMA mean.
    #[must_use]
    pub const fn mean(&self) -> f32 {
        self.mean
    }

    /// EMA deviation.
    #[must_use]
    pub const fn std(&self) -> f32 {
        self.std
    }

    /// Decisions folded in.
    #[must_use]
    pub const fn updates(&self) -> u64 {
        self.updates
    }

    /// View for statistics.
    #[must_use]
    pub fn snapshot(&self, config: &ConsensusConfig) -> ThresholdSnapshot {
        ThresholdSnapshot {
            category: self.category,
            mean_confidence: self.mean,
            std_confidence: self.std,
            updates: self.updates,
            acceptance_floor: self.acceptance_floor(config),
            drifting: self.drifting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_behaves() {
        assert!((ewma(0.0, 10.0, 0.5) - 5.0).abs() < f32::EPSILON);
        assert!((ewma(1.0, 0.0, 2.0)).abs() < f32::EPSILON);
    }

    #[test]
    fn floor_uses_config_until_warm() {
        let config = ConsensusConfig {
            warmup_decisions: 3,
            ..ConsensusConfig::default()
        };
        let mut threshold = AdaptiveThreshold::new(Category::Apple);
        for _ in 0..2 {
            threshold.update(0.9, &config);
        }
        assert!((threshold.acceptance_floor(&config) - 0.6).abs() < f32::EPSILON);
        threshold.update(0.9, &config);
        let floor = threshold.acceptance_floor(&config);
        let expected = threshold.mean() - 1.5 * threshold.std();
        assert!((floor - expected.clamp(0.5, 0.95)).abs() < 1e-6);
    }

    #[test]
    fn drift_reported_once_and_rearmed() {
        let config = ConsensusConfig {
            learning_rate: 0.5,
            ..ConsensusConfig::default()
        };
        let mut threshold = AdaptiveThreshold::new(Category::Pear);
        assert_eq!(threshold.update(0.3, &config), Some(DriftTransition::Entered));
        assert_eq!(threshold.update(0.3, &config), None);
        assert_eq!(threshold.update(0.8, &config), None);
        assert_eq!(
            threshold.update(1.0, &config),
            Some(DriftTransition::Recovered)
        );
    }
}
