use serde::{Deserialize, Serialize};
use sortline_core::{Detection, QualityGrade};

/// Relative weights of the quality blend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    /// Model confidence.
    pub confidence: f32,
    /// Colour uniformity.
    pub color: f32,
    /// Shape conformity.
    pub shape: f32,
    /// Surface quality.
    pub surface: f32,
    /// Size fitness.
    pub size: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            confidence: 0.30,
            color: 0.25,
            shape: 0.20,
            surface: 0.15,
            size: 0.10,
        }
    }
}

impl QualityWeights {
    /// Blend of the measured factors; unmeasured ones are left out and the
    /// remaining weights renormalized.
    #[must_use]
    pub fn blend(&self, detection: &Detection) -> f32 {
        let factors = [
            (Some(detection.confidence), self.confidence),
            (detection.color_score, self.color),
            (detection.shape_score, self.shape),
            (detection.surface_score, self.surface),
            (detection.size_score, self.size),
        ];
        let (weighted, total) = factors
            .iter()
            .filter_map(|(value, weight)| value.map(|v| (v, *weight)))
            .fold((0.0_f32, 0.0_f32), |(sum, total), (value, weight)| {
                (value.mul_add(weight, sum), total + weight)
            });
        if total <= f32::EPSILON {
            return 0.0;
        }
        (weighted / total).clamp(0.0, 1.0)
    }

    /// Grade of a single detection.
    #[must_use]
    pub fn grade(&self, detection: &Detection) -> QualityGrade {
        QualityGrade::from_score(self.blend(detection))
    }
}

/// Quality blend with the default weights.
#[must_use]
pub fn blend_score(detection: &Detection) -> f32 {
    QualityWeights::default().blend(detection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortline_core::{BoundingBox, Category, Timestamp};

    fn detection(confidence: f32) -> Detection {
        Detection::new(
            Timestamp::ZERO,
            1,
            Category::Apple,
            confidence,
            BoundingBox::default(),
        )
    }

    #[test]
    fn full_blend_uses_every_weight() {
        let d = detection(1.0).with_quality(0.8, 0.6, 0.4, 0.2);
        let expected = 0.30 + 0.25 * 0.8 + 0.20 * 0.6 + 0.15 * 0.4 + 0.10 * 0.2;
        assert!((blend_score(&d) - expected).abs() < 1e-5);
    }

    #[test]
    fn missing_factors_are_renormalized() {
        let d = detection(0.8);
        assert!((blend_score(&d) - 0.8).abs() < 1e-6);

        let mut d = detection(0.6);
        d.color_score = Some(1.0);
        let expected = (0.30 * 0.6 + 0.25) / 0.55;
        assert!((blend_score(&d) - expected).abs() < 1e-5);
    }

    #[test]
    fn grades_follow_blend() {
        assert_eq!(
            QualityWeights::default().grade(&detection(0.95).with_quality(0.95, 0.95, 0.95, 0.95)),
            QualityGrade::Premium
        );
        assert_eq!(
            QualityWeights::default().grade(&detection(0.3)),
            QualityGrade::Defective
        );
    }
}
