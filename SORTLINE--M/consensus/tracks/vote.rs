use std::cmp::Ordering;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sortline_core::{Category, Detection, Timestamp};

use crate::quality::QualityWeights;

/// Outcome of the recency-weighted vote over one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteSummary {
    /// Category that won the ranking.
    pub winner: Category,
    /// Samples voting for the winner.
    pub winner_count: usize,
    /// Samples considered.
    pub total_count: usize,
    /// Winner's share of the weighted vote.
    pub consensus_ratio: f32,
    /// Recency-weighted mean confidence of the winner's samples.
    pub confidence: f32,
    /// Mean quality blend of the winner's samples.
    pub quality_score: f32,
    /// Timestamp of the newest sample.
    pub newest: Timestamp,
}

#[derive(Debug, Default)]
struct Tally {
    count: usize,
    votes: f32,
    recency: f32,
    quality: f32,
    last_index: usize,
}

/// Linear recency weight of sample `index` among `len`: the oldest weighs 1,
/// the newest `1 + boost`.
#[must_use]
pub fn recency_weight(index: usize, len: usize, boost: f32) -> f32 {
    if len <= 1 {
        return 1.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let position = index as f32 / (len - 1) as f32;
    boost.mul_add(position, 1.0)
}

/// Ranks categories by total weighted vote (confidence times recency
/// weight), then by the category of the most recent sample.
pub fn tally<'a, I>(samples: I, recency_boost: f32, weights: &QualityWeights) -> Option<VoteSummary>
where
    I: ExactSizeIterator<Item = &'a Detection>,
{
    let len = samples.len();
    let mut tallies: IndexMap<Category, Tally> = IndexMap::new();
    let mut total_votes = 0.0_f32;
    let mut newest = Timestamp::ZERO;
    for (index, detection) in samples.enumerate() {
        let weight = recency_weight(index, len, recency_boost);
        let vote = detection.confidence * weight;
        total_votes += vote;
        newest = newest.latest(detection.timestamp);
        let tally = tallies.entry(detection.category).or_default();
        tally.count += 1;
        tally.votes += vote;
        tally.recency += weight;
        tally.quality += weights.blend(detection);
        tally.last_index = index;
    }

    let (winner, best) = tallies.iter().max_by(|(_, a), (_, b)| rank(a, b))?;
    #[allow(clippy::cast_precision_loss)]
    let quality_score = best.quality / best.count as f32;
    let confidence = if best.recency > 0.0 {
        best.votes / best.recency
    } else {
        0.0
    };
    let consensus_ratio = if total_votes > 0.0 {
        best.votes / total_votes
    } else {
        0.0
    };
    Some(VoteSummary {
        winner: *winner,
        winner_count: best.count,
        total_count: len,
        consensus_ratio,
        confidence,
        quality_score,
        newest,
    })
}

fn rank(a: &Tally, b: &Tally) -> Ordering {
    a.votes
        .total_cmp(&b.votes)
        .then_with(|| a.last_index.cmp(&b.last_index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortline_core::BoundingBox;

    fn sample(at: f64, category: Category, confidence: f32) -> Detection {
        Detection::new(
            Timestamp::from_secs(at),
            7,
            category,
            confidence,
            BoundingBox::default(),
        )
    }

    #[test]
    fn recency_weights_are_linear() {
        assert!((recency_weight(0, 3, 0.5) - 1.0).abs() < f32::EPSILON);
        assert!((recency_weight(1, 3, 0.5) - 1.25).abs() < f32::EPSILON);
        assert!((recency_weight(2, 3, 0.5) - 1.5).abs() < f32::EPSILON);
        assert!((recency_weight(0, 1, 0.5) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn unanimous_vote_has_full_ratio() {
        let samples = vec![
            sample(0.0, Category::Apple, 0.6),
            sample(0.1, Category::Apple, 0.8),
            sample(0.2, Category::Apple, 0.9),
        ];
        let vote = tally(samples.iter(), 0.25, &QualityWeights::default()).unwrap();
        assert_eq!(vote.winner, Category::Apple);
        assert!((vote.consensus_ratio - 1.0).abs() < 1e-6);
        let expected = (0.6 + 0.8 * 1.125 + 0.9 * 1.25) / 3.375;
        assert!((vote.confidence - expected).abs() < 1e-5);
        assert!((vote.newest.as_secs() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn confident_minority_outvotes_weak_majority() {
        let samples = vec![
            sample(0.0, Category::Apple, 0.1),
            sample(0.1, Category::Pear, 0.95),
            sample(0.2, Category::Apple, 0.1),
            sample(0.3, Category::Apple, 0.1),
            sample(0.4, Category::Pear, 0.95),
        ];
        let vote = tally(samples.iter(), 0.25, &QualityWeights::default()).unwrap();
        assert_eq!(vote.winner, Category::Pear);
        assert_eq!(vote.winner_count, 2);
        assert!(vote.consensus_ratio > 0.85, "ratio {}", vote.consensus_ratio);
        assert!((vote.confidence - 0.95).abs() < 1e-5);
    }

    #[test]
    fn equal_counts_fall_back_to_weighted_score() {
        let samples = vec![
            sample(0.0, Category::Pear, 0.9),
            sample(0.1, Category::Apple, 0.5),
            sample(0.2, Category::Pear, 0.9),
            sample(0.3, Category::Apple, 0.5),
        ];
        let vote = tally(samples.iter(), 0.0, &QualityWeights::default()).unwrap();
        assert_eq!(vote.winner, Category::Pear);
        assert_eq!(vote.winner_count, 2);
    }

    #[test]
    fn full_tie_goes_to_most_recent_sample() {
        let samples = vec![
            sample(0.0, Category::Lemon, 0.8),
            sample(0.1, Category::Apple, 0.8),
        ];
        let vote = tally(samples.iter(), 0.0, &QualityWeights::default()).unwrap();
        assert_eq!(vote.winner, Category::Apple);
    }

    #[test]
    fn empty_track_has_no_vote() {
        let samples: Vec<Detection> = Vec::new();
        assert!(tally(samples.iter(), 0.25, &QualityWeights::default()).is_none());
    }
}
