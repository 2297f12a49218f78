use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use sortline_core::{
    Category, ClassificationDecision, ConsensusConfig, DecisionOutcome, Detection, LineTelemetry,
    QualityGrade, Timestamp, TrackId,
};
use tracing::instrument;

use crate::{
    quality::QualityWeights,
    threshold::{AdaptiveThreshold, DriftTransition, ThresholdSnapshot},
    tracks::{vote::VoteSummary, Track, TrackBook},
};

/// Running totals of the classifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassifierStats {
    /// Detections received, including ignored ones.
    pub detections_seen: u64,
    /// Detections dropped because their track already settled.
    pub late_detections: u64,
    /// Decisions emitted.
    pub decisions: u64,
    /// Accepted decisions per category.
    pub accepted_by_category: IndexMap<Category, u64>,
    /// Accepted decisions per grade.
    pub accepted_by_grade: IndexMap<QualityGrade, u64>,
    /// Decisions flagged for rejection (any outcome).
    pub rejected: u64,
    /// Decisions without consensus.
    pub no_consensus: u64,
    /// Decisions emitted on window expiry with too few samples.
    pub insufficient_evidence: u64,
    /// Live tracks.
    pub active_tracks: usize,
    /// Adaptive thresholds per category.
    pub thresholds: Vec<ThresholdSnapshot>,
}

/// Multi-frame consensus classifier. Owned by exactly one task.
#[derive(Debug)]
pub struct TemporalConsensusClassifier {
    config: ConsensusConfig,
    weights: QualityWeights,
    book: TrackBook,
    thresholds: IndexMap<Category, AdaptiveThreshold>,
    stats: ClassifierStats,
    telemetry: Option<LineTelemetry>,
}

impl TemporalConsensusClassifier {
    /// Creates a classifier with default quality weights.
    #[must_use]
    pub fn new(config: ConsensusConfig) -> Self {
        let thresholds = Category::KNOWN
            .iter()
            .map(|category| (*category, AdaptiveThreshold::new(*category)))
            .collect();
        Self {
            config,
            weights: QualityWeights::default(),
            book: TrackBook::new(),
            thresholds,
            stats: ClassifierStats::default(),
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: LineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Overrides the quality blend weights.
    #[must_use]
    pub const fn with_weights(mut self, weights: QualityWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Adds one detection to its track and returns the track's decision once
    /// the evidence is sufficient.
    #[instrument(skip(self, detection), fields(track = detection.track_id))]
    pub fn ingest(&mut self, detection: Detection) -> Option<ClassificationDecision> {
        self.stats.detections_seen += 1;
        let track_id = detection.track_id;
        if self.book.is_settled(track_id) {
            self.stats.late_detections += 1;
            tracing::debug!(track_id, "detection for settled track ignored");
            return None;
        }

        let window = self.config.temporal_window();
        let at = detection.timestamp;
        if let Some(expired) = self.book.take_if_expired(track_id, at, window) {
            // The old evidence is closed out; this sample arrived after it.
            self.stats.late_detections += 1;
            return self.expire(&expired, at);
        }
        let track = self
            .book
            .observe(detection, self.config.max_samples, window);
        let vote = track.vote(self.config.recency_boost, &self.weights)?;
        let count = track.len();
        let newest = track.last_seen();

        if count < self.config.min_detections {
            return None;
        }
        let outcome = if vote.consensus_ratio > self.config.consensus_threshold {
            if vote.winner.is_known() {
                DecisionOutcome::Accepted
            } else {
                DecisionOutcome::NoConsensus
            }
        } else if count >= self.config.max_samples {
            DecisionOutcome::NoConsensus
        } else {
            return None;
        };

        self.book.settle(track_id, newest);
        Some(self.decide(track_id, &vote, outcome, newest))
    }

    /// Closes every track silent for longer than the window, emitting a
    /// rejected `Unknown` decision for each.
    pub fn sweep_expired(&mut self, now: Timestamp) -> Vec<ClassificationDecision> {
        let window = self.config.temporal_window();
        self.book.forget_settled(now, window * 2);
        let expired: Vec<Track> = self.book.take_expired(now, window);
        expired
            .iter()
            .filter_map(|track| self.expire(track, now))
            .collect()
    }

    fn expire(&mut self, track: &Track, at: Timestamp) -> Option<ClassificationDecision> {
        let vote = track.vote(self.config.recency_boost, &self.weights)?;
        let outcome = if track.len() < self.config.min_detections {
            DecisionOutcome::InsufficientEvidence
        } else {
            DecisionOutcome::NoConsensus
        };
        Some(self.decide(track.track_id(), &vote, outcome, at))
    }

    /// Forgets one track or all of them.
    pub fn reset_tracking(&mut self, track_id: Option<TrackId>) {
        self.book.reset(track_id);
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(
                LogLevel::Info,
                "consensus.tracking.reset",
                json!({ "track_id": track_id }),
            );
        }
    }

    /// Running totals.
    #[must_use]
    pub fn stats(&self) -> ClassifierStats {
        let mut stats = self.stats.clone();
        stats.active_tracks = self.book.active();
        stats.thresholds = self.thresholds();
        stats
    }

    /// Adaptive thresholds per category.
    #[must_use]
    pub fn thresholds(&self) -> Vec<ThresholdSnapshot> {
        self.thresholds
            .values()
            .map(|threshold| threshold.snapshot(&self.config))
            .collect()
    }

    /// Live tracks.
    #[must_use]
    pub fn active_tracks(&self) -> usize {
        self.book.active()
    }

    fn decide(
        &mut self,
        track_id: TrackId,
        vote: &VoteSummary,
        outcome: DecisionOutcome,
        timestamp: Timestamp,
    ) -> ClassificationDecision {
        let accepted = outcome == DecisionOutcome::Accepted;
        let category = if accepted { vote.winner } else { Category::Unknown };
        let rejected = if accepted {
            let floor = self
                .thresholds
                .get(&category)
                .map_or(self.config.min_confidence, |t| t.acceptance_floor(&self.config));
            vote.confidence < floor
        } else {
            true
        };

        let decision = ClassificationDecision {
            track_id,
            category,
            confidence: vote.confidence,
            quality_grade: QualityGrade::from_score(vote.quality_score),
            quality_score: vote.quality_score,
            consensus_ratio: vote.consensus_ratio,
            sample_count: vote.total_count,
            timestamp,
            outcome,
            rejected,
        };

        self.record(&decision);
        if accepted {
            self.learn(category, decision.confidence);
        }
        self.report(&decision);
        decision
    }

    fn record(&mut self, decision: &ClassificationDecision) {
        self.stats.decisions += 1;
        if decision.rejected {
            self.stats.rejected += 1;
        }
        match decision.outcome {
            DecisionOutcome::Accepted => {
                *self
                    .stats
                    .accepted_by_category
                    .entry(decision.category)
                    .or_default() += 1;
                *self
                    .stats
                    .accepted_by_grade
                    .entry(decision.quality_grade)
                    .or_default() += 1;
            }
            DecisionOutcome::NoConsensus => self.stats.no_consensus += 1,
            DecisionOutcome::InsufficientEvidence => self.stats.insufficient_evidence += 1,
        }
    }

    fn learn(&mut self, category: Category, confidence: f32) {
        let Some(threshold) = self.thresholds.get_mut(&category) else {
            return;
        };
        let Some(transition) = threshold.update(confidence, &self.config) else {
            return;
        };
        let snapshot = threshold.snapshot(&self.config);
        match transition {
            DriftTransition::Entered => {
                tracing::warn!(
                    %category,
                    mean = snapshot.mean_confidence,
                    "confidence drifting downward"
                );
                if let Some(tel) = &self.telemetry {
                    let _ = tel.log(
                        LogLevel::Warn,
                        "consensus.threshold.drift",
                        json!({
                            "category": category,
                            "mean_confidence": snapshot.mean_confidence,
                            "std_confidence": snapshot.std_confidence,
                        }),
                    );
                    let _ = tel.event("consensus.threshold.drift", json!(snapshot));
                }
            }
            DriftTransition::Recovered => {
                if let Some(tel) = &self.telemetry {
                    let _ = tel.log(
                        LogLevel::Info,
                        "consensus.threshold.recovered",
                        json!({ "category": category, "mean_confidence": snapshot.mean_confidence }),
                    );
                }
            }
        }
    }

    fn report(&self, decision: &ClassificationDecision) {
        let Some(tel) = &self.telemetry else {
            return;
        };
        let level = if decision.is_actionable() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let _ = tel.log(
            level,
            "consensus.decision.emitted",
            json!({
                "track_id": decision.track_id,
                "category": decision.category,
                "outcome": decision.outcome,
                "confidence": decision.confidence,
                "consensus_ratio": decision.consensus_ratio,
                "quality_grade": decision.quality_grade,
                "samples": decision.sample_count,
                "rejected": decision.rejected,
            }),
        );
        let _ = tel.event("consensus.decision.emitted", json!(decision));
    }
}
