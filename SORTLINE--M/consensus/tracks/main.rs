//! Per-track evidence buffers.

/// Recency-weighted voting.
pub mod vote;

use std::{collections::VecDeque, time::Duration};

use indexmap::IndexMap;
use sortline_core::{Detection, Timestamp, TrackId};

use crate::quality::QualityWeights;
use vote::VoteSummary;

/// Bounded, ordered evidence for one tracked item.
#[derive(Debug, Clone)]
pub struct Track {
    track_id: TrackId,
    samples: VecDeque<Detection>,
    first_seen: Timestamp,
    last_seen: Timestamp,
}

impl Track {
    /// Creates an empty track.
    #[must_use]
    pub fn new(track_id: TrackId, at: Timestamp) -> Self {
        Self {
            track_id,
            samples: VecDeque::new(),
            first_seen: at,
            last_seen: at,
        }
    }

    /// Appends a sample, keeping at most `max_samples` and only those inside
    /// `window` of the newest.
    pub fn push(&mut self, detection: Detection, max_samples: usize, window: Duration) {
        self.last_seen = self.last_seen.latest(detection.timestamp);
        self.samples.push_back(detection);
        while self.samples.len() > max_samples.max(1) {
            self.samples.pop_front();
        }
        let newest = self.last_seen;
        self.samples
            .retain(|sample| newest.saturating_since(sample.timestamp) <= window);
    }

    /// Tracker identity.
    #[must_use]
    pub const fn track_id(&self) -> TrackId {
        self.track_id
    }

    /// Samples retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples, oldest first.
    pub fn samples(&self) -> impl ExactSizeIterator<Item = &Detection> {
        self.samples.iter()
    }

    /// Time of the first sample.
    #[must_use]
    pub const fn first_seen(&self) -> Timestamp {
        self.first_seen
    }

    /// Time of the newest sample.
    #[must_use]
    pub const fn last_seen(&self) -> Timestamp {
        self.last_seen
    }

    /// Weighted vote over the retained samples.
    #[must_use]
    pub fn vote(&self, recency_boost: f32, weights: &QualityWeights) -> Option<VoteSummary> {
        vote::tally(self.samples(), recency_boost, weights)
    }
}

/// Live tracks plus the memory of tracks that already produced a decision.
#[derive(Debug, Default)]
pub struct TrackBook {
    tracks: IndexMap<TrackId, Track>,
    settled: IndexMap<TrackId, Timestamp>,
}

impl TrackBook {
    /// Creates an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `track_id` already produced its decision.
    #[must_use]
    pub fn is_settled(&self, track_id: TrackId) -> bool {
        self.settled.contains_key(&track_id)
    }

    /// Adds a detection to its track, creating the track when absent.
    pub fn observe(&mut self, detection: Detection, max_samples: usize, window: Duration) -> &Track {
        let track = self
            .tracks
            .entry(detection.track_id)
            .or_insert_with(|| Track::new(detection.track_id, detection.timestamp));
        track.push(detection, max_samples, window);
        track
    }

    /// Removes a track and remembers it as settled at `at`.
    pub fn settle(&mut self, track_id: TrackId, at: Timestamp) -> Option<Track> {
        self.settled.insert(track_id, at);
        self.tracks.shift_remove(&track_id)
    }

    /// Removes and settles `track_id` when it has been silent for longer
    /// than `window` at `now`.
    pub fn take_if_expired(
        &mut self,
        track_id: TrackId,
        now: Timestamp,
        window: Duration,
    ) -> Option<Track> {
        let silent = now.saturating_since(self.tracks.get(&track_id)?.last_seen());
        if silent > window {
            self.settle(track_id, now)
        } else {
            None
        }
    }

    /// Removes and settles every track silent for longer than `window`.
    pub fn take_expired(&mut self, now: Timestamp, window: Duration) -> Vec<Track> {
        let expired: Vec<TrackId> = self
            .tracks
            .values()
            .filter(|track| now.saturating_since(track.last_seen()) > window)
            .map(Track::track_id)
            .collect();
        expired
            .into_iter()
            .filter_map(|track_id| self.settle(track_id, now))
            .collect()
    }

    /// Forgets settled ids older than `retention`.
    pub fn forget_settled(&mut self, now: Timestamp, retention: Duration) {
        self.settled
            .retain(|_, settled_at| now.saturating_since(*settled_at) <= retention);
    }

    /// Drops one live track (and its settled memory), or everything.
    pub fn reset(&mut self, track_id: Option<TrackId>) {
        match track_id {
            Some(id) => {
                self.tracks.shift_remove(&id);
                self.settled.shift_remove(&id);
            }
            None => {
                self.tracks.clear();
                self.settled.clear();
            }
        }
    }

    /// Live tracks.
    #[must_use]
    pub fn active(&self) -> usize {
        self.tracks.len()
    }

    /// Remembered settled ids.
    #[must_use]
    pub fn settled(&self) -> usize {
        self.settled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortline_core::{BoundingBox, Category};

    fn sample(track_id: TrackId, at: f64) -> Detection {
        Detection::new(
            Timestamp::from_secs(at),
            track_id,
            Category::Lemon,
            0.9,
            BoundingBox::default(),
        )
    }

    #[test]
    fn track_is_bounded_and_windowed() {
        let mut track = Track::new(1, Timestamp::ZERO);
        for step in 0..8 {
            track.push(sample(1, f64::from(step) * 0.1), 5, Duration::from_secs(2));
        }
        assert_eq!(track.len(), 5);
        assert!((track.samples().next().unwrap().timestamp.as_secs() - 0.3).abs() < 1e-9);

        track.push(sample(1, 3.0), 5, Duration::from_secs(2));
        assert_eq!(track.len(), 1);
        assert!((track.last_seen().as_secs() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn book_settles_and_expires() {
        let mut book = TrackBook::new();
        let window = Duration::from_secs(2);
        book.observe(sample(1, 0.0), 5, window);
        book.observe(sample(2, 1.5), 5, window);
        assert_eq!(book.active(), 2);

        let expired = book.take_expired(Timestamp::from_secs(2.5), window);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].track_id(), 1);
        assert!(book.is_settled(1));
        assert!(!book.is_settled(2));

        book.forget_settled(Timestamp::from_secs(7.0), window * 2);
        assert!(!book.is_settled(1));
    }

    #[test]
    fn single_track_expires_on_late_sample() {
        let mut book = TrackBook::new();
        let window = Duration::from_secs(2);
        book.observe(sample(4, 0.0), 5, window);
        assert!(book
            .take_if_expired(4, Timestamp::from_secs(1.9), window)
            .is_none());
        assert!(book
            .take_if_expired(9, Timestamp::from_secs(5.0), window)
            .is_none());
        let expired = book
            .take_if_expired(4, Timestamp::from_secs(2.5), window)
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert!(book.is_settled(4));
        assert_eq!(book.active(), 0);
    }

    #[test]
    fn reset_clears_selected_track() {
        let mut book = TrackBook::new();
        let window = Duration::from_secs(2);
        book.observe(sample(1, 0.0), 5, window);
        book.observe(sample(2, 0.0), 5, window);
        book.settle(2, Timestamp::ZERO);
        book.reset(Some(2));
        assert_eq!(book.active(), 1);
        assert!(!book.is_settled(2));
        book.reset(None);
        assert_eq!(book.active(), 0);
    }
}
