use std::{collections::VecDeque, time::Duration};

use indexmap::IndexMap;
use serde_json::json;
use shared_logging::LogLevel;
use sortline_core::{
    ActuationEvent, ActuationKind, ActuatorId, BeltKinematics, Category, ClassificationDecision,
    LineConfig, LineTelemetry, Timestamp,
};

/// Static plan for one actuator: where it sits and what an activation looks like.
#[derive(Debug, Clone, PartialEq)]
struct Station {
    actuator_id: ActuatorId,
    distance_m: f64,
    kind: ActuationKind,
    duration: Duration,
    hold_duration: Duration,
}

/// Belt travel time over `distance_m` at `speed_mps`; `None` unless the
/// speed is positive and the result finite.
#[must_use]
pub fn travel_delay(distance_m: f64, speed_mps: f64) -> Option<Duration> {
    if !(speed_mps.is_finite() && speed_mps > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(distance_m / speed_mps).ok()
}

/// Plans actuator firing times from decisions and belt kinematics.
///
/// Pure and synchronous: the scheduling task feeds it decisions and belt ticks
/// and dispatches whatever [`ActuationScheduler::due`] hands back.
#[derive(Debug)]
pub struct ActuationScheduler {
    marker: Station,
    diverters: IndexMap<Category, Station>,
    min_spacing: Duration,
    pending: Vec<ActuationEvent>,
    dispatched: IndexMap<ActuatorId, ActuationEvent>,
    deferred: VecDeque<ClassificationDecision>,
    halted_since: Option<Timestamp>,
    telemetry: Option<LineTelemetry>,
}

impl ActuationScheduler {
    /// Builds the station table from the line configuration.
    #[must_use]
    pub fn new(config: &LineConfig) -> Self {
        let marker = Station {
            actuator_id: ActuatorId::Marker,
            distance_m: config.marker.distance_m,
            kind: ActuationKind::Mark {
                intensity: config.marker.intensity,
            },
            duration: config.marker.duration(),
            hold_duration: config.marker.duration(),
        };
        let diverters = config
            .diverters
            .iter()
            .map(|diverter| {
                (
                    diverter.category,
                    Station {
                        actuator_id: ActuatorId::Diverter(diverter.category),
                        distance_m: diverter.distance_m,
                        kind: ActuationKind::Divert(diverter.category),
                        duration: diverter.activation_duration(),
                        hold_duration: diverter.hold_duration(),
                    },
                )
            })
            .collect();
        Self {
            marker,
            diverters,
            min_spacing: config.actuation.min_event_spacing(),
            pending: Vec::new(),
            dispatched: IndexMap::new(),
            deferred: VecDeque::new(),
            halted_since: None,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: LineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Plans the events for one decision. Non-actionable decisions are
    /// dropped; decisions arriving while the belt is not carrying items
    /// forward are deferred until the next usable belt tick.
    pub fn schedule(
        &mut self,
        decision: &ClassificationDecision,
        belt: &BeltKinematics,
    ) -> Vec<ActuationEvent> {
        if !decision.is_actionable() {
            self.log(
                LogLevel::Debug,
                "scheduler.decision.skipped",
                json!({
                    "track_id": decision.track_id,
                    "category": decision.category,
                    "outcome": decision.outcome,
                    "rejected": decision.rejected,
                }),
            );
            return Vec::new();
        }
        let Some(speed) = belt.usable_speed() else {
            self.halt(belt.observed_at);
            self.deferred.push_back(decision.clone());
            self.log(
                LogLevel::Info,
                "scheduler.decision.deferred",
                json!({
                    "track_id": decision.track_id,
                    "direction": belt.direction,
                    "deferred": self.deferred.len(),
                }),
            );
            if let Some(tel) = &self.telemetry {
                let _ = tel.event(
                    "scheduler.decision.deferred",
                    json!({ "track_id": decision.track_id }),
                );
            }
            return Vec::new();
        };
        self.resume(belt.observed_at);
        self.plan(decision, speed, decision.timestamp)
    }

    /// Applies a fresh belt sample. While the belt is not carrying items
    /// forward, pending events are held; once it runs again they are pushed
    /// back by the time it stood still and deferred decisions are planned.
    pub fn on_belt_tick(&mut self, belt: &BeltKinematics) -> Vec<ActuationEvent> {
        let Some(speed) = belt.usable_speed() else {
            self.halt(belt.observed_at);
            return Vec::new();
        };
        self.resume(belt.observed_at);
        let deferred: Vec<ClassificationDecision> = self.deferred.drain(..).collect();
        deferred
            .iter()
            .flat_map(|decision| {
                // Items do not travel while the belt is stopped.
                let origin = decision.timestamp.latest(belt.observed_at);
                self.plan(decision, speed, origin)
            })
            .collect()
    }

    /// Removes and returns every pending event with `fire_at <= now`, in
    /// firing order.
    pub fn due(&mut self, now: Timestamp) -> Vec<ActuationEvent> {
        if self.halted_since.is_some() {
            return Vec::new();
        }
        let (mut ready, waiting): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|event| event.fire_at <= now);
        self.pending = waiting;
        ready.sort_by(|a, b| a.fire_at.total_cmp(&b.fire_at));
        for event in &ready {
            self.dispatched.insert(event.actuator_id, event.clone());
        }
        let horizon = self.min_spacing;
        self.dispatched
            .retain(|_, event| now.saturating_since(event.hold_ends_at()) <= horizon);
        ready
    }

    /// Earliest pending firing time.
    #[must_use]
    pub fn next_due(&self) -> Option<Timestamp> {
        if self.halted_since.is_some() {
            return None;
        }
        self.pending
            .iter()
            .map(|event| event.fire_at)
            .min_by(Timestamp::total_cmp)
    }

    /// Whether pending events are held because the belt stopped.
    #[must_use]
    pub const fn is_halted(&self) -> bool {
        self.halted_since.is_some()
    }

    /// Decisions waiting for the belt to move.
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Events planned but not yet dispatched.
    #[must_use]
    pub fn pending(&self) -> &[ActuationEvent] {
        &self.pending
    }

    fn halt(&mut self, at: Timestamp) {
        if self.halted_since.is_some() {
            return;
        }
        self.halted_since = Some(at);
        if !self.pending.is_empty() {
            self.log(
                LogLevel::Warn,
                "scheduler.pending.held",
                json!({ "pending": self.pending.len(), "at": at }),
            );
        }
    }

    fn resume(&mut self, at: Timestamp) {
        let Some(since) = self.halted_since.take() else {
            return;
        };
        let stood = at.saturating_since(since);
        for event in &mut self.pending {
            event.fire_at = event.fire_at + stood;
        }
        if !self.pending.is_empty() {
            self.log(
                LogLevel::Info,
                "scheduler.pending.resumed",
                json!({
                    "pending": self.pending.len(),
                    "stood_s": stood.as_secs_f64(),
                }),
            );
        }
    }

    fn plan(
        &mut self,
        decision: &ClassificationDecision,
        speed_mps: f64,
        origin: Timestamp,
    ) -> Vec<ActuationEvent> {
        let mut stations = vec![self.marker.clone()];
        stations.extend(self.diverters.get(&decision.category).cloned());

        let mut planned = Vec::with_capacity(stations.len());
        for station in stations {
            let Some(delay) = travel_delay(station.distance_m, speed_mps) else {
                continue;
            };
            let event = ActuationEvent::new(
                station.actuator_id,
                Some(decision.track_id),
                origin + delay,
                station.kind,
                station.duration,
                station.hold_duration,
            );
            let event = self.merge_or_enqueue(event);
            self.log(
                LogLevel::Debug,
                "scheduler.event.planned",
                json!({
                    "track_id": decision.track_id,
                    "actuator": event.actuator_id.to_string(),
                    "fire_at": event.fire_at,
                    "hold_s": event.hold_duration.as_secs_f64(),
                }),
            );
            planned.push(event);
        }
        planned
    }

    /// Folds `event` into a pending or dispatched event of the same actuator
    /// when their firing times are closer than the minimum spacing.
    fn merge_or_enqueue(&mut self, event: ActuationEvent) -> ActuationEvent {
        let spacing = self.min_spacing.as_secs_f64();
        let close = |other: &ActuationEvent| {
            other.actuator_id == event.actuator_id
                && (other.fire_at.as_secs() - event.fire_at.as_secs()).abs() < spacing
        };

        if let Some(existing) = self.pending.iter_mut().find(|other| close(&**other)) {
            let fire_at = if event.fire_at < existing.fire_at {
                event.fire_at
            } else {
                existing.fire_at
            };
            extend(existing, &event, fire_at);
            let merged = existing.clone();
            self.log_merge(&merged);
            return merged;
        }

        if let Some(dispatched) = self.dispatched.get(&event.actuator_id).filter(|d| close(*d)) {
            // Already handed to the actuator: re-send under the same id so the
            // owner extends the running hold.
            let mut superseding = dispatched.clone();
            let fire_at = superseding.fire_at;
            extend(&mut superseding, &event, fire_at);
            self.pending.push(superseding.clone());
            self.log_merge(&superseding);
            return superseding;
        }

        self.pending.push(event.clone());
        event
    }

    fn log_merge(&self, merged: &ActuationEvent) {
        self.log(
            LogLevel::Info,
            "scheduler.event.merged",
            json!({
                "actuator": merged.actuator_id.to_string(),
                "event_id": merged.id.to_string(),
                "hold_s": merged.hold_duration.as_secs_f64(),
            }),
        );
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

/// Stretches `target` so it also covers `incoming`, starting at `fire_at`.
fn extend(target: &mut ActuationEvent, incoming: &ActuationEvent, fire_at: Timestamp) {
    let hold_end = (target.fire_at + target.hold_duration).latest(incoming.fire_at + incoming.hold_duration);
    let active_end = (target.fire_at + target.duration).latest(incoming.fire_at + incoming.duration);
    target.fire_at = fire_at;
    target.hold_duration = hold_end.saturating_since(fire_at);
    target.duration = active_end.saturating_since(fire_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortline_core::{DecisionOutcome, QualityGrade};

    fn decision(track_id: u64, at: f64, category: Category) -> ClassificationDecision {
        ClassificationDecision {
            track_id,
            category,
            confidence: 0.9,
            quality_grade: QualityGrade::GradeA,
            quality_score: 0.8,
            consensus_ratio: 1.0,
            sample_count: 3,
            timestamp: Timestamp::from_secs(at),
            outcome: DecisionOutcome::Accepted,
            rejected: false,
        }
    }

    fn scheduler() -> ActuationScheduler {
        ActuationScheduler::new(&LineConfig::default())
    }

    fn belt(speed: f64, at: f64) -> BeltKinematics {
        BeltKinematics::forward(speed, Timestamp::from_secs(at))
    }

    #[test]
    fn travel_delay_matches_geometry() {
        let delay = travel_delay(0.5, 0.2).unwrap();
        assert!((delay.as_secs_f64() - 2.5).abs() < 1e-9);
        assert!(travel_delay(0.5, 0.0).is_none());
        assert!(travel_delay(0.5, f64::NAN).is_none());
    }

    #[test]
    fn fire_time_is_decision_time_plus_travel() {
        let mut scheduler = scheduler();
        let events = scheduler.schedule(&decision(1, 10.0, Category::Apple), &belt(0.2, 10.0));
        assert_eq!(events.len(), 2);
        let diverter = events
            .iter()
            .find(|e| e.actuator_id == ActuatorId::Diverter(Category::Apple))
            .unwrap();
        assert!((diverter.fire_at.as_secs() - 12.5).abs() < 1e-6);
        assert_eq!(diverter.kind, ActuationKind::Divert(Category::Apple));
        let marker = events
            .iter()
            .find(|e| e.actuator_id == ActuatorId::Marker)
            .unwrap();
        assert!((marker.fire_at.as_secs() - 11.25).abs() < 1e-6);
        assert_eq!(scheduler.next_due(), Some(marker.fire_at));
    }

    #[test]
    fn unknown_and_rejected_decisions_are_not_scheduled() {
        let mut scheduler = scheduler();
        let mut unknown = decision(1, 0.0, Category::Unknown);
        unknown.outcome = DecisionOutcome::NoConsensus;
        assert!(scheduler.schedule(&unknown, &belt(0.2, 0.0)).is_empty());

        let mut rejected = decision(2, 0.0, Category::Pear);
        rejected.rejected = true;
        assert!(scheduler.schedule(&rejected, &belt(0.2, 0.0)).is_empty());
        assert!(scheduler.pending().is_empty());
    }

    #[test]
    fn stopped_belt_defers_until_speed_returns() {
        let mut scheduler = scheduler();
        let stopped = BeltKinematics::stopped(Timestamp::from_secs(1.0));
        assert!(scheduler
            .schedule(&decision(4, 1.0, Category::Lemon), &stopped)
            .is_empty());
        assert_eq!(scheduler.deferred_len(), 1);
        assert!(scheduler.on_belt_tick(&stopped).is_empty());
        assert_eq!(scheduler.deferred_len(), 1);
        assert!(scheduler.due(Timestamp::from_secs(100.0)).is_empty());

        let events = scheduler.on_belt_tick(&belt(0.2, 5.0));
        assert_eq!(events.len(), 2);
        assert_eq!(scheduler.deferred_len(), 0);
        let lemon = events
            .iter()
            .find(|e| e.actuator_id == ActuatorId::Diverter(Category::Lemon))
            .unwrap();
        assert!((lemon.fire_at.as_secs() - 9.0).abs() < 1e-6);
    }

    #[test]
    fn belt_stop_holds_pending_events_until_restart() {
        let mut scheduler = scheduler();
        scheduler.schedule(&decision(1, 1.2, Category::Apple), &belt(0.2, 1.2));
        assert_eq!(scheduler.pending().len(), 2);

        assert!(scheduler
            .on_belt_tick(&BeltKinematics::stopped(Timestamp::from_secs(1.3)))
            .is_empty());
        assert!(scheduler.is_halted());
        assert_eq!(scheduler.next_due(), None);
        assert!(scheduler.due(Timestamp::from_secs(10.0)).is_empty());
        assert_eq!(scheduler.pending().len(), 2);

        scheduler.on_belt_tick(&belt(0.2, 5.3));
        assert!(!scheduler.is_halted());
        let diverter = scheduler
            .pending()
            .iter()
            .find(|e| e.actuator_id == ActuatorId::Diverter(Category::Apple))
            .unwrap();
        assert!((diverter.fire_at.as_secs() - 7.7).abs() < 1e-6);
        assert_eq!(scheduler.due(Timestamp::from_secs(7.0)).len(), 1);
        assert_eq!(scheduler.due(Timestamp::from_secs(7.7)).len(), 1);
    }

    #[test]
    fn close_events_merge_by_extending_hold() {
        let mut scheduler = scheduler();
        let first = scheduler.schedule(&decision(1, 0.0, Category::Apple), &belt(0.2, 0.0));
        let second = scheduler.schedule(&decision(2, 0.3, Category::Apple), &belt(0.2, 0.3));
        assert_eq!(scheduler.pending().len(), 2);
        let first_div = first.iter().find(|e| e.actuator_id != ActuatorId::Marker).unwrap();
        let merged = second.iter().find(|e| e.actuator_id != ActuatorId::Marker).unwrap();
        assert_eq!(first_div.id, merged.id);
        assert!((merged.hold_duration.as_secs_f64() - 1.8).abs() < 1e-6);
        assert!((merged.fire_at.as_secs() - 2.5).abs() < 1e-6);
    }

    #[test]
    fn distant_events_stay_separate() {
        let mut scheduler = scheduler();
        scheduler.schedule(&decision(1, 0.0, Category::Pear), &belt(0.2, 0.0));
        scheduler.schedule(&decision(2, 0.6, Category::Pear), &belt(0.2, 0.6));
        assert_eq!(scheduler.pending().len(), 4);
    }

    #[test]
    fn merge_into_dispatched_event_resends_same_id() {
        let mut scheduler = scheduler();
        scheduler.schedule(&decision(1, 0.0, Category::Apple), &belt(0.2, 0.0));
        let dispatched = scheduler.due(Timestamp::from_secs(2.6));
        assert_eq!(dispatched.len(), 2);
        let original = dispatched
            .iter()
            .find(|e| e.actuator_id == ActuatorId::Diverter(Category::Apple))
            .unwrap()
            .clone();

        let follow_up = scheduler.schedule(&decision(2, 0.2, Category::Apple), &belt(0.2, 0.2));
        let superseding = follow_up
            .iter()
            .find(|e| e.actuator_id == ActuatorId::Diverter(Category::Apple))
            .unwrap();
        assert_eq!(superseding.id, original.id);
        assert_eq!(superseding.fire_at, original.fire_at);
        assert!((superseding.hold_duration.as_secs_f64() - 1.7).abs() < 1e-6);

        let resent = scheduler.due(Timestamp::from_secs(2.7));
        assert!(resent.iter().any(|e| e.id == original.id));
    }
}
