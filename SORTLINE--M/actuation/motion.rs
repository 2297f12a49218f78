use std::{f32::consts::PI, time::Duration};

use serde::{Deserialize, Serialize};
use sortline_core::{ActuatorState, Timestamp};

/// One pose command produced by [`MotionProfile::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionStep {
    /// Pose to command, degrees.
    pub pose: f32,
    /// State after this step has been applied.
    pub state: ActuatorState,
    /// When the profile wants to be advanced next; `None` once finished.
    pub wake_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Moving { step: u32 },
    Holding { since: Timestamp },
    Returning { step: u32 },
    Done,
}

/// Move → hold → smooth return for one activation.
///
/// Pure: the caller supplies the time and applies the returned poses. Each
/// leg is `steps` cosine-eased increments spaced `step_interval` apart.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionProfile {
    rest: f32,
    active: f32,
    steps: u32,
    step_interval: Duration,
    hold: Duration,
    phase: Phase,
    next_at: Timestamp,
    started_at: Timestamp,
}

impl MotionProfile {
    /// Profile whose first step is due at `start_at`.
    #[must_use]
    pub fn new(
        start_at: Timestamp,
        rest: f32,
        active: f32,
        steps: u32,
        step_interval: Duration,
        hold: Duration,
    ) -> Self {
        Self {
            rest,
            active,
            steps: steps.max(1),
            step_interval,
            hold,
            phase: Phase::Moving { step: 1 },
            next_at: start_at,
            started_at: start_at,
        }
    }

    /// Lifecycle state of the actuator running this profile.
    #[must_use]
    pub const fn state(&self) -> ActuatorState {
        match self.phase {
            Phase::Moving { .. } => ActuatorState::Moving,
            Phase::Holding { .. } => ActuatorState::Holding,
            Phase::Returning { .. } => ActuatorState::Returning,
            Phase::Done => ActuatorState::Idle,
        }
    }

    /// Next time [`MotionProfile::advance`] has work to do.
    #[must_use]
    pub const fn wake_at(&self) -> Option<Timestamp> {
        match self.phase {
            Phase::Done => None,
            _ => Some(self.next_at),
        }
    }

    /// Time the first step was due.
    #[must_use]
    pub const fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Current hold length.
    #[must_use]
    pub const fn hold(&self) -> Duration {
        self.hold
    }

    /// Whether the profile has returned to rest.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }

    /// Expected completion time if nothing is extended.
    #[must_use]
    pub fn expected_end(&self) -> Timestamp {
        let legs = self.step_interval * (2 * self.steps.saturating_sub(1));
        self.started_at + legs + self.hold
    }

    /// Lengthens the hold. Only possible before the return has begun.
    pub fn extend_hold(&mut self, hold: Duration) -> bool {
        match self.phase {
            Phase::Moving { .. } => {
                self.hold = self.hold.max(hold);
                true
            }
            Phase::Holding { since } => {
                self.hold = self.hold.max(hold);
                self.next_at = since + self.hold;
                true
            }
            Phase::Returning { .. } | Phase::Done => false,
        }
    }

    /// Produces the next step if it is due at `now`.
    pub fn advance(&mut self, now: Timestamp) -> Option<MotionStep> {
        if self.is_finished() || now < self.next_at {
            return None;
        }
        let pose = match self.phase {
            Phase::Moving { step } => {
                let pose = self.interpolate(self.rest, self.active, step);
                if step >= self.steps {
                    let since = self.next_at;
                    self.phase = Phase::Holding { since };
                    self.next_at = since + self.hold;
                } else {
                    self.phase = Phase::Moving { step: step + 1 };
                    self.next_at = self.next_at + self.step_interval;
                }
                pose
            }
            Phase::Holding { .. } => {
                let pose = self.interpolate(self.active, self.rest, 1);
                self.after_return_step(1);
                pose
            }
            Phase::Returning { step } => {
                let pose = self.interpolate(self.active, self.rest, step);
                self.after_return_step(step);
                pose
            }
            Phase::Done => return None,
        };
        Some(MotionStep {
            pose,
            state: self.state(),
            wake_at: self.wake_at(),
        })
    }

    fn after_return_step(&mut self, step: u32) {
        if step >= self.steps {
            self.phase = Phase::Done;
        } else {
            self.phase = Phase::Returning { step: step + 1 };
            self.next_at = self.next_at + self.step_interval;
        }
    }

    fn interpolate(&self, from: f32, to: f32, step: u32) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        let progress = step as f32 / self.steps as f32;
        let eased = (1.0 - (PI * progress).cos()) / 2.0;
        (to - from).mul_add(eased, from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: f64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    fn drain(profile: &mut MotionProfile) -> Vec<(f64, MotionStep)> {
        let mut steps = Vec::new();
        while let Some(wake) = profile.wake_at() {
            let step = profile.advance(wake).unwrap();
            steps.push((wake.as_secs(), step));
        }
        steps
    }

    #[test]
    fn runs_move_hold_return() {
        let mut profile = MotionProfile::new(
            at(1.0),
            90.0,
            0.0,
            10,
            Duration::from_millis(20),
            Duration::from_millis(1_500),
        );
        assert_eq!(profile.state(), ActuatorState::Moving);
        assert!(profile.advance(at(0.5)).is_none());

        let steps = drain(&mut profile);
        assert_eq!(steps.len(), 20);
        let (last_move_at, last_move) = steps[9];
        assert_eq!(last_move.state, ActuatorState::Holding);
        assert!(last_move.pose.abs() < 1e-4);
        assert!((last_move_at - 1.18).abs() < 1e-6);

        let (return_at, first_return) = steps[10];
        assert!((return_at - 2.68).abs() < 1e-6);
        assert_eq!(first_return.state, ActuatorState::Returning);

        let (_, last) = steps[19];
        assert_eq!(last.state, ActuatorState::Idle);
        assert!((last.pose - 90.0).abs() < 1e-4);
        assert!(last.wake_at.is_none());
        assert!(profile.is_finished());
        assert!((profile.expected_end().as_secs() - 2.86).abs() < 1e-6);
    }

    #[test]
    fn poses_are_monotonic_within_a_leg() {
        let mut profile =
            MotionProfile::new(at(0.0), 0.0, 90.0, 20, Duration::from_millis(10), Duration::ZERO);
        let steps = drain(&mut profile);
        for pair in steps[..20].windows(2) {
            assert!(pair[1].1.pose >= pair[0].1.pose);
        }
        for pair in steps[20..].windows(2) {
            assert!(pair[1].1.pose <= pair[0].1.pose);
        }
        assert!(steps.iter().all(|(_, s)| (0.0..=90.0).contains(&s.pose)));
    }

    #[test]
    fn hold_extends_until_return_begins() {
        let mut profile = MotionProfile::new(
            at(0.0),
            0.0,
            90.0,
            10,
            Duration::from_millis(20),
            Duration::from_millis(600),
        );
        for _ in 0..10 {
            let wake = profile.wake_at().unwrap();
            profile.advance(wake);
        }
        assert_eq!(profile.state(), ActuatorState::Holding);
        assert!(profile.extend_hold(Duration::from_millis(900)));
        assert!((profile.wake_at().unwrap().as_secs() - 1.08).abs() < 1e-6);

        let wake = profile.wake_at().unwrap();
        profile.advance(wake);
        assert_eq!(profile.state(), ActuatorState::Returning);
        assert!(!profile.extend_hold(Duration::from_secs(5)));
    }
}
