//! Actuator coordination: one owner task and one watchdog per actuator, with
//! a message-passing handle for callers.

/// Cross-actuator start staggering.
pub mod guard;
mod owner;
mod watchdog;

use std::{sync::Arc, time::Duration};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sortline_core::{
    ActuationEvent, ActuationKind, ActuatorId, ActuatorState, Category, Clock, HardwareError,
    LineConfig, LineTelemetry, ServoGeometry, Timestamp,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::instrument;
use uuid::Uuid;

use crate::driver::ActuatorDriver;
use guard::IntervalGuard;
use owner::{ActuatorOwner, OwnerSettings};

/// Errors returned by the coordinator's command surface.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActuationError {
    /// The actuator already has an event in flight and one pending.
    #[error("actuator {0} is busy")]
    Busy(ActuatorId),
    /// The actuator is faulted and refuses work until reset.
    #[error("actuator {0} is faulted")]
    Faulted(ActuatorId),
    /// No such actuator on this line.
    #[error("unknown actuator {0}")]
    UnknownActuator(ActuatorId),
    /// The owner task is gone.
    #[error("actuator {0} owner has stopped")]
    ChannelClosed(ActuatorId),
    /// The output stage failed.
    #[error("actuator {actuator} hardware failure: {source}")]
    Hardware {
        /// Failing actuator.
        actuator: ActuatorId,
        /// Driver error.
        source: HardwareError,
    },
}

/// Static description of one actuator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorSpec {
    /// Identity.
    pub id: ActuatorId,
    /// Output channel.
    pub channel: u8,
    /// Rest pose, degrees.
    pub rest_pose: f32,
    /// Full-stroke active pose, degrees.
    pub active_pose: f32,
    /// Interpolation steps per leg.
    pub motion_steps: u32,
    /// Default hold used by test fires.
    pub hold_duration: Duration,
    /// Default activation time used by test fires.
    pub duration: Duration,
    /// Pulse geometry.
    pub servo: ServoGeometry,
}

impl ActuatorSpec {
    /// Marker first, then one spec per configured diverter.
    #[must_use]
    pub fn from_config(config: &LineConfig) -> Vec<Self> {
        let marker = &config.marker;
        std::iter::once(Self {
            id: ActuatorId::Marker,
            channel: marker.channel,
            rest_pose: marker.rest_pose,
            active_pose: marker.active_pose,
            motion_steps: marker.motion_steps,
            hold_duration: marker.duration(),
            duration: marker.duration(),
            servo: marker.servo,
        })
        .chain(config.diverters.iter().map(|diverter| Self {
            id: ActuatorId::Diverter(diverter.category),
            channel: diverter.channel,
            rest_pose: diverter.rest_pose,
            active_pose: diverter.active_pose,
            motion_steps: diverter.motion_steps,
            hold_duration: diverter.hold_duration(),
            duration: diverter.activation_duration(),
            servo: diverter.servo,
        }))
        .collect()
    }

    /// Target pose for an activation of `kind`; marks scale the stroke by
    /// their intensity percentage.
    #[must_use]
    pub fn target_pose(&self, kind: &ActuationKind) -> f32 {
        let pose = match kind {
            ActuationKind::Mark { intensity } => {
                let ratio = if intensity.is_nan() {
                    0.0
                } else {
                    intensity.clamp(0.0, 100.0) / 100.0
                };
                (self.active_pose - self.rest_pose).mul_add(ratio, self.rest_pose)
            }
            ActuationKind::Divert(_) => self.active_pose,
        };
        self.servo.clamp_angle(pose)
    }
}

/// Pollable view of one actuator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorSnapshot {
    /// Identity.
    pub actuator_id: ActuatorId,
    /// Lifecycle state.
    pub state: ActuatorState,
    /// Last commanded pose, degrees.
    pub pose: f32,
    /// Event currently executing.
    pub active_event: Option<Uuid>,
    /// Event waiting in the pending slot.
    pub queued_event: Option<Uuid>,
    /// Start time of the most recent activation.
    pub last_fire_time: Option<Timestamp>,
    /// Completed activations.
    pub fire_count: u64,
    /// Hardware faults observed.
    pub fault_count: u32,
    /// Requests refused.
    pub rejected_count: u64,
    /// Events discarded for being too late.
    pub stale_count: u64,
    /// Recovery exhausted; a reset is required.
    pub persistent_fault: bool,
    /// Time after which the watchdog aborts the current operation.
    pub deadline: Option<Timestamp>,
}

impl ActuatorSnapshot {
    fn idle(spec: &ActuatorSpec) -> Self {
        Self {
            actuator_id: spec.id,
            state: ActuatorState::Idle,
            pose: spec.rest_pose,
            active_event: None,
            queued_event: None,
            last_fire_time: None,
            fire_count: 0,
            fault_count: 0,
            rejected_count: 0,
            stale_count: 0,
            persistent_fault: false,
            deadline: None,
        }
    }
}

type Reply = oneshot::Sender<Result<ActuatorSnapshot, ActuationError>>;

/// Requests handled by an owner task.
#[derive(Debug)]
pub(crate) enum Command {
    Execute { event: ActuationEvent, reply: Reply },
    Reset { reply: Reply },
    Shutdown,
}

/// Out-of-band requests from the watchdog.
#[derive(Debug)]
pub(crate) enum Control {
    Abort { reason: String },
}

#[derive(Debug)]
struct ActuatorHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<ActuatorSnapshot>,
}

/// Command surface over every actuator of the line.
#[derive(Debug)]
pub struct ActuatorCoordinator {
    handles: IndexMap<ActuatorId, ActuatorHandle>,
    specs: IndexMap<ActuatorId, ActuatorSpec>,
    clock: Arc<dyn Clock>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ActuatorCoordinator {
    /// Spawns one owner and one watchdog per configured actuator. Must be
    /// called inside a tokio runtime.
    #[must_use]
    pub fn spawn(
        config: &LineConfig,
        driver: Arc<dyn ActuatorDriver>,
        clock: Arc<dyn Clock>,
        telemetry: Option<LineTelemetry>,
    ) -> Self {
        let guard = IntervalGuard::new(config.actuation.command_margin());
        let settings = OwnerSettings::from_config(&config.actuation);
        let mut handles = IndexMap::new();
        let mut specs = IndexMap::new();
        let mut tasks = Vec::new();

        for spec in ActuatorSpec::from_config(config) {
            let (command_tx, command_rx) = mpsc::channel(16);
            let (control_tx, control_rx) = mpsc::channel(4);
            let (snapshot_tx, snapshot_rx) = watch::channel(ActuatorSnapshot::idle(&spec));

            let owner = ActuatorOwner::new(
                spec.clone(),
                Arc::clone(&driver),
                Arc::clone(&clock),
                guard.clone(),
                settings.clone(),
                command_rx,
                control_rx,
                snapshot_tx,
                telemetry.clone(),
            );
            tasks.push(tokio::spawn(owner.run()));
            tasks.push(tokio::spawn(watchdog::run(
                spec.id,
                snapshot_rx.clone(),
                control_tx,
                Arc::clone(&clock),
            )));

            handles.insert(
                spec.id,
                ActuatorHandle {
                    commands: command_tx,
                    snapshots: snapshot_rx,
                },
            );
            specs.insert(spec.id, spec);
        }

        Self {
            handles,
            specs,
            clock,
            tasks: Mutex::new(tasks),
        }
    }

    /// Hands an event to its actuator's owner. Accepted events execute at
    /// their `fire_at`; an event with the id of the running activation
    /// extends its hold.
    #[instrument(skip(self, event), fields(actuator = %event.actuator_id))]
    pub async fn execute(&self, event: ActuationEvent) -> Result<ActuatorSnapshot, ActuationError> {
        let actuator = event.actuator_id;
        self.request(actuator, |reply| Command::Execute { event, reply })
            .await
    }

    /// Clears a persistent fault by driving the actuator back to rest.
    pub async fn reset(&self, actuator: ActuatorId) -> Result<ActuatorSnapshot, ActuationError> {
        self.request(actuator, |reply| Command::Reset { reply }).await
    }

    /// Fires the marker now for `duration` at `intensity` percent.
    pub async fn mark_test_fire(
        &self,
        duration: Duration,
        intensity: f32,
    ) -> Result<ActuatorSnapshot, ActuationError> {
        let intensity = if intensity.is_nan() {
            0.0
        } else {
            intensity.clamp(0.0, 100.0)
        };
        let event = ActuationEvent::new(
            ActuatorId::Marker,
            None,
            self.clock.now(),
            ActuationKind::Mark { intensity },
            duration,
            duration,
        );
        self.execute(event).await
    }

    /// Opens the diverter of `category` now with its configured timings.
    pub async fn divert_test_fire(
        &self,
        category: Category,
    ) -> Result<ActuatorSnapshot, ActuationError> {
        let actuator = ActuatorId::Diverter(category);
        let spec = self
            .specs
            .get(&actuator)
            .ok_or(ActuationError::UnknownActuator(actuator))?;
        let event = ActuationEvent::new(
            actuator,
            None,
            self.clock.now(),
            ActuationKind::Divert(category),
            spec.duration,
            spec.hold_duration,
        );
        self.execute(event).await
    }

    /// Latest snapshot of one actuator.
    pub fn snapshot(&self, actuator: ActuatorId) -> Result<ActuatorSnapshot, ActuationError> {
        self.handles
            .get(&actuator)
            .map(|handle| handle.snapshots.borrow().clone())
            .ok_or(ActuationError::UnknownActuator(actuator))
    }

    /// Latest snapshot of every actuator, marker first.
    #[must_use]
    pub fn snapshots(&self) -> Vec<ActuatorSnapshot> {
        self.handles
            .values()
            .map(|handle| handle.snapshots.borrow().clone())
            .collect()
    }

    /// Change feed of one actuator's snapshot.
    #[must_use]
    pub fn subscribe(&self, actuator: ActuatorId) -> Option<watch::Receiver<ActuatorSnapshot>> {
        self.handles
            .get(&actuator)
            .map(|handle| handle.snapshots.clone())
    }

    /// Configured actuators.
    #[must_use]
    pub fn specs(&self) -> Vec<ActuatorSpec> {
        self.specs.values().cloned().collect()
    }

    /// Parks every actuator at rest and waits for the tasks to finish.
    pub async fn shutdown(&self) {
        for handle in self.handles.values() {
            let _ = handle.commands.send(Command::Shutdown).await;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn request(
        &self,
        actuator: ActuatorId,
        build: impl FnOnce(Reply) -> Command + Send,
    ) -> Result<ActuatorSnapshot, ActuationError> {
        let handle = self
            .handles
            .get(&actuator)
            .ok_or(ActuationError::UnknownActuator(actuator))?;
        let (reply, response) = oneshot::channel();
        handle
            .commands
            .send(build(reply))
            .await
            .map_err(|_| ActuationError::ChannelClosed(actuator))?;
        response
            .await
            .map_err(|_| ActuationError::ChannelClosed(actuator))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimulatedActuatorDriver;
    use sortline_core::TokioClock;

    struct Rig {
        coordinator: ActuatorCoordinator,
        driver: Arc<SimulatedActuatorDriver>,
        clock: Arc<TokioClock>,
    }

    fn rig() -> Rig {
        let driver = Arc::new(SimulatedActuatorDriver::new());
        let clock = Arc::new(TokioClock::new());
        let coordinator = ActuatorCoordinator::spawn(
            &LineConfig::default(),
            driver.clone(),
            clock.clone(),
            None,
        );
        Rig {
            coordinator,
            driver,
            clock,
        }
    }

    const APPLE: ActuatorId = ActuatorId::Diverter(Category::Apple);
    const APPLE_CHANNEL: u8 = 12;

    fn divert_now(clock: &TokioClock, hold_ms: u64) -> ActuationEvent {
        ActuationEvent::new(
            APPLE,
            Some(1),
            clock.now(),
            ActuationKind::Divert(Category::Apple),
            Duration::from_millis(hold_ms),
            Duration::from_millis(hold_ms),
        )
    }

    async fn wait_for(
        coordinator: &ActuatorCoordinator,
        actuator: ActuatorId,
        predicate: impl Fn(&ActuatorSnapshot) -> bool,
    ) -> ActuatorSnapshot {
        let mut feed = coordinator.subscribe(actuator).unwrap();
        loop {
            let snapshot = feed.borrow_and_update().clone();
            if predicate(&snapshot) {
                return snapshot;
            }
            feed.changed().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_full_profile_and_returns_to_rest() {
        let rig = rig();
        let accepted = rig
            .coordinator
            .execute(divert_now(&rig.clock, 1_500))
            .await
            .unwrap();
        assert!(accepted.queued_event.is_some() || accepted.active_event.is_some());

        let done = wait_for(&rig.coordinator, APPLE, |s| s.fire_count == 1).await;
        assert_eq!(done.state, ActuatorState::Idle);
        assert!((done.pose - 90.0).abs() < 1e-3);

        let history = rig.driver.history_for(APPLE_CHANNEL);
        assert_eq!(history.len(), 40);
        let lowest = history
            .iter()
            .filter_map(|c| c.angle)
            .fold(f32::MAX, f32::min);
        assert!(lowest.abs() < 1e-3);
        // 19 step gaps each way at 20 ms plus the 1.5 s hold.
        assert!(rig.clock.now().as_secs() >= 2.26 - 1e-6);
        rig.coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn third_concurrent_request_is_rejected() {
        let rig = rig();
        rig.coordinator
            .execute(divert_now(&rig.clock, 1_500))
            .await
            .unwrap();
        wait_for(&rig.coordinator, APPLE, |s| s.active_event.is_some()).await;
        rig.coordinator
            .execute(divert_now(&rig.clock, 1_500))
            .await
            .unwrap();
        let err = rig
            .coordinator
            .execute(divert_now(&rig.clock, 1_500))
            .await
            .unwrap_err();
        assert_eq!(err, ActuationError::Busy(APPLE));
        assert_eq!(rig.coordinator.snapshot(APPLE).unwrap().rejected_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_pending_event_is_discarded() {
        let rig = rig();
        rig.coordinator
            .execute(divert_now(&rig.clock, 1_500))
            .await
            .unwrap();
        wait_for(&rig.coordinator, APPLE, |s| s.active_event.is_some()).await;
        rig.coordinator
            .execute(divert_now(&rig.clock, 1_500))
            .await
            .unwrap();
        let done = wait_for(&rig.coordinator, APPLE, |s| s.stale_count == 1).await;
        assert_eq!(done.fire_count, 1);
        assert_eq!(done.state, ActuatorState::Idle);
        assert_eq!(rig.driver.history_for(APPLE_CHANNEL).len(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn superseding_event_extends_hold() {
        let rig = rig();
        let event = divert_now(&rig.clock, 1_500);
        let start = event.fire_at;
        rig.coordinator.execute(event.clone()).await.unwrap();
        wait_for(&rig.coordinator, APPLE, |s| s.state == ActuatorState::Holding).await;

        let mut longer = event;
        longer.hold_duration = Duration::from_millis(2_500);
        rig.coordinator.execute(longer).await.unwrap();

        wait_for(&rig.coordinator, APPLE, |s| s.fire_count == 1).await;
        let elapsed = rig.clock.now().saturating_since(start);
        assert!(elapsed >= Duration::from_millis(2_500 + 2 * 19 * 20));
        assert_eq!(rig.coordinator.snapshot(APPLE).unwrap().rejected_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_fault_recovers() {
        let rig = rig();
        rig.driver.fail_next(APPLE_CHANNEL, 1);
        rig.coordinator
            .execute(divert_now(&rig.clock, 1_500))
            .await
            .unwrap();
        let snapshot = wait_for(&rig.coordinator, APPLE, |s| {
            s.fault_count == 1 && s.state == ActuatorState::Idle
        })
        .await;
        assert!(!snapshot.persistent_fault);
        assert_eq!(snapshot.fire_count, 0);
        assert_eq!(rig.driver.last_pose(APPLE_CHANNEL), Some(90.0));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_recovery_requires_reset() {
        let rig = rig();
        rig.driver.fail_next(APPLE_CHANNEL, 10);
        rig.coordinator
            .execute(divert_now(&rig.clock, 1_500))
            .await
            .unwrap();
        wait_for(&rig.coordinator, APPLE, |s| s.persistent_fault).await;

        let err = rig
            .coordinator
            .execute(divert_now(&rig.clock, 1_500))
            .await
            .unwrap_err();
        assert_eq!(err, ActuationError::Faulted(APPLE));
        assert!(matches!(
            rig.coordinator.reset(APPLE).await,
            Err(ActuationError::Hardware { .. })
        ));

        rig.driver.fail_next(APPLE_CHANNEL, 0);
        let snapshot = rig.coordinator.reset(APPLE).await.unwrap();
        assert!(!snapshot.persistent_fault);
        assert_eq!(snapshot.state, ActuatorState::Idle);
        rig.coordinator
            .execute(divert_now(&rig.clock, 1_500))
            .await
            .unwrap();
        wait_for(&rig.coordinator, APPLE, |s| s.fire_count == 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_aborts_unresponsive_actuator() {
        let rig = rig();
        rig.driver.stick(APPLE_CHANNEL);
        rig.coordinator
            .execute(divert_now(&rig.clock, 1_500))
            .await
            .unwrap();
        let snapshot = wait_for(&rig.coordinator, APPLE, |s| s.persistent_fault).await;
        assert_eq!(snapshot.state, ActuatorState::Faulted);
        assert!(snapshot.fault_count >= 1);
        assert!(snapshot.deadline.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn different_actuators_start_staggered() {
        let rig = rig();
        let now = rig.clock.now();
        let pear = ActuatorId::Diverter(Category::Pear);
        rig.coordinator
            .execute(divert_now(&rig.clock, 1_500))
            .await
            .unwrap();
        rig.coordinator
            .execute(ActuationEvent::new(
                pear,
                Some(2),
                now,
                ActuationKind::Divert(Category::Pear),
                Duration::from_millis(1_500),
                Duration::from_millis(1_500),
            ))
            .await
            .unwrap();
        let apple = wait_for(&rig.coordinator, APPLE, |s| s.last_fire_time.is_some()).await;
        let pear = wait_for(&rig.coordinator, pear, |s| s.last_fire_time.is_some()).await;
        let a = apple.last_fire_time.unwrap().as_secs();
        let p = pear.last_fire_time.unwrap().as_secs();
        assert!((a - p).abs() >= 0.05 - 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_use_intensity_and_config() {
        let rig = rig();
        rig.coordinator
            .mark_test_fire(Duration::from_millis(500), 50.0)
            .await
            .unwrap();
        wait_for(&rig.coordinator, ActuatorId::Marker, |s| s.fire_count == 1).await;
        let peak = rig
            .driver
            .history_for(18)
            .iter()
            .filter_map(|c| c.angle)
            .fold(f32::MIN, f32::max);
        assert!((peak - 45.0).abs() < 1e-3);

        rig.coordinator
            .divert_test_fire(Category::Lemon)
            .await
            .unwrap();
        let lemon = ActuatorId::Diverter(Category::Lemon);
        wait_for(&rig.coordinator, lemon, |s| s.fire_count == 1).await;
        assert_eq!(
            rig.coordinator.divert_test_fire(Category::Unknown).await,
            Err(ActuationError::UnknownActuator(ActuatorId::Diverter(
                Category::Unknown
            )))
        );
        assert_eq!(rig.coordinator.snapshots().len(), 4);
    }
}
