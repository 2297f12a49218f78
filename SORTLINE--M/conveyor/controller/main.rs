//! Belt drive handle. The relays are only ever touched by the owner task; the
//! handle talks to it over a command channel and a priority interrupt channel.

mod owner;
mod watchdog;

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sortline_core::{
    BeltConfig, BeltKinematics, BeltState, Clock, Direction, HardwareError, LineTelemetry,
    Timestamp,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::instrument;

use crate::relay::RelayDriver;
use owner::BeltOwner;

/// Errors returned by the belt command surface.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BeltError {
    /// Recovery was exhausted earlier; `reset` is required.
    #[error("belt is faulted and requires a reset")]
    Faulted,
    /// An emergency stop or safety trip cut the command short.
    #[error("command preempted by a stop")]
    Preempted,
    /// The owner task is gone.
    #[error("belt controller has stopped")]
    ChannelClosed,
    /// Relay output failed beyond recovery.
    #[error("relay failure: {0}")]
    Hardware(#[from] HardwareError),
}

/// Lifecycle of the belt drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeltPhase {
    /// Relays released.
    Stopped,
    /// Released and settling before asserting `Direction`.
    Starting(Direction),
    /// Running in `Direction`.
    Running(Direction),
    /// Recovery exhausted; relays released until reset.
    Faulted,
}

/// Last automatic stop caused by command silence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyTrip {
    /// When the belt was stopped.
    pub at: Timestamp,
    /// Human-readable cause.
    pub reason: String,
}

/// Pollable view of the belt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeltSnapshot {
    /// Relay and direction state.
    #[serde(flatten)]
    pub state: BeltState,
    /// Lifecycle phase.
    pub phase: BeltPhase,
    /// Time at which command silence stops the belt.
    pub safety_deadline: Option<Timestamp>,
    /// Time left before the safety timer fires.
    pub safety_timeout_remaining: Option<Duration>,
    /// Most recent safety trip.
    pub last_trip: Option<SafetyTrip>,
    /// The last stop was an emergency stop.
    pub emergency_stopped: bool,
}

impl Default for BeltSnapshot {
    fn default() -> Self {
        Self {
            state: BeltState::default(),
            phase: BeltPhase::Stopped,
            safety_deadline: None,
            safety_timeout_remaining: None,
            last_trip: None,
            emergency_stopped: false,
        }
    }
}

impl BeltSnapshot {
    fn at(mut self, now: Timestamp) -> Self {
        self.safety_timeout_remaining = self
            .safety_deadline
            .map(|deadline| deadline.saturating_since(now));
        self
    }
}

type Reply = oneshot::Sender<Result<BeltSnapshot, BeltError>>;

#[derive(Debug)]
enum BeltCommand {
    Start { direction: Direction, reply: Reply },
    Stop { reply: Reply },
    Heartbeat { reply: Reply },
    Reset { reply: Reply },
    Shutdown,
}

/// Requests that preempt whatever the owner is doing.
#[derive(Debug)]
enum Interrupt {
    EmergencyStop { reply: oneshot::Sender<BeltSnapshot> },
    SafetyTrip { deadline: Timestamp },
}

/// Command surface of the belt drive.
#[derive(Debug)]
pub struct ConveyorSafetyController {
    commands: mpsc::Sender<BeltCommand>,
    interrupts: mpsc::Sender<Interrupt>,
    snapshots: watch::Receiver<BeltSnapshot>,
    clock: Arc<dyn Clock>,
    speed_mps: f64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConveyorSafetyController {
    /// Spawns the owner and the safety watchdog. Must be called inside a
    /// tokio runtime.
    #[must_use]
    pub fn spawn(
        config: &BeltConfig,
        driver: Arc<dyn RelayDriver>,
        clock: Arc<dyn Clock>,
        telemetry: Option<LineTelemetry>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (interrupt_tx, interrupt_rx) = mpsc::channel(8);
        let (snapshot_tx, snapshot_rx) = watch::channel(BeltSnapshot::default());

        let owner = BeltOwner::new(
            config,
            driver,
            Arc::clone(&clock),
            command_rx,
            interrupt_rx,
            snapshot_tx,
            telemetry,
        );
        let tasks = vec![
            tokio::spawn(owner.run()),
            tokio::spawn(watchdog::run(
                snapshot_rx.clone(),
                interrupt_tx.clone(),
                Arc::clone(&clock),
            )),
        ];

        Self {
            commands: command_tx,
            interrupts: interrupt_tx,
            snapshots: snapshot_rx,
            clock,
            speed_mps: config.speed_mps,
            tasks: Mutex::new(tasks),
        }
    }

    /// Runs the belt in `direction` after the mandatory release, settle and
    /// reversal pauses.
    #[instrument(skip(self))]
    pub async fn start(&self, direction: Direction) -> Result<BeltSnapshot, BeltError> {
        self.request(|reply| BeltCommand::Start { direction, reply })
            .await
    }

    /// Releases both relays.
    pub async fn stop(&self) -> Result<BeltSnapshot, BeltError> {
        self.request(|reply| BeltCommand::Stop { reply }).await
    }

    /// Releases both relays ahead of any queued command, cancelling the
    /// safety timer and pending recovery.
    #[instrument(skip(self))]
    pub async fn emergency_stop(&self) -> Result<BeltSnapshot, BeltError> {
        let (reply, response) = oneshot::channel();
        self.interrupts
            .send(Interrupt::EmergencyStop { reply })
            .await
            .map_err(|_| BeltError::ChannelClosed)?;
        let snapshot = response.await.map_err(|_| BeltError::ChannelClosed)?;
        Ok(snapshot.at(self.clock.now()))
    }

    /// Re-arms the safety timer without touching the relays.
    pub async fn heartbeat(&self) -> Result<BeltSnapshot, BeltError> {
        self.request(|reply| BeltCommand::Heartbeat { reply }).await
    }

    /// Clears a terminal fault by releasing the relays. Counters are kept.
    pub async fn reset(&self) -> Result<BeltSnapshot, BeltError> {
        self.request(|reply| BeltCommand::Reset { reply }).await
    }

    /// Latest snapshot with the remaining safety time computed now.
    #[must_use]
    pub fn snapshot(&self) -> BeltSnapshot {
        self.snapshots.borrow().clone().at(self.clock.now())
    }

    /// Change feed of the belt snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BeltSnapshot> {
        self.snapshots.clone()
    }

    /// Current belt kinematics at the configured nominal speed.
    #[must_use]
    pub fn kinematics(&self) -> BeltKinematics {
        self.snapshots
            .borrow()
            .state
            .kinematics(self.speed_mps, self.clock.now())
    }

    /// Releases the relays and waits for the tasks to finish.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(BeltCommand::Shutdown).await;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(Reply) -> BeltCommand + Send,
    ) -> Result<BeltSnapshot, BeltError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| BeltError::ChannelClosed)?;
        let snapshot = response.await.map_err(|_| BeltError::ChannelClosed)??;
        Ok(snapshot.at(self.clock.now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::SimulatedRelayDriver;
    use sortline_core::{BeltDirection, TokioClock};

    const FORWARD: u8 = 22;
    const BACKWARD: u8 = 23;

    struct Rig {
        belt: ConveyorSafetyController,
        driver: Arc<SimulatedRelayDriver>,
        clock: Arc<TokioClock>,
    }

    fn rig() -> Rig {
        let clock = Arc::new(TokioClock::new());
        let config = BeltConfig::default();
        let driver = Arc::new(SimulatedRelayDriver::new(clock.clone(), config.active_low));
        let belt = ConveyorSafetyController::spawn(&config, driver.clone(), clock.clone(), None);
        Rig {
            belt,
            driver,
            clock,
        }
    }

    fn secs(at: Timestamp) -> f64 {
        at.as_secs()
    }

    #[tokio::test(start_paused = true)]
    async fn start_asserts_after_settle_pause() {
        let rig = rig();
        let snapshot = rig.belt.start(Direction::Forward).await.unwrap();
        assert_eq!(snapshot.phase, BeltPhase::Running(Direction::Forward));
        assert!(snapshot.state.relay_forward && !snapshot.state.relay_backward);

        let asserted = rig.driver.assertions(FORWARD);
        assert_eq!(asserted.len(), 1);
        assert!(secs(asserted[0]) >= 0.1 - 1e-9);
        assert_eq!(rig.belt.kinematics().direction, BeltDirection::Forward);
        assert!(rig.belt.kinematics().usable_speed().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn quick_reversal_waits_direction_change_delay() {
        let rig = rig();
        let (forward, backward) = tokio::join!(rig.belt.start(Direction::Forward), async {
            rig.clock.sleep(Duration::from_millis(50)).await;
            rig.belt.start(Direction::Backward).await
        });
        forward.unwrap();
        let snapshot = backward.unwrap();
        assert_eq!(snapshot.phase, BeltPhase::Running(Direction::Backward));

        let released = rig.driver.releases(FORWARD);
        let asserted = rig.driver.assertions(BACKWARD);
        assert_eq!(released.len(), 1);
        assert_eq!(asserted.len(), 1);
        assert!(secs(asserted[0]) - secs(released[0]) >= 0.5 - 1e-9);
        assert_eq!(rig.driver.peak_asserted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_trips_safety_stop_without_fault() {
        let rig = rig();
        rig.belt.start(Direction::Forward).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        let snapshot = rig.belt.snapshot();
        assert_eq!(snapshot.phase, BeltPhase::Stopped);
        assert_eq!(snapshot.state.fault_count, 0);
        assert!(!snapshot.state.relay_forward);
        assert!(snapshot.last_trip.is_some());
        assert!(snapshot.safety_timeout_remaining.is_none());
        assert!(!rig.driver.is_asserted(FORWARD));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_belt_running() {
        let rig = rig();
        rig.belt.start(Direction::Forward).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        rig.belt.heartbeat().await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let snapshot = rig.belt.snapshot();
        assert_eq!(snapshot.phase, BeltPhase::Running(Direction::Forward));
        let remaining = snapshot.safety_timeout_remaining.unwrap();
        assert!(remaining > Duration::from_secs(3) && remaining < Duration::from_millis(4_100));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_relay_fault_recovers() {
        let rig = rig();
        rig.driver.fail_next(1);
        let snapshot = rig.belt.start(Direction::Forward).await.unwrap();
        assert_eq!(snapshot.phase, BeltPhase::Running(Direction::Forward));
        assert_eq!(snapshot.state.fault_count, 1);
        assert!(rig.driver.is_asserted(FORWARD));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_recovery_is_terminal_until_reset() {
        let rig = rig();
        rig.driver.fail_next(100);
        assert!(matches!(
            rig.belt.start(Direction::Forward).await,
            Err(BeltError::Hardware(_))
        ));
        assert_eq!(rig.belt.snapshot().phase, BeltPhase::Faulted);
        assert_eq!(
            rig.belt.start(Direction::Forward).await,
            Err(BeltError::Faulted)
        );

        rig.driver.fail_next(0);
        let snapshot = rig.belt.reset().await.unwrap();
        assert_eq!(snapshot.phase, BeltPhase::Stopped);
        assert_eq!(snapshot.state.fault_count, 1);
        rig.belt.start(Direction::Forward).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_cancels_pending_recovery() {
        let rig = rig();
        rig.driver.fail_next(1);
        let (start, stop) = tokio::join!(rig.belt.start(Direction::Forward), async {
            rig.clock.sleep(Duration::from_millis(50)).await;
            rig.belt.emergency_stop().await
        });
        assert_eq!(start, Err(BeltError::Preempted));
        let snapshot = stop.unwrap();
        assert!(snapshot.emergency_stopped);
        assert_eq!(snapshot.phase, BeltPhase::Stopped);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rig.driver.assertions(FORWARD).is_empty());
        assert_eq!(rig.driver.peak_asserted(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_releases_running_belt() {
        let rig = rig();
        rig.belt.start(Direction::Backward).await.unwrap();
        let snapshot = rig.belt.emergency_stop().await.unwrap();
        assert_eq!(snapshot.state.direction, BeltDirection::Stopped);
        assert!(!snapshot.state.relay_backward);
        assert!(snapshot.safety_deadline.is_none());
        assert!(!rig.driver.is_asserted(BACKWARD));

        let snapshot = rig.belt.stop().await.unwrap();
        assert_eq!(snapshot.phase, BeltPhase::Stopped);
        rig.belt.shutdown().await;
    }
}
