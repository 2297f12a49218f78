use std::{future::Future, sync::Arc, time::Duration};

use serde_json::{json, Value};
use shared_logging::LogLevel;
use sortline_core::{
    BeltConfig, BeltDirection, BeltState, Clock, Direction, HardwareError, LineTelemetry,
    RelayCommand, RetryOutcome, RetryPolicy, Timestamp,
};
use tokio::sync::{mpsc, watch};

use super::{BeltCommand, BeltError, BeltPhase, BeltSnapshot, Interrupt, SafetyTrip};
use crate::relay::{RelayDriver, RelayPair};

/// Everything needed to write the relays, detached from the owner so relay
/// sequences can be raced against interrupts.
#[derive(Debug, Clone)]
struct RelayIo {
    driver: Arc<dyn RelayDriver>,
    pair: RelayPair,
    clock: Arc<dyn Clock>,
    settle: Duration,
}

impl RelayIo {
    async fn apply(&self, command: RelayCommand) -> Result<(), HardwareError> {
        self.pair.apply(self.driver.as_ref(), command).await
    }

    /// Release, wait for the settle pause (and any pending reversal pause),
    /// then assert `target`. `None` only releases.
    async fn sequence(
        &self,
        target: Option<Direction>,
        not_before: Option<Timestamp>,
    ) -> Result<(), HardwareError> {
        self.apply(RelayCommand::Released).await?;
        let Some(direction) = target else {
            return Ok(());
        };
        let settled = self.clock.now() + self.settle;
        let ready = not_before.map_or(settled, |at| settled.latest(at));
        self.clock.sleep_until(ready).await;
        self.apply(RelayCommand::drive(direction)).await
    }
}

/// Sole owner of the belt relays.
#[derive(Debug)]
pub struct BeltOwner {
    io: RelayIo,
    policy: RetryPolicy,
    safety_timeout: Duration,
    change_delay: Duration,
    commands: mpsc::Receiver<BeltCommand>,
    interrupts: mpsc::Receiver<Interrupt>,
    snapshots: watch::Sender<BeltSnapshot>,
    telemetry: Option<LineTelemetry>,
    status: BeltSnapshot,
    last_driven: Option<Direction>,
    released_at: Option<Timestamp>,
    stopping: bool,
}

impl BeltOwner {
    pub fn new(
        config: &BeltConfig,
        driver: Arc<dyn RelayDriver>,
        clock: Arc<dyn Clock>,
        commands: mpsc::Receiver<BeltCommand>,
        interrupts: mpsc::Receiver<Interrupt>,
        snapshots: watch::Sender<BeltSnapshot>,
        telemetry: Option<LineTelemetry>,
    ) -> Self {
        Self {
            io: RelayIo {
                driver,
                pair: RelayPair::from_config(config),
                clock,
                settle: config.settle_delay(),
            },
            policy: config.recovery_policy(),
            safety_timeout: config.safety_timeout(),
            change_delay: config.direction_change_delay(),
            commands,
            interrupts,
            snapshots,
            telemetry,
            status: BeltSnapshot::default(),
            last_driven: None,
            released_at: None,
            stopping: false,
        }
    }

    pub async fn run(mut self) {
        while !self.stopping {
            tokio::select! {
                biased;
                Some(interrupt) = self.interrupts.recv() => {
                    self.on_interrupt(interrupt).await;
                }
                command = self.commands.recv() => match command {
                    Some(BeltCommand::Shutdown) | None => self.stopping = true,
                    Some(command) => self.on_command(command).await,
                },
            }
        }
        if self.io.apply(RelayCommand::Released).await.is_ok() {
            self.set_relays(RelayCommand::Released, self.io.clock.now());
        }
        self.status.safety_deadline = None;
        self.publish();
    }

    async fn on_command(&mut self, command: BeltCommand) {
        match command {
            BeltCommand::Start { direction, reply } => {
                let result = self.start(direction).await;
                let _ = reply.send(result);
            }
            BeltCommand::Stop { reply } => {
                let result = self.stop().await;
                let _ = reply.send(result);
            }
            BeltCommand::Heartbeat { reply } => {
                self.touch(self.io.clock.now());
                let _ = reply.send(Ok(self.publish()));
            }
            BeltCommand::Reset { reply } => {
                let result = self.reset().await;
                let _ = reply.send(result);
            }
            BeltCommand::Shutdown => self.stopping = true,
        }
    }

    /// Records a command and re-arms the safety timer while the belt moves.
    fn touch(&mut self, now: Timestamp) {
        self.status.state.last_command_at = Some(now);
        if matches!(
            self.status.phase,
            BeltPhase::Starting(_) | BeltPhase::Running(_)
        ) {
            self.status.safety_deadline = Some(now + self.safety_timeout);
        }
    }

    async fn start(&mut self, direction: Direction) -> Result<BeltSnapshot, BeltError> {
        if self.status.phase == BeltPhase::Faulted {
            return Err(BeltError::Faulted);
        }
        let now = self.io.clock.now();
        if self.status.phase == BeltPhase::Running(direction) {
            self.touch(now);
            return Ok(self.publish());
        }

        self.set_relays(RelayCommand::Released, now);
        let not_before = if self.last_driven == Some(direction.opposite()) {
            self.released_at
                .map(|released| released + self.change_delay)
        } else {
            None
        };
        self.status.phase = BeltPhase::Starting(direction);
        self.status.emergency_stopped = false;
        self.touch(now);
        self.publish();

        self.drive(Some(direction), not_before).await?;

        self.set_relays(RelayCommand::drive(direction), self.io.clock.now());
        self.status.phase = BeltPhase::Running(direction);
        self.last_driven = Some(direction);
        self.released_at = None;
        self.log(
            LogLevel::Info,
            "belt.started",
            json!({ "direction": direction }),
        );
        Ok(self.publish())
    }

    async fn stop(&mut self) -> Result<BeltSnapshot, BeltError> {
        if self.status.phase == BeltPhase::Faulted {
            return Err(BeltError::Faulted);
        }
        let now = self.io.clock.now();
        self.touch(now);
        self.drive(None, None).await?;
        self.set_relays(RelayCommand::Released, self.io.clock.now());
        self.status.phase = BeltPhase::Stopped;
        self.status.safety_deadline = None;
        self.log(LogLevel::Info, "belt.stopped", json!({}));
        Ok(self.publish())
    }

    async fn reset(&mut self) -> Result<BeltSnapshot, BeltError> {
        if self.status.phase != BeltPhase::Faulted {
            return Ok(self.publish());
        }
        let now = self.io.clock.now();
        self.status.state.last_command_at = Some(now);
        match self.io.apply(RelayCommand::Released).await {
            Ok(()) => {
                self.set_relays(RelayCommand::Released, now);
                self.status.phase = BeltPhase::Stopped;
                self.log(LogLevel::Info, "belt.reset", json!({}));
                Ok(self.publish())
            }
            Err(err) => {
                self.status.state.fault_count += 1;
                self.log(
                    LogLevel::Error,
                    "belt.reset.failed",
                    json!({ "error": err.to_string() }),
                );
                self.publish();
                Err(BeltError::Hardware(err))
            }
        }
    }

    /// Runs one relay sequence, retrying it under the recovery policy.
    async fn drive(
        &mut self,
        target: Option<Direction>,
        not_before: Option<Timestamp>,
    ) -> Result<(), BeltError> {
        let io = self.io.clone();
        let error = match self.preemptible(io.sequence(target, not_before)).await {
            Some(Ok(())) => return Ok(()),
            Some(Err(err)) => err,
            None => return Err(BeltError::Preempted),
        };

        self.status.state.fault_count += 1;
        self.log(
            LogLevel::Warn,
            "belt.fault",
            json!({
                "error": error.to_string(),
                "target": target,
                "fault_count": self.status.state.fault_count,
            }),
        );
        self.publish();

        let policy = self.policy;
        let retries = async {
            policy
                .run(io.clock.as_ref(), |_| io.sequence(target, not_before))
                .await
        };
        match self.preemptible(retries).await {
            Some(RetryOutcome::Recovered { attempts, .. }) => {
                self.log(
                    LogLevel::Warn,
                    "belt.fault.recovered",
                    json!({ "attempts": attempts }),
                );
                Ok(())
            }
            Some(RetryOutcome::Exhausted {
                attempts,
                last_error,
            }) => {
                self.terminal_fault(attempts, &last_error).await;
                Err(BeltError::Hardware(last_error))
            }
            None => Err(BeltError::Preempted),
        }
    }

    /// Polls `work` while serving interrupts. `None` when an interrupt
    /// stopped the belt and `work` was abandoned.
    async fn preemptible<T>(&mut self, work: impl Future<Output = T>) -> Option<T> {
        tokio::pin!(work);
        loop {
            tokio::select! {
                biased;
                Some(interrupt) = self.interrupts.recv() => {
                    if self.on_interrupt(interrupt).await {
                        return None;
                    }
                }
                output = &mut work => return Some(output),
            }
        }
    }

    /// Handles an interrupt; `true` when the belt was stopped by it.
    async fn on_interrupt(&mut self, interrupt: Interrupt) -> bool {
        match interrupt {
            Interrupt::EmergencyStop { reply } => {
                self.release_once("emergency stop").await;
                self.status.emergency_stopped = true;
                self.log(LogLevel::Warn, "belt.emergency_stop", json!({}));
                self.emit("belt.emergency_stop", json!({}));
                let _ = reply.send(self.publish());
                true
            }
            Interrupt::SafetyTrip { deadline } => {
                if self.status.safety_deadline != Some(deadline) {
                    return false;
                }
                let reason = format!(
                    "no command for {:.1} s",
                    self.safety_timeout.as_secs_f64()
                );
                self.release_once(&reason).await;
                let at = self.io.clock.now();
                self.status.last_trip = Some(SafetyTrip {
                    at,
                    reason: reason.clone(),
                });
                let payload = json!({ "reason": reason, "deadline": deadline.as_secs() });
                self.log(LogLevel::Warn, "belt.safety.trip", payload.clone());
                self.emit("belt.safety.trip", payload);
                self.publish();
                true
            }
        }
    }

    /// Single release attempt used by stops that must never be retried.
    async fn release_once(&mut self, cause: &str) {
        let now = self.io.clock.now();
        if self.status.state.direction != BeltDirection::Stopped {
            self.released_at = Some(now);
        }
        self.status.safety_deadline = None;
        match self.io.apply(RelayCommand::Released).await {
            Ok(()) => {
                self.set_relays(RelayCommand::Released, now);
                if self.status.phase != BeltPhase::Faulted {
                    self.status.phase = BeltPhase::Stopped;
                }
            }
            Err(err) => {
                self.status.state.fault_count += 1;
                self.status.phase = BeltPhase::Faulted;
                self.log(
                    LogLevel::Error,
                    "belt.release.failed",
                    json!({ "cause": cause, "error": err.to_string() }),
                );
            }
        }
    }

    async fn terminal_fault(&mut self, attempts: u32, error: &HardwareError) {
        let now = self.io.clock.now();
        let _ = self.io.apply(RelayCommand::Released).await;
        self.set_relays(RelayCommand::Released, now);
        self.status.phase = BeltPhase::Faulted;
        self.status.safety_deadline = None;
        let payload = json!({
            "attempts": attempts,
            "error": error.to_string(),
            "fault_count": self.status.state.fault_count,
        });
        self.log(LogLevel::Error, "belt.fault.terminal", payload.clone());
        self.emit("belt.fault.terminal", payload);
        self.publish();
    }

    fn set_relays(&mut self, command: RelayCommand, now: Timestamp) {
        let was_moving = self.status.state.direction != BeltDirection::Stopped;
        self.status.state.apply_relays(command);
        if was_moving && command == RelayCommand::Released {
            self.released_at = Some(now);
        }
    }

    fn publish(&self) -> BeltSnapshot {
        let snapshot = self.status.clone().at(self.io.clock.now());
        self.snapshots.send_replace(snapshot.clone());
        snapshot
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, with_state(metadata, &self.status.state));
        }
    }

    fn emit(&self, event_type: &str, payload: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(event_type, with_state(payload, &self.status.state));
        }
    }
}

fn with_state(mut value: Value, state: &BeltState) -> Value {
    if let Value::Object(map) = &mut value {
        map.insert("belt_direction".into(), json!(state.direction));
        map.insert("fault_count".into(), json!(state.fault_count));
    }
    value
}
