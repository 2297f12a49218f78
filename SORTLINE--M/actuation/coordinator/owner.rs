use std::{sync::Arc, time::Duration};

use serde_json::{json, Value};
use shared_logging::LogLevel;
use sortline_core::{
    ActuationConfig, ActuationEvent, ActuatorState, Clock, HardwareError, LineTelemetry,
    RetryOutcome, RetryPolicy, Timestamp,
};
use tokio::sync::{mpsc, watch};

use super::{guard::IntervalGuard, ActuationError, ActuatorSnapshot, ActuatorSpec, Command, Control};
use crate::{driver::ActuatorDriver, motion::MotionProfile};

/// Timing knobs shared by every owner of a line.
#[derive(Debug, Clone)]
pub struct OwnerSettings {
    /// Recovery policy after a hardware fault.
    pub recovery: RetryPolicy,
    /// Oldest a pending event may be when it reaches the front.
    pub max_lateness: Duration,
    /// Spacing between interpolation steps.
    pub step_interval: Duration,
    /// Grace added to every watchdog deadline.
    pub watchdog_slack: Duration,
}

impl OwnerSettings {
    /// Settings derived from the actuation section.
    #[must_use]
    pub fn from_config(config: &ActuationConfig) -> Self {
        Self {
            recovery: config.recovery_policy(),
            max_lateness: config.max_lateness(),
            step_interval: config.step_interval(),
            watchdog_slack: config.watchdog_slack(),
        }
    }
}

#[derive(Debug)]
struct Activation {
    event: ActuationEvent,
    profile: MotionProfile,
}

/// Sole owner of one actuator's motion state. Every mutation happens on this
/// task; callers talk to it through [`Command`]s.
#[derive(Debug)]
pub struct ActuatorOwner {
    spec: ActuatorSpec,
    driver: Arc<dyn ActuatorDriver>,
    clock: Arc<dyn Clock>,
    guard: IntervalGuard,
    settings: OwnerSettings,
    commands: mpsc::Receiver<Command>,
    control: mpsc::Receiver<Control>,
    snapshots: watch::Sender<ActuatorSnapshot>,
    telemetry: Option<LineTelemetry>,
    active: Option<Activation>,
    queued: Option<ActuationEvent>,
    status: ActuatorSnapshot,
    stopping: bool,
}

async fn sleep_until_opt(clock: &dyn Clock, wake: Option<Timestamp>) {
    match wake {
        Some(deadline) => clock.sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ActuatorOwner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spec: ActuatorSpec,
        driver: Arc<dyn ActuatorDriver>,
        clock: Arc<dyn Clock>,
        guard: IntervalGuard,
        settings: OwnerSettings,
        commands: mpsc::Receiver<Command>,
        control: mpsc::Receiver<Control>,
        snapshots: watch::Sender<ActuatorSnapshot>,
        telemetry: Option<LineTelemetry>,
    ) -> Self {
        let status = snapshots.borrow().clone();
        Self {
            spec,
            driver,
            clock,
            guard,
            settings,
            commands,
            control,
            snapshots,
            telemetry,
            active: None,
            queued: None,
            status,
            stopping: false,
        }
    }

    pub async fn run(mut self) {
        while !self.stopping {
            let wake = self.next_wake();
            let clock = Arc::clone(&self.clock);
            tokio::select! {
                biased;
                Some(Control::Abort { reason }) = self.control.recv() => {
                    // Nothing is in flight between ticks; stale abort.
                    tracing::debug!(actuator = %self.spec.id, %reason, "abort ignored while idle");
                }
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => self.stopping = true,
                    Some(command) => self.on_command(command).await,
                },
                () = sleep_until_opt(clock.as_ref(), wake) => self.on_tick().await,
            }
        }
        self.park().await;
    }

    fn next_wake(&self) -> Option<Timestamp> {
        if self.status.state == ActuatorState::Faulted {
            return None;
        }
        match &self.active {
            Some(activation) => activation.profile.wake_at(),
            None => self.queued.as_ref().map(|event| event.fire_at),
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Execute { event, reply } => {
                let result = self.accept(event);
                let _ = reply.send(result);
            }
            Command::Reset { reply } => {
                let result = self.reset().await;
                let _ = reply.send(result);
            }
            Command::Shutdown => self.stopping = true,
        }
    }

    fn accept(&mut self, event: ActuationEvent) -> Result<ActuatorSnapshot, ActuationError> {
        let id = self.spec.id;
        if event.actuator_id != id {
            return Err(ActuationError::UnknownActuator(event.actuator_id));
        }
        if self.status.persistent_fault || self.status.state == ActuatorState::Faulted {
            self.status.rejected_count += 1;
            self.publish();
            return Err(ActuationError::Faulted(id));
        }

        if let Some(activation) = self.active.as_mut() {
            if activation.event.id == event.id {
                if !activation.profile.extend_hold(event.hold_duration) {
                    return Err(self.reject(&event, "return already in progress"));
                }
                let deadline = activation.profile.expected_end() + self.settings.watchdog_slack;
                let hold = activation.profile.hold();
                activation.event = event;
                self.status.deadline = Some(deadline);
                self.log(
                    LogLevel::Debug,
                    "actuator.hold.extended",
                    json!({ "hold_s": hold.as_secs_f64() }),
                );
                return Ok(self.publish());
            }
        }

        match self.queued.as_ref().map(|queued| queued.id) {
            Some(queued) if queued == event.id => {
                self.queued = Some(event);
                Ok(self.publish())
            }
            Some(_) => Err(self.reject(&event, "pending slot occupied")),
            None => {
                self.status.queued_event = Some(event.id);
                self.queued = Some(event);
                Ok(self.publish())
            }
        }
    }

    fn reject(&mut self, event: &ActuationEvent, reason: &str) -> ActuationError {
        self.status.rejected_count += 1;
        let payload = json!({
            "event_id": event.id,
            "track_id": event.track_id,
            "reason": reason,
        });
        self.log(LogLevel::Warn, "actuator.request.rejected", payload.clone());
        self.emit("actuator.request.rejected", payload);
        self.publish();
        ActuationError::Busy(self.spec.id)
    }

    async fn on_tick(&mut self) {
        let now = self.clock.now();
        if self.active.is_some() {
            self.step(now).await;
        } else if let Some(event) = self.queued.take() {
            self.status.queued_event = None;
            self.start(event, now);
        }
    }

    fn start(&mut self, event: ActuationEvent, now: Timestamp) {
        let lateness = now.saturating_since(event.fire_at);
        if lateness > self.settings.max_lateness {
            self.status.stale_count += 1;
            self.log(
                LogLevel::Warn,
                "actuator.event.stale",
                json!({
                    "event_id": event.id,
                    "track_id": event.track_id,
                    "late_ms": lateness.as_millis(),
                }),
            );
            self.publish();
            return;
        }

        let start_at = self.guard.reserve(self.spec.id, now);
        let profile = MotionProfile::new(
            start_at,
            self.spec.rest_pose,
            self.spec.target_pose(&event.kind),
            self.spec.motion_steps,
            self.settings.step_interval,
            event.hold_duration,
        );
        self.status.state = profile.state();
        self.status.active_event = Some(event.id);
        self.status.last_fire_time = Some(start_at);
        self.status.deadline = Some(profile.expected_end() + self.settings.watchdog_slack);
        self.log(
            LogLevel::Debug,
            "actuator.fire.started",
            json!({
                "event_id": event.id,
                "track_id": event.track_id,
                "start_at": start_at.as_secs(),
            }),
        );
        self.active = Some(Activation { event, profile });
        self.publish();
    }

    async fn step(&mut self, now: Timestamp) {
        let Some(step) = self
            .active
            .as_mut()
            .and_then(|activation| activation.profile.advance(now))
        else {
            return;
        };
        match self.drive(step.pose).await {
            Ok(()) => {
                self.status.pose = step.pose;
                self.status.state = step.state;
                if step.state == ActuatorState::Idle {
                    self.complete();
                }
                self.publish();
            }
            Err(err) => self.fault(err).await,
        }
    }

    fn complete(&mut self) {
        let Some(activation) = self.active.take() else {
            return;
        };
        self.status.fire_count += 1;
        self.status.active_event = None;
        self.status.deadline = None;
        let payload = json!({
            "event_id": activation.event.id,
            "track_id": activation.event.track_id,
            "kind": activation.event.kind,
            "started_at": activation.profile.started_at().as_secs(),
            "hold_s": activation.profile.hold().as_secs_f64(),
        });
        self.log(LogLevel::Info, "actuator.fire.completed", payload.clone());
        self.emit("actuator.fire.completed", payload);
    }

    /// Commands one pose, abandoning it if the watchdog aborts first.
    async fn drive(&mut self, pose: f32) -> Result<(), HardwareError> {
        let channel = self.spec.channel;
        let pulse = self.spec.servo.pulse_width_us(pose);
        let driver = Arc::clone(&self.driver);
        tokio::select! {
            biased;
            Some(Control::Abort { reason }) = self.control.recv() => {
                tracing::warn!(actuator = %self.spec.id, %reason, "pose command aborted");
                Err(HardwareError::Unresponsive(channel))
            }
            result = driver.set_pose(channel, pose, pulse) => result,
        }
    }

    async fn fault(&mut self, error: HardwareError) {
        let id = self.spec.id;
        self.status.fault_count += 1;
        self.status.state = ActuatorState::Faulted;
        self.status.active_event = None;
        self.active = None;
        if let Some(dropped) = self.queued.take() {
            self.status.queued_event = None;
            self.log(
                LogLevel::Warn,
                "actuator.event.dropped",
                json!({ "event_id": dropped.id, "track_id": dropped.track_id }),
            );
        }
        self.log(
            LogLevel::Warn,
            "actuator.fault",
            json!({ "error": error.to_string(), "fault_count": self.status.fault_count }),
        );

        let policy = self.settings.recovery;
        let budget: Duration = (0..policy.max_attempts.max(1))
            .map(|attempt| policy.delay_for(attempt))
            .sum();
        self.status.deadline = Some(self.clock.now() + budget + self.settings.watchdog_slack);
        self.publish();

        let clock = Arc::clone(&self.clock);
        let driver = Arc::clone(&self.driver);
        let channel = self.spec.channel;
        let rest = self.spec.rest_pose;
        let pulse = self.spec.servo.pulse_width_us(rest);
        let recovery = async move {
            policy
                .run(clock.as_ref(), |_| {
                    let driver = Arc::clone(&driver);
                    async move { driver.set_pose(channel, rest, pulse).await }
                })
                .await
        };
        tokio::pin!(recovery);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(Control::Abort { reason }) = self.control.recv() => {
                    break RetryOutcome::Exhausted {
                        attempts: 0,
                        last_error: HardwareError::Io { channel, reason },
                    };
                }
                command = self.commands.recv() => match command {
                    Some(Command::Execute { reply, .. }) => {
                        self.status.rejected_count += 1;
                        let _ = reply.send(Err(ActuationError::Faulted(id)));
                    }
                    Some(Command::Reset { reply }) => {
                        let _ = reply.send(Err(ActuationError::Faulted(id)));
                    }
                    Some(Command::Shutdown) | None => {
                        self.stopping = true;
                        break RetryOutcome::Exhausted {
                            attempts: 0,
                            last_error: HardwareError::NotInitialized(channel),
                        };
                    }
                },
                outcome = &mut recovery => break outcome,
            }
        };

        self.status.deadline = None;
        match outcome {
            RetryOutcome::Recovered { attempts, .. } => {
                self.status.state = ActuatorState::Idle;
                self.status.pose = rest;
                self.log(
                    LogLevel::Warn,
                    "actuator.fault.recovered",
                    json!({ "attempts": attempts }),
                );
            }
            RetryOutcome::Exhausted { .. } if self.stopping => {}
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                self.status.persistent_fault = true;
                let payload = json!({
                    "attempts": attempts,
                    "error": last_error.to_string(),
                    "fault_count": self.status.fault_count,
                });
                self.log(LogLevel::Error, "actuator.fault.persistent", payload.clone());
                self.emit("actuator.fault.persistent", payload);
            }
        }
        self.publish();
    }

    async fn reset(&mut self) -> Result<ActuatorSnapshot, ActuationError> {
        if !self.status.persistent_fault && self.status.state != ActuatorState::Faulted {
            return Ok(self.status.clone());
        }
        let rest = self.spec.rest_pose;
        self.status.deadline = Some(self.clock.now() + self.settings.watchdog_slack);
        self.publish();
        let result = self.drive(rest).await;
        self.status.deadline = None;
        match result {
            Ok(()) => {
                self.status.persistent_fault = false;
                self.status.state = ActuatorState::Idle;
                self.status.pose = rest;
                self.log(LogLevel::Info, "actuator.reset", json!({}));
                Ok(self.publish())
            }
            Err(source) => {
                self.status.fault_count += 1;
                self.log(
                    LogLevel::Error,
                    "actuator.reset.failed",
                    json!({ "error": source.to_string() }),
                );
                self.publish();
                Err(ActuationError::Hardware {
                    actuator: self.spec.id,
                    source,
                })
            }
        }
    }

    /// Returns an in-flight activation to rest before the task exits.
    async fn park(&mut self) {
        self.queued = None;
        self.status.queued_event = None;
        if self.active.take().is_some() {
            let rest = self.spec.rest_pose;
            if self.drive(rest).await.is_ok() {
                self.status.pose = rest;
                self.status.state = ActuatorState::Idle;
            }
            self.status.active_event = None;
            self.status.deadline = None;
        }
        self.publish();
    }

    fn publish(&self) -> ActuatorSnapshot {
        self.snapshots.send_replace(self.status.clone());
        self.status.clone()
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, with_actuator(metadata, &self.spec));
        }
    }

    fn emit(&self, event_type: &str, payload: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(event_type, with_actuator(payload, &self.spec));
        }
    }
}

fn with_actuator(mut value: Value, spec: &ActuatorSpec) -> Value {
    if let Value::Object(map) = &mut value {
        map.insert("actuator".into(), json!(spec.id.to_string()));
        map.insert("channel".into(), json!(spec.channel));
    }
    value
}
