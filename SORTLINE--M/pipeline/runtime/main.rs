//! Spawns the per-domain tasks of a line and exposes the operator command
//! surface over them.

mod classify;
mod schedule;

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use sortline_actuation::{
    ActuationScheduler, ActuatorCoordinator, ActuatorDriver, ActuatorSnapshot,
};
use sortline_consensus::{ClassifierStats, TemporalConsensusClassifier};
use sortline_conveyor::{BeltSnapshot, ConveyorSafetyController, RelayDriver};
use sortline_core::{
    ActuatorId, Category, Clock, Direction, LineConfig, LineTelemetry, Timestamp,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{error::PipelineError, source::DetectionSource};

const DETECTION_BUFFER: usize = 256;
const DECISION_BUFFER: usize = 64;

/// Hardware outputs of one line.
#[derive(Debug, Clone)]
pub struct LineDrivers {
    /// Servo bank for the marker and diverters.
    pub actuators: Arc<dyn ActuatorDriver>,
    /// Belt relay board.
    pub relays: Arc<dyn RelayDriver>,
}

impl LineDrivers {
    /// Bundles the two output stages.
    #[must_use]
    pub fn new(actuators: Arc<dyn ActuatorDriver>, relays: Arc<dyn RelayDriver>) -> Self {
        Self { actuators, relays }
    }
}

/// Progress of the scheduling task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// Events planned and not yet due.
    pub pending: usize,
    /// Decisions waiting for the belt to run forward.
    pub deferred: usize,
    /// Events handed to the coordinator.
    pub dispatched: u64,
}

/// Everything an operator can see about the line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineStatus {
    /// Line time of the snapshot.
    pub at: Timestamp,
    /// Belt drive.
    pub belt: BeltSnapshot,
    /// Marker first, then diverters.
    pub actuators: Vec<ActuatorSnapshot>,
    /// Classifier totals.
    pub classifier: ClassifierStats,
    /// Scheduler progress.
    pub scheduler: SchedulerStatus,
}

/// Cloneable command surface of a running line.
#[derive(Debug, Clone)]
pub struct LineControl {
    coordinator: Arc<ActuatorCoordinator>,
    conveyor: Arc<ConveyorSafetyController>,
    classifier: watch::Receiver<ClassifierStats>,
    scheduler: watch::Receiver<SchedulerStatus>,
    clock: Arc<dyn Clock>,
}

impl LineControl {
    /// Runs the belt toward the actuators.
    pub async fn start_forward(&self) -> Result<BeltSnapshot, PipelineError> {
        Ok(self.conveyor.start(Direction::Forward).await?)
    }

    /// Runs the belt away from the actuators.
    pub async fn start_backward(&self) -> Result<BeltSnapshot, PipelineError> {
        Ok(self.conveyor.start(Direction::Backward).await?)
    }

    /// Stops the belt.
    pub async fn stop(&self) -> Result<BeltSnapshot, PipelineError> {
        Ok(self.conveyor.stop().await?)
    }

    /// Stops the belt ahead of anything else it is doing.
    pub async fn emergency_stop(&self) -> Result<BeltSnapshot, PipelineError> {
        Ok(self.conveyor.emergency_stop().await?)
    }

    /// Keeps the belt's safety timer from expiring.
    pub async fn heartbeat(&self) -> Result<BeltSnapshot, PipelineError> {
        Ok(self.conveyor.heartbeat().await?)
    }

    /// Clears a terminal belt fault.
    pub async fn reset_belt(&self) -> Result<BeltSnapshot, PipelineError> {
        Ok(self.conveyor.reset().await?)
    }

    /// Clears a persistent actuator fault.
    pub async fn reset_actuator(
        &self,
        actuator: ActuatorId,
    ) -> Result<ActuatorSnapshot, PipelineError> {
        Ok(self.coordinator.reset(actuator).await?)
    }

    /// Fires the marker now.
    pub async fn mark_actuator_test_fire(
        &self,
        duration: Duration,
        intensity: f32,
    ) -> Result<ActuatorSnapshot, PipelineError> {
        Ok(self.coordinator.mark_test_fire(duration, intensity).await?)
    }

    /// Opens one category's diverter now.
    pub async fn divert_test_fire(
        &self,
        category: Category,
    ) -> Result<ActuatorSnapshot, PipelineError> {
        Ok(self.coordinator.divert_test_fire(category).await?)
    }

    /// Live snapshots of one actuator.
    #[must_use]
    pub fn subscribe_actuator(
        &self,
        actuator: ActuatorId,
    ) -> Option<watch::Receiver<ActuatorSnapshot>> {
        self.coordinator.subscribe(actuator)
    }

    /// Live snapshots of the belt.
    #[must_use]
    pub fn subscribe_belt(&self) -> watch::Receiver<BeltSnapshot> {
        self.conveyor.subscribe()
    }

    /// Snapshot of every component.
    #[must_use]
    pub fn status(&self) -> LineStatus {
        LineStatus {
            at: self.clock.now(),
            belt: self.conveyor.snapshot(),
            actuators: self.coordinator.snapshots(),
            classifier: self.classifier.borrow().clone(),
            scheduler: *self.scheduler.borrow(),
        }
    }
}

/// A running line: one task per control domain connected by bounded channels.
#[derive(Debug)]
pub struct LineRuntime {
    control: LineControl,
    shutdown: watch::Sender<bool>,
    pipeline: Vec<(&'static str, JoinHandle<()>)>,
}

impl LineRuntime {
    /// Validates `config` and spawns the source pump, classifier, scheduler,
    /// actuator owners and belt controller. Must be called inside a tokio
    /// runtime.
    pub fn spawn(
        config: &LineConfig,
        drivers: LineDrivers,
        clock: Arc<dyn Clock>,
        telemetry: Option<LineTelemetry>,
        source: Box<dyn DetectionSource>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let scoped = |component: &str| {
            telemetry
                .as_ref()
                .map(|tel| tel.for_component(component))
        };

        let coordinator = Arc::new(ActuatorCoordinator::spawn(
            config,
            drivers.actuators,
            Arc::clone(&clock),
            scoped("actuators"),
        ));
        let conveyor = Arc::new(ConveyorSafetyController::spawn(
            &config.belt,
            drivers.relays,
            Arc::clone(&clock),
            scoped("belt"),
        ));

        let mut classifier = TemporalConsensusClassifier::new(config.consensus.clone());
        let mut scheduler = ActuationScheduler::new(config);
        if let Some(tel) = scoped("consensus") {
            classifier = classifier.with_telemetry(tel);
        }
        if let Some(tel) = scoped("scheduler") {
            scheduler = scheduler.with_telemetry(tel);
        }

        let (detection_tx, detection_rx) = mpsc::channel(DETECTION_BUFFER);
        let (decision_tx, decision_rx) = mpsc::channel(DECISION_BUFFER);
        let (stats_tx, stats_rx) = watch::channel(classifier.stats());
        let (scheduler_tx, scheduler_rx) = watch::channel(SchedulerStatus::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pipeline = vec![
            (
                "source",
                tokio::spawn(classify::pump(source, detection_tx, shutdown_rx.clone())),
            ),
            (
                "consensus",
                tokio::spawn(classify::run(
                    classifier,
                    detection_rx,
                    decision_tx,
                    stats_tx,
                    Arc::clone(&clock),
                    shutdown_rx.clone(),
                    scoped("consensus"),
                )),
            ),
            (
                "scheduler",
                tokio::spawn(schedule::run(
                    scheduler,
                    decision_rx,
                    Arc::clone(&coordinator),
                    Arc::clone(&conveyor),
                    scheduler_tx,
                    Arc::clone(&clock),
                    shutdown_rx,
                    scoped("scheduler"),
                )),
            ),
        ];

        Ok(Self {
            control: LineControl {
                coordinator,
                conveyor,
                classifier: stats_rx,
                scheduler: scheduler_rx,
                clock,
            },
            shutdown: shutdown_tx,
            pipeline,
        })
    }

    /// Command surface; cheap to clone.
    #[must_use]
    pub fn control(&self) -> LineControl {
        self.control.clone()
    }

    /// Waits until the source is exhausted, every track is decided, every
    /// event dispatched and every actuator back at rest.
    pub async fn drain(&mut self) -> Result<LineStatus, PipelineError> {
        for (name, task) in self.pipeline.drain(..) {
            task.await.map_err(|_| PipelineError::TaskFailed(name))?;
        }
        for snapshot in self.control.coordinator.snapshots() {
            let Some(mut feed) = self.control.coordinator.subscribe(snapshot.actuator_id) else {
                continue;
            };
            loop {
                let settled = {
                    let current = feed.borrow_and_update();
                    !current.state.is_busy() && current.queued_event.is_none()
                };
                if settled {
                    break;
                }
                if feed.changed().await.is_err() {
                    break;
                }
            }
        }
        Ok(self.control.status())
    }

    /// Stops every task, parks the actuators and releases the belt.
    pub async fn shutdown(mut self) -> LineStatus {
        let _ = self.shutdown.send(true);
        for (name, task) in self.pipeline.drain(..) {
            if task.await.is_err() {
                tracing::warn!(task = name, "line task ended abnormally");
            }
        }
        self.control.coordinator.shutdown().await;
        self.control.conveyor.shutdown().await;
        self.control.status()
    }
}
