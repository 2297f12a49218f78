use std::sync::Arc;

use serde_json::json;
use shared_logging::LogLevel;
use sortline_actuation::{ActuationScheduler, ActuatorCoordinator};
use sortline_conveyor::ConveyorSafetyController;
use sortline_core::{ActuationEvent, ClassificationDecision, Clock, LineTelemetry, Timestamp};
use tokio::sync::{mpsc, watch};

use super::SchedulerStatus;

async fn sleep_until_opt(clock: &dyn Clock, wake: Option<Timestamp>) {
    match wake {
        Some(deadline) => clock.sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Scheduling task: plans decisions against live belt kinematics and hands
/// events to the coordinator when they fall due. Ends once decisions have
/// stopped and nothing is left pending or deferred.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    mut scheduler: ActuationScheduler,
    mut decisions: mpsc::Receiver<ClassificationDecision>,
    coordinator: Arc<ActuatorCoordinator>,
    conveyor: Arc<ConveyorSafetyController>,
    status: watch::Sender<SchedulerStatus>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
    telemetry: Option<LineTelemetry>,
) {
    let mut belt = conveyor.subscribe();
    let mut open = true;
    let mut dispatched = 0_u64;

    loop {
        let wake = scheduler.next_due();
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            () = sleep_until_opt(clock.as_ref(), wake) => {
                for event in scheduler.due(clock.now()) {
                    dispatched += 1;
                    dispatch(&coordinator, event, telemetry.as_ref()).await;
                }
            }
            changed = belt.changed() => {
                if changed.is_err() {
                    break;
                }
                scheduler.on_belt_tick(&conveyor.kinematics());
            }
            decision = decisions.recv(), if open => match decision {
                Some(decision) => {
                    scheduler.schedule(&decision, &conveyor.kinematics());
                }
                None => open = false,
            },
        }

        status.send_replace(SchedulerStatus {
            pending: scheduler.pending().len(),
            deferred: scheduler.deferred_len(),
            dispatched,
        });
        if !open && scheduler.pending().is_empty() && scheduler.deferred_len() == 0 {
            break;
        }
    }
}

async fn dispatch(
    coordinator: &ActuatorCoordinator,
    event: ActuationEvent,
    telemetry: Option<&LineTelemetry>,
) {
    let actuator = event.actuator_id;
    let event_id = event.id;
    let track_id = event.track_id;
    if let Err(err) = coordinator.execute(event).await {
        tracing::warn!(%actuator, %err, "actuation event not accepted");
        if let Some(tel) = telemetry {
            let _ = tel.log(
                LogLevel::Warn,
                "scheduler.dispatch.refused",
                json!({
                    "actuator": actuator.to_string(),
                    "event_id": event_id,
                    "track_id": track_id,
                    "error": err.to_string(),
                }),
            );
        }
    }
}
