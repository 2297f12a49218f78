use std::sync::Arc;

use sortline_core::{ActuatorId, Clock, Timestamp};
use tokio::sync::{mpsc, watch};

use super::{ActuatorSnapshot, Control};

/// Aborts the owner's current operation when its published deadline passes
/// without the deadline being cleared or moved. Exits with the owner.
pub async fn run(
    actuator: ActuatorId,
    mut snapshots: watch::Receiver<ActuatorSnapshot>,
    control: mpsc::Sender<Control>,
    clock: Arc<dyn Clock>,
) {
    loop {
        let deadline = snapshots.borrow_and_update().deadline;
        let Some(deadline) = deadline else {
            if snapshots.changed().await.is_err() {
                return;
            }
            continue;
        };

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            () = clock.sleep_until(deadline) => {
                if still_pending(&snapshots, deadline) {
                    tracing::warn!(%actuator, %deadline, "activation deadline missed");
                    let _ = control.try_send(Control::Abort {
                        reason: format!("deadline {deadline} missed"),
                    });
                    if snapshots.changed().await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn still_pending(snapshots: &watch::Receiver<ActuatorSnapshot>, deadline: Timestamp) -> bool {
    snapshots.borrow().deadline == Some(deadline)
}
