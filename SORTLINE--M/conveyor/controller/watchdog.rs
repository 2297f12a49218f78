use std::sync::Arc;

use sortline_core::Clock;
use tokio::sync::{mpsc, watch};

use super::{BeltSnapshot, Interrupt};

/// Safety timer: when the published deadline passes unchanged, asks the owner
/// to stop the belt. Exits with the owner.
pub async fn run(
    mut snapshots: watch::Receiver<BeltSnapshot>,
    interrupts: mpsc::Sender<Interrupt>,
    clock: Arc<dyn Clock>,
) {
    loop {
        let deadline = snapshots.borrow_and_update().safety_deadline;
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
                if snapshots.borrow().safety_deadline != Some(deadline) {
                    continue;
                }
                tracing::warn!(%deadline, "belt command silence, tripping safety stop");
                if interrupts.send(Interrupt::SafetyTrip { deadline }).await.is_err() {
                    return;
                }
                if snapshots.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}
