use std::{sync::Arc, time::Duration};

use sortline_consensus::{ClassifierStats, TemporalConsensusClassifier};
use sortline_core::{ClassificationDecision, Clock, Detection, LineTelemetry};
use tokio::sync::{mpsc, watch};

use crate::source::DetectionSource;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Moves detections from the source into the classifier's channel.
pub async fn pump(
    mut source: Box<dyn DetectionSource>,
    detections: mpsc::Sender<Detection>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = source.next_detection() => next,
        };
        match next {
            Ok(Some(detection)) => {
                if detections.send(detection).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::error!(%err, "detection source failed");
                break;
            }
        }
    }
}

/// Classification task. Ends once the detection stream has closed and
/// every open track has been decided.
pub async fn run(
    mut classifier: TemporalConsensusClassifier,
    mut detections: mpsc::Receiver<Detection>,
    decisions: mpsc::Sender<ClassificationDecision>,
    stats: watch::Sender<ClassifierStats>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
    telemetry: Option<LineTelemetry>,
) {
    let sweep_every = (classifier.config().temporal_window() / 4).max(MIN_SWEEP_INTERVAL);
    let mut next_sweep = clock.now() + sweep_every;
    let mut open = true;

    loop {
        let decided: Vec<ClassificationDecision> = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            detection = detections.recv(), if open => match detection {
                Some(detection) => classifier.ingest(detection).into_iter().collect(),
                None => {
                    open = false;
                    Vec::new()
                }
            },
            () = clock.sleep_until(next_sweep) => {
                let now = clock.now();
                next_sweep = now + sweep_every;
                classifier.sweep_expired(now)
            }
        };
        stats.send_replace(classifier.stats());

        for decision in decided {
            if decisions.send(decision).await.is_err() {
                return;
            }
        }
        if !open && classifier.active_tracks() == 0 {
            break;
        }
    }

    if let Some(tel) = &telemetry {
        let stats = classifier.stats();
        let _ = tel.log(
            shared_logging::LogLevel::Info,
            "consensus.task.finished",
            serde_json::json!({
                "detections_seen": stats.detections_seen,
                "decisions": stats.decisions,
                "rejected": stats.rejected,
            }),
        );
    }
}
