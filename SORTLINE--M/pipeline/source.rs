use std::{fmt, path::Path, sync::Arc};

use async_trait::async_trait;
use sortline_core::{Clock, Detection, RawDetection};
use tokio::{
    fs::File,
    io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines},
    sync::mpsc,
};

use crate::error::PipelineError;

/// Upstream stream of detections, in arrival order.
#[async_trait]
pub trait DetectionSource: Send + fmt::Debug {
    /// Next detection, or `None` once the stream has ended.
    async fn next_detection(&mut self) -> Result<Option<Detection>, PipelineError>;
}

/// Replays a JSON-lines capture, one [`RawDetection`] per line.
///
/// Blank lines and lines starting with `#` are ignored; malformed lines are
/// logged and skipped. When paced, each detection is released no earlier
/// than its own timestamp on the line clock.
pub struct JsonlDetectionSource<R> {
    lines: Lines<R>,
    line_no: usize,
    skipped: usize,
    pacing: Option<Arc<dyn Clock>>,
}

impl<R> fmt::Debug for JsonlDetectionSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlDetectionSource")
            .field("line_no", &self.line_no)
            .field("skipped", &self.skipped)
            .field("paced", &self.pacing.is_some())
            .finish_non_exhaustive()
    }
}

impl JsonlDetectionSource<BufReader<File>> {
    /// Opens a capture file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let file = File::open(path.as_ref()).await?;
        Ok(Self::from_reader(BufReader::new(file)))
    }
}

impl<R: AsyncBufRead + Unpin> JsonlDetectionSource<R> {
    /// Source over any buffered reader.
    pub fn from_reader(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            skipped: 0,
            pacing: None,
        }
    }
}

impl<R> JsonlDetectionSource<R> {
    /// Releases detections in real time on `clock`.
    #[must_use]
    pub fn paced(mut self, clock: Arc<dyn Clock>) -> Self {
        self.pacing = Some(clock);
        self
    }

    /// Malformed lines skipped so far.
    #[must_use]
    pub const fn skipped(&self) -> usize {
        self.skipped
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> DetectionSource for JsonlDetectionSource<R> {
    async fn next_detection(&mut self) -> Result<Option<Detection>, PipelineError> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let raw: RawDetection = match serde_json::from_str(line) {
                Ok(raw) => raw,
                Err(err) => {
                    self.skipped += 1;
                    tracing::warn!(line = self.line_no, %err, "skipping malformed detection");
                    continue;
                }
            };
            let detection = Detection::from(raw);
            if let Some(clock) = &self.pacing {
                clock.sleep_until(detection.timestamp).await;
            }
            return Ok(Some(detection));
        }
        Ok(None)
    }
}

/// In-process source fed through a bounded channel. Ends when every sender
/// has been dropped.
#[derive(Debug)]
pub struct ChannelDetectionSource {
    detections: mpsc::Receiver<Detection>,
}

impl ChannelDetectionSource {
    /// Source plus the sender that feeds it.
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<Detection>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { detections: rx })
    }
}

#[async_trait]
impl DetectionSource for ChannelDetectionSource {
    async fn next_detection(&mut self) -> Result<Option<Detection>, PipelineError> {
        Ok(self.detections.recv().await)
    }
}
