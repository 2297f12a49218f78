use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Builder, Handle, Runtime};

/// Runtime used to publish events from threads that are not inside tokio.
/// Process-wide so it is never dropped from within an async context.
static FALLBACK_RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Builder for [`LineTelemetry`].
pub struct LineTelemetryBuilder {
    component: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl LineTelemetryBuilder {
    /// Creates the builder for `component`.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops log records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<LineTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(Arc::new(
                JsonLogger::with_min_level(&path, self.min_level)
                    .with_context(|| format!("opening telemetry log {}", path.display()))?,
            )),
            None => None,
        };
        Ok(LineTelemetry {
            inner: Arc::new(TelemetryInner {
                component: self.component,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared by every task of one control domain.
///
/// Records go to the JSON-lines log and are mirrored to `tracing`; events go
/// to the configured bus. A handle without sinks still emits `tracing` events.
#[derive(Clone)]
pub struct LineTelemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    component: String,
    logger: Option<Arc<JsonLogger>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl fmt::Debug for LineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineTelemetry")
            .field("component", &self.inner.component)
            .field("log", &self.inner.logger.as_ref().map(|logger| logger.path()))
            .field("events", &self.inner.publisher.is_some())
            .finish()
    }
}

impl LineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(component: impl Into<String>) -> LineTelemetryBuilder {
        LineTelemetryBuilder::new(component)
    }

    /// Handle with no log file and no bus.
    #[must_use]
    pub fn disabled(component: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                component: component.into(),
                logger: None,
                publisher: None,
            }),
        }
    }

    /// Same sinks, different component name.
    #[must_use]
    pub fn for_component(&self, component: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                component: component.into(),
                logger: self.inner.logger.clone(),
                publisher: self.inner.publisher.clone(),
            }),
        }
    }

    /// Component name stamped on records.
    #[must_use]
    pub fn component(&self) -> &str {
        &self.inner.component
    }

    /// Logs a structured record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        let component = self.inner.component.as_str();
        match level {
            LogLevel::Debug => tracing::debug!(component, %metadata, "{message}"),
            LogLevel::Info => tracing::info!(component, %metadata, "{message}"),
            LogLevel::Warn => tracing::warn!(component, %metadata, "{message}"),
            LogLevel::Error => tracing::error!(component, %metadata, "{message}"),
        }
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(component, level, message).with_object(&metadata);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Publishes an event on the bus.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        let Some(publisher) = &self.inner.publisher else {
            return Ok(());
        };
        let record = EventRecord::new(self.inner.component.clone(), event_type, payload);
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    tracing::warn!(error = %err, "telemetry event publish failed");
                }
            });
            Ok(())
        } else {
            let runtime = FALLBACK_RUNTIME.get_or_try_init(|| {
                Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("building telemetry runtime")
            })?;
            runtime.block_on(publisher.publish(record))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn writes_log_and_event_outside_runtime() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("line.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = LineTelemetry::builder("conveyor")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "belt.started", json!({ "direction": "forward" }))
            .unwrap();
        telemetry
            .event("belt.safety.trip", json!({ "silence_s": 10.0 }))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("belt.started"));
        assert!(content.contains("forward"));
        assert_eq!(bus.events_of("belt.safety.trip").len(), 1);
    }

    #[tokio::test]
    async fn publishes_from_inside_runtime() {
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = LineTelemetry::builder("actuation")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .event("actuator.fire.completed", json!({ "actuator": "marker" }))
            .unwrap();
        for _ in 0..10 {
            if !bus.snapshot().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(bus.snapshot()[0].source, "actuation");
    }

    #[test]
    fn disabled_handle_accepts_everything() {
        let telemetry = LineTelemetry::disabled("consensus");
        telemetry.log(LogLevel::Warn, "noop", json!({})).unwrap();
        telemetry.event("noop", json!({})).unwrap();
        assert_eq!(telemetry.component(), "consensus");
    }
}
