use std::{collections::HashSet, fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    error::ConfigError,
    retry::RetryPolicy,
    types::{ActuatorId, Category},
};

/// Shortest settling pause the relays accept between deassert and assert.
pub const MIN_SETTLE_DELAY_MS: u64 = 100;
/// Shortest rigid hold accepted for a diverter gate.
pub const MIN_DIVERTER_HOLD_S: f64 = 1.5;
/// Accepted range of interpolation steps for one motion leg.
pub const MOTION_STEP_RANGE: std::ops::RangeInclusive<u32> = 10..=30;

/// Complete line configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineConfig {
    /// Belt drive and safety parameters.
    #[serde(default)]
    pub belt: BeltConfig,
    /// Consensus classifier parameters.
    #[serde(default)]
    pub consensus: ConsensusConfig,
    /// Scheduler and coordinator parameters.
    #[serde(default)]
    pub actuation: ActuationConfig,
    /// Marking actuator.
    #[serde(default)]
    pub marker: MarkerConfig,
    /// One diverter gate per sortable category.
    #[serde(default = "default_diverters")]
    pub diverters: Vec<DiverterConfig>,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            belt: BeltConfig::default(),
            consensus: ConsensusConfig::default(),
            actuation: ActuationConfig::default(),
            marker: MarkerConfig::default(),
            diverters: default_diverters(),
        }
    }
}

impl LineConfig {
    /// Loads and validates a TOML document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading line config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    /// Parses and validates a TOML document held in memory.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("parsing line config")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every range and uniqueness rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.belt.validate()?;
        self.consensus.validate()?;
        self.actuation.validate()?;
        self.marker.validate()?;

        let mut categories = HashSet::new();
        let mut channels = HashSet::new();
        for channel in [
            self.belt.forward_channel,
            self.belt.backward_channel,
            self.marker.channel,
        ] {
            if !channels.insert(channel) {
                return Err(ConfigError::DuplicateChannel(channel));
            }
        }
        for diverter in &self.diverters {
            diverter.validate()?;
            if !categories.insert(diverter.category) {
                return Err(ConfigError::DuplicateDiverter(diverter.category));
            }
            if !channels.insert(diverter.channel) {
                return Err(ConfigError::DuplicateChannel(diverter.channel));
            }
        }
        Ok(())
    }

    /// Diverter assigned to `category`, if any.
    #[must_use]
    pub fn diverter_for(&self, category: Category) -> Option<&DiverterConfig> {
        self.diverters.iter().find(|d| d.category == category)
    }

    /// Every actuator the line drives, marker first.
    #[must_use]
    pub fn actuator_ids(&self) -> Vec<ActuatorId> {
        std::iter::once(ActuatorId::Marker)
            .chain(
                self.diverters
                    .iter()
                    .map(|d| ActuatorId::Diverter(d.category)),
            )
            .collect()
    }
}

fn default_diverters() -> Vec<DiverterConfig> {
    vec![
        DiverterConfig::new(Category::Apple, 12, 0.5),
        DiverterConfig::new(Category::Pear, 13, 0.65),
        DiverterConfig::new(Category::Lemon, 19, 0.8),
    ]
}

/// Belt drive configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeltConfig {
    /// Nominal surface speed when running, m/s.
    #[serde(default = "default_speed")]
    pub speed_mps: f64,
    /// Maximum command silence before the belt stops itself, seconds.
    #[serde(default = "default_safety_timeout")]
    pub safety_timeout_s: f64,
    /// Pause between releasing one direction and asserting the other, ms.
    #[serde(default = "default_direction_change_delay")]
    pub direction_change_delay_ms: u64,
    /// Settling pause before asserting any relay, ms.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Attempts made to restore the commanded state after an I/O failure.
    #[serde(default = "default_recovery_attempts")]
    pub recovery_attempts: u32,
    /// First recovery pause, ms.
    #[serde(default = "default_belt_recovery_base")]
    pub recovery_base_ms: u64,
    /// Pin driving the forward relay.
    #[serde(default = "default_forward_channel")]
    pub forward_channel: u8,
    /// Pin driving the backward relay.
    #[serde(default = "default_backward_channel")]
    pub backward_channel: u8,
    /// Relay board asserts on a low pin level.
    #[serde(default = "default_true")]
    pub active_low: bool,
}

impl Default for BeltConfig {
    fn default() -> Self {
        Self {
            speed_mps: default_speed(),
            safety_timeout_s: default_safety_timeout(),
            direction_change_delay_ms: default_direction_change_delay(),
            settle_delay_ms: default_settle_delay(),
            recovery_attempts: default_recovery_attempts(),
            recovery_base_ms: default_belt_recovery_base(),
            forward_channel: default_forward_channel(),
            backward_channel: default_backward_channel(),
            active_low: true,
        }
    }
}

impl BeltConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        positive("belt.speed_mps", self.speed_mps)?;
        positive("belt.safety_timeout_s", self.safety_timeout_s)?;
        if self.settle_delay_ms < MIN_SETTLE_DELAY_MS {
            return Err(ConfigError::invalid(
                "belt.settle_delay_ms",
                format!("must be at least {MIN_SETTLE_DELAY_MS} ms"),
            ));
        }
        if self.direction_change_delay_ms < self.settle_delay_ms {
            return Err(ConfigError::invalid(
                "belt.direction_change_delay_ms",
                "must not be shorter than the settle delay",
            ));
        }
        if self.recovery_attempts == 0 {
            return Err(ConfigError::invalid(
                "belt.recovery_attempts",
                "at least one attempt is required",
            ));
        }
        if self.forward_channel == self.backward_channel {
            return Err(ConfigError::DuplicateChannel(self.forward_channel));
        }
        Ok(())
    }

    /// Safety timeout as a duration.
    #[must_use]
    pub fn safety_timeout(&self) -> Duration {
        secs(self.safety_timeout_s)
    }

    /// Reversal pause as a duration.
    #[must_use]
    pub const fn direction_change_delay(&self) -> Duration {
        Duration::from_millis(self.direction_change_delay_ms)
    }

    /// Settling pause as a duration, never below the hardware floor.
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms.max(MIN_SETTLE_DELAY_MS))
    }

    /// Retry policy for relay recovery.
    #[must_use]
    pub fn recovery_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.recovery_attempts,
            Duration::from_millis(self.recovery_base_ms),
        )
        .with_max_delay(Duration::from_secs(2))
    }
}

/// Consensus classifier configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Samples required before a vote may be accepted.
    #[serde(default = "default_min_detections")]
    pub min_detections: usize,
    /// Weighted vote share required for acceptance.
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f32,
    /// Sliding evidence window, seconds.
    #[serde(default = "default_temporal_window")]
    pub temporal_window_s: f64,
    /// Samples retained per track.
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    /// EMA rate of the adaptive thresholds.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Extra weight given to the newest sample relative to the oldest.
    #[serde(default = "default_recency_boost")]
    pub recency_boost: f32,
    /// Acceptance floor used until a category has warmed up.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Drop of a category mean below its prior that triggers a warning.
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance: f32,
    /// Decisions a category needs before its adaptive floor applies.
    #[serde(default = "default_warmup_decisions")]
    pub warmup_decisions: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_detections: default_min_detections(),
            consensus_threshold: default_consensus_threshold(),
            temporal_window_s: default_temporal_window(),
            max_samples: default_max_samples(),
            learning_rate: default_learning_rate(),
            recency_boost: default_recency_boost(),
            min_confidence: default_min_confidence(),
            drift_tolerance: default_drift_tolerance(),
            warmup_decisions: default_warmup_decisions(),
        }
    }
}

impl ConsensusConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_detections == 0 {
            return Err(ConfigError::invalid(
                "consensus.min_detections",
                "must be at least 1",
            ));
        }
        if self.max_samples < self.min_detections {
            return Err(ConfigError::invalid(
                "consensus.max_samples",
                "must not be smaller than min_detections",
            ));
        }
        fraction("consensus.consensus_threshold", self.consensus_threshold)?;
        fraction("consensus.learning_rate", self.learning_rate)?;
        fraction("consensus.min_confidence", self.min_confidence)?;
        fraction("consensus.drift_tolerance", self.drift_tolerance)?;
        positive("consensus.temporal_window_s", self.temporal_window_s)?;
        if !self.recency_boost.is_finite() || self.recency_boost < 0.0 {
            return Err(ConfigError::invalid(
                "consensus.recency_boost",
                "must be a non-negative number",
            ));
        }
        Ok(())
    }

    /// Evidence window as a duration.
    #[must_use]
    pub fn temporal_window(&self) -> Duration {
        secs(self.temporal_window_s)
    }
}

/// Scheduler and coordinator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuationConfig {
    /// Minimum spacing between events on one actuator, seconds.
    #[serde(default = "default_min_event_spacing")]
    pub min_event_spacing_s: f64,
    /// Minimum interval between starts on different actuators, ms.
    #[serde(default = "default_command_margin")]
    pub command_margin_ms: u64,
    /// Attempts made to return a faulted actuator to rest.
    #[serde(default = "default_recovery_attempts")]
    pub recovery_attempts: u32,
    /// First recovery pause, ms.
    #[serde(default = "default_actuator_recovery_base")]
    pub recovery_base_ms: u64,
    /// Queued events later than this are discarded, ms.
    #[serde(default = "default_max_lateness")]
    pub max_lateness_ms: u64,
    /// Pause between interpolation steps, ms.
    #[serde(default = "default_step_interval")]
    pub step_interval_ms: u64,
    /// Grace added to the expected activation time before the watchdog aborts, ms.
    #[serde(default = "default_watchdog_slack")]
    pub watchdog_slack_ms: u64,
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            min_event_spacing_s: default_min_event_spacing(),
            command_margin_ms: default_command_margin(),
            recovery_attempts: default_recovery_attempts(),
            recovery_base_ms: default_actuator_recovery_base(),
            max_lateness_ms: default_max_lateness(),
            step_interval_ms: default_step_interval(),
            watchdog_slack_ms: default_watchdog_slack(),
        }
    }
}

impl ActuationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.min_event_spacing_s.is_finite() || self.min_event_spacing_s < 0.0 {
            return Err(ConfigError::invalid(
                "actuation.min_event_spacing_s",
                "must be a non-negative number",
            ));
        }
        if self.recovery_attempts == 0 {
            return Err(ConfigError::invalid(
                "actuation.recovery_attempts",
                "at least one attempt is required",
            ));
        }
        if self.step_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "actuation.step_interval_ms",
                "must be positive",
            ));
        }
        Ok(())
    }

    /// Per-actuator event spacing.
    #[must_use]
    pub fn min_event_spacing(&self) -> Duration {
        secs(self.min_event_spacing_s)
    }

    /// Cross-actuator start margin.
    #[must_use]
    pub const fn command_margin(&self) -> Duration {
        Duration::from_millis(self.command_margin_ms)
    }

    /// Stale-event bound.
    #[must_use]
    pub const fn max_lateness(&self) -> Duration {
        Duration::from_millis(self.max_lateness_ms)
    }

    /// Interpolation step pause.
    #[must_use]
    pub const fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms)
    }

    /// Watchdog grace.
    #[must_use]
    pub const fn watchdog_slack(&self) -> Duration {
        Duration::from_millis(self.watchdog_slack_ms)
    }

    /// Retry policy for actuator recovery.
    #[must_use]
    pub fn recovery_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.recovery_attempts,
            Duration::from_millis(self.recovery_base_ms),
        )
        .with_max_delay(Duration::from_secs(5))
    }
}

/// Servo pulse geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServoGeometry {
    /// Pulse width at `min_angle`, µs.
    #[serde(default = "default_min_pulse")]
    pub min_pulse_us: u16,
    /// Pulse width at `max_angle`, µs.
    #[serde(default = "default_max_pulse")]
    pub max_pulse_us: u16,
    /// Lowest safe angle, degrees.
    #[serde(default)]
    pub min_angle: f32,
    /// Highest safe angle, degrees.
    #[serde(default = "default_max_angle")]
    pub max_angle: f32,
    /// Mirror the angle range (servo mounted reversed).
    #[serde(default)]
    pub invert: bool,
}

impl Default for ServoGeometry {
    fn default() -> Self {
        Self {
            min_pulse_us: default_min_pulse(),
            max_pulse_us: default_max_pulse(),
            min_angle: 0.0,
            max_angle: default_max_angle(),
            invert: false,
        }
    }
}

impl ServoGeometry {
    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if self.min_pulse_us >= self.max_pulse_us {
            return Err(ConfigError::invalid(field, "min_pulse_us must be below max_pulse_us"));
        }
        if !(self.min_angle.is_finite() && self.max_angle.is_finite())
            || self.min_angle >= self.max_angle
        {
            return Err(ConfigError::invalid(field, "min_angle must be below max_angle"));
        }
        Ok(())
    }

    /// Clamps a pose to the safe angle range.
    #[must_use]
    pub fn clamp_angle(&self, angle: f32) -> f32 {
        if angle.is_nan() {
            return self.min_angle;
        }
        angle.clamp(self.min_angle, self.max_angle)
    }

    /// Pulse width commanding `angle`, after clamping and inversion.
    #[must_use]
    pub fn pulse_width_us(&self, angle: f32) -> u16 {
        let span = self.max_angle - self.min_angle;
        let mut ratio = (self.clamp_angle(angle) - self.min_angle) / span;
        if self.invert {
            ratio = 1.0 - ratio;
        }
        let pulse_span = f32::from(self.max_pulse_us - self.min_pulse_us);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let offset = (ratio * pulse_span).round() as u16;
        self.min_pulse_us + offset
    }
}

/// Marking actuator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerConfig {
    /// PWM channel.
    #[serde(default = "default_marker_channel")]
    pub channel: u8,
    /// Distance from the detection point, metres.
    #[serde(default = "default_marker_distance")]
    pub distance_m: f64,
    /// Rest pose, degrees.
    #[serde(default)]
    pub rest_pose: f32,
    /// Full-stroke active pose, degrees.
    #[serde(default = "default_marker_active_pose")]
    pub active_pose: f32,
    /// Time the mark is applied, seconds.
    #[serde(default = "default_marker_duration")]
    pub duration_s: f64,
    /// Default stroke percentage.
    #[serde(default = "default_intensity")]
    pub intensity: f32,
    /// Interpolation steps per motion leg.
    #[serde(default = "default_marker_steps")]
    pub motion_steps: u32,
    /// Pulse geometry.
    #[serde(default)]
    pub servo: ServoGeometry,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            channel: default_marker_channel(),
            distance_m: default_marker_distance(),
            rest_pose: 0.0,
            active_pose: default_marker_active_pose(),
            duration_s: default_marker_duration(),
            intensity: default_intensity(),
            motion_steps: default_marker_steps(),
            servo: ServoGeometry::default(),
        }
    }
}

impl MarkerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        non_negative("marker.distance_m", self.distance_m)?;
        positive("marker.duration_s", self.duration_s)?;
        motion_steps("marker.motion_steps", self.motion_steps)?;
        if !(0.0..=100.0).contains(&self.intensity) {
            return Err(ConfigError::invalid("marker.intensity", "must lie in [0, 100]"));
        }
        self.servo.validate("marker.servo")
    }

    /// Mark duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        secs(self.duration_s)
    }

    /// Active pose scaled by a stroke percentage.
    #[must_use]
    pub fn pose_for_intensity(&self, intensity: f32) -> f32 {
        let ratio = if intensity.is_nan() {
            0.0
        } else {
            intensity.clamp(0.0, 100.0) / 100.0
        };
        self.servo
            .clamp_angle((self.active_pose - self.rest_pose).mul_add(ratio, self.rest_pose))
    }
}

/// Diverter gate for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiverterConfig {
    /// Category routed by this gate.
    #[serde(deserialize_with = "category_label")]
    pub category: Category,
    /// PWM channel.
    pub channel: u8,
    /// Distance from the detection point, metres.
    pub distance_m: f64,
    /// Rest pose, degrees.
    #[serde(default = "default_diverter_rest_pose")]
    pub rest_pose: f32,
    /// Active pose, degrees.
    #[serde(default)]
    pub active_pose: f32,
    /// Rigid hold at the active pose, seconds.
    #[serde(default = "default_hold")]
    pub hold_duration_s: f64,
    /// Total time the gate must stay open, seconds.
    #[serde(default = "default_activation")]
    pub activation_duration_s: f64,
    /// Interpolation steps per motion leg.
    #[serde(default = "default_diverter_steps")]
    pub motion_steps: u32,
    /// Pulse geometry.
    #[serde(default)]
    pub servo: ServoGeometry,
}

impl DiverterConfig {
    /// Diverter with production defaults.
    #[must_use]
    pub fn new(category: Category, channel: u8, distance_m: f64) -> Self {
        Self {
            category,
            channel,
            distance_m,
            rest_pose: default_diverter_rest_pose(),
            active_pose: 0.0,
            hold_duration_s: default_hold(),
            activation_duration_s: default_activation(),
            motion_steps: default_diverter_steps(),
            servo: ServoGeometry::default(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.category.is_known() {
            return Err(ConfigError::UnknownCategory(self.category.to_string()));
        }
        non_negative("diverters.distance_m", self.distance_m)?;
        if !self.hold_duration_s.is_finite() || self.hold_duration_s < MIN_DIVERTER_HOLD_S {
            return Err(ConfigError::invalid(
                "diverters.hold_duration_s",
                format!("must be at least {MIN_DIVERTER_HOLD_S} s"),
            ));
        }
        positive("diverters.activation_duration_s", self.activation_duration_s)?;
        motion_steps("diverters.motion_steps", self.motion_steps)?;
        self.servo.validate("diverters.servo")
    }

    /// Hold duration.
    #[must_use]
    pub fn hold_duration(&self) -> Duration {
        secs(self.hold_duration_s)
    }

    /// Activation duration.
    #[must_use]
    pub fn activation_duration(&self) -> Duration {
        secs(self.activation_duration_s)
    }
}

fn category_label<'de, D>(deserializer: D) -> Result<Category, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, "must be a positive number"))
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, "must be a non-negative number"))
    }
}

fn fraction(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, "must lie in [0, 1]"))
    }
}

fn motion_steps(field: &'static str, steps: u32) -> Result<(), ConfigError> {
    if MOTION_STEP_RANGE.contains(&steps) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!(
                "must lie in [{}, {}]",
                MOTION_STEP_RANGE.start(),
                MOTION_STEP_RANGE.end()
            ),
        ))
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

const fn default_true() -> bool {
    true
}

const fn default_speed() -> f64 {
    0.2
}

const fn default_safety_timeout() -> f64 {
    10.0
}

const fn default_direction_change_delay() -> u64 {
    500
}

const fn default_settle_delay() -> u64 {
    MIN_SETTLE_DELAY_MS
}

const fn default_recovery_attempts() -> u32 {
    3
}

const fn default_belt_recovery_base() -> u64 {
    200
}

const fn default_actuator_recovery_base() -> u64 {
    250
}

const fn default_forward_channel() -> u8 {
    22
}

const fn default_backward_channel() -> u8 {
    23
}

const fn default_min_detections() -> usize {
    3
}

const fn default_consensus_threshold() -> f32 {
    0.7
}

const fn default_temporal_window() -> f64 {
    2.0
}

const fn default_max_samples() -> usize {
    5
}

const fn default_learning_rate() -> f32 {
    0.05
}

const fn default_recency_boost() -> f32 {
    0.25
}

const fn default_min_confidence() -> f32 {
    0.6
}

const fn default_drift_tolerance() -> f32 {
    0.1
}

const fn default_warmup_decisions() -> u64 {
    50
}

const fn default_min_event_spacing() -> f64 {
    0.5
}

const fn default_command_margin() -> u64 {
    50
}

const fn default_max_lateness() -> u64 {
    250
}

const fn default_step_interval() -> u64 {
    20
}

const fn default_watchdog_slack() -> u64 {
    2_000
}

const fn default_min_pulse() -> u16 {
    1_000
}

const fn default_max_pulse() -> u16 {
    2_000
}

const fn default_max_angle() -> f32 {
    180.0
}

const fn default_marker_channel() -> u8 {
    18
}

const fn default_marker_distance() -> f64 {
    0.25
}

const fn default_marker_active_pose() -> f32 {
    90.0
}

const fn default_marker_duration() -> f64 {
    0.6
}

const fn default_intensity() -> f32 {
    80.0
}

const fn default_marker_steps() -> u32 {
    10
}

const fn default_diverter_rest_pose() -> f32 {
    90.0
}

const fn default_hold() -> f64 {
    MIN_DIVERTER_HOLD_S
}

const fn default_activation() -> f64 {
    2.0
}

const fn default_diverter_steps() -> u32 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_validate() {
        let config = LineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.actuator_ids().len(), 4);
        assert_eq!(config.belt.direction_change_delay(), Duration::from_millis(500));
        assert_eq!(
            config.diverter_for(Category::Pear).map(|d| d.channel),
            Some(13)
        );
    }

    #[test]
    fn loads_partial_document_with_aliases() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("line.toml");
        std::fs::write(
            &path,
            r#"
[belt]
speed_mps = 0.25

[consensus]
min_detections = 4
max_samples = 6

[[diverters]]
category = "Manzana"
channel = 5
distance_m = 0.6
"#,
        )
        .unwrap();
        let config = LineConfig::load(&path).unwrap();
        assert!((config.belt.speed_mps - 0.25).abs() < 1e-9);
        assert_eq!(config.belt.safety_timeout(), Duration::from_secs(10));
        assert_eq!(config.consensus.min_detections, 4);
        assert_eq!(config.diverters.len(), 1);
        assert_eq!(config.diverters[0].category, Category::Apple);
        assert!((config.diverters[0].hold_duration_s - 1.5).abs() < 1e-9);
    }

    #[test]
    fn rejects_unknown_label() {
        let err = LineConfig::from_toml_str(
            r#"
[[diverters]]
category = "banana"
channel = 5
distance_m = 0.6
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("banana"));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = LineConfig::default();
        config.belt.settle_delay_ms = 50;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "belt.settle_delay_ms", .. })
        ));

        let mut config = LineConfig::default();
        config.consensus.consensus_threshold = 1.3;
        assert!(config.validate().is_err());

        let mut config = LineConfig::default();
        config.diverters[1].motion_steps = 40;
        assert!(config.validate().is_err());

        let mut config = LineConfig::default();
        config.diverters[2].hold_duration_s = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicates() {
        let mut config = LineConfig::default();
        config.diverters[1].category = Category::Apple;
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateDiverter(Category::Apple))
        );

        let mut config = LineConfig::default();
        config.diverters[0].channel = config.marker.channel;
        assert_eq!(config.validate(), Err(ConfigError::DuplicateChannel(18)));
    }

    #[test]
    fn servo_pulse_mapping() {
        let geometry = ServoGeometry::default();
        assert_eq!(geometry.pulse_width_us(0.0), 1_000);
        assert_eq!(geometry.pulse_width_us(90.0), 1_500);
        assert_eq!(geometry.pulse_width_us(250.0), 2_000);
        let inverted = ServoGeometry {
            invert: true,
            ..geometry
        };
        assert_eq!(inverted.pulse_width_us(0.0), 2_000);
    }

    #[test]
    fn marker_intensity_scales_stroke() {
        let marker = MarkerConfig::default();
        assert!((marker.pose_for_intensity(100.0) - 90.0).abs() < 1e-4);
        assert!((marker.pose_for_intensity(50.0) - 45.0).abs() < 1e-4);
        assert!((marker.pose_for_intensity(-5.0) - 0.0).abs() < 1e-4);
    }
}
