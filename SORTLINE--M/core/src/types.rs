use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{clock::Timestamp, error::ConfigError};

/// Identifier assigned by the upstream tracker to one physical item.
pub type TrackId = u64;

/// Closed set of item categories the line can sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Apples.
    Apple,
    /// Pears.
    Pear,
    /// Lemons.
    Lemon,
    /// Anything the line must not act upon.
    Unknown,
}

/// External label → category. Labels are matched after trimming and lowercasing.
const LABEL_TABLE: &[(&str, Category)] = &[
    ("apple", Category::Apple),
    ("manzana", Category::Apple),
    ("pear", Category::Pear),
    ("pera", Category::Pear),
    ("lemon", Category::Lemon),
    ("limon", Category::Lemon),
    ("limón", Category::Lemon),
];

impl Category {
    /// Every sortable category.
    pub const KNOWN: [Self; 3] = [Self::Apple, Self::Pear, Self::Lemon];

    /// Maps an external label, falling back to [`Category::Unknown`].
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        Self::lookup(label).unwrap_or(Self::Unknown)
    }

    fn lookup(label: &str) -> Option<Self> {
        let needle = label.trim().to_lowercase();
        LABEL_TABLE
            .iter()
            .find(|(alias, _)| *alias == needle)
            .map(|(_, category)| *category)
    }

    /// Canonical label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Apple => "apple",
            Self::Pear => "pear",
            Self::Lemon => "lemon",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the line may act on this category.
    #[must_use]
    pub const fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Category {
    type Err = ConfigError;

    /// Strict parse used for configuration: unknown labels are an error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::lookup(s).ok_or_else(|| ConfigError::UnknownCategory(s.to_string()))
    }
}

/// Axis-aligned box in image pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge.
    pub x1: f32,
    /// Top edge.
    pub y1: f32,
    /// Right edge.
    pub x2: f32,
    /// Bottom edge.
    pub y2: f32,
}

impl BoundingBox {
    /// Creates a box from its corners, normalizing their order.
    #[must_use]
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// Box width.
    #[must_use]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    /// Box height.
    #[must_use]
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Centre point.
    #[must_use]
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// One frame's observation of one tracked item. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Capture time on the line clock.
    pub timestamp: Timestamp,
    /// Tracker identity.
    pub track_id: TrackId,
    /// Mapped category.
    pub category: Category,
    /// Model confidence in `[0, 1]`.
    pub confidence: f32,
    /// Location in the frame.
    pub bbox: BoundingBox,
    /// Shape conformity in `[0, 1]`, when measured.
    #[serde(default)]
    pub shape_score: Option<f32>,
    /// Colour uniformity in `[0, 1]`, when measured.
    #[serde(default)]
    pub color_score: Option<f32>,
    /// Surface quality in `[0, 1]`, when measured.
    #[serde(default)]
    pub surface_score: Option<f32>,
    /// Size fitness in `[0, 1]`, when measured.
    #[serde(default)]
    pub size_score: Option<f32>,
}

impl Detection {
    /// Creates a detection with no quality factors measured.
    #[must_use]
    pub fn new(
        timestamp: Timestamp,
        track_id: TrackId,
        category: Category,
        confidence: f32,
        bbox: BoundingBox,
    ) -> Self {
        Self {
            timestamp,
            track_id,
            category,
            confidence: unit(confidence),
            bbox,
            shape_score: None,
            color_score: None,
            surface_score: None,
            size_score: None,
        }
    }

    /// Attaches the four quality factors (colour, shape, surface, size).
    #[must_use]
    pub fn with_quality(mut self, color: f32, shape: f32, surface: f32, size: f32) -> Self {
        self.color_score = Some(unit(color));
        self.shape_score = Some(unit(shape));
        self.surface_score = Some(unit(surface));
        self.size_score = Some(unit(size));
        self
    }
}

fn unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Wire form produced by the detection source, before label mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    /// Capture time in seconds on the line clock.
    pub timestamp: f64,
    /// Tracker identity.
    pub track_id: TrackId,
    /// Free-form class label.
    pub label: String,
    /// Model confidence.
    pub confidence: f32,
    /// `[x1, y1, x2, y2]`.
    pub bbox: [f32; 4],
    /// Optional shape factor.
    #[serde(default)]
    pub shape_score: Option<f32>,
    /// Optional colour factor.
    #[serde(default)]
    pub color_score: Option<f32>,
    /// Optional surface factor.
    #[serde(default)]
    pub surface_score: Option<f32>,
    /// Optional size factor.
    #[serde(default)]
    pub size_score: Option<f32>,
}

impl From<RawDetection> for Detection {
    fn from(raw: RawDetection) -> Self {
        let [x1, y1, x2, y2] = raw.bbox;
        let mut detection = Self::new(
            Timestamp::from_secs(raw.timestamp),
            raw.track_id,
            Category::from_label(&raw.label),
            raw.confidence,
            BoundingBox::new(x1, y1, x2, y2),
        );
        detection.shape_score = raw.shape_score.map(unit);
        detection.color_score = raw.color_score.map(unit);
        detection.surface_score = raw.surface_score.map(unit);
        detection.size_score = raw.size_score.map(unit);
        detection
    }
}

/// Commercial quality grade, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityGrade {
    /// Below 0.60.
    Defective,
    /// `[0.60, 0.75)`.
    GradeB,
    /// `[0.75, 0.90)`.
    GradeA,
    /// 0.90 and above.
    Premium,
}

impl QualityGrade {
    /// Lower bound of GradeB.
    pub const GRADE_B_FLOOR: f32 = 0.60;
    /// Lower bound of GradeA.
    pub const GRADE_A_FLOOR: f32 = 0.75;
    /// Lower bound of Premium.
    pub const PREMIUM_FLOOR: f32 = 0.90;

    /// Maps a blend score onto the four contiguous grade bands.
    #[must_use]
    pub fn from_score(score: f32) -> Self {
        if score >= Self::PREMIUM_FLOOR {
            Self::Premium
        } else if score >= Self::GRADE_A_FLOOR {
            Self::GradeA
        } else if score >= Self::GRADE_B_FLOOR {
            Self::GradeB
        } else {
            Self::Defective
        }
    }
}

/// How a decision came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Weighted vote reached the consensus threshold.
    Accepted,
    /// Enough samples, but no category carried the vote.
    NoConsensus,
    /// The window closed before enough samples arrived.
    InsufficientEvidence,
}

/// Final verdict for one track, consumed once by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationDecision {
    /// Track the verdict belongs to.
    pub track_id: TrackId,
    /// Winning category, `Unknown` when the vote failed.
    pub category: Category,
    /// Recency-weighted mean confidence of the winning samples.
    pub confidence: f32,
    /// Grade derived from `quality_score`.
    pub quality_grade: QualityGrade,
    /// Mean quality blend of the winning samples.
    pub quality_score: f32,
    /// Winner's share of the weighted vote.
    pub consensus_ratio: f32,
    /// Samples considered.
    pub sample_count: usize,
    /// Time of the newest sample considered (or of expiry).
    pub timestamp: Timestamp,
    /// How the decision was reached.
    pub outcome: DecisionOutcome,
    /// Flagged for rejection: the line must not act on it.
    pub rejected: bool,
}

impl ClassificationDecision {
    /// Whether downstream actuators may act on this decision.
    #[must_use]
    pub const fn is_actionable(&self) -> bool {
        self.category.is_known()
            && !self.rejected
            && matches!(self.outcome, DecisionOutcome::Accepted)
    }
}

/// Physical actuator addressed by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorId {
    /// The marking (labelling) actuator.
    Marker,
    /// Diverter gate for one category.
    Diverter(Category),
}

impl fmt::Display for ActuatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Marker => f.write_str("marker"),
            Self::Diverter(category) => write!(f, "diverter.{category}"),
        }
    }
}

/// What an actuation does.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuationKind {
    /// Apply a mark; `intensity` is a percentage of the active stroke.
    Mark {
        /// Stroke percentage in `[0, 100]`.
        intensity: f32,
    },
    /// Divert the item into the category's lane.
    Divert(Category),
}

/// Timed command for one actuator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuationEvent {
    /// Event identity; a re-sent event with the same id supersedes the original.
    pub id: Uuid,
    /// Target actuator.
    pub actuator_id: ActuatorId,
    /// Track that caused it (`None` for test fires).
    pub track_id: Option<TrackId>,
    /// Absolute line time at which motion must start.
    pub fire_at: Timestamp,
    /// Kind of actuation.
    pub kind: ActuationKind,
    /// Time the effect must be in place.
    pub duration: Duration,
    /// Rigid hold at the active pose.
    pub hold_duration: Duration,
}

impl ActuationEvent {
    /// Creates an event with a fresh id.
    #[must_use]
    pub fn new(
        actuator_id: ActuatorId,
        track_id: Option<TrackId>,
        fire_at: Timestamp,
        kind: ActuationKind,
        duration: Duration,
        hold_duration: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actuator_id,
            track_id,
            fire_at,
            kind,
            duration,
            hold_duration,
        }
    }

    /// Time the hold phase ends, assuming motion starts on time.
    #[must_use]
    pub fn hold_ends_at(&self) -> Timestamp {
        self.fire_at + self.hold_duration
    }
}

/// Lifecycle of one actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorState {
    /// At rest, ready.
    Idle,
    /// Interpolating toward the active pose.
    Moving,
    /// Rigidly holding the active pose.
    Holding,
    /// Interpolating back to rest.
    Returning,
    /// Hardware fault, recovering or awaiting reset.
    Faulted,
}

impl ActuatorState {
    /// Whether an activation is in progress.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Moving | Self::Holding | Self::Returning)
    }
}

/// Commanded belt travel direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Toward the actuators.
    Forward,
    /// Away from the actuators.
    Backward,
}

impl Direction {
    /// The other direction.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Forward,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => f.write_str("forward"),
            Self::Backward => f.write_str("backward"),
        }
    }
}

/// Observed belt motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeltDirection {
    /// Running toward the actuators.
    Forward,
    /// Running away from the actuators.
    Backward,
    /// Relays released.
    Stopped,
}

impl From<Direction> for BeltDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Forward => Self::Forward,
            Direction::Backward => Self::Backward,
        }
    }
}

/// Logical output of the relay pair. Both relays asserted is not representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayCommand {
    /// Both relays deasserted.
    Released,
    /// Forward relay only.
    Forward,
    /// Backward relay only.
    Backward,
}

impl RelayCommand {
    /// `(forward, backward)` logical levels.
    #[must_use]
    pub const fn levels(self) -> (bool, bool) {
        match self {
            Self::Released => (false, false),
            Self::Forward => (true, false),
            Self::Backward => (false, true),
        }
    }

    /// Relay command driving the belt in `direction`.
    #[must_use]
    pub const fn drive(direction: Direction) -> Self {
        match direction {
            Direction::Forward => Self::Forward,
            Direction::Backward => Self::Backward,
        }
    }
}

/// Belt drive state owned by the conveyor controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeltState {
    /// Current motion.
    pub direction: BeltDirection,
    /// Forward relay asserted.
    pub relay_forward: bool,
    /// Backward relay asserted.
    pub relay_backward: bool,
    /// Time of the last accepted command.
    pub last_command_at: Option<Timestamp>,
    /// Hardware faults observed since start.
    pub fault_count: u32,
}

impl Default for BeltState {
    fn default() -> Self {
        Self {
            direction: BeltDirection::Stopped,
            relay_forward: false,
            relay_backward: false,
            last_command_at: None,
            fault_count: 0,
        }
    }
}

impl BeltState {
    /// Records the relay output now present on the hardware.
    pub fn apply_relays(&mut self, relays: RelayCommand) {
        let (forward, backward) = relays.levels();
        self.relay_forward = forward;
        self.relay_backward = backward;
        self.direction = match relays {
            RelayCommand::Released => BeltDirection::Stopped,
            RelayCommand::Forward => BeltDirection::Forward,
            RelayCommand::Backward => BeltDirection::Backward,
        };
    }

    /// Kinematics as seen by the scheduler: only forward travel carries items
    /// toward the actuators.
    #[must_use]
    pub fn kinematics(&self, nominal_speed_mps: f64, observed_at: Timestamp) -> BeltKinematics {
        let speed_mps = match self.direction {
            BeltDirection::Forward => Some(nominal_speed_mps),
            BeltDirection::Backward | BeltDirection::Stopped => Some(0.0),
        };
        BeltKinematics {
            speed_mps,
            direction: self.direction,
            observed_at,
        }
    }
}

/// Belt speed sample handed to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeltKinematics {
    /// Speed toward the actuators in m/s; `None` when unavailable.
    pub speed_mps: Option<f64>,
    /// Direction reported by the belt.
    pub direction: BeltDirection,
    /// When the sample was taken.
    pub observed_at: Timestamp,
}

impl BeltKinematics {
    /// Forward-running belt at `speed_mps`.
    #[must_use]
    pub const fn forward(speed_mps: f64, observed_at: Timestamp) -> Self {
        Self {
            speed_mps: Some(speed_mps),
            direction: BeltDirection::Forward,
            observed_at,
        }
    }

    /// Stopped belt.
    #[must_use]
    pub const fn stopped(observed_at: Timestamp) -> Self {
        Self {
            speed_mps: Some(0.0),
            direction: BeltDirection::Stopped,
            observed_at,
        }
    }

    /// Usable positive speed, if any.
    #[must_use]
    pub fn usable_speed(&self) -> Option<f64> {
        self.speed_mps
            .filter(|speed| speed.is_finite() && *speed > 0.0)
            .filter(|_| self.direction == BeltDirection::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_table_maps_aliases() {
        assert_eq!(Category::from_label(" Manzana "), Category::Apple);
        assert_eq!(Category::from_label("PERA"), Category::Pear);
        assert_eq!(Category::from_label("limón"), Category::Lemon);
        assert_eq!(Category::from_label("banana"), Category::Unknown);
        assert!("banana".parse::<Category>().is_err());
        assert_eq!("lemon".parse::<Category>().unwrap(), Category::Lemon);
    }

    #[test]
    fn grade_bands_are_contiguous_and_monotonic() {
        let mut previous = QualityGrade::Defective;
        for step in 0..=1000 {
            let score = step as f32 / 1000.0;
            let grade = QualityGrade::from_score(score);
            assert!(grade >= previous, "grade dropped at {score}");
            previous = grade;
        }
        assert_eq!(QualityGrade::from_score(0.5999), QualityGrade::Defective);
        assert_eq!(QualityGrade::from_score(0.60), QualityGrade::GradeB);
        assert_eq!(QualityGrade::from_score(0.75), QualityGrade::GradeA);
        assert_eq!(QualityGrade::from_score(0.90), QualityGrade::Premium);
    }

    #[test]
    fn raw_detection_maps_through_lookup() {
        let raw = RawDetection {
            timestamp: 1.25,
            track_id: 4,
            label: "Pera".into(),
            confidence: 1.4,
            bbox: [30.0, 40.0, 10.0, 20.0],
            shape_score: Some(0.8),
            color_score: None,
            surface_score: None,
            size_score: None,
        };
        let detection = Detection::from(raw);
        assert_eq!(detection.category, Category::Pear);
        assert!((detection.confidence - 1.0).abs() < f32::EPSILON);
        assert!((detection.bbox.width() - 20.0).abs() < f32::EPSILON);
        assert_eq!(detection.shape_score, Some(0.8));
    }

    #[test]
    fn relay_levels_never_overlap() {
        let mut state = BeltState::default();
        for relays in [
            RelayCommand::Forward,
            RelayCommand::Released,
            RelayCommand::Backward,
        ] {
            state.apply_relays(relays);
            assert!(!(state.relay_forward && state.relay_backward));
        }
        assert_eq!(state.direction, BeltDirection::Backward);
    }

    #[test]
    fn kinematics_only_forward_is_usable() {
        let mut state = BeltState::default();
        assert_eq!(
            state.kinematics(0.2, Timestamp::ZERO).usable_speed(),
            None
        );
        state.apply_relays(RelayCommand::Forward);
        assert_eq!(
            state.kinematics(0.2, Timestamp::ZERO).usable_speed(),
            Some(0.2)
        );
        state.apply_relays(RelayCommand::Backward);
        assert_eq!(
            state.kinematics(0.2, Timestamp::ZERO).usable_speed(),
            None
        );
    }

    #[test]
    fn actuator_ids_display() {
        assert_eq!(ActuatorId::Marker.to_string(), "marker");
        assert_eq!(
            ActuatorId::Diverter(Category::Lemon).to_string(),
            "diverter.lemon"
        );
    }
}
