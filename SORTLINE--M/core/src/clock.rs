use std::{cmp::Ordering, fmt, ops::Add, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::oneshot;

/// Point on the line clock, in whole nanoseconds since the clock origin.
///
/// Detections carry timestamps on the same axis, so firing times are computed
/// by plain addition of belt travel delays. Arithmetic is exact, so a sleeper
/// woken at its deadline always observes `now() >= deadline`. Serialized as
/// fractional seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

const NANOS_PER_SEC: f64 = 1e9;

impl Timestamp {
    /// Clock origin.
    pub const ZERO: Self = Self(0);

    /// Creates a timestamp from seconds, rounded to the nearest nanosecond.
    /// Negative or non-finite input collapses to zero.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_secs(secs: f64) -> Self {
        if secs.is_finite() && secs > 0.0 {
            Self((secs * NANOS_PER_SEC).round() as u64)
        } else {
            Self::ZERO
        }
    }

    /// Timestamp `elapsed` after the origin.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_elapsed(elapsed: Duration) -> Self {
        Self(elapsed.as_nanos() as u64)
    }

    /// Seconds since origin.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_secs(self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC
    }

    /// Offset from the origin.
    #[must_use]
    pub const fn since_origin(self) -> Duration {
        Duration::from_nanos(self.0)
    }

    /// Time elapsed since `earlier`, zero when `earlier` is in the future.
    #[must_use]
    pub const fn saturating_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Later of two timestamps.
    #[must_use]
    pub fn latest(self, other: Self) -> Self {
        self.max(other)
    }

    /// Total ordering usable for sorting.
    #[must_use]
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    #[allow(clippy::cast_possible_truncation)]
    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(rhs.as_nanos() as u64))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_secs())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        f64::deserialize(deserializer).map(Self::from_secs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.as_secs())
    }
}

/// Source of line time and of timed suspension.
///
/// Motion profiles, belt pauses and watchdogs only ever wait through this
/// trait, which keeps them independent of the runtime's sleep primitive.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current line time.
    fn now(&self) -> Timestamp;

    /// Suspends until `deadline` has been reached.
    async fn sleep_until(&self, deadline: Timestamp);

    /// Suspends for `duration`.
    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

/// Clock backed by `tokio::time`, anchored at construction.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    /// Creates a clock whose origin is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_elapsed(self.origin.elapsed())
    }

    async fn sleep_until(&self, deadline: Timestamp) {
        tokio::time::sleep_until(self.origin + deadline.since_origin()).await;
    }
}

#[derive(Debug, Default)]
struct ManualState {
    now: Timestamp,
    sleepers: Vec<(Timestamp, oneshot::Sender<()>)>,
}

/// Virtual clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    /// Creates a clock at the origin.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward, waking every sleeper whose deadline has passed
    /// in deadline order.
    pub fn advance(&self, by: Duration) {
        let mut due = {
            let mut state = self.state.lock();
            state.now = state.now + by;
            let now = state.now;
            let (due, waiting): (Vec<_>, Vec<_>) = state
                .sleepers
                .drain(..)
                .partition(|(deadline, _)| *deadline <= now);
            state.sleepers = waiting;
            due
        };
        due.sort_by_key(|(deadline, _)| *deadline);
        for (_, waker) in due {
            let _ = waker.send(());
        }
    }

    /// Number of tasks currently suspended on this clock.
    #[must_use]
    pub fn sleepers(&self) -> usize {
        self.state.lock().sleepers.len()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.state.lock().now
    }

    async fn sleep_until(&self, deadline: Timestamp) {
        let receiver = {
            let mut state = self.state.lock();
            if deadline <= state.now {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.sleepers.push((deadline, tx));
            rx
        };
        let _ = receiver.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_arithmetic() {
        let t = Timestamp::from_secs(1.5) + Duration::from_millis(500);
        assert!((t.as_secs() - 2.0).abs() < 1e-9);
        assert_eq!(
            Timestamp::from_secs(1.0).saturating_since(Timestamp::from_secs(3.0)),
            Duration::ZERO
        );
        assert_eq!(Timestamp::from_secs(f64::NAN), Timestamp::ZERO);
        assert_eq!(Timestamp::from_secs(-0.5), Timestamp::ZERO);
        assert_eq!(
            Timestamp::from_secs(0.1) + Duration::from_millis(200),
            Timestamp::from_secs(0.3)
        );
        assert_eq!(
            Timestamp::from_secs(1.0).latest(Timestamp::from_secs(2.0)),
            Timestamp::from_secs(2.0)
        );
    }

    #[tokio::test]
    async fn manual_clock_wakes_sleepers_on_advance() {
        let clock = ManualClock::new();
        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move {
                clock.sleep(Duration::from_millis(100)).await;
                clock.now()
            })
        };
        while clock.sleepers() == 0 {
            tokio::task::yield_now().await;
        }
        clock.advance(Duration::from_millis(50));
        assert_eq!(clock.sleepers(), 1);
        clock.advance(Duration::from_millis(50));
        let woke_at = sleeper.await.unwrap();
        assert!((woke_at.as_secs() - 0.1).abs() < 1e-9);
        assert_eq!(clock.sleepers(), 0);
    }

    #[tokio::test]
    async fn manual_clock_past_deadline_returns_immediately() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(1));
        clock.sleep_until(Timestamp::from_secs(0.5)).await;
        assert_eq!(clock.sleepers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        clock.sleep(Duration::from_secs(2)).await;
        assert!(clock.now().as_secs() >= 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_never_wakes_before_deadline() {
        let clock = TokioClock::new();
        let mut deadline = Timestamp::from_secs(1.0);
        clock.sleep_until(deadline).await;
        let mut early = 0;
        for _ in 0..200 {
            deadline = deadline + Duration::from_millis(20);
            clock.sleep_until(deadline).await;
            if clock.now() < deadline {
                early += 1;
            }
        }
        assert_eq!(early, 0);
        assert!((clock.now().as_secs() - 5.0).abs() < 1e-3);
    }

    #[test]
    fn timestamps_serialize_as_seconds() {
        let t = Timestamp::from_secs(1.25);
        assert_eq!(serde_json::to_string(&t).unwrap(), "1.25");
        let back: Timestamp = serde_json::from_str("1.25").unwrap();
        assert_eq!(back, t);
    }
}
