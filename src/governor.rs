//! Rate and quota governance shared by every worker.
//!
//! Two independent limits protect the provider account:
//!
//! * [`RateGovernor`] — requests per minute. A call may start only when
//!   (a) at least `0.8 × 60 s / rpm` has passed since the previous start, and
//!   (b) fewer than `rpm` calls started in the trailing 60 s. The spacing gate
//!   spreads bursts out; the sliding window is the hard limit.
//!
//! * [`QuotaTracker`] — requests per day, counted against a day key computed
//!   in the provider's timezone (America/Los_Angeles) and persisted on every
//!   change so a restart cannot reset the count.
//!
//! Both use `tokio::time::Instant`, so tests drive them with a paused clock.

use crate::error::ForgeError;
use crate::store::write_json_atomic;
use chrono::Utc;
use chrono_tz::America::Los_Angeles;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

const WINDOW: Duration = Duration::from_secs(60);
/// 0.8 × 60 s, in microseconds.
const SPACING_BUDGET_US: u64 = 48_000_000;

// ── Rate governor ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GateState {
    last_start: Option<Instant>,
    window: VecDeque<Instant>,
}

/// Requests-per-minute gate.
///
/// Waiters queue on an async mutex, so admissions are handed out in arrival
/// order and the state is never observed half-updated.
#[derive(Debug, Default)]
pub struct RateGovernor {
    state: tokio::sync::Mutex<GateState>,
}

impl RateGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimum gap between two call starts for the given rpm.
    pub fn spacing(rpm: u32) -> Duration {
        Duration::from_micros(SPACING_BUDGET_US / u64::from(rpm.max(1)))
    }

    /// Wait until a call may start, then record the start.
    ///
    /// `rpm` is read per call so a settings change applies to the next
    /// admission without rebuilding the governor.
    pub async fn acquire(&self, rpm: u32) {
        let limit = rpm.max(1) as usize;
        let spacing = Self::spacing(rpm);
        let mut state = self.state.lock().await;

        loop {
            let now = Instant::now();

            if let Some(last) = state.last_start {
                let since = now.saturating_duration_since(last);
                if since < spacing {
                    sleep(spacing - since).await;
                    continue;
                }
            }

            while let Some(&front) = state.window.front() {
                if now.saturating_duration_since(front) >= WINDOW {
                    state.window.pop_front();
                } else {
                    break;
                }
            }

            if state.window.len() < limit {
                state.window.push_back(now);
                state.last_start = Some(now);
                return;
            }

            let oldest = state.window[0];
            debug!(
                "Rate window full ({limit}/min); waiting {:?}",
                (oldest + WINDOW).saturating_duration_since(now)
            );
            sleep_until(oldest + WINDOW).await;
        }
    }
}

// ── Daily quota ──────────────────────────────────────────────────────────

/// Persisted quota state (`server_state.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaState {
    pub daily_request_count: u32,
    pub daily_reset_date: String,
}

/// Day key in the provider's timezone, formatted like `10/19/2026`.
pub fn pacific_day() -> String {
    Utc::now()
        .with_timezone(&Los_Angeles)
        .format("%-m/%-d/%Y")
        .to_string()
}

type DayFn = Box<dyn Fn() -> String + Send + Sync>;

/// One reserved request, tied to the quota day it was taken on.
#[derive(Debug)]
#[must_use = "release the slot when the call fails"]
pub struct QuotaSlot {
    day: String,
}

/// Daily request counter with timezone-anchored rollover.
pub struct QuotaTracker {
    path: PathBuf,
    state: Mutex<QuotaState>,
    today: DayFn,
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("path", &self.path)
            .field("state", &self.state)
            .finish()
    }
}

impl QuotaTracker {
    /// Load from `path` using the Pacific-time day key.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        Self::with_day_fn(path, pacific_day)
    }

    /// Load from `path` with a custom day-key source.
    pub fn with_day_fn(
        path: impl Into<PathBuf>,
        today: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        let path = path.into();
        let state = match crate::store::read_json::<QuotaState>(&path) {
            Ok(Some(s)) => s,
            Ok(None) => QuotaState {
                daily_request_count: 0,
                daily_reset_date: today(),
            },
            Err(e) => {
                warn!("{e}; starting quota from zero");
                QuotaState {
                    daily_request_count: 0,
                    daily_reset_date: today(),
                }
            }
        };
        Self {
            path,
            state: Mutex::new(state),
            today: Box::new(today),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn persist(&self, state: &QuotaState) {
        if let Err(e) = write_json_atomic(&self.path, state) {
            warn!("Could not persist quota state: {e}");
        }
    }

    /// Reset the counter if the day key changed. Caller holds the lock.
    fn roll_over(&self, state: &mut QuotaState) {
        let today = (self.today)();
        if today != state.daily_reset_date {
            state.daily_request_count = 0;
            state.daily_reset_date = today;
            self.persist(state);
            info!(
                "Daily request counter reset. New day (PT): {}",
                state.daily_reset_date
            );
        }
    }

    /// Refuse when the quota for today is used up.
    pub fn check(&self, max: u32) -> Result<(), ForgeError> {
        let mut state = self.lock();
        self.roll_over(&mut state);
        if state.daily_request_count >= max {
            return Err(ForgeError::QuotaExhausted {
                count: state.daily_request_count,
                max,
            });
        }
        Ok(())
    }

    /// Take one slot of today's quota, refusing when none is left.
    ///
    /// Check and increment happen under one lock, so concurrent callers can
    /// never overrun `max`. Hand the slot back with [`QuotaTracker::release`]
    /// when the call it was taken for fails.
    pub fn reserve(&self, max: u32) -> Result<QuotaSlot, ForgeError> {
        let mut state = self.lock();
        self.roll_over(&mut state);
        if state.daily_request_count >= max {
            return Err(ForgeError::QuotaExhausted {
                count: state.daily_request_count,
                max,
            });
        }
        state.daily_request_count += 1;
        self.persist(&state);
        let n = state.daily_request_count;
        if n % 10 == 0 || n == max {
            info!("Daily requests: {n}/{max}");
        }
        Ok(QuotaSlot {
            day: state.daily_reset_date.clone(),
        })
    }

    /// Return an unused slot. A slot taken before a rollover or manual reset
    /// is dropped silently.
    pub fn release(&self, slot: QuotaSlot) {
        let mut state = self.lock();
        if state.daily_reset_date == slot.day && state.daily_request_count > 0 {
            state.daily_request_count -= 1;
            self.persist(&state);
        }
    }

    /// Manual reset to zero for the current day.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.daily_request_count = 0;
        state.daily_reset_date = (self.today)();
        self.persist(&state);
    }

    /// Consistent copy of the current state (after any rollover).
    pub fn snapshot(&self) -> QuotaState {
        let mut state = self.lock();
        self.roll_over(&mut state);
        state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn spacing_is_eighty_percent_of_even_share() {
        assert_eq!(RateGovernor::spacing(10), Duration::from_millis(4800));
        assert_eq!(RateGovernor::spacing(60), Duration::from_millis(800));
        // rpm 0 is treated as 1.
        assert_eq!(RateGovernor::spacing(0), Duration::from_secs(48));
    }

    #[tokio::test(start_paused = true)]
    async fn first_call_is_admitted_immediately() {
        let gov = RateGovernor::new();
        let t0 = Instant::now();
        gov.acquire(10).await;
        assert_eq!(Instant::now(), t0);
    }

    #[tokio::test(start_paused = true)]
    async fn calls_are_spaced() {
        let gov = RateGovernor::new();
        let t0 = Instant::now();
        gov.acquire(3).await;
        gov.acquire(3).await;
        assert!(Instant::now() - t0 >= Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn limit_plus_one_waits_for_the_window() {
        let gov = RateGovernor::new();
        let t0 = Instant::now();
        let mut starts = Vec::new();
        for _ in 0..4 {
            gov.acquire(3).await;
            starts.push(Instant::now() - t0);
        }
        // Spacing admits at 0 s, 16 s and 32 s; the fourth must wait until
        // the first start leaves the 60 s window.
        assert!(starts[2] < Duration::from_secs(60));
        assert!(starts[3] >= Duration::from_secs(60), "got {:?}", starts[3]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_the_window() {
        let gov = Arc::new(RateGovernor::new());
        let t0 = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let gov = Arc::clone(&gov);
            handles.push(tokio::spawn(async move {
                gov.acquire(2).await;
                Instant::now() - t0
            }));
        }
        let mut starts = Vec::new();
        for h in handles {
            starts.push(h.await.unwrap());
        }
        starts.sort();
        for w in starts.windows(3) {
            assert!(w[2] - w[0] >= WINDOW, "three starts inside one window: {w:?}");
        }
    }

    fn tracker_with_day(
        dir: &std::path::Path,
        day: Arc<Mutex<String>>,
    ) -> QuotaTracker {
        QuotaTracker::with_day_fn(dir.join("server_state.json"), move || {
            day.lock().unwrap().clone()
        })
    }

    #[test]
    fn exhaustion_is_refused_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let day = Arc::new(Mutex::new("1/1/2026".to_string()));
        let q = tracker_with_day(dir.path(), Arc::clone(&day));

        q.check(2).unwrap();
        let _ = q.reserve(2).unwrap();
        let _ = q.reserve(2).unwrap();
        let err = q.check(2).unwrap_err();
        assert!(matches!(err, ForgeError::QuotaExhausted { count: 2, max: 2 }));

        // A restart reads the persisted count.
        let again = tracker_with_day(dir.path(), day);
        assert!(again.check(2).is_err());
        assert_eq!(again.snapshot().daily_request_count, 2);
    }

    #[test]
    fn rollover_on_day_change() {
        let dir = tempfile::tempdir().unwrap();
        let day = Arc::new(Mutex::new("1/1/2026".to_string()));
        let q = tracker_with_day(dir.path(), Arc::clone(&day));
        let _ = q.reserve(1).unwrap();
        assert!(q.check(1).is_err());

        *day.lock().unwrap() = "1/2/2026".to_string();
        q.check(1).unwrap();
        let snap = q.snapshot();
        assert_eq!(snap.daily_request_count, 0);
        assert_eq!(snap.daily_reset_date, "1/2/2026");

        let on_disk: QuotaState =
            crate::store::read_json(&dir.path().join("server_state.json"))
                .unwrap()
                .unwrap();
        assert_eq!(on_disk, snap);
    }

    #[test]
    fn manual_reset_zeroes_the_count() {
        let dir = tempfile::tempdir().unwrap();
        let day = Arc::new(Mutex::new("3/3/2026".to_string()));
        let q = tracker_with_day(dir.path(), day);
        let _ = q.reserve(1).unwrap();
        q.reset();
        q.check(1).unwrap();
        assert_eq!(q.snapshot().daily_request_count, 0);
    }

    #[test]
    fn reservation_is_atomic_and_refundable() {
        let dir = tempfile::tempdir().unwrap();
        let day = Arc::new(Mutex::new("5/5/2026".to_string()));
        let q = tracker_with_day(dir.path(), day);

        let slot = q.reserve(1).unwrap();
        let err = q.reserve(1).unwrap_err();
        assert!(matches!(err, ForgeError::QuotaExhausted { count: 1, max: 1 }));

        q.release(slot);
        assert_eq!(q.snapshot().daily_request_count, 0);
        let _ = q.reserve(1).unwrap();
        assert_eq!(q.snapshot().daily_request_count, 1);
    }

    #[test]
    fn slot_from_previous_day_is_not_refunded() {
        let dir = tempfile::tempdir().unwrap();
        let day = Arc::new(Mutex::new("5/5/2026".to_string()));
        let q = tracker_with_day(dir.path(), Arc::clone(&day));

        let stale = q.reserve(5).unwrap();
        *day.lock().unwrap() = "5/6/2026".to_string();
        let _ = q.reserve(5).unwrap();
        q.release(stale);
        assert_eq!(q.snapshot().daily_request_count, 1);
    }

    #[test]
    fn pacific_day_has_us_date_shape() {
        let d = pacific_day();
        let parts: Vec<&str> = d.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 4);
    }
}
