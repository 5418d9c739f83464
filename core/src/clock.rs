//! Process-wide simulation/real time source.
//!
//! Every component in a service MUST obtain "now" exclusively through a
//! [`Clock`] handle rather than calling `Utc::now()` directly, so that the
//! whole process can be driven deterministically by Stime in sim mode.

use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use parking_lot::Mutex;

use crate::error::AppError;

#[derive(Debug)]
struct Inner {
    /// `None` means real (wall-clock) mode; `Some(t)` means sim mode pinned at `t`.
    sim_time: Option<DateTime<Utc>>,
}

/// Cheaply cloneable handle onto one process-wide clock.
#[derive(Debug, Clone)]
pub struct Clock {
    inner: Arc<Mutex<Inner>>,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    /// A clock that starts in real (wall-clock) mode.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { sim_time: None })),
        }
    }

    /// A clock pinned at `t` from construction (sim mode).
    pub fn at(t: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { sim_time: Some(t) })),
        }
    }

    /// Current instant: wall clock in real mode, the stored instant in sim mode.
    pub fn now(&self) -> DateTime<Utc> {
        match self.inner.lock().sim_time {
            Some(t) => t,
            None => Utc::now(),
        }
    }

    pub fn now_iso(&self) -> String {
        self.now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }

    pub fn today(&self) -> chrono::NaiveDate {
        self.now().date_naive()
    }

    pub fn is_sim_mode(&self) -> bool {
        self.inner.lock().sim_time.is_some()
    }

    /// Set an absolute sim instant. Enters sim mode if not already in it.
    pub fn set(&self, t: DateTime<Utc>) {
        self.inner.lock().sim_time = Some(t);
    }

    /// Parse `t` as UTC ISO-8601 and set it; fails on unparsable input.
    pub fn set_iso(&self, t: &str) -> Result<DateTime<Utc>, AppError> {
        let parsed = parse_iso_utc(t)?;
        self.set(parsed);
        Ok(parsed)
    }

    /// Monotone forward step. `dur` must be strictly positive.
    pub fn advance(&self, dur: Duration) -> Result<DateTime<Utc>, AppError> {
        if dur <= Duration::zero() {
            return Err(AppError::BadRequest("advance duration must be > 0".into()));
        }
        let mut guard = self.inner.lock();
        let base = guard.sim_time.unwrap_or_else(Utc::now);
        let next = base + dur;
        guard.sim_time = Some(next);
        Ok(next)
    }

    /// Floor the current instant's minute to a multiple of `step_minutes`.
    /// `step_minutes` must be one of {5, 15, 30, 60}.
    pub fn snap_to_previous_boundary(&self, step_minutes: u32) -> Result<DateTime<Utc>, AppError> {
        if ![5, 15, 30, 60].contains(&step_minutes) {
            return Err(AppError::BadRequest(format!(
                "invalid snap step_minutes: {step_minutes}"
            )));
        }
        let mut guard = self.inner.lock();
        let base = guard.sim_time.unwrap_or_else(Utc::now);
        let floored_minute = (base.minute() / step_minutes) * step_minutes;
        let snapped = base
            .with_minute(floored_minute)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(base);
        guard.sim_time = Some(snapped);
        Ok(snapped)
    }
}

/// Parse a header/body value as UTC ISO-8601. Accepts trailing `Z`.
pub fn parse_iso_utc(s: &str) -> Result<DateTime<Utc>, AppError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(AppError::BadRequest("empty timestamp".into()));
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::BadRequest(format!("invalid UTC ISO-8601 timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_mode_tracks_wall_clock() {
        let clock = Clock::new();
        assert!(!clock.is_sim_mode());
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn set_enters_sim_mode_and_pins_time() {
        let clock = Clock::new();
        let t = parse_iso_utc("2025-06-01T16:00:00Z").unwrap();
        clock.set(t);
        assert!(clock.is_sim_mode());
        assert_eq!(clock.now(), t);
        assert_eq!(clock.now(), t); // stays pinned
    }

    #[test]
    fn advance_is_monotone() {
        let clock = Clock::at(parse_iso_utc("2025-06-01T16:00:00Z").unwrap());
        let t1 = clock.advance(Duration::days(1)).unwrap();
        assert_eq!(t1, parse_iso_utc("2025-06-02T16:00:00Z").unwrap());
        let t2 = clock.advance(Duration::hours(1)).unwrap();
        assert_eq!(t2, t1 + Duration::hours(1));
    }

    #[test]
    fn advance_rejects_non_positive_duration() {
        let clock = Clock::new();
        assert!(clock.advance(Duration::zero()).is_err());
        assert!(clock.advance(Duration::seconds(-1)).is_err());
    }

    #[test]
    fn snap_floors_to_boundary() {
        let clock = Clock::at(parse_iso_utc("2025-06-01T16:47:12Z").unwrap());
        let snapped = clock.snap_to_previous_boundary(15).unwrap();
        assert_eq!(snapped, parse_iso_utc("2025-06-01T16:45:00Z").unwrap());
    }

    #[test]
    fn snap_rejects_bad_step() {
        let clock = Clock::new();
        assert!(clock.snap_to_previous_boundary(7).is_err());
    }
}
