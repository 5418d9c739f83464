//! Sequential advance+tick driver (spec.md §4.10, C12).
//!
//! The driver is deliberately NOT a worker pool (spec.md §9 "Threading vs.
//! async"): advancing the clock and fanning a tick out to every downstream
//! URL happens on a single task, one step and one URL at a time, so that
//! downstream services always observe a consistent, monotonically
//! increasing sim time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use quant_core::http::{HEADER_SIM_TIME, HEADER_WEBHOOK_TOKEN};
use quant_core::{AppError, Clock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvanceUnit {
    Days,
    Hours,
    Minutes,
    Seconds,
}

impl AdvanceUnit {
    pub fn duration(&self, value: i64) -> Duration {
        match self {
            AdvanceUnit::Days => Duration::days(value),
            AdvanceUnit::Hours => Duration::hours(value),
            AdvanceUnit::Minutes => Duration::minutes(value),
            AdvanceUnit::Seconds => Duration::seconds(value),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TickStatus {
    pub running: bool,
    pub steps_done: u32,
    pub steps_total: u32,
    pub executed_total: i64,
    pub cancelled: bool,
    pub error: Option<String>,
    pub now: DateTime<Utc>,
}

struct TickState {
    steps_done: u32,
    steps_total: u32,
    executed_total: i64,
    cancelled: bool,
    error: Option<String>,
}

impl TickState {
    fn idle() -> Self {
        Self { steps_done: 0, steps_total: 0, executed_total: 0, cancelled: false, error: None }
    }
}

pub struct AdvanceAndTickRequest {
    pub unit: AdvanceUnit,
    pub step_value: i64,
    pub steps: u32,
    pub tick_urls: Vec<String>,
    pub timeout: StdDuration,
    pub snap_to_boundary: bool,
    pub webhook_token: Option<String>,
}

/// Single-job sequential driver. `running` gates concurrent starts (409 per
/// spec.md §6.4); `cancel_flag` is checked between steps only — a step
/// already in flight always finishes (spec.md §5 "Cancellation & timeouts").
pub struct SimDriver {
    clock: Clock,
    http: reqwest::Client,
    running: AtomicBool,
    cancel_flag: Arc<AtomicBool>,
    state: Mutex<TickState>,
}

impl SimDriver {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            http: reqwest::Client::builder().build().expect("reqwest client"),
            running: AtomicBool::new(false),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(TickState::idle()),
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn status(&self) -> TickStatus {
        let s = self.state.lock();
        TickStatus {
            running: self.running.load(Ordering::SeqCst),
            steps_done: s.steps_done,
            steps_total: s.steps_total,
            executed_total: s.executed_total,
            cancelled: s.cancelled,
            error: s.error.clone(),
            now: self.clock.now(),
        }
    }

    /// Signals cancellation; a no-op if no job is running. The in-flight
    /// step (if any) still completes.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    /// Starts a new advance+tick job. Returns `Conflict` if one is already
    /// running (spec.md §6.4 "Returns 409 if a job is already running").
    pub fn start(self: &Arc<Self>, req: AdvanceAndTickRequest) -> Result<u32, AppError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AppError::Conflict("advance-and-tick job already running".into()));
        }
        self.cancel_flag.store(false, Ordering::SeqCst);
        *self.state.lock() = TickState { steps_total: req.steps, ..TickState::idle() };

        if req.snap_to_boundary && req.unit == AdvanceUnit::Minutes && [5, 15, 30, 60].contains(&req.step_value) {
            if let Err(e) = self.clock.snap_to_previous_boundary(req.step_value as u32) {
                warn!(error = %e, "snap_to_previous_boundary failed, continuing unsnapped");
            }
        }

        let steps = req.steps;
        let driver = Arc::clone(self);
        tokio::spawn(async move {
            driver.run(req).await;
        });
        Ok(steps)
    }

    async fn run(self: Arc<Self>, req: AdvanceAndTickRequest) {
        for _ in 0..req.steps {
            if self.cancel_flag.load(Ordering::SeqCst) {
                self.state.lock().cancelled = true;
                break;
            }

            let next = match self.clock.advance(req.unit.duration(req.step_value)) {
                Ok(t) => t,
                Err(e) => {
                    self.state.lock().error = Some(e.to_string());
                    break;
                }
            };
            info!(now = %next, "stime advancing step");

            let mut step_error = None;
            for (idx, url) in req.tick_urls.iter().enumerate() {
                let result = self.post_tick(url, next, req.timeout, req.webhook_token.as_deref()).await;
                match result {
                    Ok(body) => {
                        if idx == 0 {
                            if let Some(n) = extract_count(&body) {
                                self.state.lock().executed_total += n;
                            }
                        }
                    }
                    Err(e) => {
                        if idx == 0 {
                            // spec.md §4.10 step c: first URL failing aborts
                            // the whole step AND the whole job.
                            step_error = Some(format!("{url}: {e}"));
                            break;
                        } else {
                            warn!(url, error = %e, "tick fan-out: non-first URL failed, continuing");
                        }
                    }
                }
            }

            if let Some(err) = step_error {
                self.state.lock().error = Some(err);
                break;
            }
            self.state.lock().steps_done += 1;
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn post_tick(
        &self,
        url: &str,
        now: DateTime<Utc>,
        timeout: StdDuration,
        webhook_token: Option<&str>,
    ) -> Result<serde_json::Value, AppError> {
        let mut req = self
            .http
            .post(url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .header(HEADER_SIM_TIME, now.to_rfc3339());
        if let Some(token) = webhook_token {
            if !token.is_empty() {
                req = req.header(HEADER_WEBHOOK_TOKEN, token);
            }
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AppError::StoreUnreachable(format!("tick POST {url} failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(AppError::Internal(format!("tick POST {url} returned {}", resp.status())));
        }
        resp.json::<serde_json::Value>()
            .await
            .or_else(|_| Ok(serde_json::Value::Null))
    }
}

/// Best-effort extraction of a downstream step's "work done" count from its
/// JSON tick response, tried across the field names the two downstream
/// services actually use (ZuiLow's `jobs_dispatched`, a generic `executed`).
fn extract_count(body: &serde_json::Value) -> Option<i64> {
    for key in ["executed_total", "executed", "jobs_dispatched", "count"] {
        if let Some(n) = body.get(key).and_then(|v| v.as_i64()) {
            return Some(n);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_duration_conversion() {
        assert_eq!(AdvanceUnit::Days.duration(1), Duration::days(1));
        assert_eq!(AdvanceUnit::Minutes.duration(15), Duration::minutes(15));
    }

    #[test]
    fn extract_count_tries_known_fields() {
        assert_eq!(extract_count(&serde_json::json!({"jobs_dispatched": 3})), Some(3));
        assert_eq!(extract_count(&serde_json::json!({"executed": 7})), Some(7));
        assert_eq!(extract_count(&serde_json::json!({"other": 1})), None);
    }

    #[tokio::test]
    async fn cannot_start_two_jobs_concurrently() {
        let driver = Arc::new(SimDriver::new(Clock::new()));
        let req = AdvanceAndTickRequest {
            unit: AdvanceUnit::Seconds,
            step_value: 1,
            steps: 5,
            tick_urls: vec![],
            timeout: StdDuration::from_secs(1),
            snap_to_boundary: false,
            webhook_token: None,
        };
        assert!(driver.start(req).is_ok());
        let req2 = AdvanceAndTickRequest {
            unit: AdvanceUnit::Seconds,
            step_value: 1,
            steps: 1,
            tick_urls: vec![],
            timeout: StdDuration::from_secs(1),
            snap_to_boundary: false,
            webhook_token: None,
        };
        assert!(driver.start(req2).is_err());
    }

    #[tokio::test]
    async fn cancel_stops_before_steps_total() {
        let driver = Arc::new(SimDriver::new(Clock::new()));
        let req = AdvanceAndTickRequest {
            unit: AdvanceUnit::Seconds,
            step_value: 1,
            steps: 100,
            tick_urls: vec![],
            timeout: StdDuration::from_secs(1),
            snap_to_boundary: false,
            webhook_token: None,
        };
        driver.start(req).unwrap();
        driver.cancel();
        // Give the background task a chance to observe the cancel flag.
        for _ in 0..50 {
            if !driver.status().running {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        let status = driver.status();
        assert!(!status.running);
        assert!(status.steps_done < status.steps_total);
    }
}
