//! ZuiLow Scheduler (spec.md §4.7, C9): the trigger engine, job state and
//! auto-injected execution jobs. Strategy jobs always run before execution
//! jobs within the same tick — load-bearing for replay correctness.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::RwLock;
use quant_core::{Clock, Notifier};
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::events::{Condition, EventBus};
use crate::executor::SignalExecutor;
use crate::signal_store::{NewSignal, SignalStore};
use crate::store::ZuiLowStore;
use crate::strategy::{convert_to_signals, run_strategy, Strategy};

#[derive(Clone)]
pub enum JobTrigger {
    Cron(String),
    Interval(StdDuration),
    Event { event_type: String, condition: Condition },
    MarketOpen,
    MarketClose,
    OpenBar,
    AtTime(String),
}

/// Factory so the scheduler can create a fresh strategy instance per run
/// without the runtime state of one invocation leaking into the next.
pub trait StrategyFactory: Send + Sync {
    fn create(&self) -> Box<dyn Strategy>;
}

impl<F> StrategyFactory for F
where
    F: Fn() -> Box<dyn Strategy> + Send + Sync,
{
    fn create(&self) -> Box<dyn Strategy> {
        (self)()
    }
}

#[derive(Clone)]
pub struct JobConfig {
    pub name: String,
    /// `None` marks an auto-injected execution job (spec.md §4.7 "Job
    /// loading"); such jobs never run a strategy, only SignalExecutor.
    pub strategy_name: Option<String>,
    pub trigger: JobTrigger,
    pub account: String,
    pub market: Option<String>,
    pub priority: i32,
    pub send_immediately: bool,
    pub enabled: bool,
    /// `true` for `exec_<market>_{open,close,bar}` jobs; never eligible for
    /// manual trigger.
    pub auto_injected: bool,
}

impl JobConfig {
    fn is_execution_job(&self) -> bool {
        self.strategy_name.is_none()
    }
}

struct JobRuntime {
    last_run: DateTime<Utc>,
    run_count: u64,
    error_count: u64,
    is_running: Arc<AtomicBool>,
}

pub struct Scheduler {
    pub clock: Clock,
    pub config: Config,
    pub signals: Arc<SignalStore>,
    pub executor: Arc<SignalExecutor>,
    pub events: Arc<EventBus>,
    pub notifier: Arc<dyn Notifier>,
    store: Arc<ZuiLowStore>,
    jobs: RwLock<Vec<JobConfig>>,
    runtime: RwLock<HashMap<String, JobRuntime>>,
    strategies: RwLock<HashMap<String, Arc<dyn StrategyFactory>>>,
    brokers: Arc<crate::executor::BrokerRegistry>,
}

impl Scheduler {
    pub fn new(
        clock: Clock,
        config: Config,
        store: Arc<ZuiLowStore>,
        signals: Arc<SignalStore>,
        executor: Arc<SignalExecutor>,
        brokers: Arc<crate::executor::BrokerRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let now = clock.now();
        let mut jobs = Vec::new();
        for market in config.markets.iter().filter(|m| m.enabled) {
            for (suffix, trigger) in [
                ("open", JobTrigger::MarketOpen),
                ("close", JobTrigger::MarketClose),
                ("bar", JobTrigger::OpenBar),
            ] {
                jobs.push(JobConfig {
                    name: format!("exec_{}_{}", market.code.to_lowercase(), suffix),
                    strategy_name: None,
                    trigger,
                    account: config.default_account.clone(),
                    market: Some(market.code.clone()),
                    priority: 0,
                    send_immediately: false,
                    enabled: true,
                    auto_injected: true,
                });
            }
        }
        let mut runtime = HashMap::new();
        for j in &jobs {
            runtime.insert(
                j.name.clone(),
                JobRuntime { last_run: now, run_count: 0, error_count: 0, is_running: Arc::new(AtomicBool::new(false)) },
            );
        }

        Self {
            clock,
            config,
            signals,
            executor,
            events: Arc::new(EventBus::new()),
            notifier,
            store,
            jobs: RwLock::new(jobs),
            runtime: RwLock::new(runtime),
            strategies: RwLock::new(HashMap::new()),
            brokers,
        }
    }

    pub fn register_strategy(&self, name: &str, factory: Arc<dyn StrategyFactory>) {
        self.strategies.write().insert(name.to_string(), factory);
    }

    /// Adds a strategy-backed job not covered by auto-injection. Safe to
    /// call after construction; used by `reload_config`.
    pub fn add_job(&self, job: JobConfig) {
        let now = self.clock.now();
        self.runtime.write().insert(
            job.name.clone(),
            JobRuntime { last_run: now, run_count: 0, error_count: 0, is_running: Arc::new(AtomicBool::new(false)) },
        );
        self.jobs.write().push(job);
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.read().iter().map(|j| j.name.clone()).collect()
    }

    pub fn job_status(&self) -> Vec<serde_json::Value> {
        let jobs = self.jobs.read();
        let runtime = self.runtime.read();
        jobs.iter()
            .map(|j| {
                let rt = runtime.get(&j.name);
                json!({
                    "name": j.name,
                    "enabled": j.enabled,
                    "auto_injected": j.auto_injected,
                    "account": j.account,
                    "market": j.market,
                    "run_count": rt.map(|r| r.run_count).unwrap_or(0),
                    "error_count": rt.map(|r| r.error_count).unwrap_or(0),
                    "is_running": rt.map(|r| r.is_running.load(Ordering::SeqCst)).unwrap_or(false),
                })
            })
            .collect()
    }

    /// Dispatcher loop: one tick per `tick_interval_secs`.
    pub async fn run_loop(self: Arc<Self>) {
        loop {
            self.clone().tick(None).await;
            tokio::time::sleep(StdDuration::from_secs(self.config.tick_interval_secs)).await;
        }
    }

    /// Evaluates every enabled job and dispatches the due ones, strategy
    /// jobs first (spec.md §4.7 "Tick semantics"). `sim_time` overrides
    /// `Clock.now()` when the tick was driven by Stime's `X-Simulation-Time`.
    pub async fn tick(self: Arc<Self>, sim_time: Option<DateTime<Utc>>) -> usize {
        let now = sim_time.unwrap_or_else(|| self.clock.now());
        let mut due: Vec<JobConfig> = {
            let jobs = self.jobs.read();
            let mut runtime = self.runtime.write();
            jobs.iter()
                .filter(|j| j.enabled)
                .filter(|j| {
                    let rt = runtime.entry(j.name.clone()).or_insert_with(|| JobRuntime {
                        last_run: now,
                        run_count: 0,
                        error_count: 0,
                        is_running: Arc::new(AtomicBool::new(false)),
                    });
                    if rt.is_running.load(Ordering::SeqCst) {
                        return false;
                    }
                    trigger_due(&j.trigger, rt.last_run, now, &self.config, &self.events)
                })
                .cloned()
                .collect()
        };
        // Strategy jobs (is_execution_job = false) before execution jobs.
        due.sort_by_key(|j| (j.is_execution_job(), -j.priority));

        let n = due.len();
        for job in due {
            if let Some(rt) = self.runtime.write().get_mut(&job.name) {
                rt.last_run = now;
            }
            self.clone().spawn_job_run(job, now);
        }
        n
    }

    fn spawn_job_run(self: Arc<Self>, job: JobConfig, now: DateTime<Utc>) {
        let is_running = match self.runtime.read().get(&job.name) {
            Some(rt) => rt.is_running.clone(),
            None => return,
        };
        if is_running.swap(true, Ordering::SeqCst) {
            return; // already running: re-entrancy guard
        }
        tokio::spawn(async move {
            let result = self.run_job(&job, now).await;
            if let Some(rt) = self.runtime.write().get_mut(&job.name) {
                rt.run_count += 1;
                if result.is_err() {
                    rt.error_count += 1;
                }
            }
            is_running.store(false, Ordering::SeqCst);
        });
    }

    async fn run_job(self: &Arc<Self>, job: &JobConfig, now: DateTime<Utc>) -> Result<(), quant_core::AppError> {
        if job.is_execution_job() {
            let outcome = self
                .executor
                .run_once(Some(&job.account), job.market.as_deref(), Some(now), now)
                .await?;
            if outcome.failed > 0 {
                warn!(job = %job.name, failed = outcome.failed, "execution job had failures");
            }
            return Ok(());
        }

        let strategy_name = job.strategy_name.as_deref().unwrap_or_default();
        let log_id = self.store.record_job_start(&job.name, now, self.clock.now())?;

        let outcome = self.run_strategy_job(job, strategy_name, now).await;
        let end = self.clock.now();
        match outcome {
            Ok((signals, exec_summary)) => {
                self.store.record_job_end(log_id, end, "success", signals.len() as i64, Some(&json!(signals)), None)?;
                self.notifier.notify("signal", json!({ "job": job.name, "count": signals.len() })).await;
                if let Some(summary) = exec_summary {
                    if summary.failed == 0 {
                        self.notifier.notify("success", json!({ "job": job.name })).await;
                    } else {
                        self.notifier.notify("failure", json!({ "job": job.name, "errors": summary.errors })).await;
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.store.record_job_end(log_id, end, "failed", 0, None, Some(&e.to_string()))?;
                self.notifier.notify("failure", json!({ "job": job.name, "error": e.to_string() })).await;
                error!(job = %job.name, error = %e, "strategy job failed");
                Err(e)
            }
        }
    }

    async fn run_strategy_job(
        self: &Arc<Self>,
        job: &JobConfig,
        strategy_name: &str,
        now: DateTime<Utc>,
    ) -> Result<(Vec<String>, Option<crate::executor::RunOnceOutcome>), quant_core::AppError> {
        let factory = self
            .strategies
            .read()
            .get(strategy_name)
            .cloned()
            .ok_or_else(|| quant_core::AppError::NotFound(format!("strategy '{strategy_name}'")))?;
        let mut strategy = factory.create();

        let broker_type = self
            .config
            .broker_type_for(&job.account)
            .ok_or_else(|| quant_core::AppError::BadRequest(format!("account '{}' has no configured broker type", job.account)))?;
        let broker = self
            .brokers
            .get(broker_type)
            .ok_or_else(|| quant_core::AppError::Internal(format!("broker type '{broker_type}' not registered")))?;

        let symbols = default_symbols_for(job.market.as_deref());
        let dicts = run_strategy(&mut *strategy, &symbols, &job.account, now, self.config.default_qty, &*broker).await?;
        let news: Vec<NewSignal> = convert_to_signals(dicts, &job.name, &job.account, job.market.clone(), None);
        let inserted = self.signals.add_many(news, now)?;
        let ids: Vec<String> = inserted.iter().map(|s| s.id.clone()).collect();

        let exec_summary = if job.send_immediately {
            let summary = self.executor.execute_signals(&inserted, now).await;
            Some(summary)
        } else {
            None
        };

        Ok((ids, exec_summary))
    }

    /// Only allowed on enabled, strategy-backed jobs (spec.md §4.7 "Manual
    /// trigger"). Replaces the next scheduled fire.
    pub fn trigger_now(self: Arc<Self>, name: &str) -> bool {
        let job = self.jobs.read().iter().find(|j| j.name == name).cloned();
        let Some(job) = job else { return false };
        if !job.enabled || job.auto_injected {
            return false;
        }
        let now = self.clock.now();
        self.spawn_job_run(job, now);
        true
    }

    /// `reload_config()`: drops and reloads jobs from `new_jobs`. On the
    /// caller's failure to build `new_jobs` the previous set is kept rather
    /// than lost outright (a deliberate deviation, see SPEC_FULL.md).
    pub fn reload_config(&self, new_jobs: Vec<JobConfig>) {
        let now = self.clock.now();
        let mut runtime = self.runtime.write();
        runtime.clear();
        for j in &new_jobs {
            runtime.insert(
                j.name.clone(),
                JobRuntime { last_run: now, run_count: 0, error_count: 0, is_running: Arc::new(AtomicBool::new(false)) },
            );
        }
        *self.jobs.write() = new_jobs;
    }

    pub fn job_history(&self, job_name: Option<&str>, limit: i64) -> Result<Vec<crate::store::JobHistoryRow>, quant_core::AppError> {
        self.store.job_history(job_name, limit)
    }

    pub fn statistics(&self) -> serde_json::Value {
        let runtime = self.runtime.read();
        let total_runs: u64 = runtime.values().map(|r| r.run_count).sum();
        let total_errors: u64 = runtime.values().map(|r| r.error_count).sum();
        json!({ "jobs": runtime.len(), "total_runs": total_runs, "total_errors": total_errors })
    }
}

/// Placeholder universe per market until a real watchlist config is wired
/// in; enough to exercise the strategy/execution job split end to end.
fn default_symbols_for(market: Option<&str>) -> Vec<String> {
    match market {
        Some("HK") => vec!["HK.00700".to_string()],
        _ => vec!["US.AAPL".to_string(), "US.MSFT".to_string()],
    }
}

fn trigger_due(trigger: &JobTrigger, last_run: DateTime<Utc>, now: DateTime<Utc>, config: &Config, events: &EventBus) -> bool {
    match trigger {
        JobTrigger::Cron(expr) | JobTrigger::AtTime(expr) => cron_due(expr, last_run, now),
        JobTrigger::Interval(dur) => now - last_run >= Duration::from_std(*dur).unwrap_or(Duration::zero()),
        JobTrigger::Event { event_type, condition } => events.is_due(event_type, condition),
        JobTrigger::MarketOpen => market_time_due(now, config, true),
        JobTrigger::MarketClose => market_time_due(now, config, false),
        JobTrigger::OpenBar => open_bar_due(now, config),
    }
}

fn cron_due(expr: &str, last_run: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let Ok(schedule) = Schedule::from_str(expr) else {
        return false;
    };
    schedule
        .after(&last_run)
        .take_while(|t| *t <= now)
        .next()
        .is_some()
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.split_once(':')?;
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

/// Parses `m.timezone` as an IANA zone; falls back to UTC (with a warning)
/// if the configured string isn't one `chrono-tz` recognizes.
fn market_tz(m: &crate::config::MarketConfig) -> Tz {
    m.timezone.parse().unwrap_or_else(|_| {
        warn!(market = %m.code, timezone = %m.timezone, "unknown market timezone, falling back to UTC");
        Tz::UTC
    })
}

/// `now` converted into `m.timezone` before comparing against the
/// configured `HH:MM` (spec.md §4.7 "Triggers": `market_open`/`market_close`
/// fire when local time in `market_timezone` equals the configured time).
fn market_time_due(now: DateTime<Utc>, config: &Config, is_open: bool) -> bool {
    config.markets.iter().filter(|m| m.enabled).any(|m| {
        let local = now.with_timezone(&market_tz(m));
        if local.weekday().num_days_from_monday() >= 5 {
            return false;
        }
        let target = if is_open { &m.open_time } else { &m.close_time };
        parse_hhmm(target).map(|t| t.hour() == local.hour() && t.minute() == local.minute()).unwrap_or(false)
    })
}

fn open_bar_due(now: DateTime<Utc>, config: &Config) -> bool {
    config.markets.iter().filter(|m| m.enabled).any(|m| {
        let local = now.with_timezone(&market_tz(m));
        if local.weekday().num_days_from_monday() >= 5 {
            return false;
        }
        m.bar_minutes > 0 && local.minute() as i64 % m.bar_minutes == 0 && local.second() == 0
    })
}
