//! Cron/interval task dispatcher (spec.md §4.3 "Scheduling").
//!
//! One dispatcher loop wakes every `<=60s`; for each enabled task whose
//! trigger fires it spawns a worker and moves on without blocking. A task
//! already `Running` is never started a second time.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use parking_lot::RwLock;
use quant_core::{AppError, BarStore, Clock, Fetcher, Interval};
use serde::Serialize;
use tracing::{error, info};

use crate::config::Config;
use crate::replication::ReplicationManager;
use crate::store::SqliteBarStore;
use crate::tasks::{self, TaskKind};

#[derive(Debug, Clone)]
pub enum Trigger {
    Cron(String),
    Interval(StdDuration),
}

#[derive(Debug, Clone)]
pub struct TaskDef {
    pub name: String,
    pub kind: TaskKind,
    pub symbols: Vec<String>,
    pub interval: Interval,
    pub trigger: Trigger,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Running,
    Completed,
    Failed,
}

struct Runtime {
    state: TaskState,
    last_check: DateTime<Utc>,
}

pub struct Scheduler {
    pub store: Arc<SqliteBarStore>,
    pub fetcher: Arc<dyn Fetcher>,
    pub clock: Clock,
    pub config: Config,
    pub tasks: RwLock<Vec<TaskDef>>,
    runtime: RwLock<HashMap<String, Runtime>>,
    pub replication: Arc<ReplicationManager>,
}

impl Scheduler {
    pub fn new(
        store: Arc<SqliteBarStore>,
        fetcher: Arc<dyn Fetcher>,
        clock: Clock,
        config: Config,
        tasks: Vec<TaskDef>,
    ) -> Self {
        let now = clock.now();
        let mut runtime = HashMap::new();
        for t in &tasks {
            let state = match store.last_task_status(&t.name) {
                Ok(Some(s)) if s == "running" => TaskState::Running,
                Ok(Some(s)) if s == "failed" => TaskState::Failed,
                Ok(Some(_)) => TaskState::Completed,
                _ => TaskState::Idle,
            };
            runtime.insert(
                t.name.clone(),
                Runtime {
                    state,
                    last_check: now,
                },
            );
        }
        let replication = Arc::new(ReplicationManager::new(
            store.clone(),
            fetcher.clone(),
            config.clone(),
        ));
        Self {
            store,
            fetcher,
            clock,
            config,
            tasks: RwLock::new(tasks),
            runtime: RwLock::new(runtime),
            replication,
        }
    }

    pub fn task_states(&self) -> Vec<(String, TaskState)> {
        self.runtime
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.state))
            .collect()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.read().iter().map(|t| t.name.clone()).collect()
    }

    /// Dispatcher loop: never blocks on a task run.
    pub async fn run_loop(self: Arc<Self>) {
        loop {
            self.clone().tick().await;
            tokio::time::sleep(StdDuration::from_secs(30)).await;
        }
    }

    async fn tick(self: Arc<Self>) {
        let now = self.clock.now();
        let due: Vec<TaskDef> = {
            let tasks = self.tasks.read();
            let mut runtime = self.runtime.write();
            tasks
                .iter()
                .filter(|t| t.enabled)
                .filter(|t| {
                    let rt = runtime
                        .entry(t.name.clone())
                        .or_insert_with(|| Runtime {
                            state: TaskState::Idle,
                            last_check: now,
                        });
                    if rt.state == TaskState::Running {
                        return false;
                    }
                    let due = match &t.trigger {
                        Trigger::Cron(expr) => cron_due(expr, rt.last_check, now),
                        Trigger::Interval(dur) => {
                            now - rt.last_check >= Duration::from_std(*dur).unwrap_or(Duration::zero())
                        }
                    };
                    if due {
                        rt.last_check = now;
                    }
                    due
                })
                .cloned()
                .collect()
        };

        for task in due {
            self.clone().spawn_task_run(task);
        }
    }

    fn spawn_task_run(self: Arc<Self>, task: TaskDef) {
        self.set_state(&task.name, TaskState::Running);
        tokio::spawn(async move {
            let start = self.clock.now();
            let log_id = match self
                .store
                .record_maintenance_start(&task.name, task.kind.as_str(), start)
            {
                Ok(id) => id,
                Err(e) => {
                    error!(task = %task.name, error = %e, "failed to record maintenance start");
                    self.set_state(&task.name, TaskState::Failed);
                    return;
                }
            };
            let result = run_one(&*self.store, &*self.fetcher, &self.clock, &self.config, &task).await;
            let end = self.clock.now();
            match result {
                Ok(outcome) => {
                    let _ = self.store.record_maintenance_end(
                        log_id,
                        end,
                        "completed",
                        outcome.data_count,
                        outcome.message.as_deref(),
                        None,
                    );
                    info!(task = %task.name, rows = outcome.data_count, "task completed");
                    self.set_state(&task.name, TaskState::Completed);
                    if outcome.data_count > 0 {
                        self.replication.fan_out(task.symbols.clone(), task.interval).await;
                    }
                }
                Err(e) => {
                    let _ = self
                        .store
                        .record_maintenance_end(log_id, end, "failed", 0, None, Some(&e.to_string()));
                    error!(task = %task.name, error = %e, "task failed");
                    self.set_state(&task.name, TaskState::Failed);
                }
            }
        });
    }

    fn set_state(&self, name: &str, state: TaskState) {
        if let Some(rt) = self.runtime.write().get_mut(name) {
            rt.state = state;
        }
    }

    /// `POST /tasks/trigger`: run one named task immediately, bypassing its
    /// trigger, unless it is already `Running`.
    pub fn trigger_now(self: Arc<Self>, name: &str) -> bool {
        let task = self.tasks.read().iter().find(|t| t.name == name).cloned();
        let Some(task) = task else { return false };
        if self.runtime.read().get(name).map(|rt| rt.state) == Some(TaskState::Running) {
            return false;
        }
        self.spawn_task_run(task);
        true
    }

    /// `POST /tasks/trigger-all`: run every enabled task whose kind matches
    /// `task_type` (or all tasks when `None`), skipping ones already running.
    pub fn trigger_all(self: Arc<Self>, task_type: Option<&str>) -> Vec<String> {
        let candidates: Vec<TaskDef> = self
            .tasks
            .read()
            .iter()
            .filter(|t| t.enabled)
            .filter(|t| task_type.map(|ty| t.kind.as_str() == ty).unwrap_or(true))
            .cloned()
            .collect();
        let mut triggered = Vec::new();
        for task in candidates {
            if self.runtime.read().get(&task.name).map(|rt| rt.state) == Some(TaskState::Running) {
                continue;
            }
            triggered.push(task.name.clone());
            self.clone().spawn_task_run(task);
        }
        triggered
    }
}

async fn run_one(
    store: &dyn BarStore,
    fetcher: &dyn Fetcher,
    clock: &Clock,
    config: &Config,
    task: &TaskDef,
) -> Result<tasks::TaskRunOutcome, AppError> {
    match task.kind {
        TaskKind::Incremental => {
            tasks::run_incremental(store, fetcher, clock, config, &task.symbols, task.interval).await
        }
        TaskKind::FullSync => {
            let now = clock.now();
            let start = now - Duration::days(config.initial_days);
            tasks::run_full_sync(store, fetcher, &task.symbols, task.interval, start, now).await
        }
        TaskKind::Validation => {
            tasks::run_validation(store, clock, config, &task.symbols, task.interval).await
        }
        TaskKind::Repair => tasks::run_repair(store, fetcher, clock, config, &task.symbols, task.interval).await,
    }
}

fn cron_due(expr: &str, last_check: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match Schedule::from_str(expr) {
        Ok(schedule) => schedule
            .after(&last_check)
            .next()
            .map(|next| now >= next)
            .unwrap_or(false),
        Err(e) => {
            error!(expr, error = %e, "invalid cron expression");
            false
        }
    }
}
