//! Interval scheduler: fires configured workflows on a fixed period.
//!
//! The scheduler only decides *when*; triggered runs are handed to the
//! caller over a channel and the daemon feeds them to the Execution Manager.

use agentpilot_config::{MAX_DURATION_SECS, ScheduleConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use crate::error::WorkflowError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,

    /// Path to the workflow definition
    pub workflow: String,

    pub interval_secs: u64,

    /// Invocation input for every run
    pub input: Value,

    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self {
            name: config.name.clone(),
            workflow: config.workflow.clone(),
            interval_secs: config.interval_secs,
            input: config.input.clone(),
            enabled: config.enabled,
            last_run: None,
        }
    }

    /// Enabled, and never run or a full interval has passed since.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_run {
            None => true,
            Some(last) => i64::try_from(self.interval_secs).is_ok_and(|secs| (now - last).num_seconds() >= secs),
        }
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        if !self.enabled {
            return None;
        }
        match self.last_run {
            None => Some(Utc::now()),
            Some(last) => {
                let interval = chrono::Duration::try_seconds(i64::try_from(self.interval_secs).ok()?)?;
                last.checked_add_signed(interval)
            }
        }
    }
}

/// A schedule that came due.
#[derive(Debug, Clone)]
pub struct TriggeredRun {
    pub schedule: String,
    pub workflow: String,
    pub input: Value,
    pub fired_at: DateTime<Utc>,
}

pub struct IntervalScheduler {
    schedules: Arc<RwLock<HashMap<String, Schedule>>>,
    tick: Duration,
}

impl IntervalScheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            schedules: Arc::new(RwLock::new(HashMap::new())),
            tick,
        }
    }

    /// Build a scheduler holding every configured schedule.
    pub async fn from_config(schedules: &[ScheduleConfig], tick: Duration) -> Result<Self, WorkflowError> {
        let scheduler = Self::new(tick);
        for config in schedules {
            scheduler.add(Schedule::from_config(config)).await?;
        }
        Ok(scheduler)
    }

    pub async fn add(&self, schedule: Schedule) -> Result<(), WorkflowError> {
        if schedule.name.trim().is_empty() {
            return Err(WorkflowError::Validation("schedule name must not be empty".into()));
        }
        if !(1..=MAX_DURATION_SECS).contains(&schedule.interval_secs) {
            return Err(WorkflowError::Validation(format!(
                "schedule '{}': interval_secs must be between 1 and {MAX_DURATION_SECS}",
                schedule.name
            )));
        }
        info!(schedule = %schedule.name, workflow = %schedule.workflow, interval_secs = schedule.interval_secs, "adding schedule");
        self.schedules.write().await.insert(schedule.name.clone(), schedule);
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.schedules.write().await.remove(name).is_some()
    }

    /// All schedules, sorted by name.
    pub async fn list(&self) -> Vec<Schedule> {
        let mut schedules: Vec<Schedule> = self.schedules.read().await.values().cloned().collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        schedules
    }

    pub async fn pause(&self, name: &str) -> bool {
        self.set_enabled(name, false).await
    }

    pub async fn resume(&self, name: &str) -> bool {
        self.set_enabled(name, true).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.schedules.write().await.get_mut(name) {
            Some(schedule) => {
                schedule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Mark every due schedule as run and return its trigger.
    pub async fn collect_due(&self, now: DateTime<Utc>) -> Vec<TriggeredRun> {
        let mut schedules = self.schedules.write().await;
        let mut due: Vec<TriggeredRun> = schedules
            .values_mut()
            .filter(|s| s.is_due(now))
            .map(|s| {
                s.last_run = Some(now);
                TriggeredRun {
                    schedule: s.name.clone(),
                    workflow: s.workflow.clone(),
                    input: s.input.clone(),
                    fired_at: now,
                }
            })
            .collect();
        due.sort_by(|a, b| a.schedule.cmp(&b.schedule));
        due
    }

    /// Start the tick loop. Returns the trigger receiver and the loop's
    /// handle; the loop stops when the receiver is dropped.
    pub fn start(&self) -> (mpsc::Receiver<TriggeredRun>, tokio::task::JoinHandle<()>) {
        let scheduler = Self {
            schedules: self.schedules.clone(),
            tick: self.tick,
        };
        let (tx, rx) = mpsc::channel::<TriggeredRun>(64);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.tick);
            loop {
                interval.tick().await;
                for triggered in scheduler.collect_due(Utc::now()).await {
                    info!(schedule = %triggered.schedule, workflow = %triggered.workflow, "schedule triggered");
                    if tx.send(triggered).await.is_err() {
                        debug!("trigger receiver dropped, stopping scheduler");
                        return;
                    }
                }
            }
        });

        (rx, handle)
    }
}

impl Default for IntervalScheduler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
