//! Cron scheduler: fires named JobManager methods on 5- or 6-field cron
//! expressions evaluated in Asia/Shanghai. Jobs can be paused, resumed,
//! toggled, and manually triggered at runtime.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Asia::Shanghai;
use cron::Schedule;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use qt_types::{Job, JobSpec};

/// Ceiling on one job execution.
const JOB_TIMEOUT: Duration = Duration::from_secs(300);
/// Firing check cadence.
const TICK: Duration = Duration::from_millis(500);

type RunFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Resolves a `job_method` name to an executable body. Implemented by the
/// JobManager; mocked in tests.
pub trait JobRunner: Send + Sync {
    fn run(&self, method: &str) -> RunFuture;
}

struct ScheduledJob {
    job: Job,
    schedule: Schedule,
}

impl ScheduledJob {
    fn recompute_next(&mut self) {
        self.job.next_trigger_time = if self.job.enabled {
            self.schedule
                .upcoming(Shanghai)
                .next()
                .map(|dt| dt.with_timezone(&Utc))
        } else {
            None
        };
    }
}

/// The scheduler. Owns its firing task; job state is single-writer from the
/// control methods with atomic visibility to the firing loop.
pub struct TaskScheduler {
    jobs: Arc<RwLock<HashMap<String, ScheduledJob>>>,
    runner: Arc<dyn JobRunner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Accept 5-field (min hour dom mon dow) by prepending a seconds field;
/// 6/7-field expressions pass through.
pub fn normalize_cron(expression: &str) -> String {
    match expression.split_whitespace().count() {
        5 => format!("0 {expression}"),
        _ => expression.to_string(),
    }
}

impl TaskScheduler {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            runner,
            task: Mutex::new(None),
        }
    }

    /// Load jobs from config specs. Invalid cron expressions are skipped
    /// with an error log, never fatal.
    pub fn load_jobs(&self, specs: &[JobSpec]) {
        let mut jobs = self.jobs.write();
        for spec in specs {
            let normalized = normalize_cron(&spec.cron_expression);
            let schedule = match Schedule::from_str(&normalized) {
                Ok(schedule) => schedule,
                Err(e) => {
                    error!(
                        job_id = %spec.job_id,
                        expression = %spec.cron_expression,
                        error = %e,
                        "invalid cron expression, job skipped"
                    );
                    continue;
                }
            };
            let mut scheduled = ScheduledJob {
                job: Job {
                    job_id: spec.job_id.clone(),
                    job_name: spec.job_name.clone(),
                    job_group: spec.job_group.clone(),
                    job_description: spec.job_description.clone(),
                    cron_expression: spec.cron_expression.clone(),
                    job_method: spec.job_method.clone(),
                    enabled: spec.enabled,
                    last_trigger_time: None,
                    next_trigger_time: None,
                },
                schedule,
            };
            scheduled.recompute_next();
            jobs.insert(spec.job_id.clone(), scheduled);
        }
        info!(count = jobs.len(), "scheduler jobs loaded");
    }

    /// Start the firing loop.
    pub fn start(&self) {
        let jobs = self.jobs.clone();
        let runner = self.runner.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let due: Vec<(String, String)> = {
                    let mut guard = jobs.write();
                    let mut due = Vec::new();
                    for scheduled in guard.values_mut() {
                        if !scheduled.job.enabled {
                            continue;
                        }
                        let Some(next) = scheduled.job.next_trigger_time else {
                            continue;
                        };
                        if next <= now {
                            scheduled.job.last_trigger_time = Some(now);
                            scheduled.recompute_next();
                            due.push((
                                scheduled.job.job_id.clone(),
                                scheduled.job.job_method.clone(),
                            ));
                        }
                    }
                    due
                };

                for (job_id, method) in due {
                    info!(%job_id, %method, "job firing");
                    let runner = runner.clone();
                    tokio::spawn(async move {
                        run_bounded(&*runner, &job_id, &method).await;
                    });
                }
            }
        });
        *self.task.lock() = Some(task);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().values().map(|s| s.job.clone()).collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        jobs
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.jobs.read().get(job_id).map(|s| s.job.clone())
    }

    /// Flip `enabled`, updating the next-fire calendar. Setting the current
    /// value again is a no-op. Returns the updated job.
    pub fn toggle_job(&self, job_id: &str, enabled: bool) -> Option<Job> {
        let mut jobs = self.jobs.write();
        let scheduled = jobs.get_mut(job_id)?;
        if scheduled.job.enabled != enabled {
            scheduled.job.enabled = enabled;
            scheduled.recompute_next();
            info!(%job_id, enabled, "job toggled");
        }
        Some(scheduled.job.clone())
    }

    pub fn pause_job(&self, job_id: &str) -> Option<Job> {
        self.toggle_job(job_id, false)
    }

    pub fn resume_job(&self, job_id: &str) -> Option<Job> {
        self.toggle_job(job_id, true)
    }

    /// Fire a job once, immediately, regardless of its schedule or enabled
    /// flag. The one-shot runs under its own unique id.
    pub async fn trigger_job(&self, job_id: &str) -> Result<(), String> {
        let method = {
            let mut jobs = self.jobs.write();
            let scheduled = jobs
                .get_mut(job_id)
                .ok_or_else(|| format!("unknown job: {job_id}"))?;
            scheduled.job.last_trigger_time = Some(Utc::now());
            scheduled.job.job_method.clone()
        };
        let one_shot_id = format!("{job_id}-manual-{}", uuid::Uuid::new_v4());
        info!(job_id = %one_shot_id, %method, "manual trigger");
        run_bounded(&*self.runner, &one_shot_id, &method).await;
        Ok(())
    }
}

async fn run_bounded(runner: &dyn JobRunner, job_id: &str, method: &str) {
    match tokio::time::timeout(JOB_TIMEOUT, runner.run(method)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(%job_id, %method, error = %e, "job failed"),
        Err(_) => warn!(%job_id, %method, "job timed out after 300s"),
    }
}
