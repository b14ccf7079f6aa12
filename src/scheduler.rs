//! Background job scheduler.
//!
//! Each job runs on its own fixed interval, but all jobs share one
//! async mutex so no two jobs ever run concurrently. A job that comes
//! due while another holds the lock simply waits; intervals are
//! measured from the scheduled cadence, not from lock acquisition.
//! The first run of every job is one full period after startup, never
//! immediately.
//!
//! A failing job run is logged and the schedule continues; a job error
//! never takes the process down.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type JobFn = Box<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    NotStarted,
    Scheduled,
    Running,
}

/// Snapshot of one job for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: &'static str,
    pub state: JobState,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

struct JobBoard {
    state: JobState,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
}

struct Job {
    name: &'static str,
    period: Duration,
    run: JobFn,
    board: Mutex<JobBoard>,
}

impl Job {
    fn status(&self) -> JobStatus {
        let board = self.board.lock().expect("mutex poisoned");
        JobStatus {
            name: self.name,
            state: board.state,
            last_run: board.last_run,
            next_run: board.next_run,
        }
    }

    fn set(&self, state: JobState, last_run: Option<DateTime<Utc>>, next_run: Option<DateTime<Utc>>) {
        let mut board = self.board.lock().expect("mutex poisoned");
        board.state = state;
        if last_run.is_some() {
            board.last_run = last_run;
        }
        board.next_run = next_run;
    }
}

pub struct Scheduler {
    jobs: Vec<Arc<Job>>,
    // Shared by every job; separate from the mail queue's lock.
    job_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            job_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Register a job to run every `period`, starting one period from
    /// now.
    pub fn add_job<F, Fut>(&mut self, name: &'static str, period: Duration, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.jobs.push(Arc::new(Job {
            name,
            period,
            run: Box::new(move || Box::pin(f())),
            board: Mutex::new(JobBoard {
                state: JobState::NotStarted,
                last_run: None,
                next_run: None,
            }),
        }));
    }

    pub fn status(&self) -> Vec<JobStatus> {
        self.jobs.iter().map(|j| j.status()).collect()
    }

    /// Spawn one task per registered job. Tasks stop cleanly when the
    /// shutdown channel flips to true.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.jobs
            .iter()
            .map(|job| {
                let job = job.clone();
                let lock = self.job_lock.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    info!(job = job.name, period_secs = job.period.as_secs(), "scheduling job");
                    let mut ticker = interval_at(Instant::now() + job.period, job.period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    job.set(
                        JobState::Scheduled,
                        None,
                        Some(Utc::now() + chrono::Duration::from_std(job.period).unwrap_or_else(|_| chrono::Duration::zero())),
                    );
                    loop {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    info!(job = job.name, "stopping job");
                                    break;
                                }
                            }
                            _ = ticker.tick() => {
                                let _guard = lock.lock().await;
                                let started = Utc::now();
                                job.set(JobState::Running, Some(started), None);
                                if let Err(e) = (job.run)().await {
                                    error!(job = job.name, error = %e, "job run failed");
                                }
                                job.set(
                                    JobState::Scheduled,
                                    None,
                                    Some(Utc::now() + chrono::Duration::from_std(job.period).unwrap_or_else(|_| chrono::Duration::zero())),
                                );
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
