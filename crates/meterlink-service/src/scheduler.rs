//! Periodic synchronization of configured profiles.
//!
//! One task runs per (device, profile), each on its own interval. Cycles on
//! the same meter are serialized by the synchronizer's device lock, so a
//! slow meter never holds up the others.
//!
//! A cycle that has started always runs to the end; cancellation is only
//! observed between cycles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use meterlink_core::{CycleOutcome, CycleReport, ProfileSynchronizer};
use meterlink_types::ProfileId;

use crate::config::Config;

/// One scheduled (device, profile).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    /// Device serial.
    pub device_id: String,
    /// Profile identifier.
    pub profile_id: ProfileId,
    /// Meter model.
    pub model: Option<String>,
    /// Time between cycles.
    pub interval: Duration,
}

impl SyncJob {
    /// Jobs for every configured profile. The most specific interval wins:
    /// profile, then device, then `sync.interval_secs`.
    pub fn from_config(config: &Config) -> Vec<SyncJob> {
        config
            .devices
            .iter()
            .flat_map(|device| {
                device.profiles.iter().map(move |profile| SyncJob {
                    device_id: device.serial.clone(),
                    profile_id: ProfileId::from(profile.id.as_str()),
                    model: device.model.clone(),
                    interval: Duration::from_secs(
                        profile
                            .interval_secs
                            .or(device.interval_secs)
                            .unwrap_or(config.sync.interval_secs),
                    ),
                })
            })
            .collect()
    }
}

/// Statistics of one scheduled (device, profile).
#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    /// Device serial.
    pub device_id: String,
    /// Profile identifier.
    pub profile_id: ProfileId,
    /// Interval in seconds.
    pub interval_secs: u64,
    /// Cycles run.
    pub cycles: u64,
    /// Cycles that ended without failure.
    pub successes: u64,
    /// Cycles that failed or broke off.
    pub failures: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Rows newly stored.
    pub rows_inserted: u64,
    /// Rows salvaged from partial reads.
    pub rows_recovered: u64,
    /// How the last cycle ended.
    pub last_outcome: Option<CycleOutcome>,
    /// Start of the last cycle.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
    /// Cursor after the last cycle.
    #[serde(with = "time::serde::rfc3339::option")]
    pub cursor: Option<OffsetDateTime>,
    /// Whether a cycle is in progress.
    pub running: bool,
}

impl JobStats {
    fn new(job: &SyncJob) -> Self {
        Self {
            device_id: job.device_id.clone(),
            profile_id: job.profile_id.clone(),
            interval_secs: job.interval.as_secs(),
            cycles: 0,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            rows_inserted: 0,
            rows_recovered: 0,
            last_outcome: None,
            last_run_at: None,
            cursor: None,
            running: false,
        }
    }

    fn record(&mut self, report: &CycleReport, started_at: OffsetDateTime) {
        self.cycles += 1;
        self.running = false;
        self.last_run_at = Some(started_at);
        self.rows_inserted += report.inserted as u64;
        self.rows_recovered += report.recovered as u64;
        self.last_outcome = Some(report.outcome.clone());
        if let Some(cursor) = report.cursor_after.or(report.cursor_before) {
            self.cursor = Some(cursor);
        }
        if report.is_success() {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures += 1;
        }
    }
}

type StatsMap = HashMap<(String, ProfileId), JobStats>;

/// Fires sync cycles for a set of jobs.
pub struct Scheduler {
    sync: Arc<ProfileSynchronizer>,
    jobs: Vec<SyncJob>,
    stats: Arc<RwLock<StatsMap>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Scheduler {
    /// Create a scheduler. Nothing runs until [`Scheduler::start`] or
    /// [`Scheduler::run_once`].
    pub fn new(sync: Arc<ProfileSynchronizer>, jobs: Vec<SyncJob>) -> Self {
        let stats = jobs
            .iter()
            .map(|job| ((job.device_id.clone(), job.profile_id.clone()), JobStats::new(job)))
            .collect();
        Self {
            sync,
            jobs,
            stats: Arc::new(RwLock::new(stats)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Scheduled jobs.
    pub fn jobs(&self) -> &[SyncJob] {
        &self.jobs
    }

    /// Token that stops every job loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn one loop per job. The first cycle of each job starts at once.
    pub fn start(&self) {
        if self.jobs.is_empty() {
            info!("No profiles configured for synchronization");
            return;
        }

        info!("Starting scheduler for {} profile(s)", self.jobs.len());
        for job in self.jobs.clone() {
            let sync = Arc::clone(&self.sync);
            let stats = Arc::clone(&self.stats);
            let cancel = self.cancel.clone();
            self.tasks.spawn(async move {
                run_job(sync, stats, job, cancel).await;
            });
        }
    }

    /// Run one cycle of every job concurrently and wait for all of them.
    pub async fn run_once(&self) -> Vec<CycleReport> {
        let cycles = self
            .jobs
            .iter()
            .map(|job| run_cycle(&self.sync, &self.stats, job));
        futures::future::join_all(cycles).await
    }

    /// Stop all job loops and wait for running cycles to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Scheduler stopped");
    }

    /// Statistics of every job, sorted by device then profile.
    pub async fn stats(&self) -> Vec<JobStats> {
        let mut all: Vec<JobStats> = self.stats.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            (a.device_id.as_str(), &a.profile_id).cmp(&(b.device_id.as_str(), &b.profile_id))
        });
        all
    }

    /// Statistics of one job.
    pub async fn job_stats(&self, device_id: &str, profile_id: &ProfileId) -> Option<JobStats> {
        self.stats
            .read()
            .await
            .get(&(device_id.to_string(), profile_id.clone()))
            .cloned()
    }
}

async fn run_job(
    sync: Arc<ProfileSynchronizer>,
    stats: Arc<RwLock<StatsMap>>,
    job: SyncJob,
    cancel: CancellationToken,
) {
    info!(
        "Scheduling {} on {} every {}s",
        job.profile_id,
        job.device_id,
        job.interval.as_secs()
    );

    let mut ticker = interval(job.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Job {} on {} stopping", job.profile_id, job.device_id);
                break;
            }
            _ = ticker.tick() => {
                run_cycle(&sync, &stats, &job).await;
            }
        }
    }
}

async fn run_cycle(
    sync: &ProfileSynchronizer,
    stats: &RwLock<StatsMap>,
    job: &SyncJob,
) -> CycleReport {
    let key = (job.device_id.clone(), job.profile_id.clone());
    if let Some(entry) = stats.write().await.get_mut(&key) {
        entry.running = true;
    }

    let started_at = OffsetDateTime::now_utc();
    let report = sync
        .run(&job.device_id, &job.profile_id, job.model.as_deref())
        .await;

    let mut stats = stats.write().await;
    let entry = stats.entry(key).or_insert_with(|| JobStats::new(job));
    entry.record(&report, started_at);

    if !report.is_success() {
        let failures = entry.consecutive_failures;
        if failures <= 3 {
            warn!(
                outcome = ?report.outcome,
                "Cycle of {} on {} did not complete (attempt {})",
                job.profile_id,
                job.device_id,
                failures
            );
        } else if failures == 4 {
            error!(
                "Cycle of {} on {} failed {} times in a row, will keep trying silently",
                job.profile_id, job.device_id, failures
            );
        }
    }

    report
}
