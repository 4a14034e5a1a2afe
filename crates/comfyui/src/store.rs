//! In-memory job registry.
//!
//! [`JobStore`] exclusively owns every tracked [`Job`] together with its
//! waiter (a `watch` channel resolved on the terminal transition) and its
//! artifact collector. All state lives behind one `std::sync::Mutex`
//! that is never held across an `.await`.
//!
//! Changes are broadcast as [`JobUpdate`]s to subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use kiln_core::job::{ArtifactRef, Job, JobStatus, ProgressSnapshot};
use kiln_core::types::{JobId, Timestamp};
use tokio::sync::{broadcast, watch, OnceCell};

use crate::events::{BackendEvent, ConnectionId, JobUpdate};

/// Broadcast channel capacity for job updates.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Events for not-yet-registered jobs kept for replay on registration.
const UNCLAIMED_CAPACITY: usize = 64;

/// Resolves to the terminal status once the job finishes.
pub type Waiter = watch::Receiver<Option<JobStatus>>;

/// Collects a job's artifacts at most once.
pub type Collector = Arc<OnceCell<Vec<ArtifactRef>>>;

pub struct JobStore {
    inner: Mutex<StoreInner>,
    updates: broadcast::Sender<JobUpdate>,
}

#[derive(Default)]
struct StoreInner {
    jobs: HashMap<JobId, JobEntry>,
    /// Events that arrived before their job was registered.
    unclaimed: VecDeque<BackendEvent>,
    /// Highest connection id known to be lost.
    lost_connection: ConnectionId,
}

struct JobEntry {
    job: Job,
    /// Push-channel connection the job was submitted over.
    connection: ConnectionId,
    waiter: watch::Sender<Option<JobStatus>>,
    collector: Collector,
}

impl JobEntry {
    fn finish(&mut self, status: JobStatus, error: Option<String>) -> Option<JobUpdate> {
        if !self.job.finish(status, error, Utc::now()) {
            return None;
        }
        self.waiter.send_replace(Some(status));
        Some(terminal_update(&self.job))
    }
}

fn terminal_update(job: &Job) -> JobUpdate {
    let job_id = job.id.clone();
    match job.status {
        JobStatus::Succeeded => JobUpdate::Completed { job_id },
        JobStatus::TimedOut => JobUpdate::TimedOut { job_id },
        JobStatus::Cancelled => JobUpdate::Cancelled { job_id },
        _ => JobUpdate::Failed {
            job_id,
            error: job.error.clone().unwrap_or_default(),
        },
    }
}

impl StoreInner {
    /// Apply a job-scoped event to a registered job.
    fn apply_job_event(&mut self, event: BackendEvent) -> Option<JobUpdate> {
        let entry = self.jobs.get_mut(event.job_id()?)?;
        match event {
            BackendEvent::Started { job_id } => {
                entry.job.start().then_some(JobUpdate::Started { job_id })
            }
            BackendEvent::Progress {
                job_id,
                step,
                total,
            } => {
                if !entry.job.record_progress(step, total) {
                    return None;
                }
                tracing::debug!(job_id = %job_id, step, total, "Generation progress");
                Some(JobUpdate::Progress {
                    job_id,
                    step,
                    total,
                    percent: entry.job.progress.percent(),
                })
            }
            BackendEvent::Completed { job_id } => {
                let update = entry.finish(JobStatus::Succeeded, None)?;
                tracing::info!(job_id = %job_id, "Generation completed");
                Some(update)
            }
            BackendEvent::Failed { job_id, message } => {
                let update = entry.finish(JobStatus::Failed, Some(message))?;
                tracing::warn!(job_id = %job_id, "Generation failed");
                Some(update)
            }
            BackendEvent::Interrupted { job_id } => {
                let update = entry.finish(
                    JobStatus::Cancelled,
                    Some("Interrupted on the backend".to_string()),
                )?;
                tracing::info!(job_id = %job_id, "Generation interrupted");
                Some(update)
            }
            BackendEvent::Disconnected { .. } => None,
        }
    }

    fn buffer_unclaimed(&mut self, event: BackendEvent) {
        if self.unclaimed.len() == UNCLAIMED_CAPACITY {
            self.unclaimed.pop_front();
        }
        self.unclaimed.push_back(event);
    }

    fn take_unclaimed(&mut self, job_id: &str) -> Vec<BackendEvent> {
        let (matching, rest): (Vec<_>, Vec<_>) = self
            .unclaimed
            .drain(..)
            .partition(|event| event.job_id() == Some(job_id));
        self.unclaimed = rest.into();
        matching
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(StoreInner::default()),
            updates,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to job updates.
    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.updates.subscribe()
    }

    pub fn publish(&self, update: JobUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    /// Track a newly accepted job submitted over `connection`.
    ///
    /// Events that raced ahead of registration are replayed. A job whose
    /// connection is already known to be lost fails immediately unless a
    /// buffered terminal event already settled it.
    pub fn register(&self, job: Job, connection: ConnectionId) {
        let job_id = job.id.clone();
        let mut updates = vec![JobUpdate::Submitted {
            job_id: job_id.clone(),
        }];

        {
            let mut inner = self.lock();
            let (waiter, _) = watch::channel(None);
            let lost = connection <= inner.lost_connection;
            inner.jobs.insert(
                job_id.clone(),
                JobEntry {
                    job,
                    connection,
                    waiter,
                    collector: Arc::new(OnceCell::new()),
                },
            );

            for event in inner.take_unclaimed(&job_id) {
                updates.extend(inner.apply_job_event(event));
            }
            if lost {
                if let Some(entry) = inner.jobs.get_mut(&job_id) {
                    updates.extend(entry.finish(
                        JobStatus::Failed,
                        Some("Connection to backend lost".to_string()),
                    ));
                }
            }
        }

        for update in updates {
            self.publish(update);
        }
    }

    /// Apply an event from the push channel. Returns whether any job
    /// changed.
    pub fn apply(&self, event: BackendEvent) -> bool {
        if let BackendEvent::Disconnected { connection, reason } = event {
            return self.connection_lost(connection, reason) > 0;
        }

        let update = {
            let mut inner = self.lock();
            let known = event
                .job_id()
                .is_some_and(|job_id| inner.jobs.contains_key(job_id));
            if !known {
                tracing::debug!(event = ?event, "Event for unregistered job, buffering");
                inner.buffer_unclaimed(event);
                return false;
            }
            inner.apply_job_event(event)
        };

        match update {
            Some(update) => {
                self.publish(update);
                true
            }
            None => false,
        }
    }

    /// Move a job to a terminal status. Returns `false` if the job is
    /// unknown or already terminal.
    pub fn finish(&self, job_id: &str, status: JobStatus, error: Option<String>) -> bool {
        let update = self
            .lock()
            .jobs
            .get_mut(job_id)
            .and_then(|entry| entry.finish(status, error));
        match update {
            Some(update) => {
                self.publish(update);
                true
            }
            None => false,
        }
    }

    /// Fail every non-terminal job submitted over `connection` or an
    /// earlier one. Returns how many jobs were failed.
    ///
    /// Buffered terminal events survive so a job whose result arrived
    /// before its registration still settles with that result.
    pub fn connection_lost(&self, connection: ConnectionId, reason: String) -> usize {
        let message = format!("Connection to backend lost: {reason}");
        let mut updates = Vec::new();
        {
            let mut inner = self.lock();
            inner.lost_connection = inner.lost_connection.max(connection);
            inner.unclaimed.retain(BackendEvent::is_terminal);
            for entry in inner.jobs.values_mut() {
                if entry.connection <= connection {
                    updates.extend(entry.finish(JobStatus::Failed, Some(message.clone())));
                }
            }
        }

        let failed = updates.len();
        tracing::warn!(connection, failed, reason = %reason, "Push channel lost");
        self.publish(JobUpdate::Disconnected { connection, reason });
        for update in updates {
            self.publish(update);
        }
        failed
    }

    /// Fail every non-terminal job. Returns how many were failed.
    pub fn fail_pending(&self, reason: &str) -> usize {
        let updates: Vec<_> = self
            .lock()
            .jobs
            .values_mut()
            .filter_map(|entry| entry.finish(JobStatus::Failed, Some(reason.to_string())))
            .collect();
        let failed = updates.len();
        for update in updates {
            self.publish(update);
        }
        failed
    }

    pub fn waiter(&self, job_id: &str) -> Option<Waiter> {
        self.lock()
            .jobs
            .get(job_id)
            .map(|entry| entry.waiter.subscribe())
    }

    pub fn collector(&self, job_id: &str) -> Option<Collector> {
        self.lock()
            .jobs
            .get(job_id)
            .map(|entry| Arc::clone(&entry.collector))
    }

    pub fn set_artifacts(&self, job_id: &str, artifacts: Vec<ArtifactRef>) {
        if let Some(entry) = self.lock().jobs.get_mut(job_id) {
            entry.job.artifacts = Some(artifacts);
        }
    }

    /// Snapshot of a job.
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.lock().jobs.get(job_id).map(|entry| entry.job.clone())
    }

    pub fn progress(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.lock().jobs.get(job_id).map(|entry| entry.job.snapshot())
    }

    /// Forget a job. Outstanding waiters observe a closed channel.
    pub fn evict(&self, job_id: &str) -> bool {
        self.lock().jobs.remove(job_id).is_some()
    }

    /// Evict terminal jobs that finished more than `retention` before `now`.
    pub fn evict_expired(&self, retention: Duration, now: Timestamp) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return 0;
        };

        let mut inner = self.lock();
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, entry| !matches!(entry.job.finished_at, Some(at) if at <= cutoff));
        before - inner.jobs.len()
    }

    /// Time out every non-terminal job submitted more than `max_age`
    /// before `now`. Returns how many jobs were timed out.
    pub fn expire_stale(&self, max_age: Duration, now: Timestamp) -> usize {
        let Ok(age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let Some(cutoff) = now.checked_sub_signed(age) else {
            return 0;
        };

        let message = format!("No result within {}s of submission", max_age.as_secs());
        let updates: Vec<_> = self
            .lock()
            .jobs
            .values_mut()
            .filter(|entry| entry.job.submitted_at <= cutoff)
            .filter_map(|entry| entry.finish(JobStatus::TimedOut, Some(message.clone())))
            .collect();

        let expired = updates.len();
        if expired > 0 {
            tracing::warn!(expired, "Timed out stale jobs");
        }
        for update in updates {
            self.publish(update);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
