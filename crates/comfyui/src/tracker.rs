//! Generation job tracker.
//!
//! [`JobTracker`] is the caller-facing entry point: it builds the graph
//! for a request, submits it over the [`Backend`], and follows the job
//! through push-channel events until a result can be collected.
//!
//! Created once via [`JobTracker::start`]; the returned `Arc` can be
//! cloned into any number of tasks. Each caller awaiting a result is
//! suspended on its own; the tracker itself runs two background tasks:
//! the event pump (drains listener events into the [`JobStore`]) and the
//! retention sweeper.
//!
//! The push channel is opened lazily on the first submission and
//! re-opened on a later submission after it drops, throttled by
//! [`ReconnectBackoff`] after failed attempts.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use kiln_core::builder;
use kiln_core::error::BuildError;
use kiln_core::job::{ArtifactRef, Job, JobStatus, ProgressSnapshot};
use kiln_core::request::GenerationRequest;
use kiln_core::types::JobId;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIApi;
use crate::backend::{Backend, EventSource};
use crate::backoff::ReconnectBackoff;
use crate::capability::CapabilityKind;
use crate::client::ComfyUIClient;
use crate::config::TrackerConfig;
use crate::events::{BackendEvent, ConnectionId, JobUpdate};
use crate::history;
use crate::store::JobStore;

/// Capacity of the listener -> event pump channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How long shutdown waits for each background task.
const SHUTDOWN_TASK_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced to tracker callers.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The request could not be turned into a graph. Nothing was sent.
    #[error("Invalid generation request: {0}")]
    Build(#[from] BuildError),

    /// The push channel could not be opened. Nothing was sent.
    #[error("Event channel unavailable: {0}")]
    Connection(String),

    /// The backend refused or failed the submission. No job was created.
    #[error("Workflow submission failed: {0}")]
    Submission(String),

    #[error("Job {0} not found")]
    UnknownJob(JobId),

    /// The engine reported a failure for the job.
    #[error("Job {job_id} failed: {message}")]
    Execution { job_id: JobId, message: String },

    #[error("Job {0} timed out waiting for a result")]
    TimedOut(JobId),

    #[error("Job {0} was cancelled")]
    Cancelled(JobId),

    #[error("Job {0} has not finished")]
    NotFinished(JobId),

    /// A follow-up backend call (history, artifact, interrupt) failed.
    #[error("Backend request failed: {0}")]
    Gateway(String),

    /// The backend has no history entry for a finished job.
    #[error("No history recorded for job {0}")]
    MissingHistory(JobId),
}

/// Push-channel bookkeeping, guarded by an async mutex so concurrent
/// submissions open at most one connection.
struct ConnectionState {
    listener: Option<JoinHandle<()>>,
    /// Id of the most recently opened connection (0 before the first).
    current: ConnectionId,
    backoff: ReconnectBackoff,
}

impl ConnectionState {
    fn is_connected(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| !listener.is_finished())
    }
}

/// Tracks generation jobs against one backend.
pub struct JobTracker {
    backend: Arc<dyn Backend>,
    source: Arc<dyn EventSource>,
    store: Arc<JobStore>,
    config: TrackerConfig,
    /// Stable for the tracker's lifetime; reused across reconnects.
    client_id: String,
    connection: tokio::sync::Mutex<ConnectionState>,
    event_tx: mpsc::Sender<BackendEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobTracker {
    /// Start a tracker over the given backend and push-channel source.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        backend: Arc<dyn Backend>,
        source: Arc<dyn EventSource>,
        config: TrackerConfig,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let store = Arc::new(JobStore::new());

        let pump = tokio::spawn(run_event_pump(
            Arc::clone(&store),
            event_rx,
            cancel.clone(),
        ));
        let sweeper = tokio::spawn(run_sweeper(
            Arc::clone(&store),
            config.job_retention,
            config.generation_timeout,
            cancel.clone(),
        ));

        let client_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(client_id = %client_id, api_url = %config.api_url, "Job tracker started");

        Arc::new(Self {
            backend,
            source,
            store,
            connection: tokio::sync::Mutex::new(ConnectionState {
                listener: None,
                current: 0,
                backoff: ReconnectBackoff::new(config.reconnect.clone()),
            }),
            config,
            client_id,
            event_tx,
            cancel,
            tasks: Mutex::new(vec![pump, sweeper]),
        })
    }

    /// Start a tracker talking to the ComfyUI instance in `config`.
    pub fn from_config(config: TrackerConfig) -> Arc<Self> {
        let backend = Arc::new(ComfyUIApi::new(config.api_url.clone()));
        let source = Arc::new(ComfyUIClient::new(config.ws_url.clone()));
        Self::start(backend, source, config)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The configured default for [`await_result`](Self::await_result).
    pub fn default_timeout(&self) -> Duration {
        self.config.generation_timeout
    }

    /// Subscribe to job and connection updates.
    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.store.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_connected()
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Build and submit a request. Returns the backend job id without
    /// waiting for execution.
    ///
    /// On any error no job is registered.
    pub async fn submit(&self, request: &GenerationRequest) -> Result<JobId, TrackerError> {
        let built = builder::prepare(request)?;
        let connection = self.ensure_connected().await?;

        let graph = built.workflow.to_value();
        let response = self
            .backend
            .submit_workflow(&graph, &self.client_id)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Workflow submission failed");
                TrackerError::Submission(e.to_string())
            })?;

        let recorded = request.with_resolved_seed(built.seed);
        let job_id = response.prompt_id;
        self.store
            .register(Job::new(job_id.clone(), recorded, Utc::now()), connection);

        tracing::info!(
            job_id = %job_id,
            seed = built.seed,
            nodes = built.workflow.len(),
            queue_position = response.number,
            "Workflow submitted to ComfyUI",
        );
        Ok(job_id)
    }

    /// Make sure the push channel is open, opening it if needed.
    async fn ensure_connected(&self) -> Result<ConnectionId, TrackerError> {
        let mut state = self.connection.lock().await;
        if state.is_connected() {
            return Ok(state.current);
        }

        if let Err(wait) = state.backoff.check(Instant::now()) {
            return Err(TrackerError::Connection(format!(
                "reconnect throttled after {} failed attempt(s), retry in {}ms",
                state.backoff.failures(),
                wait.as_millis()
            )));
        }

        let connection = state.current + 1;
        let opened = self
            .source
            .open(
                &self.client_id,
                connection,
                self.event_tx.clone(),
                self.cancel.child_token(),
            )
            .await;

        match opened {
            Ok(listener) => {
                state.backoff.reset();
                state.listener = Some(listener);
                state.current = connection;
                self.store.publish(JobUpdate::Connected { connection });
                tracing::info!(connection, "Push channel open");
                Ok(connection)
            }
            Err(e) => {
                state.backoff.record_failure(Instant::now());
                tracing::warn!(
                    attempt = state.backoff.failures(),
                    error = %e,
                    "Failed to open push channel",
                );
                Err(TrackerError::Connection(e.to_string()))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// Wait up to `timeout` for the job to finish and return its artifacts.
    ///
    /// On expiry the job becomes `TimedOut` and later events for it are
    /// ignored; the backend is not told to stop. Calls on an already
    /// finished job return the stored outcome, and artifacts are
    /// collected from the backend at most once.
    pub async fn await_result(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<Vec<ArtifactRef>, TrackerError> {
        let mut waiter = self
            .store
            .waiter(job_id)
            .ok_or_else(|| TrackerError::UnknownJob(job_id.to_string()))?;

        let resolved = match tokio::time::timeout(timeout, waiter.wait_for(Option::is_some)).await
        {
            Ok(Ok(_)) => true,
            // Sender dropped: the job was evicted while waiting.
            Ok(Err(_)) => return Err(TrackerError::UnknownJob(job_id.to_string())),
            Err(_elapsed) => false,
        };

        if !resolved {
            let message = format!("No result within {}ms", timeout.as_millis());
            if self.store.finish(job_id, JobStatus::TimedOut, Some(message)) {
                tracing::warn!(
                    job_id = %job_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Generation timed out",
                );
            }
        }

        self.finalize(job_id).await
    }

    /// Map a finished job to its caller-facing outcome.
    async fn finalize(&self, job_id: &str) -> Result<Vec<ArtifactRef>, TrackerError> {
        let job = self
            .store
            .get(job_id)
            .ok_or_else(|| TrackerError::UnknownJob(job_id.to_string()))?;

        match job.status {
            JobStatus::Succeeded => self.collect_artifacts(job_id).await,
            JobStatus::Failed => Err(TrackerError::Execution {
                job_id: job.id,
                message: job.error.unwrap_or_default(),
            }),
            JobStatus::TimedOut => Err(TrackerError::TimedOut(job.id)),
            JobStatus::Cancelled => Err(TrackerError::Cancelled(job.id)),
            JobStatus::Queued | JobStatus::Running => Err(TrackerError::NotFinished(job.id)),
        }
    }

    /// Fetch history once per job and extract the artifact locators.
    ///
    /// A failed fetch leaves the job `Succeeded` and uncollected, so a
    /// later call retries.
    async fn collect_artifacts(&self, job_id: &str) -> Result<Vec<ArtifactRef>, TrackerError> {
        let collector = self
            .store
            .collector(job_id)
            .ok_or_else(|| TrackerError::UnknownJob(job_id.to_string()))?;

        let artifacts = collector
            .get_or_try_init(|| async {
                tokio::time::sleep(self.config.history_grace).await;
                let history = self
                    .backend
                    .get_history(job_id)
                    .await
                    .map_err(|e| TrackerError::Gateway(e.to_string()))?;
                let artifacts = history::extract_artifacts(&history, job_id)
                    .ok_or_else(|| TrackerError::MissingHistory(job_id.to_string()))?;
                tracing::info!(
                    job_id = %job_id,
                    count = artifacts.len(),
                    status = history::status_str(&history, job_id).unwrap_or("unknown"),
                    "Collected artifacts",
                );
                Ok::<_, TrackerError>(artifacts)
            })
            .await?
            .clone();

        self.store.set_artifacts(job_id, artifacts.clone());
        Ok(artifacts)
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Cancel a job: queued jobs are removed from the backend queue,
    /// running jobs interrupted. The job is marked `Cancelled` either way;
    /// the backend is not guaranteed to have stopped.
    pub async fn cancel(&self, job_id: &str) -> Result<(), TrackerError> {
        let job = self
            .store
            .get(job_id)
            .ok_or_else(|| TrackerError::UnknownJob(job_id.to_string()))?;

        let result = match job.status {
            JobStatus::Queued => self.backend.cancel_execution(job_id).await,
            JobStatus::Running => self.backend.interrupt().await,
            _ => return Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(job_id = %job_id, error = %e, "Backend did not confirm cancellation");
        }

        if self.store.finish(job_id, JobStatus::Cancelled, None) {
            tracing::info!(job_id = %job_id, "Job cancelled");
        }
        Ok(())
    }

    /// Interrupt whatever the backend is executing right now.
    pub async fn interrupt(&self) -> Result<(), TrackerError> {
        self.backend
            .interrupt()
            .await
            .map_err(|e| TrackerError::Gateway(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn progress(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.store.progress(job_id)
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.store.get(job_id)
    }

    pub async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, TrackerError> {
        self.backend
            .fetch_artifact(artifact)
            .await
            .map_err(|e| TrackerError::Gateway(e.to_string()))
    }

    pub async fn list_capability(&self, kind: CapabilityKind) -> Vec<String> {
        self.backend.list_capability(kind).await
    }

    /// Forget a job before its retention window ends.
    pub fn evict(&self, job_id: &str) -> bool {
        self.store.evict(job_id)
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Fail pending jobs and stop the background tasks.
    ///
    /// Waits up to 5 seconds per task for a clean exit.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down job tracker");
        let failed = self.store.fail_pending("Tracker shut down");
        self.cancel.cancel();

        let listener = self.connection.lock().await.listener.take();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in listener.into_iter().chain(tasks) {
            let _ = tokio::time::timeout(SHUTDOWN_TASK_TIMEOUT, handle).await;
        }

        tracing::info!(failed, "Job tracker shut down complete");
    }
}

/// Apply listener events to the store, in arrival order.
async fn run_event_pump(
    store: Arc<JobStore>,
    mut events: mpsc::Receiver<BackendEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(event) => {
                store.apply(event);
            }
            None => break,
        }
    }
    tracing::debug!("Event pump exited");
}

/// Periodically time out jobs still pending after `max_age` and evict
/// finished jobs older than `retention`.
async fn run_sweeper(
    store: Arc<JobStore>,
    retention: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) {
    let period = (retention.min(max_age) / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let now = Utc::now();
                store.expire_stale(max_age, now);
                let evicted = store.evict_expired(retention, now);
                if evicted > 0 {
                    tracing::debug!(evicted, "Evicted expired jobs");
                }
            }
        }
    }
}
