#![allow(dead_code)]

pub mod server;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiln_comfyui::api::{ComfyUIApiError, SubmitResponse};
use kiln_comfyui::backend::{Backend, EventSource};
use kiln_comfyui::capability::CapabilityKind;
use kiln_comfyui::client::ComfyUIClientError;
use kiln_comfyui::config::TrackerConfig;
use kiln_comfyui::events::{BackendEvent, ConnectionId};
use kiln_comfyui::tracker::JobTracker;
use kiln_core::job::ArtifactRef;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

/// In-memory backend handing out `job-N` ids and a one-image history.
#[derive(Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<String>>,
    submitted: AtomicUsize,
    pub history_calls: AtomicUsize,
    pub reject_submissions: AtomicBool,
}

impl FakeBackend {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn submit_workflow(
        &self,
        _workflow: &serde_json::Value,
        _client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        if self.reject_submissions.load(Ordering::SeqCst) {
            return Err(ComfyUIApiError::Rejected(
                r#"{"3":{"errors":["bad"]}}"#.to_string(),
            ));
        }
        let number = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        self.record("submit");
        Ok(SubmitResponse {
            prompt_id: format!("job-{number}"),
            number: number as i64,
            node_errors: serde_json::Value::Null,
        })
    }

    async fn get_history(&self, job_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            job_id: {
                "outputs": {
                    "9": {
                        "images": [{
                            "filename": format!("{job_id}.png"),
                            "subfolder": "",
                            "type": "output"
                        }]
                    }
                },
                "status": {"status_str": "success"}
            }
        }))
    }

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ComfyUIApiError> {
        Ok(artifact.filename.as_bytes().to_vec())
    }

    async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        self.record("interrupt");
        Ok(())
    }

    async fn cancel_execution(&self, job_id: &str) -> Result<(), ComfyUIApiError> {
        self.record(format!("cancel:{job_id}"));
        Ok(())
    }

    async fn list_capability(&self, kind: CapabilityKind) -> Vec<String> {
        kind.fallback()
    }
}

// ---------------------------------------------------------------------------
// Fake push channel
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Channel {
    events: Option<mpsc::Sender<BackendEvent>>,
    cancel: Option<CancellationToken>,
    connection: ConnectionId,
}

/// Push channel driven by the test: events are injected with
/// [`FakeSource::push`], loss simulated with [`FakeSource::drop_connection`].
#[derive(Default)]
pub struct FakeSource {
    channel: Mutex<Channel>,
    pub opens: AtomicUsize,
    pub fail_open: AtomicBool,
}

impl FakeSource {
    pub async fn push(&self, event: BackendEvent) {
        let sender = self.channel.lock().unwrap().events.clone();
        sender
            .expect("push channel not open")
            .send(event)
            .await
            .expect("event pump gone");
    }

    /// Report the current connection as lost and end its listener.
    pub async fn drop_connection(&self, reason: &str) {
        let (sender, cancel, connection) = {
            let mut channel = self.channel.lock().unwrap();
            (
                channel.events.take(),
                channel.cancel.take(),
                channel.connection,
            )
        };
        if let Some(sender) = sender {
            sender
                .send(BackendEvent::Disconnected {
                    connection,
                    reason: reason.to_string(),
                })
                .await
                .expect("event pump gone");
        }
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }
}

#[async_trait]
impl EventSource for FakeSource {
    async fn open(
        &self,
        _client_id: &str,
        connection: ConnectionId,
        events: mpsc::Sender<BackendEvent>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, ComfyUIClientError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(ComfyUIClientError::Connection("connection refused".into()));
        }

        let mut channel = self.channel.lock().unwrap();
        channel.events = Some(events);
        channel.cancel = Some(cancel.clone());
        channel.connection = connection;
        Ok(tokio::spawn(async move { cancel.cancelled().await }))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Config with no history grace so tests don't sleep.
pub fn test_config() -> TrackerConfig {
    let mut config = TrackerConfig::new("http://comfyui.invalid:8188");
    config.history_grace = Duration::ZERO;
    config
}

pub struct Harness {
    pub tracker: Arc<JobTracker>,
    pub backend: Arc<FakeBackend>,
    pub source: Arc<FakeSource>,
}

pub fn start_tracker(config: TrackerConfig) -> Harness {
    let backend = Arc::new(FakeBackend::default());
    let source = Arc::new(FakeSource::default());
    let tracker = JobTracker::start(backend.clone(), source.clone(), config);
    Harness {
        tracker,
        backend,
        source,
    }
}

/// Poll `condition` every 10ms for up to 2 seconds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
