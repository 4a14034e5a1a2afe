//! Seams between the tracker and the outside world.
//!
//! [`Backend`] is the HTTP side (implemented by [`ComfyUIApi`]) and
//! [`EventSource`] opens the push channel (implemented by
//! [`ComfyUIClient`](crate::client::ComfyUIClient)). Tests substitute
//! in-memory fakes for both.

use async_trait::async_trait;
use kiln_core::job::ArtifactRef;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError, SubmitResponse};
use crate::capability::CapabilityKind;
use crate::client::ComfyUIClientError;
use crate::events::{BackendEvent, ConnectionId};

/// Request/response operations against a generation backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError>;

    async fn get_history(&self, job_id: &str) -> Result<serde_json::Value, ComfyUIApiError>;

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ComfyUIApiError>;

    /// Stop whatever is currently executing.
    async fn interrupt(&self) -> Result<(), ComfyUIApiError>;

    /// Remove a queued job.
    async fn cancel_execution(&self, job_id: &str) -> Result<(), ComfyUIApiError>;

    /// Capability list; never fails (falls back to a built-in list).
    async fn list_capability(&self, kind: CapabilityKind) -> Vec<String>;
}

/// Opens the push channel and runs its listener.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Connect with `client_id` and spawn a listener forwarding events to
    /// `events` until the channel closes or `cancel` fires. The listener
    /// reports its own loss as [`BackendEvent::Disconnected`] tagged with
    /// `connection`.
    async fn open(
        &self,
        client_id: &str,
        connection: ConnectionId,
        events: mpsc::Sender<BackendEvent>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, ComfyUIClientError>;
}

#[async_trait]
impl Backend for ComfyUIApi {
    async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        ComfyUIApi::submit_workflow(self, workflow, client_id).await
    }

    async fn get_history(&self, job_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        ComfyUIApi::get_history(self, job_id).await
    }

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ComfyUIApiError> {
        ComfyUIApi::fetch_artifact(self, artifact).await
    }

    async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        ComfyUIApi::interrupt(self).await
    }

    async fn cancel_execution(&self, job_id: &str) -> Result<(), ComfyUIApiError> {
        ComfyUIApi::cancel_execution(self, job_id).await
    }

    async fn list_capability(&self, kind: CapabilityKind) -> Vec<String> {
        ComfyUIApi::list_capability(self, kind).await
    }
}
