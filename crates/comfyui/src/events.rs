//! Events flowing out of the push-channel listener and the tracker.
//!
//! [`BackendEvent`]s are produced by the listener after interpreting raw
//! WebSocket messages and consumed by the tracker's event pump.
//! [`JobUpdate`]s are what the tracker broadcasts to its subscribers
//! once an event actually changed a job.

use kiln_core::types::JobId;
use serde::Serialize;

/// Monotonic identifier of one push-channel connection.
pub type ConnectionId = u64;

/// A job-level event decoded from the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// The backend began executing a job.
    Started { job_id: JobId },

    /// Sampler step progress.
    Progress { job_id: JobId, step: u32, total: u32 },

    /// Every node of the job finished.
    Completed { job_id: JobId },

    /// The engine reported an execution error.
    Failed { job_id: JobId, message: String },

    /// Execution was stopped by an interrupt.
    Interrupted { job_id: JobId },

    /// The push channel closed or errored. Jobs submitted over this
    /// connection will receive no further events.
    Disconnected {
        connection: ConnectionId,
        reason: String,
    },
}

impl BackendEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            BackendEvent::Started { job_id }
            | BackendEvent::Progress { job_id, .. }
            | BackendEvent::Completed { job_id }
            | BackendEvent::Failed { job_id, .. }
            | BackendEvent::Interrupted { job_id } => Some(job_id),
            BackendEvent::Disconnected { .. } => None,
        }
    }

    /// Whether this event ends a job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackendEvent::Completed { .. }
                | BackendEvent::Failed { .. }
                | BackendEvent::Interrupted { .. }
        )
    }
}

/// A state change broadcast by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobUpdate {
    /// The push channel was (re)opened.
    Connected { connection: ConnectionId },

    /// The push channel was lost.
    Disconnected {
        connection: ConnectionId,
        reason: String,
    },

    /// A job was accepted by the backend.
    Submitted { job_id: JobId },

    /// A job started executing.
    Started { job_id: JobId },

    /// A job made progress (step N of M).
    Progress {
        job_id: JobId,
        step: u32,
        total: u32,
        /// Completion percentage (0-100).
        percent: u8,
    },

    /// A job completed successfully.
    Completed { job_id: JobId },

    /// A job failed with an error.
    Failed { job_id: JobId, error: String },

    /// A job exceeded its result deadline.
    TimedOut { job_id: JobId },

    /// A job was cancelled.
    Cancelled { job_id: JobId },
}
