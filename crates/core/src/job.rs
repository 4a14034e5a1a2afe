//! Generation job lifecycle model.
//!
//! A job is created when the backend accepts a submission and moves
//! through `Queued -> Running -> {Succeeded | Failed | TimedOut | Cancelled}`.
//! Terminal states are final: every mutator below is a no-op once the
//! job is terminal.

use serde::{Deserialize, Serialize};

use crate::request::GenerationRequest;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Progress & artifacts
// ---------------------------------------------------------------------------

/// Sampler step progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub step: u32,
    pub total: u32,
}

impl Progress {
    /// Completion percentage (0-100), clamped.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let pct = (u64::from(self.step) * 100) / u64::from(self.total);
        pct.min(100) as u8
    }
}

/// Locator for a backend output file. Never holds the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Backend folder type (`output`, `temp`).
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    /// Node that produced the file.
    #[serde(default)]
    pub node_id: String,
}

fn default_kind() -> String {
    "output".to_string()
}

/// Caller-facing progress view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub step: u32,
    pub total: u32,
    pub status: JobStatus,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub submitted_at: Timestamp,
    /// The request with its seed resolved.
    pub request: GenerationRequest,
    pub status: JobStatus,
    pub progress: Progress,
    pub artifacts: Option<Vec<ArtifactRef>>,
    pub error: Option<String>,
    pub finished_at: Option<Timestamp>,
}

impl Job {
    /// A freshly accepted job, progress `0/steps`.
    pub fn new(id: impl Into<JobId>, request: GenerationRequest, submitted_at: Timestamp) -> Self {
        let total = request.steps;
        Self {
            id: id.into(),
            submitted_at,
            request,
            status: JobStatus::Queued,
            progress: Progress { step: 0, total },
            artifacts: None,
            error: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `Queued -> Running`. Returns whether the status changed.
    pub fn start(&mut self) -> bool {
        if self.status == JobStatus::Queued {
            self.status = JobStatus::Running;
            true
        } else {
            false
        }
    }

    /// Record a progress report. Implies the job is running.
    ///
    /// Returns `false` (and changes nothing) for terminal jobs.
    pub fn record_progress(&mut self, step: u32, total: u32) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.start();
        self.progress = Progress { step, total };
        true
    }

    /// Move to a terminal status. Returns `false` if already terminal.
    pub fn finish(&mut self, status: JobStatus, error: Option<String>, at: Timestamp) -> bool {
        debug_assert!(status.is_terminal());
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        self.error = error;
        self.finished_at = Some(at);
        if status == JobStatus::Succeeded && self.progress.total > 0 {
            self.progress.step = self.progress.total;
        }
        true
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            step: self.progress.step,
            total: self.progress.total,
            status: self.status,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
