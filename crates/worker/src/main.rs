//! Command-line runner: submit one generation request to ComfyUI and
//! download its outputs.
//!
//! ```text
//! kiln-worker <request.json>
//! ```
//!
//! Backend settings come from the environment (see
//! [`TrackerConfig::from_env`]); files are written to `OUTPUT_DIR`
//! (default `output`).

use std::path::{Path, PathBuf};

use anyhow::Context;
use kiln_comfyui::config::TrackerConfig;
use kiln_comfyui::events::JobUpdate;
use kiln_comfyui::tracker::JobTracker;
use kiln_core::job::ArtifactRef;
use kiln_core::request::GenerationRequest;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_OUTPUT_DIR: &str = "output";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_worker=debug,kiln_comfyui=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let request_path = std::env::args()
        .nth(1)
        .context("usage: kiln-worker <request.json>")?;
    let config = TrackerConfig::from_env()?;
    let output_dir = PathBuf::from(
        std::env::var("OUTPUT_DIR").unwrap_or_else(|_| DEFAULT_OUTPUT_DIR.to_string()),
    );

    let raw = tokio::fs::read_to_string(&request_path)
        .await
        .with_context(|| format!("failed to read {request_path}"))?;
    let request: GenerationRequest = serde_json::from_str(&raw)
        .with_context(|| format!("{request_path} is not a valid generation request"))?;

    tracing::info!(
        api_url = %config.api_url,
        model = %request.model,
        output_dir = %output_dir.display(),
        "Worker starting",
    );

    let tracker = JobTracker::from_config(config);
    let result = run(&tracker, &request, &output_dir).await;
    tracker.shutdown().await;

    let saved = result?;
    tracing::info!(files = saved.len(), "Generation finished");
    Ok(())
}

/// Submit, wait, download. Returns the paths written.
async fn run(
    tracker: &JobTracker,
    request: &GenerationRequest,
    output_dir: &Path,
) -> anyhow::Result<Vec<PathBuf>> {
    let progress_log = tokio::spawn(log_updates(tracker.subscribe()));

    let job_id = tracker.submit(request).await?;
    let outcome = tracker
        .await_result(&job_id, tracker.default_timeout())
        .await;
    progress_log.abort();
    let artifacts = outcome?;

    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let mut saved = Vec::with_capacity(artifacts.len());
    for artifact in &artifacts {
        let bytes = tracker.fetch_artifact(artifact).await?;
        let path = artifact_path(output_dir, artifact);
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(
            job_id = %job_id,
            path = %path.display(),
            bytes = bytes.len(),
            "Saved artifact",
        );
        saved.push(path);
    }
    Ok(saved)
}

async fn log_updates(mut updates: broadcast::Receiver<JobUpdate>) {
    loop {
        match updates.recv().await {
            Ok(JobUpdate::Progress {
                job_id,
                step,
                total,
                percent,
            }) => {
                tracing::info!(job_id = %job_id, step, total, "Progress {percent}%");
            }
            Ok(update) => tracing::debug!(?update, "Job update"),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Progress log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Local path for an artifact. The backend subfolder is folded into the
/// file name so outputs never escape `dir`.
fn artifact_path(dir: &Path, artifact: &ArtifactRef) -> PathBuf {
    let name = Path::new(&artifact.filename)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let subfolder = artifact
        .subfolder
        .replace(|c: char| c == '/' || c == '\\', "_");

    if subfolder.is_empty() {
        dir.join(name)
    } else {
        dir.join(format!("{subfolder}_{name}"))
    }
}
