//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI push channel, parses them into typed
//! [`ComfyUIMessage`] variants and translates the job-relevant ones into
//! [`BackendEvent`]s sent to the tracker's event pump. The listener holds
//! no job state beyond the id of the prompt currently executing, which
//! attributes `progress` frames that omit their `prompt_id`.

use futures::{Stream, StreamExt};
use kiln_core::types::JobId;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::events::{BackendEvent, ConnectionId};
use crate::messages::{parse_message, ComfyUIMessage};

/// Per-connection translation state.
#[derive(Debug, Default)]
pub struct ListenerState {
    /// Prompt currently executing on the backend, if known.
    pub current_job: Option<JobId>,
}

/// Translate one parsed message into a job event.
///
/// Returns `None` for messages that carry no job transition (status,
/// cached nodes, node outputs) or that cannot be attributed to a job.
pub fn translate(message: ComfyUIMessage, state: &mut ListenerState) -> Option<BackendEvent> {
    match message {
        ComfyUIMessage::ExecutionStart(data) => {
            state.current_job = Some(data.prompt_id.clone());
            Some(BackendEvent::Started {
                job_id: data.prompt_id,
            })
        }
        ComfyUIMessage::Executing(data) => match data.node {
            Some(node) => {
                tracing::debug!(prompt_id = ?data.prompt_id, node = %node, "Executing node");
                let job_id = data.prompt_id.or_else(|| state.current_job.clone())?;
                state.current_job = Some(job_id.clone());
                Some(BackendEvent::Started { job_id })
            }
            // node == None means execution is complete for this prompt.
            None => {
                let job_id = data.prompt_id.or_else(|| state.current_job.take())?;
                if state.current_job.as_deref() == Some(job_id.as_str()) {
                    state.current_job = None;
                }
                Some(BackendEvent::Completed { job_id })
            }
        },
        ComfyUIMessage::Progress(data) => {
            let job_id = data.prompt_id.or_else(|| state.current_job.clone())?;
            Some(BackendEvent::Progress {
                job_id,
                step: data.value,
                total: data.max,
            })
        }
        ComfyUIMessage::ExecutionSuccess(data) => Some(BackendEvent::Completed {
            job_id: data.prompt_id,
        }),
        ComfyUIMessage::ExecutionError(data) => {
            tracing::error!(
                prompt_id = %data.prompt_id,
                node_id = ?data.node_id,
                node_type = ?data.node_type,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error",
            );
            clear_current(state, &data.prompt_id);
            let message = data.message();
            Some(BackendEvent::Failed {
                job_id: data.prompt_id,
                message,
            })
        }
        ComfyUIMessage::ExecutionInterrupted(data) => {
            clear_current(state, &data.prompt_id);
            Some(BackendEvent::Interrupted {
                job_id: data.prompt_id,
            })
        }
        ComfyUIMessage::Executed(data) => {
            let kinds: Vec<&str> = data
                .output
                .as_object()
                .map(|output| output.keys().map(String::as_str).collect())
                .unwrap_or_default();
            tracing::debug!(
                prompt_id = %data.prompt_id,
                node = %data.node,
                outputs = ?kinds,
                "Node executed with output",
            );
            None
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(prompt_id = %data.prompt_id, cached = data.nodes.len(), "Execution used cache");
            None
        }
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                sid = ?data.sid,
                "ComfyUI queue status",
            );
            None
        }
    }
}

fn clear_current(state: &mut ListenerState, job_id: &str) {
    if state.current_job.as_deref() == Some(job_id) {
        state.current_job = None;
    }
}

/// Process push-channel frames until the channel closes, errors, or
/// `cancel` fires.
///
/// Each text frame is parsed via [`parse_message`] and translated with
/// [`translate`]. Binary frames (preview images) are dropped. When the
/// channel is lost, a final [`BackendEvent::Disconnected`] is sent;
/// cancellation exits silently.
pub async fn run_listener<S>(
    mut ws_stream: S,
    connection: ConnectionId,
    events: mpsc::Sender<BackendEvent>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut state = ListenerState::default();

    let reason = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(connection, "Listener cancelled");
                return;
            }
            frame = ws_stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                let Some(event) = handle_text_message(&text, &mut state) else {
                    continue;
                };
                if events.send(event).await.is_err() {
                    // Event pump is gone; nothing left to report to.
                    return;
                }
            }
            Some(Ok(Message::Binary(data))) => {
                tracing::trace!(connection, bytes = data.len(), "Ignoring binary message (preview image)");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(connection, ?frame, "ComfyUI WebSocket closed");
                break "connection closed by backend".to_string();
            }
            Some(Err(e)) => {
                tracing::error!(connection, error = %e, "WebSocket receive error");
                break format!("receive error: {e}");
            }
            None => break "connection stream ended".to_string(),
        }
    };

    let _ = events
        .send(BackendEvent::Disconnected { connection, reason })
        .await;
}

fn handle_text_message(text: &str, state: &mut ListenerState) -> Option<BackendEvent> {
    match parse_message(text) {
        Ok(message) => translate(message, state),
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_message = %text,
                "Failed to parse ComfyUI message",
            );
            None
        }
    }
}
