//! Artifact extraction from ComfyUI `/history/{prompt_id}` responses.
//!
//! The history entry lists, per output node, the files it wrote:
//!
//! ```json
//! {"<prompt_id>": {"outputs": {"9": {"images": [{"filename": "a.png", "subfolder": "", "type": "output"}]}}}}
//! ```

use kiln_core::job::ArtifactRef;
use serde_json::Value;

/// Output keys under which nodes report written files.
const ARTIFACT_KEYS: &[&str] = &["images", "gifs", "videos"];

/// Collect every file reported by the history entry for `prompt_id`.
///
/// Returns `None` when the history has no entry for the prompt yet.
/// Entries without a `filename` are skipped.
pub fn extract_artifacts(history: &Value, prompt_id: &str) -> Option<Vec<ArtifactRef>> {
    let entry = history.get(prompt_id)?;
    let Some(outputs) = entry.get("outputs").and_then(Value::as_object) else {
        return Some(Vec::new());
    };

    let mut artifacts = Vec::new();
    for (node_id, output) in outputs {
        for key in ARTIFACT_KEYS {
            let Some(items) = output.get(*key).and_then(Value::as_array) else {
                continue;
            };
            for item in items {
                let Some(filename) = item.get("filename").and_then(Value::as_str) else {
                    continue;
                };
                artifacts.push(ArtifactRef {
                    filename: filename.to_string(),
                    subfolder: string_field(item, "subfolder").unwrap_or_default(),
                    kind: string_field(item, "type").unwrap_or_else(|| "output".to_string()),
                    node_id: node_id.clone(),
                });
            }
        }
    }
    Some(artifacts)
}

/// The status string ComfyUI recorded for the prompt (`success`, `error`).
pub fn status_str<'a>(history: &'a Value, prompt_id: &str) -> Option<&'a str> {
    history
        .get(prompt_id)?
        .get("status")?
        .get("status_str")?
        .as_str()
}

fn string_field(item: &Value, key: &str) -> Option<String> {
    item.get(key).and_then(Value::as_str).map(str::to_string)
}
