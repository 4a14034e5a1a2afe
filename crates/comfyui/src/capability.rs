//! Backend capability lists (installed models, samplers, schedulers).
//!
//! ComfyUI exposes these as the option lists of loader and sampler node
//! inputs under `/object_info/{NodeClass}`. When the backend cannot be
//! queried, callers get a hard-coded fallback instead of an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const FALLBACK_SAMPLERS: &[&str] = &[
    "euler",
    "euler_ancestral",
    "heun",
    "dpm_2",
    "dpmpp_2m",
    "dpmpp_sde",
    "dpmpp_2m_sde",
    "ddim",
    "uni_pc",
];

const FALLBACK_SCHEDULERS: &[&str] = &[
    "normal",
    "karras",
    "exponential",
    "sgm_uniform",
    "simple",
    "ddim_uniform",
    "beta",
];

/// A list the backend can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Checkpoints,
    DiffusionModels,
    Loras,
    Vaes,
    TextEncoders,
    Samplers,
    Schedulers,
}

impl CapabilityKind {
    /// Node class whose input options enumerate this capability.
    pub fn node_class(self) -> &'static str {
        match self {
            CapabilityKind::Checkpoints => "CheckpointLoaderSimple",
            CapabilityKind::DiffusionModels => "UNETLoader",
            CapabilityKind::Loras => "LoraLoader",
            CapabilityKind::Vaes => "VAELoader",
            CapabilityKind::TextEncoders => "CLIPLoader",
            CapabilityKind::Samplers | CapabilityKind::Schedulers => "KSampler",
        }
    }

    /// Required input holding the option list.
    pub fn input_field(self) -> &'static str {
        match self {
            CapabilityKind::Checkpoints => "ckpt_name",
            CapabilityKind::DiffusionModels => "unet_name",
            CapabilityKind::Loras => "lora_name",
            CapabilityKind::Vaes => "vae_name",
            CapabilityKind::TextEncoders => "clip_name",
            CapabilityKind::Samplers => "sampler_name",
            CapabilityKind::Schedulers => "scheduler",
        }
    }

    /// List returned when the backend cannot be queried. Model lists
    /// have no sensible fallback and are empty.
    pub fn fallback(self) -> Vec<String> {
        let list: &[&str] = match self {
            CapabilityKind::Samplers => FALLBACK_SAMPLERS,
            CapabilityKind::Schedulers => FALLBACK_SCHEDULERS,
            _ => &[],
        };
        list.iter().map(|s| s.to_string()).collect()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityKind::Checkpoints => "checkpoints",
            CapabilityKind::DiffusionModels => "diffusion_models",
            CapabilityKind::Loras => "loras",
            CapabilityKind::Vaes => "vaes",
            CapabilityKind::TextEncoders => "text_encoders",
            CapabilityKind::Samplers => "samplers",
            CapabilityKind::Schedulers => "schedulers",
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extract the option list from an `/object_info/{NodeClass}` response.
///
/// Handles both the legacy shape (`[["a", "b"], {...}]`) and the
/// combo shape (`["COMBO", {"options": ["a", "b"]}]`).
pub fn parse_options(object_info: &Value, kind: CapabilityKind) -> Option<Vec<String>> {
    let input_def = object_info
        .get(kind.node_class())?
        .get("input")?
        .get("required")?
        .get(kind.input_field())?
        .as_array()?;

    let options = match input_def.first()? {
        Value::Array(options) => options,
        _ => input_def.get(1)?.get("options")?.as_array()?,
    };

    Some(
        options
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}
