//! Semantic generation parameters.
//!
//! A [`GenerationRequest`] is what callers submit. The builder turns it
//! into a node graph; the tracker records it (with the seed resolved)
//! against the job.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BuildError;
use crate::family::{has_noise_marker, ModelFamily};
use crate::template::is_seed_tag;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Seed value meaning "pick a fresh random seed at build time".
pub const RANDOM_SEED: i64 = -1;

pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_HEIGHT: u32 = 1024;
pub const DEFAULT_STEPS: u32 = 20;
pub const DEFAULT_CFG: f64 = 7.0;
pub const DEFAULT_SAMPLER: &str = "euler";
pub const DEFAULT_SCHEDULER: &str = "normal";
pub const DEFAULT_FILENAME_PREFIX: &str = "kiln";

/// Default `ModelSamplingSD3` shift for dual-stage video models.
pub const DEFAULT_VIDEO_SHIFT: f64 = 8.0;

/// Latent dimensions must be a multiple of this.
pub const LATENT_ALIGNMENT: u32 = 8;

/// Upper bound on either image dimension.
pub const MAX_DIMENSION: u32 = 8192;

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

fn default_steps() -> u32 {
    DEFAULT_STEPS
}

fn default_cfg() -> f64 {
    DEFAULT_CFG
}

fn default_seed() -> i64 {
    RANDOM_SEED
}

fn default_sampler() -> String {
    DEFAULT_SAMPLER.to_string()
}

fn default_scheduler() -> String {
    DEFAULT_SCHEDULER.to_string()
}

fn default_strength() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Architecture and media
// ---------------------------------------------------------------------------

/// How the model's weights are packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelArchitecture {
    /// One checkpoint file containing model, text encoder and VAE.
    Checkpoint,
    /// Separate diffusion weights, text encoder and VAE files.
    Split,
    /// High-noise and low-noise diffusion weights used in sequence.
    DualStage,
}

/// Container for multi-frame output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoContainer {
    #[default]
    Webp,
    Png,
    Mp4,
    Gif,
}

fn default_quality() -> u32 {
    90
}

/// Video-specific output options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoOptions {
    pub frames: u32,
    pub fps: f64,
    #[serde(default)]
    pub container: VideoContainer,
    /// Lossless encoding for animated WebP.
    #[serde(default)]
    pub lossless: bool,
    /// Encoder quality for animated WebP (0-100).
    #[serde(default = "default_quality")]
    pub quality: u32,
}

/// Declared output media.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Image,
    Video(VideoOptions),
}

impl MediaKind {
    pub fn video(&self) -> Option<&VideoOptions> {
        match self {
            MediaKind::Image => None,
            MediaKind::Video(options) => Some(options),
        }
    }
}

/// One LoRA application, in chain order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraSpec {
    pub name: String,
    #[serde(default = "default_strength")]
    pub strength: f64,
    /// CLIP strength; defaults to `strength`.
    #[serde(default)]
    pub clip_strength: Option<f64>,
    /// Paired low-noise file for dual-stage models.
    #[serde(default)]
    pub low_noise_name: Option<String>,
}

impl LoraSpec {
    pub fn new(name: impl Into<String>, strength: f64) -> Self {
        Self {
            name: name.into(),
            strength,
            clip_strength: None,
            low_noise_name: None,
        }
    }

    pub fn clip_strength(&self) -> f64 {
        self.clip_strength.unwrap_or(self.strength)
    }
}

// ---------------------------------------------------------------------------
// GenerationRequest
// ---------------------------------------------------------------------------

/// Everything needed to build one generation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    /// Checkpoint or diffusion-weight file name.
    pub model: String,
    /// Weight packaging; detected from the model name when absent.
    #[serde(default)]
    pub architecture: Option<ModelArchitecture>,
    /// Model family; detected from the model name when absent.
    #[serde(default)]
    pub family: Option<ModelFamily>,
    /// Text encoder file(s) overriding the family convention.
    #[serde(default)]
    pub text_encoders: Vec<String>,
    /// VAE file overriding the family convention.
    #[serde(default)]
    pub vae: Option<String>,
    #[serde(default)]
    pub high_noise_model: Option<String>,
    #[serde(default)]
    pub low_noise_model: Option<String>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg")]
    pub cfg: f64,
    /// Explicit seed, or [`RANDOM_SEED`].
    #[serde(default = "default_seed")]
    pub seed: i64,
    #[serde(default = "default_sampler")]
    pub sampler: String,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default)]
    pub loras: Vec<LoraSpec>,
    #[serde(default)]
    pub media: MediaKind,
    /// `ModelSamplingSD3` shift for dual-stage models.
    #[serde(default)]
    pub shift: Option<f64>,
    #[serde(default)]
    pub filename_prefix: Option<String>,
    /// Stored workflow with `${tag}` placeholders. When set, the builder
    /// is bypassed and the template is filled instead.
    #[serde(default)]
    pub custom_workflow: Option<String>,
    /// Additional template parameters; override the derived ones.
    #[serde(default)]
    pub extra_params: Map<String, Value>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            model: String::new(),
            architecture: None,
            family: None,
            text_encoders: Vec::new(),
            vae: None,
            high_noise_model: None,
            low_noise_model: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            steps: DEFAULT_STEPS,
            cfg: DEFAULT_CFG,
            seed: RANDOM_SEED,
            sampler: default_sampler(),
            scheduler: default_scheduler(),
            loras: Vec::new(),
            media: MediaKind::Image,
            shift: None,
            filename_prefix: None,
            custom_workflow: None,
            extra_params: Map::new(),
        }
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    /// Family from the request, or detected from the model file name.
    pub fn resolved_family(&self) -> ModelFamily {
        self.family
            .unwrap_or_else(|| ModelFamily::detect(&self.model))
    }

    /// Architecture from the request, or inferred.
    ///
    /// A video request for a Wan model, or any model whose name carries a
    /// high/low-noise marker, is dual-stage. A known split family is
    /// split. Everything else loads as a single checkpoint.
    pub fn resolved_architecture(&self) -> ModelArchitecture {
        if let Some(architecture) = self.architecture {
            return architecture;
        }
        let family = self.resolved_family();
        let explicit_pair = self.high_noise_model.is_some() || self.low_noise_model.is_some();
        let is_video = matches!(self.media, MediaKind::Video(_));
        if explicit_pair || (is_video && family == ModelFamily::Wan && has_noise_marker(&self.model))
        {
            ModelArchitecture::DualStage
        } else if family.text_encoder().is_some() {
            ModelArchitecture::Split
        } else {
            ModelArchitecture::Checkpoint
        }
    }

    pub fn filename_prefix(&self) -> &str {
        self.filename_prefix
            .as_deref()
            .unwrap_or(DEFAULT_FILENAME_PREFIX)
    }

    /// Reject requests that cannot produce a valid graph.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.model.trim().is_empty() {
            return Err(BuildError::MissingModel);
        }
        if self.seed < RANDOM_SEED {
            return Err(BuildError::Validation(format!(
                "Seed must be non-negative or {RANDOM_SEED} (got {})",
                self.seed
            )));
        }

        // Template graphs carry their own sizes and sampler settings.
        if self.custom_workflow.is_some() {
            return Ok(());
        }

        for (label, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 || value > MAX_DIMENSION || value % LATENT_ALIGNMENT != 0 {
                return Err(BuildError::Validation(format!(
                    "{label} must be a positive multiple of {LATENT_ALIGNMENT} up to {MAX_DIMENSION} (got {value})"
                )));
            }
        }
        if self.steps == 0 {
            return Err(BuildError::Validation("steps must be at least 1".to_string()));
        }
        if !self.cfg.is_finite() || self.cfg < 0.0 {
            return Err(BuildError::Validation(format!(
                "cfg must be a non-negative number (got {})",
                self.cfg
            )));
        }
        if let Some(shift) = self.shift {
            if !shift.is_finite() || shift <= 0.0 {
                return Err(BuildError::Validation(format!(
                    "shift must be positive (got {shift})"
                )));
            }
        }
        for (index, lora) in self.loras.iter().enumerate() {
            if lora.name.trim().is_empty() {
                return Err(BuildError::Validation(format!(
                    "LoRA #{index} has an empty name"
                )));
            }
            if !lora.strength.is_finite() || !lora.clip_strength().is_finite() {
                return Err(BuildError::Validation(format!(
                    "LoRA '{}' strength must be finite",
                    lora.name
                )));
            }
        }
        if let Some(video) = self.media.video() {
            if video.frames == 0 {
                return Err(BuildError::Validation(
                    "Video frame count must be at least 1".to_string(),
                ));
            }
            if !video.fps.is_finite() || video.fps <= 0.0 {
                return Err(BuildError::Validation(format!(
                    "Video fps must be positive (got {})",
                    video.fps
                )));
            }
            if video.quality > 100 {
                return Err(BuildError::Validation(format!(
                    "Video quality must be 0-100 (got {})",
                    video.quality
                )));
            }
        }
        Ok(())
    }

    /// Seed asked for by a templated request: a seed-like `extra_params`
    /// entry (`seed`, `noise_seed`, ...) wins over [`seed`](Self::seed).
    /// Entries that are not an integer are ignored.
    pub fn template_seed(&self) -> i64 {
        self.extra_params
            .iter()
            .filter(|(key, _)| is_seed_tag(key))
            .find_map(|(_, value)| match value {
                Value::Number(n) => n.as_i64(),
                Value::String(text) => text.trim().parse().ok(),
                _ => None,
            })
            .unwrap_or(self.seed)
    }

    /// Copy of this request with `seed` pinned everywhere a seed can be
    /// given, so the record matches the graph that was submitted.
    pub fn with_resolved_seed(&self, seed: u64) -> GenerationRequest {
        let mut pinned = self.clone();
        pinned.seed = i64::try_from(seed).unwrap_or(i64::MAX);
        for (key, value) in pinned.extra_params.iter_mut() {
            if is_seed_tag(key) {
                *value = Value::from(seed);
            }
        }
        pinned
    }

    /// Parameters exposed to `${tag}` placeholders in a stored workflow.
    ///
    /// `seed` is the already-resolved seed. Entries in `extra_params`
    /// override the derived values, except seed-like entries, which all
    /// take `seed`.
    pub fn template_params(&self, seed: u64) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("prompt".into(), Value::from(self.prompt.clone()));
        params.insert(
            "negative_prompt".into(),
            Value::from(self.negative_prompt.clone()),
        );
        params.insert("model".into(), Value::from(self.model.clone()));
        params.insert("width".into(), Value::from(self.width));
        params.insert("height".into(), Value::from(self.height));
        params.insert("steps".into(), Value::from(self.steps));
        params.insert("cfg".into(), Value::from(self.cfg));
        params.insert("seed".into(), Value::from(seed));
        params.insert("sampler".into(), Value::from(self.sampler.clone()));
        params.insert("scheduler".into(), Value::from(self.scheduler.clone()));
        params.insert(
            "filename_prefix".into(),
            Value::from(self.filename_prefix().to_string()),
        );
        if let Some(video) = self.media.video() {
            params.insert("frames".into(), Value::from(video.frames));
            params.insert("fps".into(), Value::from(video.fps));
        }
        for (index, lora) in self.loras.iter().enumerate() {
            params.insert(format!("lora_{}", index + 1), Value::from(lora.name.clone()));
            params.insert(
                format!("lora_{}_strength", index + 1),
                Value::from(lora.strength),
            );
        }
        for (key, value) in &self.extra_params {
            let value = if is_seed_tag(key) {
                Value::from(seed)
            } else {
                value.clone()
            };
            params.insert(key.clone(), value);
        }
        params
    }
}

/// Resolve [`RANDOM_SEED`] to a fresh random 32-bit seed.
pub fn resolve_seed(seed: i64) -> u64 {
    if seed == RANDOM_SEED {
        u64::from(rand::random::<u32>())
    } else {
        seed.max(0) as u64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    // -- Deserialization --

    #[test]
    fn minimal_json_gets_defaults() {
        let request: GenerationRequest =
            serde_json::from_value(json!({"prompt": "a cat", "model": "ckpt.safetensors"}))
                .unwrap();
        assert_eq!(request.seed, RANDOM_SEED);
        assert_eq!(request.steps, DEFAULT_STEPS);
        assert_eq!(request.media, MediaKind::Image);
        assert!(request.loras.is_empty());
    }

    #[test]
    fn video_media_is_tagged_by_kind() {
        let request: GenerationRequest = serde_json::from_value(json!({
            "prompt": "waves",
            "model": "wan.safetensors",
            "media": {"kind": "video", "frames": 81, "fps": 16.0, "container": "mp4"}
        }))
        .unwrap();
        let video = request.media.video().unwrap();
        assert_eq!(video.frames, 81);
        assert_eq!(video.container, VideoContainer::Mp4);
        assert_eq!(video.quality, 90);
    }

    // -- Validation --

    #[test]
    fn empty_model_is_rejected() {
        let request = GenerationRequest::new("a cat", "  ");
        assert_matches!(request.validate(), Err(BuildError::MissingModel));
    }

    #[test]
    fn unaligned_width_is_rejected() {
        let request = GenerationRequest {
            width: 1000 + 1,
            ..GenerationRequest::new("a cat", "m.safetensors")
        };
        assert_matches!(request.validate(), Err(BuildError::Validation(_)));
    }

    #[test]
    fn zero_steps_is_rejected() {
        let request = GenerationRequest {
            steps: 0,
            ..GenerationRequest::new("a cat", "m.safetensors")
        };
        assert_matches!(request.validate(), Err(BuildError::Validation(_)));
    }

    #[test]
    fn seed_below_random_marker_is_rejected() {
        let request = GenerationRequest {
            seed: -2,
            ..GenerationRequest::new("a cat", "m.safetensors")
        };
        assert_matches!(request.validate(), Err(BuildError::Validation(_)));
    }

    #[test]
    fn zero_frame_video_is_rejected() {
        let request = GenerationRequest {
            media: MediaKind::Video(VideoOptions {
                frames: 0,
                fps: 16.0,
                container: VideoContainer::Webp,
                lossless: false,
                quality: 90,
            }),
            ..GenerationRequest::new("a cat", "m.safetensors")
        };
        assert_matches!(request.validate(), Err(BuildError::Validation(_)));
    }

    #[test]
    fn template_request_skips_graph_checks() {
        let request = GenerationRequest {
            width: 3,
            custom_workflow: Some("{}".into()),
            ..GenerationRequest::new("a cat", "m.safetensors")
        };
        assert!(request.validate().is_ok());
    }

    // -- Architecture inference --

    #[test]
    fn plain_checkpoint_is_checkpoint() {
        let request = GenerationRequest::new("a cat", "ckpt.safetensors");
        assert_eq!(request.resolved_architecture(), ModelArchitecture::Checkpoint);
    }

    #[test]
    fn flux_is_split() {
        let request = GenerationRequest::new("a cat", "flux1-dev.safetensors");
        assert_eq!(request.resolved_architecture(), ModelArchitecture::Split);
    }

    #[test]
    fn wan_video_with_marker_is_dual_stage() {
        let request = GenerationRequest {
            media: MediaKind::Video(VideoOptions {
                frames: 81,
                fps: 16.0,
                container: VideoContainer::Webp,
                lossless: false,
                quality: 90,
            }),
            ..GenerationRequest::new("waves", "wan2.2_t2v_high_noise_14B.safetensors")
        };
        assert_eq!(request.resolved_architecture(), ModelArchitecture::DualStage);
    }

    #[test]
    fn explicit_architecture_wins() {
        let request = GenerationRequest {
            architecture: Some(ModelArchitecture::Checkpoint),
            ..GenerationRequest::new("a cat", "flux1-dev.safetensors")
        };
        assert_eq!(request.resolved_architecture(), ModelArchitecture::Checkpoint);
    }

    // -- Seeds --

    #[test]
    fn explicit_seed_is_kept() {
        assert_eq!(resolve_seed(42), 42);
        assert_eq!(resolve_seed(0), 0);
    }

    #[test]
    fn random_seed_is_32_bit() {
        for _ in 0..32 {
            assert!(resolve_seed(RANDOM_SEED) <= u64::from(u32::MAX));
        }
    }

    #[test]
    fn template_params_use_resolved_seed_and_extras() {
        let mut request = GenerationRequest::new("a cat", "m.safetensors");
        request
            .extra_params
            .insert("steps".into(), json!(35));
        let params = request.template_params(1234);
        assert_eq!(params["seed"], json!(1234));
        assert_eq!(params["steps"], json!(35));
        assert_eq!(params["prompt"], json!("a cat"));
    }

    #[test]
    fn seed_like_extras_take_the_resolved_seed() {
        let mut request = GenerationRequest::new("a cat", "m.safetensors");
        request.extra_params.insert("seed".into(), json!(-1));
        request.extra_params.insert("noise_seed".into(), json!("-1"));
        let params = request.template_params(99);
        assert_eq!(params["seed"], json!(99));
        assert_eq!(params["noise_seed"], json!(99));
    }

    #[test]
    fn template_seed_prefers_extra_params() {
        let mut request = GenerationRequest {
            seed: 7,
            ..GenerationRequest::new("a cat", "m.safetensors")
        };
        assert_eq!(request.template_seed(), 7);

        request.extra_params.insert("Noise-Seed".into(), json!(" 42 "));
        assert_eq!(request.template_seed(), 42);

        request.extra_params.clear();
        request.extra_params.insert("seed".into(), json!("random"));
        assert_eq!(request.template_seed(), 7);
    }

    #[test]
    fn resolved_seed_is_pinned_in_extras() {
        let mut request = GenerationRequest::new("a cat", "m.safetensors");
        request.extra_params.insert("seed".into(), json!(-1));
        request.extra_params.insert("steps".into(), json!(30));

        let pinned = request.with_resolved_seed(1234);
        assert_eq!(pinned.seed, 1234);
        assert_eq!(pinned.extra_params["seed"], json!(1234));
        assert_eq!(pinned.extra_params["steps"], json!(30));
    }
}
