//! Model family conventions for split and dual-stage architectures.
//!
//! Split models ship the diffusion weights, text encoder and VAE as
//! separate files. Which encoder and VAE a family expects is a naming
//! convention, captured here so requests only need the model file.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Marker separating the high-noise and low-noise halves of a
/// dual-stage checkpoint name. Matches `high`/`low` as a standalone
/// token (bounded by non-letters), in any case.
static NOISE_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:^|[^a-z])(high|low)(?:[^a-z]|$)").expect("valid regex"));

/// Suffix appended to a marker-less name for the low-noise partner.
pub const LOW_NOISE_SUFFIX: &str = "_low_noise";

/// Known model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    StableDiffusion,
    Flux,
    Chroma,
    Wan,
    HunyuanVideo,
    QwenImage,
    Unknown,
}

/// Text encoder file(s) and `CLIPLoader` type for a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextEncoderConvention {
    pub files: &'static [&'static str],
    pub clip_type: &'static str,
}

impl ModelFamily {
    /// Guess the family from a model file name.
    pub fn detect(model_name: &str) -> Self {
        let name = model_name.to_ascii_lowercase();
        if name.contains("wan") {
            ModelFamily::Wan
        } else if name.contains("hunyuan") {
            ModelFamily::HunyuanVideo
        } else if name.contains("qwen") {
            ModelFamily::QwenImage
        } else if name.contains("chroma") {
            ModelFamily::Chroma
        } else if name.contains("flux") {
            ModelFamily::Flux
        } else if name.contains("sdxl") || name.contains("sd15") || name.contains("sd_xl") {
            ModelFamily::StableDiffusion
        } else {
            ModelFamily::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::StableDiffusion => "stable_diffusion",
            ModelFamily::Flux => "flux",
            ModelFamily::Chroma => "chroma",
            ModelFamily::Wan => "wan",
            ModelFamily::HunyuanVideo => "hunyuan_video",
            ModelFamily::QwenImage => "qwen_image",
            ModelFamily::Unknown => "unknown",
        }
    }

    pub fn text_encoder(self) -> Option<TextEncoderConvention> {
        let convention = match self {
            ModelFamily::Flux => TextEncoderConvention {
                files: &["clip_l.safetensors", "t5xxl_fp8_e4m3fn.safetensors"],
                clip_type: "flux",
            },
            ModelFamily::Chroma => TextEncoderConvention {
                files: &["t5xxl_fp16.safetensors"],
                clip_type: "chroma",
            },
            ModelFamily::Wan => TextEncoderConvention {
                files: &["umt5_xxl_fp8_e4m3fn_scaled.safetensors"],
                clip_type: "wan",
            },
            ModelFamily::HunyuanVideo => TextEncoderConvention {
                files: &["clip_l.safetensors", "llava_llama3_fp8_scaled.safetensors"],
                clip_type: "hunyuan_video",
            },
            ModelFamily::QwenImage => TextEncoderConvention {
                files: &["qwen_2.5_vl_7b_fp8_scaled.safetensors"],
                clip_type: "qwen_image",
            },
            ModelFamily::StableDiffusion | ModelFamily::Unknown => return None,
        };
        Some(convention)
    }

    pub fn default_vae(self) -> Option<&'static str> {
        match self {
            ModelFamily::Flux | ModelFamily::Chroma => Some("ae.safetensors"),
            ModelFamily::Wan => Some("wan_2.1_vae.safetensors"),
            ModelFamily::HunyuanVideo => Some("hunyuan_video_vae_bf16.safetensors"),
            ModelFamily::QwenImage => Some("qwen_image_vae.safetensors"),
            ModelFamily::StableDiffusion | ModelFamily::Unknown => None,
        }
    }

    /// `CLIPLoader` type used when the caller supplies encoder files for
    /// a family without a convention.
    pub fn clip_type_or_default(self) -> &'static str {
        self.text_encoder()
            .map(|c| c.clip_type)
            .unwrap_or("stable_diffusion")
    }

    /// Families whose split loaders produce video latents.
    pub fn is_video(self) -> bool {
        matches!(self, ModelFamily::Wan | ModelFamily::HunyuanVideo)
    }
}

// ---------------------------------------------------------------------------
// Dual-stage naming
// ---------------------------------------------------------------------------

/// Which half of a dual-stage pair a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseStage {
    High,
    Low,
}

/// Locate the noise marker in the file-name part of `name`.
///
/// Returns the byte range of `high`/`low` and which stage it names.
fn find_marker(name: &str) -> Option<(usize, usize, NoiseStage)> {
    let file_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    let file = &name[file_start..];
    let caps = NOISE_MARKER_RE.captures(file)?;
    let m = caps.get(1)?;
    let stage = if m.as_str().eq_ignore_ascii_case("high") {
        NoiseStage::High
    } else {
        NoiseStage::Low
    };
    Some((file_start + m.start(), file_start + m.end(), stage))
}

/// Swap `high` <-> `low`, preserving the marker's case style.
fn swap_marker(marker: &str) -> &'static str {
    let is_high = marker.eq_ignore_ascii_case("high");
    let upper = marker.chars().all(|c| c.is_ascii_uppercase());
    let title = marker.chars().next().is_some_and(|c| c.is_ascii_uppercase());
    match (is_high, upper, title) {
        (true, true, _) => "LOW",
        (true, false, true) => "Low",
        (true, false, false) => "low",
        (false, true, _) => "HIGH",
        (false, false, true) => "High",
        (false, false, false) => "high",
    }
}

/// Derive the partner of a dual-stage weight name by swapping its
/// noise marker. Returns `None` when the name carries no marker.
pub fn swap_noise_marker(name: &str) -> Option<(String, NoiseStage)> {
    let (start, end, stage) = find_marker(name)?;
    let swapped = format!("{}{}{}", &name[..start], swap_marker(&name[start..end]), &name[end..]);
    Some((swapped, stage))
}

/// Append `suffix` to the stem of `name`, keeping its extension.
fn with_stem_suffix(name: &str, suffix: &str) -> String {
    let file_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[file_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let dot = file_start + dot;
            format!("{}{}{}", &name[..dot], suffix, &name[dot..])
        }
        _ => format!("{name}{suffix}"),
    }
}

/// Resolve the (high-noise, low-noise) weight names for a dual-stage
/// request.
///
/// Explicit names win. Otherwise the missing partner is derived by
/// swapping a `high`/`low` marker. A name with no marker is taken as
/// the high-noise weight and the low-noise name gets
/// [`LOW_NOISE_SUFFIX`] appended to its stem. This is a best-effort
/// naming heuristic, not a guarantee that the file exists.
pub fn dual_stage_names(
    model: &str,
    high_noise: Option<&str>,
    low_noise: Option<&str>,
) -> (String, String) {
    match (high_noise, low_noise) {
        (Some(high), Some(low)) => (high.to_string(), low.to_string()),
        (Some(high), None) => {
            let low = swap_noise_marker(high)
                .map(|(name, _)| name)
                .unwrap_or_else(|| with_stem_suffix(high, LOW_NOISE_SUFFIX));
            (high.to_string(), low)
        }
        (None, Some(low)) => {
            let high = swap_noise_marker(low)
                .map(|(name, _)| name)
                .unwrap_or_else(|| model.to_string());
            (high, low.to_string())
        }
        (None, None) => match swap_noise_marker(model) {
            Some((partner, NoiseStage::High)) => (model.to_string(), partner),
            Some((partner, NoiseStage::Low)) => (partner, model.to_string()),
            None => (model.to_string(), with_stem_suffix(model, LOW_NOISE_SUFFIX)),
        },
    }
}

/// Whether a model name looks like one half of a dual-stage pair.
pub fn has_noise_marker(name: &str) -> bool {
    find_marker(name).is_some()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Family detection --

    #[test]
    fn detects_families_from_file_names() {
        assert_eq!(ModelFamily::detect("flux1-dev.safetensors"), ModelFamily::Flux);
        assert_eq!(
            ModelFamily::detect("wan2.2_t2v_high_noise_14B_fp8.safetensors"),
            ModelFamily::Wan
        );
        assert_eq!(
            ModelFamily::detect("hunyuan_video_t2v_720p_bf16.safetensors"),
            ModelFamily::HunyuanVideo
        );
        assert_eq!(ModelFamily::detect("mystery.ckpt"), ModelFamily::Unknown);
    }

    #[test]
    fn flux_uses_dual_encoders() {
        let convention = ModelFamily::Flux.text_encoder().unwrap();
        assert_eq!(convention.files.len(), 2);
        assert_eq!(convention.clip_type, "flux");
    }

    #[test]
    fn unknown_family_has_no_convention() {
        assert!(ModelFamily::Unknown.text_encoder().is_none());
        assert!(ModelFamily::Unknown.default_vae().is_none());
    }

    // -- Dual-stage naming --

    #[test]
    fn explicit_names_are_used_verbatim() {
        let (high, low) = dual_stage_names("ignored", Some("a.safetensors"), Some("b.safetensors"));
        assert_eq!(high, "a.safetensors");
        assert_eq!(low, "b.safetensors");
    }

    #[test]
    fn derives_low_from_high_marker() {
        let (high, low) = dual_stage_names("wan2.2_t2v_high_noise_14B.safetensors", None, None);
        assert_eq!(high, "wan2.2_t2v_high_noise_14B.safetensors");
        assert_eq!(low, "wan2.2_t2v_low_noise_14B.safetensors");
    }

    #[test]
    fn derives_high_from_low_marker() {
        let (high, low) = dual_stage_names("wan2.2_i2v_low_noise_14B.safetensors", None, None);
        assert_eq!(high, "wan2.2_i2v_high_noise_14B.safetensors");
        assert_eq!(low, "wan2.2_i2v_low_noise_14B.safetensors");
    }

    #[test]
    fn marker_case_is_preserved() {
        let (_, low) = dual_stage_names("Wan22-HIGH.safetensors", None, None);
        assert_eq!(low, "Wan22-LOW.safetensors");
        let (_, low) = dual_stage_names("wan22_High.gguf", None, None);
        assert_eq!(low, "wan22_Low.gguf");
    }

    #[test]
    fn marker_inside_a_word_is_ignored() {
        // "highres" is not a noise marker.
        assert!(!has_noise_marker("wan_highres_fix.safetensors"));
        let (high, low) = dual_stage_names("wan_highres_fix.safetensors", None, None);
        assert_eq!(high, "wan_highres_fix.safetensors");
        assert_eq!(low, "wan_highres_fix_low_noise.safetensors");
    }

    #[test]
    fn marker_in_directory_is_ignored() {
        let (high, low) = dual_stage_names("high/wan22.safetensors", None, None);
        assert_eq!(high, "high/wan22.safetensors");
        assert_eq!(low, "high/wan22_low_noise.safetensors");
    }

    #[test]
    fn only_high_given_derives_low() {
        let (high, low) = dual_stage_names("base", Some("x_high_noise.safetensors"), None);
        assert_eq!(high, "x_high_noise.safetensors");
        assert_eq!(low, "x_low_noise.safetensors");
    }

    #[test]
    fn only_low_given_without_marker_falls_back_to_model() {
        let (high, low) = dual_stage_names("base.safetensors", None, Some("custom.safetensors"));
        assert_eq!(high, "base.safetensors");
        assert_eq!(low, "custom.safetensors");
    }

    #[test]
    fn suffix_without_extension() {
        let (_, low) = dual_stage_names("wan22", None, None);
        assert_eq!(low, "wan22_low_noise");
    }
}
