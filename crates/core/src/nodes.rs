//! Typed ComfyUI node variants used by the workflow builder.
//!
//! Each [`NodeKind`] carries strongly-typed fields and is lowered to a
//! wire-level [`GraphNode`] with [`NodeKind::into_graph_node`]. Only the
//! builder constructs these; stored templates stay untyped.

use crate::graph::{GraphNode, Link};

// ---------------------------------------------------------------------------
// Class type names
// ---------------------------------------------------------------------------

pub const CHECKPOINT_LOADER_CLASS: &str = "CheckpointLoaderSimple";
pub const UNET_LOADER_CLASS: &str = "UNETLoader";
pub const CLIP_LOADER_CLASS: &str = "CLIPLoader";
pub const DUAL_CLIP_LOADER_CLASS: &str = "DualCLIPLoader";
pub const VAE_LOADER_CLASS: &str = "VAELoader";
pub const LORA_LOADER_CLASS: &str = "LoraLoader";
pub const LORA_MODEL_ONLY_CLASS: &str = "LoraLoaderModelOnly";
pub const MODEL_SAMPLING_SD3_CLASS: &str = "ModelSamplingSD3";
pub const CLIP_TEXT_ENCODE_CLASS: &str = "CLIPTextEncode";
pub const EMPTY_LATENT_IMAGE_CLASS: &str = "EmptyLatentImage";
pub const EMPTY_LATENT_VIDEO_CLASS: &str = "EmptyHunyuanLatentVideo";
pub const KSAMPLER_CLASS: &str = "KSampler";
pub const KSAMPLER_ADVANCED_CLASS: &str = "KSamplerAdvanced";
pub const VAE_DECODE_CLASS: &str = "VAEDecode";
pub const SAVE_IMAGE_CLASS: &str = "SaveImage";
pub const SAVE_ANIMATED_WEBP_CLASS: &str = "SaveAnimatedWEBP";
pub const SAVE_ANIMATED_PNG_CLASS: &str = "SaveAnimatedPNG";
pub const VIDEO_COMBINE_CLASS: &str = "VHS_VideoCombine";

// ---------------------------------------------------------------------------
// Output slots
// ---------------------------------------------------------------------------

/// `CheckpointLoaderSimple` and `LoraLoader` emit MODEL on slot 0.
pub const MODEL_SLOT: u32 = 0;
/// `CheckpointLoaderSimple` and `LoraLoader` emit CLIP on slot 1.
pub const CLIP_SLOT: u32 = 1;
/// `CheckpointLoaderSimple` emits VAE on slot 2.
pub const CHECKPOINT_VAE_SLOT: u32 = 2;

/// Sampler parameters shared by `KSampler`.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerNode {
    pub model: Link,
    pub positive: Link,
    pub negative: Link,
    pub latent_image: Link,
    pub seed: u64,
    pub steps: u32,
    pub cfg: f64,
    pub sampler_name: String,
    pub scheduler: String,
    pub denoise: f64,
}

/// One stage of a split-range `KSamplerAdvanced` run.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvancedSamplerNode {
    pub model: Link,
    pub positive: Link,
    pub negative: Link,
    pub latent_image: Link,
    pub add_noise: bool,
    pub noise_seed: u64,
    pub steps: u32,
    pub cfg: f64,
    pub sampler_name: String,
    pub scheduler: String,
    pub start_at_step: u32,
    pub end_at_step: u32,
    pub return_with_leftover_noise: bool,
}

/// Closed set of node kinds the builder emits.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    CheckpointLoader {
        ckpt_name: String,
    },
    UnetLoader {
        unet_name: String,
        weight_dtype: String,
    },
    ClipLoader {
        clip_name: String,
        clip_type: String,
    },
    DualClipLoader {
        clip_name1: String,
        clip_name2: String,
        clip_type: String,
    },
    VaeLoader {
        vae_name: String,
    },
    LoraLoader {
        model: Link,
        clip: Link,
        lora_name: String,
        strength_model: f64,
        strength_clip: f64,
    },
    LoraLoaderModelOnly {
        model: Link,
        lora_name: String,
        strength_model: f64,
    },
    ModelSamplingSd3 {
        model: Link,
        shift: f64,
    },
    TextEncode {
        clip: Link,
        text: String,
    },
    EmptyLatentImage {
        width: u32,
        height: u32,
        batch_size: u32,
    },
    EmptyLatentVideo {
        width: u32,
        height: u32,
        length: u32,
        batch_size: u32,
    },
    Sampler(SamplerNode),
    AdvancedSampler(AdvancedSamplerNode),
    VaeDecode {
        samples: Link,
        vae: Link,
    },
    SaveImage {
        images: Link,
        filename_prefix: String,
    },
    SaveAnimatedWebp {
        images: Link,
        filename_prefix: String,
        fps: f64,
        lossless: bool,
        quality: u32,
    },
    SaveAnimatedPng {
        images: Link,
        filename_prefix: String,
        fps: f64,
        compress_level: u32,
    },
    VideoCombine {
        images: Link,
        filename_prefix: String,
        frame_rate: f64,
        format: String,
        loop_count: u32,
        crf: u32,
    },
}

fn enable_flag(on: bool) -> &'static str {
    if on {
        "enable"
    } else {
        "disable"
    }
}

impl NodeKind {
    pub fn class_type(&self) -> &'static str {
        match self {
            NodeKind::CheckpointLoader { .. } => CHECKPOINT_LOADER_CLASS,
            NodeKind::UnetLoader { .. } => UNET_LOADER_CLASS,
            NodeKind::ClipLoader { .. } => CLIP_LOADER_CLASS,
            NodeKind::DualClipLoader { .. } => DUAL_CLIP_LOADER_CLASS,
            NodeKind::VaeLoader { .. } => VAE_LOADER_CLASS,
            NodeKind::LoraLoader { .. } => LORA_LOADER_CLASS,
            NodeKind::LoraLoaderModelOnly { .. } => LORA_MODEL_ONLY_CLASS,
            NodeKind::ModelSamplingSd3 { .. } => MODEL_SAMPLING_SD3_CLASS,
            NodeKind::TextEncode { .. } => CLIP_TEXT_ENCODE_CLASS,
            NodeKind::EmptyLatentImage { .. } => EMPTY_LATENT_IMAGE_CLASS,
            NodeKind::EmptyLatentVideo { .. } => EMPTY_LATENT_VIDEO_CLASS,
            NodeKind::Sampler(_) => KSAMPLER_CLASS,
            NodeKind::AdvancedSampler(_) => KSAMPLER_ADVANCED_CLASS,
            NodeKind::VaeDecode { .. } => VAE_DECODE_CLASS,
            NodeKind::SaveImage { .. } => SAVE_IMAGE_CLASS,
            NodeKind::SaveAnimatedWebp { .. } => SAVE_ANIMATED_WEBP_CLASS,
            NodeKind::SaveAnimatedPng { .. } => SAVE_ANIMATED_PNG_CLASS,
            NodeKind::VideoCombine { .. } => VIDEO_COMBINE_CLASS,
        }
    }

    /// Lower to the wire representation, using ComfyUI's input names.
    pub fn into_graph_node(self) -> GraphNode {
        let node = GraphNode::new(self.class_type());
        match self {
            NodeKind::CheckpointLoader { ckpt_name } => node.literal("ckpt_name", ckpt_name),
            NodeKind::UnetLoader {
                unet_name,
                weight_dtype,
            } => node
                .literal("unet_name", unet_name)
                .literal("weight_dtype", weight_dtype),
            NodeKind::ClipLoader {
                clip_name,
                clip_type,
            } => node
                .literal("clip_name", clip_name)
                .literal("type", clip_type),
            NodeKind::DualClipLoader {
                clip_name1,
                clip_name2,
                clip_type,
            } => node
                .literal("clip_name1", clip_name1)
                .literal("clip_name2", clip_name2)
                .literal("type", clip_type),
            NodeKind::VaeLoader { vae_name } => node.literal("vae_name", vae_name),
            NodeKind::LoraLoader {
                model,
                clip,
                lora_name,
                strength_model,
                strength_clip,
            } => node
                .input("model", model)
                .input("clip", clip)
                .literal("lora_name", lora_name)
                .literal("strength_model", strength_model)
                .literal("strength_clip", strength_clip),
            NodeKind::LoraLoaderModelOnly {
                model,
                lora_name,
                strength_model,
            } => node
                .input("model", model)
                .literal("lora_name", lora_name)
                .literal("strength_model", strength_model),
            NodeKind::ModelSamplingSd3 { model, shift } => {
                node.input("model", model).literal("shift", shift)
            }
            NodeKind::TextEncode { clip, text } => node.literal("text", text).input("clip", clip),
            NodeKind::EmptyLatentImage {
                width,
                height,
                batch_size,
            } => node
                .literal("width", width)
                .literal("height", height)
                .literal("batch_size", batch_size),
            NodeKind::EmptyLatentVideo {
                width,
                height,
                length,
                batch_size,
            } => node
                .literal("width", width)
                .literal("height", height)
                .literal("length", length)
                .literal("batch_size", batch_size),
            NodeKind::Sampler(s) => node
                .input("model", s.model)
                .literal("seed", s.seed)
                .literal("steps", s.steps)
                .literal("cfg", s.cfg)
                .literal("sampler_name", s.sampler_name)
                .literal("scheduler", s.scheduler)
                .input("positive", s.positive)
                .input("negative", s.negative)
                .input("latent_image", s.latent_image)
                .literal("denoise", s.denoise),
            NodeKind::AdvancedSampler(s) => node
                .input("model", s.model)
                .literal("add_noise", enable_flag(s.add_noise))
                .literal("noise_seed", s.noise_seed)
                .literal("steps", s.steps)
                .literal("cfg", s.cfg)
                .literal("sampler_name", s.sampler_name)
                .literal("scheduler", s.scheduler)
                .input("positive", s.positive)
                .input("negative", s.negative)
                .input("latent_image", s.latent_image)
                .literal("start_at_step", s.start_at_step)
                .literal("end_at_step", s.end_at_step)
                .literal(
                    "return_with_leftover_noise",
                    enable_flag(s.return_with_leftover_noise),
                ),
            NodeKind::VaeDecode { samples, vae } => {
                node.input("samples", samples).input("vae", vae)
            }
            NodeKind::SaveImage {
                images,
                filename_prefix,
            } => node
                .input("images", images)
                .literal("filename_prefix", filename_prefix),
            NodeKind::SaveAnimatedWebp {
                images,
                filename_prefix,
                fps,
                lossless,
                quality,
            } => node
                .input("images", images)
                .literal("filename_prefix", filename_prefix)
                .literal("fps", fps)
                .literal("lossless", lossless)
                .literal("quality", quality)
                .literal("method", "default"),
            NodeKind::SaveAnimatedPng {
                images,
                filename_prefix,
                fps,
                compress_level,
            } => node
                .input("images", images)
                .literal("filename_prefix", filename_prefix)
                .literal("fps", fps)
                .literal("compress_level", compress_level),
            NodeKind::VideoCombine {
                images,
                filename_prefix,
                frame_rate,
                format,
                loop_count,
                crf,
            } => node
                .input("images", images)
                .literal("frame_rate", frame_rate)
                .literal("loop_count", loop_count)
                .literal("filename_prefix", filename_prefix)
                .literal("format", format)
                .literal("pix_fmt", "yuv420p")
                .literal("crf", crf)
                .literal("pingpong", false)
                .literal("save_output", true),
        }
    }
}
