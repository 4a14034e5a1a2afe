//! Workflow graph builder.
//!
//! Turns a [`GenerationRequest`] into a [`Workflow`] by branching on the
//! model architecture:
//!
//! - **Checkpoint**: one `CheckpointLoaderSimple` yields MODEL, CLIP and VAE.
//! - **Split**: `UNETLoader` + `CLIPLoader`/`DualCLIPLoader` + `VAELoader`,
//!   with encoder and VAE names taken from the model family convention.
//! - **Dual-stage**: two `UNETLoader`s (high/low noise) sampled in sequence
//!   by two `KSamplerAdvanced` nodes splitting the step range.
//!
//! LoRAs are chained in request order: each `LoraLoader` consumes the
//! previous stage's MODEL/CLIP and becomes the new current stage.
//!
//! Node ids are assigned sequentially and every link points at an
//! already-inserted node, so the result is acyclic by construction.

use crate::error::BuildError;
use crate::family::{dual_stage_names, ModelFamily};
use crate::graph::{Link, Workflow};
use crate::nodes::{
    AdvancedSamplerNode, NodeKind, SamplerNode, CHECKPOINT_VAE_SLOT, CLIP_SLOT, MODEL_SLOT,
};
use crate::request::{
    resolve_seed, GenerationRequest, MediaKind, ModelArchitecture, VideoContainer,
    DEFAULT_VIDEO_SHIFT,
};
use crate::template;

/// Fresh generations always run at full strength.
pub const FULL_DENOISE: f64 = 1.0;

/// `end_at_step` value meaning "run to the last step".
pub const END_AT_LAST_STEP: u32 = 10_000;

/// Default `UNETLoader` weight dtype.
const DEFAULT_WEIGHT_DTYPE: &str = "default";

/// `VHS_VideoCombine` constant rate factor for mp4 output.
const MP4_CRF: u32 = 19;

/// `SaveAnimatedPNG` compression level.
const APNG_COMPRESS_LEVEL: u32 = 4;

/// A built graph plus the seed that was baked into it.
#[derive(Debug, Clone)]
pub struct BuiltWorkflow {
    pub workflow: Workflow,
    /// Resolved seed; never the random marker.
    pub seed: u64,
}

/// Build the graph for a request, resolving a random seed if needed.
///
/// Requests carrying a `custom_workflow` are filled through the
/// template filler instead of the builder; their seed may also come from
/// a seed-like `extra_params` entry. Either way the returned seed is the
/// one in the graph.
pub fn prepare(request: &GenerationRequest) -> Result<BuiltWorkflow, BuildError> {
    request.validate()?;

    let (workflow, seed) = match &request.custom_workflow {
        Some(template_text) => {
            let seed = resolve_seed(request.template_seed());
            let params = request.template_params(seed);
            (template::fill(template_text, &params)?, seed)
        }
        None => {
            let seed = resolve_seed(request.seed);
            (build_with_seed(request, seed)?, seed)
        }
    };

    Ok(BuiltWorkflow { workflow, seed })
}

/// Build the graph for a request with an already-resolved seed.
///
/// Deterministic: the same request and seed always produce the same graph.
pub fn build_with_seed(request: &GenerationRequest, seed: u64) -> Result<Workflow, BuildError> {
    request.validate()?;
    let mut graph = GraphBuilder::default();

    match request.resolved_architecture() {
        ModelArchitecture::Checkpoint => {
            let stage = graph.load_checkpoint(&request.model);
            graph.single_pass(request, stage, seed, false);
        }
        ModelArchitecture::Split => {
            let family = request.resolved_family();
            let stage = graph.load_split(request, &request.model, family)?;
            graph.single_pass(request, stage, seed, true);
        }
        ModelArchitecture::DualStage => {
            graph.dual_stage(request, seed)?;
        }
    }

    Ok(graph.finish())
}

// ---------------------------------------------------------------------------
// Graph assembly
// ---------------------------------------------------------------------------

/// The current MODEL / CLIP / VAE references while assembling.
#[derive(Debug, Clone)]
struct Stage {
    model: Link,
    clip: Link,
    vae: Link,
}

#[derive(Default)]
struct GraphBuilder {
    workflow: Workflow,
    next_id: u32,
}

impl GraphBuilder {
    /// Insert a node and return its id.
    fn add(&mut self, kind: NodeKind) -> String {
        self.next_id += 1;
        let id = self.next_id.to_string();
        self.workflow.insert(id.clone(), kind.into_graph_node());
        id
    }

    fn finish(self) -> Workflow {
        self.workflow
    }

    fn load_checkpoint(&mut self, ckpt_name: &str) -> Stage {
        let loader = self.add(NodeKind::CheckpointLoader {
            ckpt_name: ckpt_name.to_string(),
        });
        Stage {
            model: Link::new(&loader, MODEL_SLOT),
            clip: Link::new(&loader, CLIP_SLOT),
            vae: Link::new(loader, CHECKPOINT_VAE_SLOT),
        }
    }

    fn load_unet(&mut self, unet_name: &str) -> Link {
        let id = self.add(NodeKind::UnetLoader {
            unet_name: unet_name.to_string(),
            weight_dtype: DEFAULT_WEIGHT_DTYPE.to_string(),
        });
        Link::new(id, 0)
    }

    /// Load the text encoder and VAE for a split family.
    fn load_encoders(
        &mut self,
        request: &GenerationRequest,
        family: ModelFamily,
    ) -> Result<(Link, Link), BuildError> {
        let convention = family.text_encoder();
        let encoders: Vec<String> = if request.text_encoders.is_empty() {
            let convention = convention.ok_or_else(|| BuildError::UnknownTextEncoder {
                family: family.as_str().to_string(),
            })?;
            convention.files.iter().map(|f| f.to_string()).collect()
        } else {
            request.text_encoders.clone()
        };
        let clip_type = family.clip_type_or_default().to_string();

        let clip = match encoders.as_slice() {
            [single] => self.add(NodeKind::ClipLoader {
                clip_name: single.clone(),
                clip_type,
            }),
            [first, second, ..] => self.add(NodeKind::DualClipLoader {
                clip_name1: first.clone(),
                clip_name2: second.clone(),
                clip_type,
            }),
            [] => {
                return Err(BuildError::UnknownTextEncoder {
                    family: family.as_str().to_string(),
                })
            }
        };

        let vae_name = match &request.vae {
            Some(vae) => vae.clone(),
            None => family
                .default_vae()
                .ok_or_else(|| BuildError::UnknownVae {
                    family: family.as_str().to_string(),
                })?
                .to_string(),
        };
        let vae = self.add(NodeKind::VaeLoader { vae_name });

        Ok((Link::new(clip, 0), Link::new(vae, 0)))
    }

    fn load_split(
        &mut self,
        request: &GenerationRequest,
        unet_name: &str,
        family: ModelFamily,
    ) -> Result<Stage, BuildError> {
        let model = self.load_unet(unet_name);
        let (clip, vae) = self.load_encoders(request, family)?;
        Ok(Stage { model, clip, vae })
    }

    /// Chain one `LoraLoader` per LoRA, in order.
    fn apply_loras(&mut self, request: &GenerationRequest, mut stage: Stage) -> Stage {
        for lora in &request.loras {
            let id = self.add(NodeKind::LoraLoader {
                model: stage.model.clone(),
                clip: stage.clip.clone(),
                lora_name: lora.name.clone(),
                strength_model: lora.strength,
                strength_clip: lora.clip_strength(),
            });
            stage.model = Link::new(&id, MODEL_SLOT);
            stage.clip = Link::new(id, CLIP_SLOT);
        }
        stage
    }

    fn encode_prompts(&mut self, request: &GenerationRequest, clip: &Link) -> (Link, Link) {
        let positive = self.add(NodeKind::TextEncode {
            clip: clip.clone(),
            text: request.prompt.clone(),
        });
        let negative = self.add(NodeKind::TextEncode {
            clip: clip.clone(),
            text: request.negative_prompt.clone(),
        });
        (Link::new(positive, 0), Link::new(negative, 0))
    }

    /// Empty latent sized for the request.
    ///
    /// Video on a split video family gets a temporal latent; video on a
    /// checkpoint model batches one latent per frame.
    fn empty_latent(&mut self, request: &GenerationRequest, temporal: bool) -> Link {
        let frames = request.media.video().map(|v| v.frames);
        let id = match (frames, temporal) {
            (Some(length), true) => self.add(NodeKind::EmptyLatentVideo {
                width: request.width,
                height: request.height,
                length,
                batch_size: 1,
            }),
            (Some(frames), false) => self.add(NodeKind::EmptyLatentImage {
                width: request.width,
                height: request.height,
                batch_size: frames,
            }),
            (None, _) => self.add(NodeKind::EmptyLatentImage {
                width: request.width,
                height: request.height,
                batch_size: 1,
            }),
        };
        Link::new(id, 0)
    }

    /// Decode the latent and append the single terminal save node.
    fn decode_and_save(&mut self, request: &GenerationRequest, samples: Link, vae: Link) {
        let decoded = Link::new(self.add(NodeKind::VaeDecode { samples, vae }), 0);
        let filename_prefix = request.filename_prefix().to_string();

        let save = match &request.media {
            MediaKind::Image => NodeKind::SaveImage {
                images: decoded,
                filename_prefix,
            },
            MediaKind::Video(video) => match video.container {
                VideoContainer::Webp => NodeKind::SaveAnimatedWebp {
                    images: decoded,
                    filename_prefix,
                    fps: video.fps,
                    lossless: video.lossless,
                    quality: video.quality,
                },
                VideoContainer::Png => NodeKind::SaveAnimatedPng {
                    images: decoded,
                    filename_prefix,
                    fps: video.fps,
                    compress_level: APNG_COMPRESS_LEVEL,
                },
                VideoContainer::Mp4 => NodeKind::VideoCombine {
                    images: decoded,
                    filename_prefix,
                    frame_rate: video.fps,
                    format: "video/h264-mp4".to_string(),
                    loop_count: 0,
                    crf: MP4_CRF,
                },
                VideoContainer::Gif => NodeKind::VideoCombine {
                    images: decoded,
                    filename_prefix,
                    frame_rate: video.fps,
                    format: "image/gif".to_string(),
                    loop_count: 0,
                    crf: MP4_CRF,
                },
            },
        };
        self.add(save);
    }

    /// LoRAs, prompts, one `KSampler`, decode, save.
    fn single_pass(&mut self, request: &GenerationRequest, stage: Stage, seed: u64, split: bool) {
        let stage = self.apply_loras(request, stage);
        let (positive, negative) = self.encode_prompts(request, &stage.clip);
        let temporal = split && request.resolved_family().is_video();
        let latent_image = self.empty_latent(request, temporal);

        let sampler = self.add(NodeKind::Sampler(SamplerNode {
            model: stage.model,
            positive,
            negative,
            latent_image,
            seed,
            steps: request.steps,
            cfg: request.cfg,
            sampler_name: request.sampler.clone(),
            scheduler: request.scheduler.clone(),
            denoise: FULL_DENOISE,
        }));

        self.decode_and_save(request, Link::new(sampler, 0), stage.vae);
    }

    /// High-noise then low-noise sampling over a shared latent.
    fn dual_stage(&mut self, request: &GenerationRequest, seed: u64) -> Result<(), BuildError> {
        let (high_name, low_name) = dual_stage_names(
            &request.model,
            request.high_noise_model.as_deref(),
            request.low_noise_model.as_deref(),
        );
        let family = match request.resolved_family() {
            ModelFamily::Unknown => ModelFamily::Wan,
            family => family,
        };

        let high = self.load_unet(&high_name);
        let mut low = self.load_unet(&low_name);
        let (clip, vae) = self.load_encoders(request, family)?;

        // The LoRA chain runs on the high-noise model together with CLIP;
        // paired low-noise files patch the low-noise model only.
        let stage = self.apply_loras(
            request,
            Stage {
                model: high,
                clip,
                vae,
            },
        );
        for lora in &request.loras {
            if let Some(low_noise_name) = &lora.low_noise_name {
                let id = self.add(NodeKind::LoraLoaderModelOnly {
                    model: low.clone(),
                    lora_name: low_noise_name.clone(),
                    strength_model: lora.strength,
                });
                low = Link::new(id, 0);
            }
        }

        let shift = request.shift.unwrap_or(DEFAULT_VIDEO_SHIFT);
        let high_model = Link::new(
            self.add(NodeKind::ModelSamplingSd3 {
                model: stage.model.clone(),
                shift,
            }),
            0,
        );
        let low_model = Link::new(self.add(NodeKind::ModelSamplingSd3 { model: low, shift }), 0);

        let (positive, negative) = self.encode_prompts(request, &stage.clip);
        let latent_image = self.empty_latent(request, true);

        // Split point: the high-noise stage takes the first half (rounded up).
        let boundary = request.steps.div_ceil(2);
        let high_pass = self.add(NodeKind::AdvancedSampler(AdvancedSamplerNode {
            model: high_model,
            positive: positive.clone(),
            negative: negative.clone(),
            latent_image,
            add_noise: true,
            noise_seed: seed,
            steps: request.steps,
            cfg: request.cfg,
            sampler_name: request.sampler.clone(),
            scheduler: request.scheduler.clone(),
            start_at_step: 0,
            end_at_step: boundary,
            return_with_leftover_noise: true,
        }));
        let low_pass = self.add(NodeKind::AdvancedSampler(AdvancedSamplerNode {
            model: low_model,
            positive,
            negative,
            latent_image: Link::new(high_pass, 0),
            add_noise: false,
            noise_seed: seed,
            steps: request.steps,
            cfg: request.cfg,
            sampler_name: request.sampler.clone(),
            scheduler: request.scheduler.clone(),
            start_at_step: boundary,
            end_at_step: END_AT_LAST_STEP,
            return_with_leftover_noise: false,
        }));

        self.decode_and_save(request, Link::new(low_pass, 0), stage.vae);
        Ok(())
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
    use crate::nodes::*;
    use crate::request::{LoraSpec, VideoOptions, RANDOM_SEED};

    fn checkpoint_request() -> GenerationRequest {
        GenerationRequest::new("a cat", "ckpt.safetensors")
    }

    fn video(container: VideoContainer) -> MediaKind {
        MediaKind::Video(VideoOptions {
            frames: 33,
            fps: 16.0,
            container,
            lossless: false,
            quality: 90,
        })
    }

    /// Every link targets an existing node and there is one save node.
    fn assert_well_formed(workflow: &Workflow) {
        workflow.validate().expect("graph should validate");
        assert_eq!(workflow.output_count(), 1);
        let output = workflow.output_node().expect("output node");
        assert!(workflow.get(output).is_some());
    }

    // -- Scenario A: single checkpoint --

    #[test]
    fn checkpoint_graph_has_minimal_node_set() {
        let built = prepare(&checkpoint_request()).unwrap();
        let wf = &built.workflow;

        assert_well_formed(wf);
        assert_eq!(wf.count_class(CHECKPOINT_LOADER_CLASS), 1);
        assert_eq!(wf.count_class(KSAMPLER_CLASS), 1);
        assert_eq!(wf.count_class(VAE_DECODE_CLASS), 1);
        assert_eq!(wf.count_class(SAVE_IMAGE_CLASS), 1);
        assert_eq!(wf.count_class(LORA_LOADER_CLASS), 0);
    }

    #[test]
    fn checkpoint_outputs_feed_encoder_sampler_and_decoder() {
        let wf = build_with_seed(&checkpoint_request(), 5).unwrap();
        let loader = wf.nodes_of_class(CHECKPOINT_LOADER_CLASS)[0];
        let sampler = wf.get(wf.nodes_of_class(KSAMPLER_CLASS)[0]).unwrap();
        let decode = wf.get(wf.nodes_of_class(VAE_DECODE_CLASS)[0]).unwrap();

        assert_eq!(sampler.link("model"), Some(&Link::new(loader, MODEL_SLOT)));
        assert_eq!(decode.link("vae"), Some(&Link::new(loader, CHECKPOINT_VAE_SLOT)));
        for id in wf.nodes_of_class(CLIP_TEXT_ENCODE_CLASS) {
            let encode = wf.get(id).unwrap();
            assert_eq!(encode.link("clip"), Some(&Link::new(loader, CLIP_SLOT)));
        }
        assert_eq!(sampler.value("denoise"), Some(&json!(1.0)));
    }

    // -- Seeds --

    #[test]
    fn explicit_seed_is_baked_in() {
        let request = GenerationRequest {
            seed: 987_654,
            ..checkpoint_request()
        };
        let built = prepare(&request).unwrap();
        assert_eq!(built.seed, 987_654);
        let sampler = built
            .workflow
            .get(built.workflow.nodes_of_class(KSAMPLER_CLASS)[0])
            .unwrap();
        assert_eq!(sampler.value("seed"), Some(&json!(987_654)));
    }

    #[test]
    fn random_seed_differs_between_builds() {
        let request = GenerationRequest {
            seed: RANDOM_SEED,
            ..checkpoint_request()
        };
        // Two 32-bit draws colliding repeatedly is practically impossible.
        let seeds: std::collections::HashSet<u64> =
            (0..4).map(|_| prepare(&request).unwrap().seed).collect();
        assert!(seeds.len() > 1);
    }

    #[test]
    fn same_seed_builds_identical_graphs() {
        let a = build_with_seed(&checkpoint_request(), 11).unwrap();
        let b = build_with_seed(&checkpoint_request(), 11).unwrap();
        assert_eq!(a.to_value(), b.to_value());
    }

    // -- LoRA chaining (Scenario B) --

    #[test]
    fn loras_chain_in_request_order() {
        let request = GenerationRequest {
            loras: vec![LoraSpec::new("l1", 0.8), LoraSpec::new("l2", 0.5)],
            ..checkpoint_request()
        };
        let wf = build_with_seed(&request, 1).unwrap();
        assert_well_formed(&wf);

        let loras = wf.nodes_of_class(LORA_LOADER_CLASS);
        assert_eq!(loras.len(), 2);
        let l1 = wf.get(loras[0]).unwrap();
        let l2 = wf.get(loras[1]).unwrap();
        assert_eq!(l1.value("lora_name"), Some(&json!("l1")));
        assert_eq!(l2.value("lora_name"), Some(&json!("l2")));

        let loader = wf.nodes_of_class(CHECKPOINT_LOADER_CLASS)[0];
        assert_eq!(l1.link("model"), Some(&Link::new(loader, MODEL_SLOT)));
        assert_eq!(l2.link("model"), Some(&Link::new(loras[0], MODEL_SLOT)));
        assert_eq!(l2.link("clip"), Some(&Link::new(loras[0], CLIP_SLOT)));

        // The sampler and encoders consume the last LoRA.
        let sampler = wf.get(wf.nodes_of_class(KSAMPLER_CLASS)[0]).unwrap();
        assert_eq!(sampler.link("model"), Some(&Link::new(loras[1], MODEL_SLOT)));
        for id in wf.nodes_of_class(CLIP_TEXT_ENCODE_CLASS) {
            assert_eq!(
                wf.get(id).unwrap().link("clip"),
                Some(&Link::new(loras[1], CLIP_SLOT))
            );
        }
    }

    #[test]
    fn lora_count_matches_request_for_any_length() {
        for n in 0..6 {
            let request = GenerationRequest {
                loras: (0..n).map(|i| LoraSpec::new(format!("l{i}"), 1.0)).collect(),
                ..checkpoint_request()
            };
            let wf = build_with_seed(&request, 1).unwrap();
            assert_well_formed(&wf);
            let loras = wf.nodes_of_class(LORA_LOADER_CLASS);
            assert_eq!(loras.len(), n);
            for (i, id) in loras.iter().enumerate().skip(1) {
                let node = wf.get(id).unwrap();
                assert_eq!(node.link("model").map(|l| l.node.as_str()), Some(loras[i - 1]));
            }
        }
    }

    // -- Split models --

    #[test]
    fn flux_split_uses_dual_clip_and_family_vae() {
        let request = GenerationRequest::new("a fox", "flux1-dev.safetensors");
        let wf = build_with_seed(&request, 3).unwrap();
        assert_well_formed(&wf);

        assert_eq!(wf.count_class(UNET_LOADER_CLASS), 1);
        let clip = wf.get(wf.nodes_of_class(DUAL_CLIP_LOADER_CLASS)[0]).unwrap();
        assert_eq!(clip.value("type"), Some(&json!("flux")));
        let vae = wf.get(wf.nodes_of_class(VAE_LOADER_CLASS)[0]).unwrap();
        assert_eq!(vae.value("vae_name"), Some(&json!("ae.safetensors")));
        assert_eq!(wf.count_class(CHECKPOINT_LOADER_CLASS), 0);
    }

    #[test]
    fn explicit_encoder_and_vae_override_convention() {
        let request = GenerationRequest {
            text_encoders: vec!["my_t5.safetensors".into()],
            vae: Some("my_vae.safetensors".into()),
            ..GenerationRequest::new("a fox", "qwen_image_fp8.safetensors")
        };
        let wf = build_with_seed(&request, 3).unwrap();
        let clip = wf.get(wf.nodes_of_class(CLIP_LOADER_CLASS)[0]).unwrap();
        assert_eq!(clip.value("clip_name"), Some(&json!("my_t5.safetensors")));
        assert_eq!(clip.value("type"), Some(&json!("qwen_image")));
        let vae = wf.get(wf.nodes_of_class(VAE_LOADER_CLASS)[0]).unwrap();
        assert_eq!(vae.value("vae_name"), Some(&json!("my_vae.safetensors")));
    }

    #[test]
    fn split_unknown_family_without_encoder_is_an_error() {
        let request = GenerationRequest {
            architecture: Some(ModelArchitecture::Split),
            ..GenerationRequest::new("a fox", "mystery.safetensors")
        };
        assert_matches!(
            build_with_seed(&request, 1),
            Err(BuildError::UnknownTextEncoder { .. })
        );
    }

    #[test]
    fn split_video_family_uses_temporal_latent() {
        let request = GenerationRequest {
            media: video(VideoContainer::Webp),
            ..GenerationRequest::new("waves", "hunyuan_video_720p.safetensors")
        };
        let wf = build_with_seed(&request, 3).unwrap();
        assert_well_formed(&wf);
        let latent = wf.get(wf.nodes_of_class(EMPTY_LATENT_VIDEO_CLASS)[0]).unwrap();
        assert_eq!(latent.value("length"), Some(&json!(33)));
        assert_eq!(wf.count_class(SAVE_ANIMATED_WEBP_CLASS), 1);
    }

    // -- Dual-stage --

    fn dual_stage_request() -> GenerationRequest {
        GenerationRequest {
            media: video(VideoContainer::Mp4),
            steps: 20,
            ..GenerationRequest::new("waves", "wan2.2_t2v_high_noise_14B.safetensors")
        }
    }

    #[test]
    fn dual_stage_loads_both_weights() {
        let wf = build_with_seed(&dual_stage_request(), 9).unwrap();
        assert_well_formed(&wf);

        let names: Vec<_> = wf
            .nodes_of_class(UNET_LOADER_CLASS)
            .into_iter()
            .map(|id| wf.get(id).unwrap().value("unet_name").cloned().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                json!("wan2.2_t2v_high_noise_14B.safetensors"),
                json!("wan2.2_t2v_low_noise_14B.safetensors")
            ]
        );
        assert_eq!(wf.count_class(VIDEO_COMBINE_CLASS), 1);
    }

    #[test]
    fn dual_stage_splits_step_range() {
        let wf = build_with_seed(&dual_stage_request(), 9).unwrap();
        let samplers = wf.nodes_of_class(KSAMPLER_ADVANCED_CLASS);
        assert_eq!(samplers.len(), 2);

        let high = wf.get(samplers[0]).unwrap();
        let low = wf.get(samplers[1]).unwrap();
        assert_eq!(high.value("end_at_step"), Some(&json!(10)));
        assert_eq!(high.value("return_with_leftover_noise"), Some(&json!("enable")));
        assert_eq!(low.value("start_at_step"), Some(&json!(10)));
        assert_eq!(low.value("add_noise"), Some(&json!("disable")));
        assert_eq!(low.link("latent_image"), Some(&Link::new(samplers[0], 0)));
    }

    #[test]
    fn dual_stage_explicit_names_win() {
        let request = GenerationRequest {
            high_noise_model: Some("h.safetensors".into()),
            low_noise_model: Some("l.safetensors".into()),
            ..dual_stage_request()
        };
        let wf = build_with_seed(&request, 9).unwrap();
        let first = wf.get(wf.nodes_of_class(UNET_LOADER_CLASS)[0]).unwrap();
        assert_eq!(first.value("unet_name"), Some(&json!("h.safetensors")));
    }

    #[test]
    fn dual_stage_paired_lora_patches_low_model() {
        let mut lora = LoraSpec::new("motion_high.safetensors", 1.0);
        lora.low_noise_name = Some("motion_low.safetensors".into());
        let request = GenerationRequest {
            loras: vec![lora],
            ..dual_stage_request()
        };
        let wf = build_with_seed(&request, 9).unwrap();
        assert_well_formed(&wf);
        assert_eq!(wf.count_class(LORA_LOADER_CLASS), 1);
        assert_eq!(wf.count_class(LORA_MODEL_ONLY_CLASS), 1);

        let low_unet = wf.nodes_of_class(UNET_LOADER_CLASS)[1];
        let model_only = wf.get(wf.nodes_of_class(LORA_MODEL_ONLY_CLASS)[0]).unwrap();
        assert_eq!(model_only.link("model"), Some(&Link::new(low_unet, 0)));
    }

    #[test]
    fn video_on_checkpoint_falls_back_to_single_pass() {
        let request = GenerationRequest {
            media: video(VideoContainer::Webp),
            ..checkpoint_request()
        };
        let wf = build_with_seed(&request, 2).unwrap();
        assert_well_formed(&wf);
        assert_eq!(wf.count_class(KSAMPLER_CLASS), 1);
        assert_eq!(wf.count_class(KSAMPLER_ADVANCED_CLASS), 0);
        let latent = wf.get(wf.nodes_of_class(EMPTY_LATENT_IMAGE_CLASS)[0]).unwrap();
        assert_eq!(latent.value("batch_size"), Some(&json!(33)));
    }

    // -- Save node selection --

    #[test]
    fn container_selects_save_node() {
        for (container, class) in [
            (VideoContainer::Webp, SAVE_ANIMATED_WEBP_CLASS),
            (VideoContainer::Png, SAVE_ANIMATED_PNG_CLASS),
            (VideoContainer::Mp4, VIDEO_COMBINE_CLASS),
            (VideoContainer::Gif, VIDEO_COMBINE_CLASS),
        ] {
            let request = GenerationRequest {
                media: video(container),
                ..checkpoint_request()
            };
            let wf = build_with_seed(&request, 2).unwrap();
            assert_well_formed(&wf);
            let output = wf.get(wf.output_node().unwrap()).unwrap();
            assert_eq!(output.class_type, class);
        }
    }

    // -- Template path --

    #[test]
    fn custom_workflow_bypasses_builder() {
        let template = r#"{
            "1": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "${model}"}},
            "2": {"class_type": "KSampler", "inputs": {"model": ["1", 0], "seed": "${seed}", "steps": "${steps}"}},
            "3": {"class_type": "SaveImage", "inputs": {"images": ["2", 0], "filename_prefix": "t"}}
        }"#;
        let request = GenerationRequest {
            custom_workflow: Some(template.into()),
            seed: 77,
            ..checkpoint_request()
        };
        let built = prepare(&request).unwrap();
        assert_eq!(built.seed, 77);
        let sampler = built.workflow.get("2").unwrap();
        assert_eq!(sampler.value("seed"), Some(&json!(77)));
        assert_eq!(sampler.value("steps"), Some(&json!(20)));
        assert_eq!(
            built.workflow.get("1").unwrap().value("ckpt_name"),
            Some(&json!("ckpt.safetensors"))
        );
    }

    fn seeded_template() -> String {
        r#"{
            "1": {"class_type": "KSampler", "inputs": {"seed": "${seed}", "noise_seed": "${noise_seed:-1}"}},
            "2": {"class_type": "SaveImage", "inputs": {"images": ["1", 0], "filename_prefix": "t"}}
        }"#
        .to_string()
    }

    #[test]
    fn random_seed_in_extras_matches_recorded_seed() {
        let mut request = GenerationRequest {
            custom_workflow: Some(seeded_template()),
            seed: 7,
            ..checkpoint_request()
        };
        request.extra_params.insert("seed".into(), json!(-1));

        let built = prepare(&request).unwrap();
        let sampler = built.workflow.get("1").unwrap();
        assert_eq!(sampler.value("seed"), Some(&json!(built.seed)));
        assert_eq!(sampler.value("noise_seed"), Some(&json!(built.seed)));
    }

    #[test]
    fn explicit_seed_in_extras_is_used_and_returned() {
        let mut request = GenerationRequest {
            custom_workflow: Some(seeded_template()),
            seed: RANDOM_SEED,
            ..checkpoint_request()
        };
        request.extra_params.insert("seed".into(), json!(42));

        let built = prepare(&request).unwrap();
        assert_eq!(built.seed, 42);
        let sampler = built.workflow.get("1").unwrap();
        assert_eq!(sampler.value("seed"), Some(&json!(42)));
        assert_eq!(sampler.value("noise_seed"), Some(&json!(42)));
    }

    #[test]
    fn missing_model_fails_before_building() {
        let request = GenerationRequest::new("a cat", "");
        assert_matches!(prepare(&request), Err(BuildError::MissingModel));
    }
}
