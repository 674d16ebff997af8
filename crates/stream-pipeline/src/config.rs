use std::path::{Path, PathBuf};

use comfyui_workflow::WorkflowParams;
use serde::{de, Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::{
    lora::{default_lora_dirs, LoraCatalog, LoraPreset, LoraResolver, WORKFLOW_PRESET_ID},
    params::InputParams,
    timesteps::{SamplingRequest, TimestepStrategy, DEFAULT_TOTAL_STEPS, DEFAULT_TURBO_STEPS},
    PipelineError,
};

/// Model used when the configured one cannot be found.
pub const DEFAULT_MODEL: &str = "stabilityai/sd-turbo";

/// LoRA loaded at startup unless configured otherwise.
pub const DEFAULT_LORA: &str = "1.5\\充气花朵_v1.0.safetensors";

/// Directories searched for checkpoints, relative to the working directory.
pub fn default_model_dirs() -> Vec<PathBuf> {
    ["models/Stable-diffusion", "../../models/Stable-diffusion"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Acceleration {
    None,
    #[default]
    Xformers,
    Sfast,
    Tensorrt,
}

/// How classifier-free guidance is computed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CfgType {
    None,
    Full,
    /// Guidance against the model's own previous prediction.
    #[serde(rename = "self")]
    SelfNegative,
    Initialize,
}

impl CfgType {
    pub fn select(turbo: bool, cfg_scale: f32) -> Self {
        if !turbo && cfg_scale > 1.0 {
            CfgType::SelfNegative
        } else {
            CfgType::None
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Img2Img,
    Txt2Img,
}

/// Pipeline configuration, usually loaded from TOML files and the environment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Checkpoint path or hub id.
    pub model_path: String,
    /// LoRA loaded at startup, registered as the `workflow` preset. Empty disables it.
    pub lora_path: Option<String>,
    pub lora_strength_model: f32,
    /// Accepted for compatibility with ComfyUI workflows; has no effect.
    pub lora_strength_clip: f32,
    pub acceleration: Acceleration,
    pub engine_dir: PathBuf,
    /// Use the tiny autoencoder for faster decoding.
    #[serde(deserialize_with = "deserialize_flag")]
    pub use_taesd: bool,
    #[serde(deserialize_with = "deserialize_flag")]
    pub safety_checker: bool,
    /// Selects the fixed timestep table for turbo models.
    pub turbo_steps: u32,
    pub model_dirs: Vec<PathBuf>,
    pub lora_dirs: Vec<PathBuf>,
    /// Extra LoRA presets.
    pub lora_presets: Vec<LoraPreset>,
    /// Initial request values.
    pub defaults: InputParams,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_path: DEFAULT_MODEL.to_string(),
            lora_path: Some(DEFAULT_LORA.to_string()),
            lora_strength_model: 0.8,
            lora_strength_clip: 1.0,
            acceleration: Acceleration::default(),
            engine_dir: PathBuf::from("engines"),
            use_taesd: true,
            safety_checker: false,
            turbo_steps: DEFAULT_TURBO_STEPS,
            model_dirs: default_model_dirs(),
            lora_dirs: default_lora_dirs(),
            lora_presets: vec![],
            defaults: InputParams::default(),
        }
    }
}

/// Accepts booleans as well as strings such as `"True"` or `"0"` from the environment.
fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => Ok(value),
        Flag::Int(value) => Ok(value != 0),
        Flag::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" | "" => Ok(false),
            other => Err(de::Error::custom(format!("invalid boolean: {other}"))),
        },
    }
}

impl Settings {
    /// The startup LoRA, if one is configured.
    pub fn startup_lora(&self) -> Option<&str> {
        self.lora_path.as_deref().filter(|path| !path.trim().is_empty())
    }

    /// Builds the preset catalog: `none`, the startup LoRA, then the configured presets.
    pub fn lora_catalog(&self) -> LoraCatalog {
        let startup = self
            .startup_lora()
            .map(|path| LoraPreset::workflow(path, self.lora_strength_model));
        LoraCatalog::with_presets(startup.into_iter().chain(self.lora_presets.iter().cloned()))
    }

    pub fn lora_resolver(&self) -> LoraResolver {
        LoraResolver::new(self.lora_dirs.clone())
    }

    /// Takes the checkpoint, LoRA and sampler values from a ComfyUI workflow.
    pub fn apply_workflow(&mut self, workflow: &WorkflowParams) {
        if let Some(checkpoint) = &workflow.checkpoint {
            self.model_path = checkpoint.clone();
        }
        if let Some(lora) = &workflow.lora {
            self.lora_path = Some(lora.name.clone());
            self.lora_strength_model = lora.strength_model;
            if let Some(strength_clip) = lora.strength_clip {
                self.lora_strength_clip = strength_clip;
            }
        }
        self.defaults.apply_workflow(workflow);
    }
}

/// Where the base model is loaded from.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum ModelSource {
    Local(PathBuf),
    Hub(String),
    /// The requested model was not found; the default model is used instead.
    Fallback { requested: String },
}

impl ModelSource {
    /// Locates `model_path` on disk, searching `search_dirs` for relative paths.
    ///
    /// Anything not found that looks like a hub id or URL is passed through as a hub id.
    pub fn resolve(model_path: &str, search_dirs: &[PathBuf]) -> Self {
        let path = Path::new(model_path);
        if path.exists() {
            return ModelSource::Local(path.to_path_buf());
        }
        if path.is_relative() {
            if let Some(found) = search_dirs
                .iter()
                .map(|dir| dir.join(path))
                .find(|candidate| candidate.exists())
            {
                debug!(model = %found.display(), "Found model");
                return ModelSource::Local(found);
            }
        }
        if model_path.contains(['/', '\\']) || model_path.starts_with("http") {
            return ModelSource::Hub(model_path.to_string());
        }
        warn!(
            requested = model_path,
            fallback = DEFAULT_MODEL,
            "Model not found, using default model"
        );
        ModelSource::Fallback {
            requested: model_path.to_string(),
        }
    }

    /// The path or id handed to the engine.
    pub fn id_or_path(&self) -> String {
        match self {
            ModelSource::Local(path) => path.display().to_string(),
            ModelSource::Hub(id) => id.clone(),
            ModelSource::Fallback { .. } => DEFAULT_MODEL.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StartupLora {
    pub source: String,
    pub strength: f32,
}

/// Everything an engine is built from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub model_id_or_path: String,
    /// Attached by the pipeline once the engine is built.
    pub lora: Option<StartupLora>,
    pub t_index_list: Vec<u32>,
    pub frame_buffer_size: u32,
    pub width: u32,
    pub height: u32,
    pub warmup: u32,
    pub acceleration: Acceleration,
    pub mode: Mode,
    pub use_denoising_batch: bool,
    pub cfg_type: CfgType,
    pub seed: u64,
    pub use_lcm_lora: bool,
    pub use_tiny_vae: bool,
    pub use_safety_checker: bool,
    pub engine_dir: PathBuf,
    pub num_inference_steps: u32,
    pub delta: f32,
}

/// The engine configuration for a set of settings, with what was decided along the way.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PipelinePlan {
    pub model: ModelSource,
    pub strategy: TimestepStrategy,
    pub engine: EngineConfig,
    /// Non-fatal problems found while resolving the model and LoRA.
    pub warnings: Vec<String>,
}

impl PipelinePlan {
    /// Resolves the model, timesteps and startup LoRA for `params`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidParameter` if `params` has a non-finite denoise.
    pub fn new(settings: &Settings, params: &InputParams) -> Result<Self, PipelineError> {
        let mut warnings = vec![];

        let model = ModelSource::resolve(&settings.model_path, &settings.model_dirs);
        if let ModelSource::Fallback { requested } = &model {
            warnings.push(format!(
                "Model {requested} not found, using {DEFAULT_MODEL}"
            ));
        }
        let model_id_or_path = model.id_or_path();

        let sampling = SamplingRequest::new(params.steps, params.denoise)?;
        let strategy = TimestepStrategy::for_model(&model_id_or_path, sampling, settings.turbo_steps);
        let turbo = strategy.is_turbo();

        let lora = match settings.lora_catalog().get(&params.lora) {
            Some(LoraPreset {
                source_ref: Some(source_ref),
                strength_model,
                ..
            }) => match settings.lora_resolver().resolve(source_ref) {
                Ok(source) => Some(StartupLora {
                    source: source.engine_ref(),
                    strength: *strength_model,
                }),
                Err(err) => {
                    warn!(preset = %params.lora, "Skipping startup LoRA: {}", err);
                    warnings.push(err.to_string());
                    None
                }
            },
            Some(_) => None,
            // No startup LoRA configured, so the workflow preset means no LoRA.
            None if params.lora == WORKFLOW_PRESET_ID => {
                debug!("No startup LoRA configured");
                None
            }
            None => {
                warn!(preset = %params.lora, "Startup LoRA preset is not in the catalog");
                warnings.push(PipelineError::UnknownPreset(params.lora.clone()).to_string());
                None
            }
        };
        if lora.is_some() && settings.lora_strength_clip != settings.lora_strength_model {
            debug!(
                strength_clip = settings.lora_strength_clip,
                "LoRA CLIP strength is not applied"
            );
        }

        let engine = EngineConfig {
            model_id_or_path,
            lora,
            t_index_list: strategy.t_index_list(),
            frame_buffer_size: 1,
            width: params.width,
            height: params.height,
            warmup: 10,
            acceleration: settings.acceleration,
            mode: Mode::Img2Img,
            use_denoising_batch: true,
            cfg_type: CfgType::select(turbo, params.cfg_scale),
            seed: params.seed,
            use_lcm_lora: !turbo,
            use_tiny_vae: settings.use_taesd,
            use_safety_checker: settings.safety_checker,
            engine_dir: settings.engine_dir.clone(),
            num_inference_steps: DEFAULT_TOTAL_STEPS,
            delta: 1.0,
        };

        Ok(Self {
            model,
            strategy,
            engine,
            warnings,
        })
    }
}
