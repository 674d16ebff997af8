use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    config::{EngineConfig, PipelinePlan, Settings},
    engine::{Engine, EngineLoader},
    lora::{InitialLoad, LoraManager, LoraPhase, LoraRuntimeState, SwitchOutcome},
    params::InputParams,
    PipelineError,
};

/// A snapshot of the pipeline for display.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PipelineStatus {
    pub model: String,
    pub t_index_list: Vec<u32>,
    pub lora_phase: LoraPhase,
    pub active_lora: String,
    pub lora: LoraRuntimeState,
    /// Problems encountered while building the engine.
    pub warnings: Vec<String>,
}

struct Built {
    engine: Box<dyn Engine>,
    config: EngineConfig,
    lora: LoraManager,
    warnings: Vec<String>,
}

/// A running engine plus the state needed to reconcile incoming requests with it.
#[derive(Debug)]
pub struct Pipeline {
    engine: Box<dyn Engine>,
    settings: Settings,
    config: EngineConfig,
    lora: LoraManager,
    /// The values the engine was last prepared with.
    applied: InputParams,
    warnings: Vec<String>,
}

impl Pipeline {
    /// Builds an engine for `settings` and prepares it with the default request values.
    pub async fn load(
        loader: &dyn EngineLoader,
        settings: Settings,
    ) -> Result<Self, PipelineError> {
        let params = settings.defaults.clone();
        let built = Self::build(loader, &settings, &params).await?;
        Ok(Self {
            engine: built.engine,
            settings,
            config: built.config,
            lora: built.lora,
            applied: params,
            warnings: built.warnings,
        })
    }

    async fn build(
        loader: &dyn EngineLoader,
        settings: &Settings,
        params: &InputParams,
    ) -> Result<Built, PipelineError> {
        let PipelinePlan {
            model,
            engine: config,
            mut warnings,
            ..
        } = PipelinePlan::new(settings, params)?;
        info!(
            model = %model.id_or_path(),
            t_index_list = ?config.t_index_list,
            "Loading engine"
        );
        let engine = loader.load(&config).await.map_err(PipelineError::Engine)?;

        let mut lora = LoraManager::new(settings.lora_catalog(), settings.lora_resolver());
        if config.lora.is_some() {
            match lora.initial_load(engine.as_ref(), &params.lora).await {
                Ok(InitialLoad::Failed) => {
                    warnings.push(format!("Failed to load LoRA preset {}", params.lora))
                }
                Ok(InitialLoad::Fused) => warnings.push(format!(
                    "LoRA preset {} is fused and cannot be switched until the engine is rebuilt",
                    params.lora
                )),
                Ok(_) => {}
                Err(err) => {
                    error!("Failed to load LoRA: {}", err);
                    warnings.push(err.to_string());
                }
            }
        }

        engine
            .prepare(&params.prompt, &params.negative_prompt, params.cfg_scale)
            .await
            .map_err(PipelineError::Engine)?;

        Ok(Built {
            engine,
            config,
            lora,
            warnings,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Brings the engine in line with `params` and runs one frame.
    ///
    /// A failed LoRA switch is logged and the frame is rendered with the previous LoRA.
    /// Changes to steps, denoise or seed only take effect after [`Pipeline::rebuild`].
    pub async fn predict(
        &mut self,
        params: &InputParams,
        image: Vec<u8>,
    ) -> Result<Vec<u8>, PipelineError> {
        if params.lora != self.applied.lora {
            match self.lora.switch_lora(self.engine.as_ref(), &params.lora).await {
                Ok(outcome) if outcome.is_success() => self.applied.lora = params.lora.clone(),
                Ok(_) => warn!(
                    lora = %params.lora,
                    active = %self.lora.active_preset(),
                    "LoRA switch failed, keeping current LoRA"
                ),
                Err(err) => warn!(lora = %params.lora, "LoRA switch rejected: {}", err),
            }
        }

        if params.cfg_scale != self.applied.cfg_scale
            || params.negative_prompt != self.applied.negative_prompt
        {
            debug!(cfg_scale = params.cfg_scale, "Preparing engine");
            self.engine
                .prepare(&params.prompt, &params.negative_prompt, params.cfg_scale)
                .await
                .map_err(PipelineError::Engine)?;
            self.applied.prompt = params.prompt.clone();
            self.applied.negative_prompt = params.negative_prompt.clone();
            self.applied.cfg_scale = params.cfg_scale;
        } else if params.prompt != self.applied.prompt {
            debug!("Updating prompt");
            self.engine
                .update_prompt(&params.prompt)
                .await
                .map_err(PipelineError::Engine)?;
            self.applied.prompt = params.prompt.clone();
        }

        if params.steps != self.applied.steps
            || params.denoise != self.applied.denoise
            || params.seed != self.applied.seed
        {
            debug!(
                steps = params.steps,
                denoise = params.denoise,
                seed = params.seed,
                "Ignoring sampling changes until the engine is rebuilt"
            );
        }

        self.engine
            .infer(image, &params.prompt)
            .await
            .map_err(PipelineError::Engine)
    }

    /// Switches the LoRA outside of a request.
    pub async fn switch_lora(&mut self, preset_id: &str) -> Result<SwitchOutcome, PipelineError> {
        let outcome = self
            .lora
            .switch_lora(self.engine.as_ref(), preset_id)
            .await?;
        if outcome.is_success() {
            self.applied.lora = preset_id.to_string();
        }
        Ok(outcome)
    }

    /// Replaces the engine with one built for new sampling settings.
    ///
    /// The current LoRA selection is loaded into the new engine, which also lifts a fused
    /// LoRA's lock. On error the old engine stays in place.
    pub async fn rebuild(
        &mut self,
        loader: &dyn EngineLoader,
        steps: u32,
        denoise: f32,
        seed: u64,
    ) -> Result<(), PipelineError> {
        let params = InputParams {
            steps,
            denoise,
            seed,
            ..self.applied.clone()
        };
        let built = Self::build(loader, &self.settings, &params).await?;
        info!(steps, denoise, seed, "Rebuilt engine");
        self.engine = built.engine;
        self.config = built.config;
        self.lora = built.lora;
        self.warnings = built.warnings;
        self.applied = params;
        Ok(())
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            model: self.config.model_id_or_path.clone(),
            t_index_list: self.config.t_index_list.clone(),
            lora_phase: self.lora.phase(),
            active_lora: self.lora.active_preset().to_string(),
            lora: self.lora.state().clone(),
            warnings: self.warnings.clone(),
        }
    }
}
