use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{LoraCatalog, LoraResolver, NONE_PRESET_ID};
use crate::{engine::Engine, PipelineError};

/// The LoRA currently attached to an engine.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LoraRuntimeState {
    pub current_lora_ref: Option<String>,
    pub current_strength: f32,
    /// Set once a LoRA has been merged into the model; only a new engine clears it.
    pub is_fused: bool,
}

impl Default for LoraRuntimeState {
    fn default() -> Self {
        Self {
            current_lora_ref: None,
            current_strength: 1.0,
            is_fused: false,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoraPhase {
    Empty,
    LoadedSwappable,
    LoadedFused,
}

impl LoraRuntimeState {
    pub fn phase(&self) -> LoraPhase {
        match (&self.current_lora_ref, self.is_fused) {
            (_, true) => LoraPhase::LoadedFused,
            (Some(_), false) => LoraPhase::LoadedSwappable,
            (None, false) => LoraPhase::Empty,
        }
    }
}

/// Result of a LoRA switch that did not hit a precondition error.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SwitchOutcome {
    /// The requested LoRA was already in place.
    Unchanged,
    /// A new LoRA was attached.
    Switched,
    /// The previous LoRA was removed.
    Cleared,
    /// The engine rejected the change; the last working LoRA (if any) is still attached.
    Failed,
}

impl SwitchOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, SwitchOutcome::Failed)
    }
}

/// Result of loading the startup LoRA into a fresh engine.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InitialLoad {
    /// The selected preset has no LoRA.
    Skipped,
    Swappable,
    /// Only fusing worked; the LoRA is locked in until the engine is rebuilt.
    Fused,
    Failed,
}

/// Owns the LoRA state of one engine and drives the engine through its transitions.
#[derive(Debug, Clone)]
pub struct LoraManager {
    catalog: LoraCatalog,
    resolver: LoraResolver,
    state: LoraRuntimeState,
    active_preset: String,
}

impl LoraManager {
    pub fn new(catalog: LoraCatalog, resolver: LoraResolver) -> Self {
        Self {
            catalog,
            resolver,
            state: LoraRuntimeState::default(),
            active_preset: NONE_PRESET_ID.to_string(),
        }
    }

    pub fn catalog(&self) -> &LoraCatalog {
        &self.catalog
    }

    pub fn state(&self) -> &LoraRuntimeState {
        &self.state
    }

    pub fn phase(&self) -> LoraPhase {
        self.state.phase()
    }

    /// Id of the preset whose LoRA is attached, `none` when empty.
    pub fn active_preset(&self) -> &str {
        &self.active_preset
    }

    /// Forgets all state, for use after the engine has been replaced.
    pub fn reset(&mut self) {
        self.state = LoraRuntimeState::default();
        self.active_preset = NONE_PRESET_ID.to_string();
    }

    /// Loads the LoRA of `preset_id` into a freshly built engine.
    ///
    /// Tries a reversible attach first and falls back to fusing the weights once.
    ///
    /// # Errors
    ///
    /// Returns `UnknownPreset` or `LoraNotFound` before touching the engine.
    pub async fn initial_load(
        &mut self,
        engine: &dyn Engine,
        preset_id: &str,
    ) -> Result<InitialLoad, PipelineError> {
        let preset = self
            .catalog
            .get(preset_id)
            .ok_or_else(|| PipelineError::UnknownPreset(preset_id.to_string()))?;
        let Some(source_ref) = &preset.source_ref else {
            return Ok(InitialLoad::Skipped);
        };
        let reference = self.resolver.resolve(source_ref)?.engine_ref();
        let strength = preset.strength_model;
        let preset_id = preset.id.clone();

        match engine.attach_lora(&reference, false, strength).await {
            Ok(()) => {
                info!(lora = %reference, strength, "Loaded LoRA");
                self.set_attached(&preset_id, reference, strength, false);
                return Ok(InitialLoad::Swappable);
            }
            Err(err) => {
                warn!(lora = %reference, "Failed to attach LoRA, fusing instead: {:#}", err)
            }
        }

        match engine.attach_lora(&reference, true, strength).await {
            Ok(()) => {
                info!(lora = %reference, strength, "Fused LoRA into the model");
                self.set_attached(&preset_id, reference, strength, true);
                Ok(InitialLoad::Fused)
            }
            Err(err) => {
                error!(lora = %reference, "Failed to load LoRA: {:#}", err);
                Ok(InitialLoad::Failed)
            }
        }
    }

    /// Switches the engine to the LoRA of `preset_id`.
    ///
    /// Engine failures are logged and reported as `SwitchOutcome::Failed`; the
    /// previous LoRA is re-attached if it had already been removed.
    ///
    /// # Errors
    ///
    /// * `Unsupported` if a fused LoRA is loaded.
    /// * `UnknownPreset` if the id is not in the catalog.
    /// * `LoraNotFound` if the preset's weights cannot be located.
    pub async fn switch_lora(
        &mut self,
        engine: &dyn Engine,
        preset_id: &str,
    ) -> Result<SwitchOutcome, PipelineError> {
        if self.state.is_fused {
            return Err(PipelineError::Unsupported(
                "fused LoRA cannot be hot-swapped",
            ));
        }
        let preset = self
            .catalog
            .get(preset_id)
            .ok_or_else(|| PipelineError::UnknownPreset(preset_id.to_string()))?;

        let Some(source_ref) = &preset.source_ref else {
            if self.state.current_lora_ref.is_none() {
                self.active_preset = preset.id.clone();
                return Ok(SwitchOutcome::Unchanged);
            }
            return match engine.detach_lora().await {
                Ok(()) => {
                    info!(preset = %preset.id, "Removed LoRA");
                    self.state = LoraRuntimeState::default();
                    self.active_preset = preset.id.clone();
                    Ok(SwitchOutcome::Cleared)
                }
                Err(err) => {
                    error!("Failed to remove LoRA: {:#}", err);
                    Ok(SwitchOutcome::Failed)
                }
            };
        };

        let reference = self.resolver.resolve(source_ref)?.engine_ref();
        let strength = preset.strength_model;
        let preset_id = preset.id.clone();

        if self.state.current_lora_ref.as_deref() == Some(reference.as_str())
            && self.state.current_strength == strength
        {
            debug!(lora = %reference, "LoRA already loaded");
            self.active_preset = preset_id;
            return Ok(SwitchOutcome::Unchanged);
        }

        let previous = self.state.clone();
        if previous.current_lora_ref.is_some() {
            if let Err(err) = engine.detach_lora().await {
                error!("Failed to remove LoRA before switching: {:#}", err);
                return Ok(SwitchOutcome::Failed);
            }
        }

        match engine.attach_lora(&reference, false, strength).await {
            Ok(()) => {
                info!(preset = %preset_id, lora = %reference, strength, "Switched LoRA");
                self.set_attached(&preset_id, reference, strength, false);
                Ok(SwitchOutcome::Switched)
            }
            Err(err) => {
                warn!(lora = %reference, "Failed to attach LoRA: {:#}", err);
                self.restore(engine, previous).await;
                Ok(SwitchOutcome::Failed)
            }
        }
    }

    fn set_attached(&mut self, preset_id: &str, reference: String, strength: f32, fused: bool) {
        self.state = LoraRuntimeState {
            current_lora_ref: Some(reference),
            current_strength: strength,
            is_fused: fused,
        };
        self.active_preset = preset_id.to_string();
    }

    async fn restore(&mut self, engine: &dyn Engine, previous: LoraRuntimeState) {
        let Some(reference) = previous.current_lora_ref.as_deref() else {
            return;
        };
        match engine
            .attach_lora(reference, false, previous.current_strength)
            .await
        {
            Ok(()) => debug!(lora = %reference, "Restored previous LoRA"),
            Err(err) => {
                error!(lora = %reference, "Failed to restore previous LoRA, running without one: {:#}", err);
                self.reset();
            }
        }
    }
}
