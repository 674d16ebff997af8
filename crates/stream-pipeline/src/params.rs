use comfyui_workflow::WorkflowParams;
use serde::{Deserialize, Serialize};

use crate::lora::WORKFLOW_PRESET_ID;

/// Per-request generation settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct InputParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    /// Only read when an engine is built.
    pub steps: u32,
    pub cfg_scale: f32,
    /// Only read when an engine is built.
    pub denoise: f32,
    /// Only read when an engine is built.
    pub seed: u64,
    /// Id of the LoRA preset to use.
    pub lora: String,
}

impl Default for InputParams {
    fn default() -> Self {
        Self {
            prompt: "masterpiece,inflatable flowers,transparency,blue sky background,high quality,"
                .to_string(),
            negative_prompt:
                "ng_deepnegative_v1_75t,(badhandv4:1.2),EasyNegative,(worst quality:2),balloon,,nsfw"
                    .to_string(),
            width: 512,
            height: 512,
            steps: 4,
            cfg_scale: 1.8,
            denoise: 0.6,
            seed: 502923423887318,
            lora: WORKFLOW_PRESET_ID.to_string(),
        }
    }
}

impl InputParams {
    /// Overrides every field the workflow provides a value for.
    pub fn apply_workflow(&mut self, workflow: &WorkflowParams) {
        if let Some(prompt) = &workflow.prompt {
            self.prompt = prompt.clone();
        }
        if let Some(negative_prompt) = &workflow.negative_prompt {
            self.negative_prompt = negative_prompt.clone();
        }
        if let Some(width) = workflow.width {
            self.width = width;
        }
        if let Some(height) = workflow.height {
            self.height = height;
        }
        if let Some(steps) = workflow.steps {
            self.steps = steps;
        }
        if let Some(cfg) = workflow.cfg {
            self.cfg_scale = cfg;
        }
        if let Some(denoise) = workflow.denoise {
            self.denoise = denoise;
        }
        if let Some(seed) = workflow.seed {
            self.seed = seed;
        }
    }
}
