use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tracing::{debug, warn};

use crate::{
    models::*,
    visitor::{find_output_node, find_upstream, walk, Visitor},
    WorkflowError,
};

/// LoRA settings read from a `LoraLoader` (or `LoraLoaderModelOnly`) node.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoraParams {
    /// The LoRA file name as written in the workflow.
    pub name: String,
    /// The model (UNet) strength.
    pub strength_model: f32,
    /// The CLIP (text encoder) strength, absent for model-only loaders.
    pub strength_clip: Option<f32>,
}

/// Generation parameters extracted from a ComfyUI workflow.
///
/// Every field is optional: inputs driven by links instead of widget values are
/// reported as absent, as are nodes the workflow does not contain.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkflowParams {
    /// The checkpoint name.
    pub checkpoint: Option<String>,
    /// The LoRA nearest to the sampler on the model chain.
    pub lora: Option<LoraParams>,
    /// The number of sampling steps.
    pub steps: Option<u32>,
    /// The CFG scale.
    pub cfg: Option<f32>,
    /// The sampler name.
    pub sampler_name: Option<String>,
    /// The scheduler name.
    pub scheduler: Option<String>,
    /// The denoising strength.
    pub denoise: Option<f32>,
    /// The seed.
    pub seed: Option<u64>,
    /// The positive prompt text.
    pub prompt: Option<String>,
    /// The negative prompt text.
    pub negative_prompt: Option<String>,
    /// The input image name, for img2img workflows.
    pub input_image: Option<String>,
    /// The latent width, for txt2img workflows.
    pub width: Option<u32>,
    /// The latent height, for txt2img workflows.
    pub height: Option<u32>,
}

impl WorkflowParams {
    /// Extracts parameters from a workflow, starting at its output node.
    ///
    /// When the workflow has no single output node, the first `KSampler` is used.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::MissingNode` if the workflow has no `KSampler`.
    pub fn from_workflow(workflow: &Workflow) -> Result<Self, WorkflowError> {
        let sampler_id = find_output_node(workflow)
            .and_then(|output| find_upstream::<KSampler>(workflow, &output))
            .or_else(|| {
                workflow
                    .nodes_of_type::<KSampler>()
                    .next()
                    .map(|(id, _)| id.to_string())
            })
            .ok_or(WorkflowError::MissingNode("KSampler"))?;
        Self::from_sampler(workflow, &sampler_id)
    }

    /// Extracts parameters from the `KSampler` feeding into `output_node`.
    ///
    /// # Errors
    ///
    /// Returns an error if `output_node` does not exist or has no `KSampler` upstream.
    pub fn from_output(workflow: &Workflow, output_node: &str) -> Result<Self, WorkflowError> {
        if workflow.get_node_by_id(output_node).is_none() {
            return Err(WorkflowError::NodeNotFound(output_node.to_string()));
        }
        let sampler_id = find_upstream::<KSampler>(workflow, output_node)
            .ok_or(WorkflowError::MissingNode("KSampler"))?;
        Self::from_sampler(workflow, &sampler_id)
    }

    fn from_sampler(workflow: &Workflow, sampler_id: &str) -> Result<Self, WorkflowError> {
        let sampler = workflow
            .get_typed_node::<KSampler>(sampler_id)
            .ok_or_else(|| WorkflowError::NodeNotFound(sampler_id.to_string()))?;
        debug!(node = sampler_id, "Extracting parameters from sampler");

        let mut params = WorkflowParams {
            steps: sampler.steps.value().copied(),
            cfg: sampler.cfg.value().copied(),
            sampler_name: sampler.sampler_name.value().cloned(),
            scheduler: sampler.scheduler.value().cloned(),
            denoise: sampler.denoise.value().copied(),
            seed: sampler.seed.value().copied(),
            prompt: conditioning_text(workflow, &sampler.positive.node_id),
            negative_prompt: conditioning_text(workflow, &sampler.negative.node_id),
            ..Default::default()
        };

        let mut model_chain = ModelChain::default();
        if let Some(node) = workflow.get_node_by_id(&sampler.model.node_id) {
            model_chain.visit(workflow, &sampler.model.node_id, node);
        }
        if model_chain.lora_count > 1 {
            warn!(
                count = model_chain.lora_count,
                "Workflow chains several LoRAs; only the one nearest to the sampler is used"
            );
        }
        params.checkpoint = model_chain.checkpoint;
        params.lora = model_chain.lora;

        let mut latent = LatentSource::default();
        if let Some(node) = workflow.get_node_by_id(&sampler.latent_image.node_id) {
            latent.visit(workflow, &sampler.latent_image.node_id, node);
        }
        params.input_image = latent.image;
        params.width = latent.width;
        params.height = latent.height;

        Ok(params)
    }
}

/// Text of the `CLIPTextEncode` feeding a conditioning input.
fn conditioning_text(workflow: &Workflow, start: &str) -> Option<String> {
    let id = find_upstream::<CLIPTextEncode>(workflow, start)?;
    workflow
        .get_typed_node::<CLIPTextEncode>(&id)?
        .text
        .value()
        .cloned()
}

#[derive(Default)]
struct ModelChain {
    seen: HashSet<String>,
    checkpoint: Option<String>,
    lora: Option<LoraParams>,
    lora_count: usize,
}

impl ModelChain {
    fn record_lora(&mut self, lora: Option<LoraParams>) {
        self.lora_count += 1;
        if self.lora.is_none() {
            self.lora = lora;
        }
    }
}

impl Visitor for ModelChain {
    fn visit(&mut self, workflow: &Workflow, id: &str, node: &dyn Node) {
        if !self.seen.insert(id.to_string()) {
            return;
        }
        if let Some(node) = as_node::<CheckpointLoaderSimple>(node) {
            if self.checkpoint.is_none() {
                self.checkpoint = node.ckpt_name.value().cloned();
            }
        } else if let Some(node) = as_node::<LoraLoader>(node) {
            let lora = match (node.lora_name.value(), node.strength_model.value()) {
                (Some(name), Some(strength_model)) => Some(LoraParams {
                    name: name.clone(),
                    strength_model: *strength_model,
                    strength_clip: node.strength_clip.value().copied(),
                }),
                _ => None,
            };
            self.record_lora(lora);
        } else if let Some(node) = as_node::<LoraLoaderModelOnly>(node) {
            let lora = match (node.lora_name.value(), node.strength_model.value()) {
                (Some(name), Some(strength_model)) => Some(LoraParams {
                    name: name.clone(),
                    strength_model: *strength_model,
                    strength_clip: None,
                }),
                _ => None,
            };
            self.record_lora(lora);
        }
        walk(self, workflow, node)
    }
}

#[derive(Default)]
struct LatentSource {
    seen: HashSet<String>,
    image: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

impl Visitor for LatentSource {
    fn visit(&mut self, workflow: &Workflow, id: &str, node: &dyn Node) {
        if !self.seen.insert(id.to_string()) {
            return;
        }
        if let Some(node) = as_node::<EmptyLatentImage>(node) {
            self.width = node.width.value().copied();
            self.height = node.height.value().copied();
            return;
        }
        if let Some(node) = as_node::<LoadImage>(node) {
            if self.image.is_none() {
                self.image = node.image.value().cloned();
            }
            return;
        }
        walk(self, workflow, node)
    }
}
