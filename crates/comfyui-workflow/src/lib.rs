//! Reader for ComfyUI workflows saved in API format.
//!
//! Parses the node graph and extracts the generation parameters (checkpoint,
//! LoRA, sampler settings, prompts, input image) needed to drive a
//! StreamDiffusion pipeline with the same settings.
//!
//! ```rust
//! use comfyui_workflow::{Workflow, WorkflowParams};
//!
//! let workflow = Workflow::from_json(r#"{
//!     "1": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "model.safetensors" } },
//!     "2": { "class_type": "CLIPTextEncode", "inputs": { "text": "a cat", "clip": ["1", 1] } },
//!     "3": { "class_type": "CLIPTextEncode", "inputs": { "text": "", "clip": ["1", 1] } },
//!     "4": { "class_type": "EmptyLatentImage", "inputs": { "batch_size": 1, "width": 512, "height": 512 } },
//!     "5": { "class_type": "KSampler", "inputs": {
//!         "seed": 1, "steps": 4, "cfg": 1.8, "sampler_name": "lcm", "scheduler": "normal",
//!         "denoise": 0.6, "model": ["1", 0], "positive": ["2", 0], "negative": ["3", 0],
//!         "latent_image": ["4", 0] } }
//! }"#).unwrap();
//!
//! let params = WorkflowParams::from_workflow(&workflow).unwrap();
//! assert_eq!(params.steps, Some(4));
//! assert_eq!(params.prompt.as_deref(), Some("a cat"));
//! ```

pub mod models;
pub mod params;
pub mod visitor;

pub use models::{Node, NodeConnection, NodeOrUnknown, Workflow};
pub use params::{LoraParams, WorkflowParams};

/// Errors that can occur while reading a workflow.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum WorkflowError {
    /// The input is not a valid API-format workflow.
    #[error("Failed to parse workflow")]
    Parse(#[from] serde_json::Error),
    /// A node id referenced by the caller does not exist.
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    /// The workflow has no node of a required class.
    #[error("Workflow has no {0} node")]
    MissingNode(&'static str),
}
