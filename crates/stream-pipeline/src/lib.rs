//! Control layer for a real-time StreamDiffusion img2img pipeline.
//!
//! Picks the denoising timesteps, manages hot-swappable LoRA adapters and keeps an
//! external engine in sync with per-request parameters. The engine itself is supplied
//! by the caller through the [`Engine`] and [`EngineLoader`] traits.

pub mod config;
pub mod engine;
mod error;
pub mod handle;
pub mod lora;
pub mod params;
pub mod pipeline;
pub mod timesteps;

pub use config::{EngineConfig, PipelinePlan, Settings};
pub use engine::{Engine, EngineLoader};
pub use error::PipelineError;
pub use handle::PipelineHandle;
pub use params::InputParams;
pub use pipeline::{Pipeline, PipelineStatus};
pub use timesteps::{compute_indices, SamplingRequest, TimestepIndexList, TimestepStrategy};
