//! LoRA presets, reference resolution and the attach/detach lifecycle.

mod catalog;
mod manager;
mod resolve;

pub use catalog::*;
pub use manager::*;
pub use resolve::{default_lora_dirs, LoraResolver, LoraSource, LORA_EXTENSIONS};
