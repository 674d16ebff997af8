use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::PipelineError;

/// File extensions of LoRA weight files.
pub const LORA_EXTENSIONS: &[&str] = &["safetensors", "ckpt", "pt", "pth", "bin"];

/// Directories searched for LoRA files, relative to the working directory.
pub fn default_lora_dirs() -> Vec<PathBuf> {
    ["models/Lora", "models/lora", "lora", "../../models/lora"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

/// Where the weights of a LoRA live.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum LoraSource {
    Local(PathBuf),
    /// A hub identifier such as `latent-consistency/lcm-lora-sdv1-5`.
    Remote(String),
}

impl LoraSource {
    /// The reference handed to the engine.
    pub fn engine_ref(&self) -> String {
        match self {
            LoraSource::Local(path) => path.display().to_string(),
            LoraSource::Remote(id) => id.clone(),
        }
    }
}

/// Returns the last component of a `/` or `\` separated reference.
pub(crate) fn base_name(reference: &str) -> &str {
    reference.rsplit(['/', '\\']).next().unwrap_or(reference)
}

fn has_weight_extension(reference: &str) -> bool {
    Path::new(base_name(reference))
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            LORA_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or_default()
}

/// Turns preset references into local paths or hub ids.
#[derive(Debug, Clone)]
pub struct LoraResolver {
    search_dirs: Vec<PathBuf>,
}

impl Default for LoraResolver {
    fn default() -> Self {
        Self::new(default_lora_dirs())
    }
}

impl LoraResolver {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Resolves `reference`.
    ///
    /// A reference with a path delimiter, no weight-file extension and nothing on disk
    /// at that name is a hub id. Anything else must exist, either as given or by its
    /// base name inside one of the search directories.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::LoraNotFound` if no local file matches.
    pub fn resolve(&self, reference: &str) -> Result<LoraSource, PipelineError> {
        let as_given = Path::new(reference);
        let exists = as_given.exists();
        if reference.contains(['/', '\\']) && !has_weight_extension(reference) && !exists {
            debug!(reference, "Treating LoRA reference as hub id");
            return Ok(LoraSource::Remote(reference.to_string()));
        }
        if exists {
            return Ok(LoraSource::Local(as_given.to_path_buf()));
        }

        let name = base_name(reference);
        self.search_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.exists())
            .map(|path| {
                debug!(reference, path = %path.display(), "Found LoRA");
                LoraSource::Local(path)
            })
            .ok_or_else(|| PipelineError::LoraNotFound(reference.to_string()))
    }
}
