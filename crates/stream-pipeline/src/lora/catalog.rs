use serde::{Deserialize, Serialize};
use tracing::warn;

/// Id of the built-in preset that runs without a LoRA.
pub const NONE_PRESET_ID: &str = "none";

/// Id under which the startup LoRA from the configuration is registered.
pub const WORKFLOW_PRESET_ID: &str = "workflow";

fn default_strength() -> f32 {
    1.0
}

/// A named LoRA selection users can switch to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoraPreset {
    pub id: String,
    pub display_name: String,
    /// Local path or hub id of the weights. `None` means no LoRA.
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default = "default_strength")]
    pub strength_model: f32,
    #[serde(default)]
    pub description: String,
}

impl LoraPreset {
    /// The preset that clears any attached LoRA.
    pub fn none() -> Self {
        Self {
            id: NONE_PRESET_ID.to_string(),
            display_name: "No LoRA".to_string(),
            source_ref: None,
            strength_model: default_strength(),
            description: "Run the base model without a LoRA".to_string(),
        }
    }

    /// The preset for the LoRA configured at startup.
    pub fn workflow(source_ref: impl Into<String>, strength_model: f32) -> Self {
        Self {
            id: WORKFLOW_PRESET_ID.to_string(),
            display_name: "Workflow LoRA".to_string(),
            source_ref: Some(source_ref.into()),
            strength_model,
            description: "The LoRA configured at startup".to_string(),
        }
    }
}

/// LoRA presets keyed by id, in registration order.
///
/// The `none` preset is always present.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraCatalog {
    presets: Vec<LoraPreset>,
}

impl Default for LoraCatalog {
    fn default() -> Self {
        Self {
            presets: vec![LoraPreset::none()],
        }
    }
}

impl LoraCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog from `presets`; later presets replace earlier ones with the same id.
    pub fn with_presets(presets: impl IntoIterator<Item = LoraPreset>) -> Self {
        let mut catalog = Self::new();
        for preset in presets {
            catalog.insert(preset);
        }
        catalog
    }

    /// Adds a preset, returning the one it replaced.
    pub fn insert(&mut self, preset: LoraPreset) -> Option<LoraPreset> {
        match self.presets.iter_mut().find(|p| p.id == preset.id) {
            Some(existing) => {
                warn!(id = %preset.id, "Replacing LoRA preset");
                Some(std::mem::replace(existing, preset))
            }
            None => {
                self.presets.push(preset);
                None
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&LoraPreset> {
        self.presets.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoraPreset> {
        self.presets.iter()
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}
