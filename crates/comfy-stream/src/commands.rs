use std::path::Path;

use anyhow::Context;
use comfyui_workflow::{Workflow, WorkflowParams};
use serde::Serialize;
use stream_pipeline::{
    lora::{LoraPreset, LoraSource},
    timesteps::{SamplingRequest, TimestepStrategy},
    PipelinePlan, Settings,
};
use tracing::warn;

#[derive(Serialize, Debug)]
struct Indices {
    strategy: TimestepStrategy,
    t_index_list: Vec<u32>,
}

/// Timestep indices for the given sampling settings.
pub(crate) fn indices(
    steps: u32,
    denoise: f32,
    total_steps: u32,
    model: Option<&str>,
    turbo_steps: u32,
) -> anyhow::Result<String> {
    let sampling = SamplingRequest::with_total_steps(steps, denoise, total_steps)?;
    let strategy = match model {
        Some(model) => TimestepStrategy::for_model(model, sampling, turbo_steps),
        None => TimestepStrategy::Formula(sampling),
    };
    let output = Indices {
        strategy,
        t_index_list: strategy.t_index_list(),
    };
    Ok(serde_json::to_string_pretty(&output)?)
}

fn read_workflow(path: &Path) -> anyhow::Result<Workflow> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow {}", path.display()))?;
    Workflow::from_json(&json).with_context(|| format!("Invalid workflow {}", path.display()))
}

/// Parameters extracted from a workflow file.
pub(crate) fn workflow(path: &Path, output_node: Option<&str>) -> anyhow::Result<String> {
    let workflow = read_workflow(path)?;
    let params = match output_node {
        Some(id) => WorkflowParams::from_output(&workflow, id),
        None => WorkflowParams::from_workflow(&workflow),
    }
    .context("Failed to extract workflow parameters")?;
    Ok(serde_json::to_string_pretty(&params)?)
}

/// The engine configuration for `settings`, optionally overlaid with a workflow.
pub(crate) fn plan(mut settings: Settings, workflow: Option<&Path>) -> anyhow::Result<String> {
    if let Some(path) = workflow {
        let params = WorkflowParams::from_workflow(&read_workflow(path)?)
            .context("Failed to extract workflow parameters")?;
        settings.apply_workflow(&params);
    }
    let plan = PipelinePlan::new(&settings, &settings.defaults)?;
    for warning in &plan.warnings {
        warn!("{}", warning);
    }
    Ok(serde_json::to_string_pretty(&plan)?)
}

#[derive(Serialize, Debug)]
struct PresetEntry {
    #[serde(flatten)]
    preset: LoraPreset,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolved: Option<LoraSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// The LoRA catalog with each preset's resolved location.
pub(crate) fn presets(settings: &Settings) -> anyhow::Result<String> {
    let resolver = settings.lora_resolver();
    let entries: Vec<_> = settings
        .lora_catalog()
        .iter()
        .map(|preset| {
            let resolved = preset
                .source_ref
                .as_deref()
                .map(|source_ref| resolver.resolve(source_ref));
            let (resolved, error) = match resolved {
                Some(Ok(source)) => (Some(source), None),
                Some(Err(err)) => (None, Some(err.to_string())),
                None => (None, None),
            };
            PresetEntry {
                preset: preset.clone(),
                resolved,
                error,
            }
        })
        .collect();
    Ok(serde_json::to_string_pretty(&entries)?)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::Value;

    use super::*;

    const WORKFLOW: &str = r#"{
        "4": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "sd_turbo.safetensors" } },
        "10": { "class_type": "LoraLoader", "inputs": {
            "lora_name": "ink.safetensors", "strength_model": 0.7, "strength_clip": 1.0,
            "model": ["4", 0], "clip": ["4", 1] } },
        "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "a paper boat", "clip": ["10", 1] } },
        "7": { "class_type": "CLIPTextEncode", "inputs": { "text": "blurry", "clip": ["10", 1] } },
        "5": { "class_type": "EmptyLatentImage", "inputs": { "width": 512, "height": 768, "batch_size": 1 } },
        "3": { "class_type": "KSampler", "inputs": {
            "seed": 11, "steps": 3, "cfg": 1.0, "sampler_name": "lcm", "scheduler": "sgm_uniform",
            "denoise": 0.5, "model": ["10", 0], "positive": ["6", 0], "negative": ["7", 0],
            "latent_image": ["5", 0] } },
        "8": { "class_type": "VAEDecode", "inputs": { "samples": ["3", 0], "vae": ["4", 2] } },
        "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "out", "images": ["8", 0] } }
    }"#;

    fn test_settings() -> Settings {
        Settings {
            model_dirs: vec![],
            lora_dirs: vec![],
            ..Default::default()
        }
    }

    #[test]
    fn test_indices() {
        let output: Value = serde_json::from_str(&indices(4, 0.6, 50, None, 2).unwrap()).unwrap();
        assert_eq!(output["t_index_list"], serde_json::json!([30, 20, 10, 0]));
        assert_eq!(output["strategy"]["strategy"], "formula");

        let output: Value =
            serde_json::from_str(&indices(4, 0.6, 50, Some("sd-turbo"), 1).unwrap()).unwrap();
        assert_eq!(output["t_index_list"], serde_json::json!([45]));
    }

    #[test]
    fn test_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        fs::write(&path, WORKFLOW).unwrap();

        let output: Value = serde_json::from_str(&workflow(&path, None).unwrap()).unwrap();

        assert_eq!(output["prompt"], "a paper boat");
        assert_eq!(output["lora"]["name"], "ink.safetensors");
        assert_eq!(output["height"], 768);
        assert!(output.get("input_image").is_none());

        assert!(workflow(&path, Some("42")).is_err());
        assert!(workflow(&dir.path().join("missing.json"), None).is_err());
    }

    #[test]
    fn test_plan_with_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        fs::write(&path, WORKFLOW).unwrap();
        fs::write(dir.path().join("ink.safetensors"), b"").unwrap();
        let settings = Settings {
            lora_dirs: vec![dir.path().to_path_buf()],
            ..test_settings()
        };

        let output: Value = serde_json::from_str(&plan(settings, Some(&path)).unwrap()).unwrap();

        let engine = &output["engine"];
        // "sd_turbo.safetensors" is not on disk and has no path separator
        assert_eq!(engine["model_id_or_path"], "stabilityai/sd-turbo");
        assert_eq!(engine["t_index_list"], serde_json::json!([35, 45]));
        assert_eq!(engine["height"], 768);
        assert_eq!(engine["seed"], 11);
        assert_eq!(engine["lora"]["strength"], 0.7);
        assert_eq!(output["warnings"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_presets() {
        let output: Value = serde_json::from_str(&presets(&test_settings()).unwrap()).unwrap();
        let entries = output.as_array().unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["id"], "none");
        assert!(entries[0].get("resolved").is_none());
        assert_eq!(entries[1]["id"], "workflow");
        assert!(entries[1]["error"]
            .as_str()
            .unwrap()
            .starts_with("LoRA not found"));
    }
}
