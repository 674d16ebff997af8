use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

/// Environment variables read without a prefix.
const BARE_ENV: &[&str] = &[
    "MODEL_PATH",
    "LORA_PATH",
    "LORA_STRENGTH_MODEL",
    "LORA_STRENGTH_CLIP",
    "ACCELERATION",
    "ENGINE_DIR",
    "TURBO_STEPS",
    "USE_TAESD",
    "SAFETY_CHECKER",
];

/// Configuration sources, lowest priority first.
pub(crate) fn figment(config: Option<&Path>) -> Figment {
    let mut figment = Figment::new()
        .merge(Toml::file("/etc/comfy-stream/config.toml"))
        .merge(Toml::file("config.toml"));
    if let Some(config) = config {
        figment = figment.merge(Toml::file(config));
    }
    figment
        .merge(Env::raw().only(BARE_ENV))
        .merge(Env::prefixed("COMFY_STREAM_").split("__"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use figment::Jail;
    use stream_pipeline::{config::Acceleration, Settings};

    use super::*;

    #[test]
    fn test_defaults() {
        Jail::expect_with(|_| {
            let settings: Settings = figment(None).extract()?;
            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                model_path = "file/model"
                turbo_steps = 1
                engine_dir = "trt"

                [defaults]
                prompt = "a harbour at dawn"

                [[lora_presets]]
                id = "ink"
                display_name = "Ink"
                source_ref = "styles/ink-lora"
                strength_model = 0.5
                "#,
            )?;
            jail.set_env("MODEL_PATH", "env/model");
            jail.set_env("USE_TAESD", "False");
            jail.set_env("LORA_STRENGTH_MODEL", "0.65");
            jail.set_env("COMFY_STREAM_ACCELERATION", "tensorrt");
            jail.set_env("COMFY_STREAM_DEFAULTS__STEPS", "2");

            let settings: Settings = figment(None).extract()?;

            assert_eq!(settings.model_path, "env/model");
            assert_eq!(settings.turbo_steps, 1);
            assert_eq!(settings.engine_dir, PathBuf::from("trt"));
            assert!(!settings.use_taesd);
            assert_eq!(settings.lora_strength_model, 0.65);
            assert_eq!(settings.acceleration, Acceleration::Tensorrt);
            assert_eq!(settings.defaults.prompt, "a harbour at dawn");
            assert_eq!(settings.defaults.steps, 2);
            assert_eq!(settings.defaults.cfg_scale, 1.8);
            assert!(settings.lora_catalog().contains("ink"));
            Ok(())
        });
    }

    #[test]
    fn test_extra_config_file() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", r#"model_path = "base""#)?;
            jail.create_file("override.toml", r#"model_path = "override""#)?;

            let settings: Settings = figment(Some(Path::new("override.toml"))).extract()?;

            assert_eq!(settings.model_path, "override");
            Ok(())
        });
    }
}
