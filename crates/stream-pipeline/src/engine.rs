use async_trait::async_trait;

use crate::config::EngineConfig;

/// A StreamDiffusion engine instance.
///
/// Implementations wrap the actual model runtime. All methods are called from the
/// single task that owns the pipeline, one at a time.
#[async_trait]
pub trait Engine: std::fmt::Debug + Send + Sync {
    /// Attaches a LoRA by local path or hub id.
    ///
    /// # Arguments
    ///
    /// * `source` - Path to the weights file, or a hub identifier.
    /// * `fuse` - Whether to merge the weights into the model. A fused LoRA cannot be detached.
    /// * `strength` - The model strength to apply.
    async fn attach_lora(&self, source: &str, fuse: bool, strength: f32) -> anyhow::Result<()>;

    /// Removes every attached (unfused) LoRA.
    async fn detach_lora(&self) -> anyhow::Result<()>;

    /// Encodes the prompts and sets the guidance scale.
    async fn prepare(
        &self,
        prompt: &str,
        negative_prompt: &str,
        guidance_scale: f32,
    ) -> anyhow::Result<()>;

    /// Re-encodes the positive prompt only.
    async fn update_prompt(&self, prompt: &str) -> anyhow::Result<()>;

    /// Runs one frame through the pipeline and returns the encoded output image.
    async fn infer(&self, image: Vec<u8>, prompt: &str) -> anyhow::Result<Vec<u8>>;
}

/// Builds engines from an `EngineConfig`.
#[async_trait]
pub trait EngineLoader: std::fmt::Debug + Send + Sync {
    async fn load(&self, config: &EngineConfig) -> anyhow::Result<Box<dyn Engine>>;
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::{Arc, Mutex};

    use anyhow::bail;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        Attach {
            source: String,
            fuse: bool,
            strength: f32,
        },
        Detach,
        Prepare {
            prompt: String,
            negative_prompt: String,
            guidance_scale: f32,
        },
        UpdatePrompt(String),
        Infer(String),
    }

    /// Failure switches shared between a test and the engines it hands out.
    #[derive(Debug, Default)]
    pub(crate) struct Failures {
        /// Sources whose unfused attach fails.
        pub(crate) attach: Vec<String>,
        /// Sources whose fused attach fails.
        pub(crate) fuse: Vec<String>,
        pub(crate) detach: bool,
    }

    /// Engine that records every call.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MockEngine {
        pub(crate) calls: Arc<Mutex<Vec<Call>>>,
        pub(crate) failures: Arc<Mutex<Failures>>,
    }

    impl MockEngine {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }

        pub(crate) fn fail_attach(&self, source: &str) {
            self.failures.lock().unwrap().attach.push(source.to_string());
        }

        pub(crate) fn fail_fuse(&self, source: &str) {
            self.failures.lock().unwrap().fuse.push(source.to_string());
        }

        pub(crate) fn fail_detach(&self) {
            self.failures.lock().unwrap().detach = true;
        }

        pub(crate) fn reset_failures(&self) {
            *self.failures.lock().unwrap() = Failures::default();
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl Engine for MockEngine {
        async fn attach_lora(&self, source: &str, fuse: bool, strength: f32) -> anyhow::Result<()> {
            self.record(Call::Attach {
                source: source.to_string(),
                fuse,
                strength,
            });
            let failures = self.failures.lock().unwrap();
            let failing = if fuse {
                &failures.fuse
            } else {
                &failures.attach
            };
            if failing.iter().any(|s| s == source) {
                bail!("cannot load {source}");
            }
            Ok(())
        }

        async fn detach_lora(&self) -> anyhow::Result<()> {
            self.record(Call::Detach);
            if self.failures.lock().unwrap().detach {
                bail!("cannot unload LoRA weights");
            }
            Ok(())
        }

        async fn prepare(
            &self,
            prompt: &str,
            negative_prompt: &str,
            guidance_scale: f32,
        ) -> anyhow::Result<()> {
            self.record(Call::Prepare {
                prompt: prompt.to_string(),
                negative_prompt: negative_prompt.to_string(),
                guidance_scale,
            });
            Ok(())
        }

        async fn update_prompt(&self, prompt: &str) -> anyhow::Result<()> {
            self.record(Call::UpdatePrompt(prompt.to_string()));
            Ok(())
        }

        async fn infer(&self, image: Vec<u8>, prompt: &str) -> anyhow::Result<Vec<u8>> {
            self.record(Call::Infer(prompt.to_string()));
            Ok(image)
        }
    }

    /// Loader that hands out clones of one `MockEngine` and keeps the configs it was given.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MockLoader {
        pub(crate) engine: MockEngine,
        pub(crate) configs: Arc<Mutex<Vec<EngineConfig>>>,
    }

    impl MockLoader {
        pub(crate) fn configs(&self) -> Vec<EngineConfig> {
            self.configs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EngineLoader for MockLoader {
        async fn load(&self, config: &EngineConfig) -> anyhow::Result<Box<dyn Engine>> {
            self.configs.lock().unwrap().push(config.clone());
            Ok(Box::new(self.engine.clone()))
        }
    }
}
