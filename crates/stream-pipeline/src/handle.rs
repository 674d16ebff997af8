use std::{fmt, sync::Arc};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    engine::EngineLoader,
    lora::SwitchOutcome,
    params::InputParams,
    pipeline::{Pipeline, PipelineStatus},
    PipelineError,
};

const COMMAND_BUFFER: usize = 32;

enum Command {
    Predict {
        params: InputParams,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, PipelineError>>,
    },
    SwitchLora {
        preset_id: String,
        reply: oneshot::Sender<Result<SwitchOutcome, PipelineError>>,
    },
    Rebuild {
        loader: Arc<dyn EngineLoader>,
        steps: u32,
        denoise: f32,
        seed: u64,
        reply: oneshot::Sender<Result<(), PipelineError>>,
    },
    Status {
        reply: oneshot::Sender<PipelineStatus>,
    },
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Predict { params, image, .. } => f
                .debug_struct("Predict")
                .field("prompt", &params.prompt)
                .field("image_len", &image.len())
                .finish(),
            Self::SwitchLora { preset_id, .. } => f
                .debug_struct("SwitchLora")
                .field("preset_id", preset_id)
                .finish(),
            Self::Rebuild {
                steps,
                denoise,
                seed,
                ..
            } => f
                .debug_struct("Rebuild")
                .field("steps", steps)
                .field("denoise", denoise)
                .field("seed", seed)
                .finish(),
            Self::Status { .. } => f.debug_struct("Status").finish(),
            Self::Shutdown => f.debug_struct("Shutdown").finish(),
        }
    }
}

/// Cloneable handle to a pipeline running on its own task.
///
/// Requests from all clones are handled one at a time in the order they arrive.
#[derive(Clone, Debug)]
pub struct PipelineHandle {
    tx: mpsc::Sender<Command>,
}

impl PipelineHandle {
    /// Moves `pipeline` onto a new task.
    ///
    /// The task ends after [`PipelineHandle::shutdown`] or once every handle is dropped,
    /// returning the pipeline through the `JoinHandle`.
    pub fn spawn(pipeline: Pipeline) -> (Self, JoinHandle<Pipeline>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(run(pipeline, rx));
        (Self { tx }, task)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| PipelineError::Closed)?;
        rx.await.map_err(|_| PipelineError::Closed)
    }

    pub async fn predict(
        &self,
        params: InputParams,
        image: Vec<u8>,
    ) -> Result<Vec<u8>, PipelineError> {
        self.request(|reply| Command::Predict {
            params,
            image,
            reply,
        })
        .await?
    }

    pub async fn switch_lora(
        &self,
        preset_id: impl Into<String>,
    ) -> Result<SwitchOutcome, PipelineError> {
        let preset_id = preset_id.into();
        self.request(|reply| Command::SwitchLora { preset_id, reply })
            .await?
    }

    pub async fn rebuild(
        &self,
        loader: Arc<dyn EngineLoader>,
        steps: u32,
        denoise: f32,
        seed: u64,
    ) -> Result<(), PipelineError> {
        self.request(|reply| Command::Rebuild {
            loader,
            steps,
            denoise,
            seed,
            reply,
        })
        .await?
    }

    pub async fn status(&self) -> Result<PipelineStatus, PipelineError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Stops the pipeline task after the commands already queued.
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        self.tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| PipelineError::Closed)
    }
}

async fn run(mut pipeline: Pipeline, mut rx: mpsc::Receiver<Command>) -> Pipeline {
    while let Some(command) = rx.recv().await {
        debug!(?command, "Pipeline command");
        match command {
            Command::Predict {
                params,
                image,
                reply,
            } => {
                let _ = reply.send(pipeline.predict(&params, image).await);
            }
            Command::SwitchLora { preset_id, reply } => {
                let _ = reply.send(pipeline.switch_lora(&preset_id).await);
            }
            Command::Rebuild {
                loader,
                steps,
                denoise,
                seed,
                reply,
            } => {
                let _ = reply.send(pipeline.rebuild(loader.as_ref(), steps, denoise, seed).await);
            }
            Command::Status { reply } => {
                let _ = reply.send(pipeline.status());
            }
            Command::Shutdown => break,
        }
    }
    info!("Pipeline stopped");
    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Settings,
        engine::mock::{Call, MockLoader},
        lora::{LoraPhase, NONE_PRESET_ID},
    };

    async fn spawn() -> (PipelineHandle, JoinHandle<Pipeline>, MockLoader) {
        let loader = MockLoader::default();
        let settings = Settings {
            model_path: "Lykon/dreamshaper-8".to_string(),
            lora_path: Some("styles/ink-lora".to_string()),
            model_dirs: vec![],
            lora_dirs: vec![],
            ..Default::default()
        };
        let pipeline = Pipeline::load(&loader, settings).await.unwrap();
        loader.engine.clear();
        let (handle, task) = PipelineHandle::spawn(pipeline);
        (handle, task, loader)
    }

    #[tokio::test]
    async fn test_handle_serializes_requests() {
        let (handle, _task, loader) = spawn().await;

        let requests = (0..8u8).map(|i| {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .predict(InputParams::default(), vec![i])
                    .await
                    .unwrap()
            })
        });
        for (i, request) in requests.collect::<Vec<_>>().into_iter().enumerate() {
            assert_eq!(request.await.unwrap(), vec![i as u8]);
        }

        let calls = loader.engine.calls();
        assert_eq!(calls.len(), 8);
        assert!(calls.iter().all(|call| matches!(call, Call::Infer(_))));
    }

    #[tokio::test]
    async fn test_handle_switch_and_status() {
        let (handle, _task, _loader) = spawn().await;

        assert_eq!(
            handle.switch_lora(NONE_PRESET_ID).await.unwrap(),
            SwitchOutcome::Cleared
        );
        let status = handle.status().await.unwrap();
        assert_eq!(status.lora_phase, LoraPhase::Empty);
        assert_eq!(status.active_lora, NONE_PRESET_ID);
    }

    #[tokio::test]
    async fn test_handle_rebuild() {
        let (handle, _task, loader) = spawn().await;

        handle
            .rebuild(Arc::new(loader.clone()), 1, 0.6, 1)
            .await
            .unwrap();

        assert_eq!(handle.status().await.unwrap().t_index_list, vec![30]);
    }

    #[tokio::test]
    async fn test_shutdown_returns_pipeline() {
        let (handle, task, _loader) = spawn().await;

        handle.shutdown().await.unwrap();
        let pipeline = task.await.unwrap();

        assert_eq!(pipeline.status().lora_phase, LoraPhase::LoadedSwappable);
        assert!(matches!(
            handle.status().await,
            Err(PipelineError::Closed)
        ));
    }
}
