/// Errors reported by the pipeline core.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum PipelineError {
    /// A parameter is outside the range the pipeline can work with.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// The requested LoRA preset is not in the catalog.
    #[error("Unknown LoRA preset: {0}")]
    UnknownPreset(String),
    /// The LoRA reference could not be found locally and does not look like a hub id.
    #[error("LoRA not found: {0}")]
    LoraNotFound(String),
    /// The operation is not possible in the current state.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
    /// The engine reported a failure.
    #[error("Engine error: {0:#}")]
    Engine(anyhow::Error),
    /// The task owning the pipeline has stopped.
    #[error("Pipeline task is no longer running")]
    Closed,
}
