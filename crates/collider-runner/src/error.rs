use thiserror::Error;

pub type Result<T> = std::result::Result<T, ColliderError>;

#[derive(Debug, Error)]
pub enum ColliderError {
    #[error("config_error: {0}")]
    Config(String),

    #[error("cache_miss: no cached result for stage {stage} at {value}")]
    NotFound { stage: String, value: String },

    #[error("stage_failed: stage {stage} failed for job {index}: {source}")]
    StageFailed {
        stage: String,
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("worker_crashed: {0}")]
    WorkerCrashed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl ColliderError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
