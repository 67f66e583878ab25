use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Upstream tokenization or packing corruption. Never repaired.
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("padding sample index rejected by dataset '{dataset}'")]
    PaddingIndexRejected { dataset: String },

    #[error("trainer state diverged: rank {rank} loaded {local:?} but rank 0 holds {reference:?}")]
    DistributedStateMismatch { rank: usize, local: Vec<u64>, reference: Vec<u64> },

    #[error("collective operation failed: {0}")]
    Collective(String),

    #[error("model error: {0}")]
    Model(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    /// Errors that leave the fleet in a state no worker may continue from.
    pub fn is_fatal_for_fleet(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::DistributedStateMismatch { .. } | Self::Collective(_)
        )
    }
}
