use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to serialize object: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("image cache {0} no longer exists in the local store")]
    ImageCacheGone(String),

    #[error("previous revision of image cache {0} not found")]
    OldImageCacheNotFound(String),

    #[error("local caches failed to synchronize")]
    CacheSyncFailed,

    #[error("controller is already running")]
    AlreadyRunning,
}
