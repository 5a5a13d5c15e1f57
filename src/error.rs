use thiserror::Error;

#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("unknown balancing algorithm '{0}'")]
    UnknownAlgorithm(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("subscription to '{0}' closed")]
    Closed(String),

    #[error("failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),
}
