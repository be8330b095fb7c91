use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ring capacity must be a non-zero power of two, got {0}")]
    InvalidCapacity(usize),
    #[error("invalid consumer layout: {0}")]
    InvalidLayout(String),
    #[error("single producer already taken")]
    ProducerTaken,
    #[error("ring buffer halted")]
    Halted,
    #[error("latency histogram: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("stage thread failed: {0}")]
    Stage(String),
}

pub type Result<T> = std::result::Result<T, Error>;
