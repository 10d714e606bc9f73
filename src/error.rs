use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A record whose value field could not be read as a number.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("unparseable value {value:?} for key {key:?} at byte {offset}")]
pub struct ParseError {
    /// Byte offset of the start of the offending record in the input.
    pub offset: u64,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("chunk size must be at least one byte")]
    ZeroChunkSize,
    #[error("worker count must be at least one")]
    ZeroWorkers,
    #[error("shard count must be at least one")]
    ZeroShards,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open input {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read input")]
    Read(#[source] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn worker {worker}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {worker} panicked")]
    WorkerPanicked { worker: usize },

    #[error("failed to serialize results")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write output {path:?}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
