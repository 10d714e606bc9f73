use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// 32 MiB read windows.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 25;

/// What to do with a record whose value is not a number.
///
/// Blank lines are never treated as malformed; they are skipped under either
/// policy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Fail the whole run on the first malformed record.
    #[default]
    Abort,
    /// Drop the record, count it, and keep going.
    Skip,
}

/// Which of the two bundled datasets to read.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Dataset {
    #[default]
    Small,
    Full,
}

impl Dataset {
    pub fn input_file_name(self) -> &'static str {
        match self {
            Dataset::Small => "measurements_small.txt",
            Dataset::Full => "measurements.txt",
        }
    }

    pub fn output_file_name(self) -> String {
        format!("output_{self}.json")
    }

    pub fn input_path(self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.input_file_name())
    }

    pub fn output_path(self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.output_file_name())
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dataset::Small => "small",
            Dataset::Full => "full",
        })
    }
}

/// Everything a run needs to know. Nothing here is global: tests build a
/// config per input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub input: PathBuf,
    pub chunk_size: usize,
    pub workers: usize,
    pub queue_depth: usize,
    pub shards: usize,
    pub malformed: MalformedPolicy,
}

impl Config {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            input: input.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers,
            queue_depth: workers,
            shards: default_shards(workers),
            malformed: MalformedPolicy::default(),
        }
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the pool size. Queue depth and shard count follow unless set
    /// explicitly afterwards.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self.queue_depth = workers;
        self.shards = default_shards(workers);
        self
    }

    pub fn queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    pub fn malformed(mut self, malformed: MalformedPolicy) -> Self {
        self.malformed = malformed;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.shards == 0 {
            return Err(ConfigError::ZeroShards);
        }
        Ok(())
    }
}

/// A few shards per worker keeps two workers hitting the same lock unlikely
/// unless they are updating the same key.
pub fn default_shards(workers: usize) -> usize {
    (workers.max(1) * 4).next_power_of_two()
}
