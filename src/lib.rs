//! Per-key count/min/max/mean over a `key;value` text file, computed in one
//! pass by a pool of worker threads.
//!
//! The calling thread reads the input in record-aligned chunks
//! ([`reader::ChunkReader`]) and feeds them through a bounded queue to the
//! workers, which parse each chunk ([`compute::process_chunk`]) straight into a
//! sharded, lock-per-shard map ([`store::AggregateStore`]). After the workers
//! have been joined the map is frozen into a sorted [`store::Snapshot`].
//!
//! ```no_run
//! use station_stats::{run, Config};
//!
//! let outcome = run(&Config::new("measurements.txt").workers(8))?;
//! for (station, agg) in outcome.snapshot.iter() {
//!     println!("{station}={:.1}/{:.1}/{:.1}", agg.min, agg.mean, agg.max);
//! }
//! # Ok::<(), station_stats::Error>(())
//! ```

pub mod chunked_parallel;
pub mod compute;
pub mod config;
pub mod error;
pub mod output;
pub mod reader;
pub mod store;

pub use chunked_parallel::{aggregate, run, Outcome, RunStats};
pub use compute::{combine, Aggregate};
pub use config::{Config, Dataset, MalformedPolicy};
pub use error::{ConfigError, Error, ParseError, Result};
pub use store::{AggregateStore, Snapshot};
