use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use station_stats::{output, run, Config, Dataset, MalformedPolicy};

#[derive(Debug, Parser)]
#[command(version, about = "Per-station min/mean/max over a measurements file")]
struct Cli {
    /// Which bundled dataset to read.
    #[arg(long, value_enum, default_value_t = Dataset::Small)]
    dataset: Dataset,

    /// Directory holding the datasets and the results.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Read this file instead of the selected dataset.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Read window in bytes.
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Worker threads. Defaults to the available parallelism.
    #[arg(long)]
    workers: Option<usize>,

    /// Chunks allowed to wait for a worker. 0 makes every hand-off a rendezvous.
    #[arg(long)]
    queue_depth: Option<usize>,

    /// Drop records with an unparseable value instead of failing the run.
    #[arg(long)]
    skip_malformed: bool,

    /// -v for debug, -vv for trace.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn config(&self) -> Config {
        let input = self
            .input
            .clone()
            .unwrap_or_else(|| self.dataset.input_path(&self.data_dir));
        let mut config = Config::new(input);
        if let Some(workers) = self.workers {
            config = config.workers(workers);
        }
        if let Some(chunk_size) = self.chunk_size {
            config = config.chunk_size(chunk_size);
        }
        if let Some(queue_depth) = self.queue_depth {
            config = config.queue_depth(queue_depth);
        }
        if self.skip_malformed {
            config = config.malformed(MalformedPolicy::Skip);
        }
        config
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_thread_names(cli.verbose >= 1)
        .init();

    let config = cli.config();
    let destination = cli.dataset.output_path(&cli.data_dir);

    let outcome = run(&config)
        .with_context(|| format!("aggregating {}", config.input.display()))?;
    output::write_json(&outcome.snapshot, &destination)
        .with_context(|| format!("writing {}", destination.display()))?;

    let records = outcome.stats.records.max(1) as f64;
    info!(
        output = %destination.display(),
        elapsed_ms = outcome.stats.elapsed.as_millis() as u64,
        "billion-row estimate: {:.1}s",
        outcome.stats.elapsed.as_secs_f64() * (1_000_000_000. / records)
    );
    Ok(())
}
