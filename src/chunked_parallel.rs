use std::fs::File;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, info, trace};

use crate::compute::{process_chunk, ChunkStats};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::reader::{Chunk, ChunkReader};
use crate::store::{AggregateStore, Snapshot};

/// Counters for one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub chunks: u64,
    pub bytes: u64,
    pub records: u64,
    pub skipped: u64,
    pub keys: u64,
    pub buffers_allocated: u64,
    pub elapsed: Duration,
}

impl RunStats {
    fn absorb(&mut self, stats: ChunkStats) {
        self.records += stats.records;
        self.skipped += stats.skipped;
    }
}

/// The finalized result of a successful run.
#[derive(Debug)]
pub struct Outcome {
    pub snapshot: Snapshot,
    pub stats: RunStats,
}

/// Opens `config.input` and aggregates it.
pub fn run(config: &Config) -> Result<Outcome> {
    config.validate()?;
    let input = File::open(&config.input).map_err(|source| Error::Open {
        path: config.input.clone(),
        source,
    })?;
    info!(
        input = %config.input.display(),
        chunk_size = config.chunk_size,
        workers = config.workers,
        "aggregating"
    );
    aggregate(input, config)
}

/// Aggregates everything `input` yields, using the sizing and policy from
/// `config` (its `input` path is not consulted).
///
/// The calling thread reads and dispatches chunks; `config.workers` threads
/// parse them into a shared store. Once the input is exhausted the queue is
/// closed, the workers drain it and are joined, and only then is the store
/// turned into a snapshot. The first failure anywhere stops every thread and
/// is returned; no partial result escapes.
pub fn aggregate<R: Read>(input: R, config: &Config) -> Result<Outcome> {
    config.validate()?;
    let begin = Instant::now();

    let store = AggregateStore::new(config.shards);
    let abort = AtomicBool::new(false);

    // chunks flow reader -> workers. the bound is what blocks the reader when
    // every worker is busy, so at most `queue_depth` chunks wait in memory.
    let (tx, rx) = channel::bounded::<Chunk>(config.queue_depth);
    // emptied buffers flow back so the reader can refill them
    let (buf_tx, buf_rx) = channel::bounded::<Vec<u8>>(config.workers + config.queue_depth);

    let mut reader = ChunkReader::new(input, config.chunk_size).with_recycler(buf_rx);
    let mut stats = RunStats::default();

    let (read_result, worker_results) = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(config.workers);
        let mut spawn_error = None;
        for worker in 0..config.workers {
            let rx = rx.clone();
            let buf_tx = buf_tx.clone();
            let store = &store;
            let abort = &abort;
            let spawned = thread::Builder::new()
                .name(format!("worker-{worker}"))
                .spawn_scoped(scope, move || {
                    work(worker, rx, buf_tx, store, abort, config)
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    spawn_error = Some(Error::Spawn { worker, source });
                    break;
                }
            }
        }
        // workers hold their own clones; ours would keep the channels open
        drop(rx);
        drop(buf_tx);

        let read_result = match spawn_error {
            Some(err) => Err(err),
            None => distribute(&mut reader, &tx, &abort, &mut stats),
        };
        if read_result.is_err() {
            abort.store(true, Ordering::Relaxed);
        }

        // closing the queue is what lets the workers' recv loops end. it has
        // to happen before the joins below or they would wait forever.
        drop(tx);

        let worker_results = handles
            .into_iter()
            .enumerate()
            .map(|(worker, handle)| {
                handle
                    .join()
                    .unwrap_or(Err(Error::WorkerPanicked { worker }))
            })
            .collect::<Vec<_>>();
        (read_result, worker_results)
    });

    read_result?;
    for result in worker_results {
        stats.absorb(result?);
    }

    let snapshot = store.into_snapshot();
    stats.keys = snapshot.len() as u64;
    stats.buffers_allocated = reader.allocations();
    stats.elapsed = begin.elapsed();

    info!(
        chunks = stats.chunks,
        bytes = stats.bytes,
        records = stats.records,
        skipped = stats.skipped,
        keys = stats.keys,
        buffers_allocated = stats.buffers_allocated,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        "aggregation finished"
    );
    Ok(Outcome { snapshot, stats })
}

/// Producer side: read chunks and hand them to the pool until the input is
/// exhausted or someone aborts.
fn distribute<R: Read>(
    reader: &mut ChunkReader<R>,
    tx: &Sender<Chunk>,
    abort: &AtomicBool,
    stats: &mut RunStats,
) -> Result<()> {
    while !abort.load(Ordering::Relaxed) {
        let Some(chunk) = reader.next_chunk().map_err(Error::Read)? else {
            break;
        };
        trace!(
            index = chunk.index,
            offset = chunk.offset,
            len = chunk.bytes.len(),
            "dispatching chunk"
        );
        stats.chunks += 1;
        stats.bytes += chunk.bytes.len() as u64;
        // a send only fails once every worker has hung up, which they only do
        // after a failure of their own. that failure is reported by the join.
        if tx.send(chunk).is_err() {
            break;
        }
    }
    Ok(())
}

/// Consumer side: drain the queue into the store.
fn work(
    worker: usize,
    rx: Receiver<Chunk>,
    buf_tx: Sender<Vec<u8>>,
    store: &AggregateStore,
    abort: &AtomicBool,
    config: &Config,
) -> Result<ChunkStats> {
    let _guard = AbortOnPanic(abort);
    let mut totals = ChunkStats::default();
    while let Ok(chunk) = rx.recv() {
        if abort.load(Ordering::Relaxed) {
            break;
        }
        let mut sink = store;
        match process_chunk(&chunk.bytes, chunk.offset, &mut sink, config.malformed) {
            Ok(stats) => totals += stats,
            Err(err) => {
                abort.store(true, Ordering::Relaxed);
                debug!(worker, %err, "worker aborting");
                return Err(err.into());
            }
        }
        buf_tx.try_send(chunk.bytes).ok();
    }
    debug!(worker, records = totals.records, "worker finished");
    Ok(totals)
}

/// Raises the abort flag if the owning thread unwinds, so a panicking worker
/// stops the run as promptly as a failing one.
struct AbortOnPanic<'a>(&'a AtomicBool);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{AggMap, Aggregate};
    use crate::config::MalformedPolicy;
    use crate::error::ParseError;
    use proptest::prelude::*;
    use std::io;

    const SAMPLE: &str = "A;10.0\nB;20.0\nA;30.0\n";

    fn config(chunk_size: usize, workers: usize) -> Config {
        Config::new("unused").chunk_size(chunk_size).workers(workers)
    }

    fn reference(input: &str) -> Snapshot {
        let mut map = AggMap::default();
        process_chunk(input.as_bytes(), 0, &mut map, MalformedPolicy::Abort).unwrap();
        Snapshot::from(map)
    }

    fn assert_close(a: &Snapshot, b: &Snapshot) {
        assert_eq!(a.len(), b.len());
        for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
            assert_eq!(ka, kb);
            assert_eq!(va.count, vb.count, "{ka}");
            assert_eq!(va.min, vb.min, "{ka}");
            assert_eq!(va.max, vb.max, "{ka}");
            assert!((va.mean - vb.mean).abs() < 1e-6, "{ka}: {} vs {}", va.mean, vb.mean);
        }
    }

    /// Fails every read after the first `ok` bytes.
    struct Flaky<'a> {
        data: &'a [u8],
        ok: usize,
    }

    impl Read for Flaky<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.ok == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk on fire"));
            }
            let n = buf.len().min(self.ok).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            self.ok -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_sample_with_every_chunk_size() {
        for chunk_size in 1..=SAMPLE.len() + 1 {
            for workers in [1, 3] {
                let outcome = aggregate(SAMPLE.as_bytes(), &config(chunk_size, workers)).unwrap();
                let snapshot = outcome.snapshot;
                assert_eq!(
                    snapshot.get("A"),
                    Some(&Aggregate {
                        count: 2,
                        min: 10.0,
                        max: 30.0,
                        mean: 20.0
                    })
                );
                assert_eq!(snapshot.get("B"), Some(&Aggregate::new(20.0)));
                assert_eq!(outcome.stats.records, 3);
                assert_eq!(outcome.stats.keys, 2);
            }
        }
    }

    #[test]
    fn test_rendezvous_queue() {
        let config = config(4, 2).queue_depth(0);
        let outcome = aggregate(SAMPLE.as_bytes(), &config).unwrap();
        assert_eq!(outcome.snapshot.total_count(), 3);
    }

    #[test]
    fn test_empty_input() {
        let outcome = aggregate(&b""[..], &config(16, 2)).unwrap();
        assert!(outcome.snapshot.is_empty());
        assert_eq!(outcome.stats.chunks, 0);
    }

    #[test]
    fn test_trailing_blank_line_is_tolerated() {
        let outcome = aggregate(&b"A;1.0\nB;2.0\n\n"[..], &config(5, 2)).unwrap();
        assert_eq!(outcome.snapshot.total_count(), 2);
    }

    #[test]
    fn test_unparseable_value_fails_the_run() {
        let mut input = String::new();
        for i in 0..1000 {
            input.push_str(&format!("k{};{}.5\n", i % 7, i));
        }
        input.push_str("bad;twelve\n");
        for i in 0..1000 {
            input.push_str(&format!("k{};{}.5\n", i % 7, i));
        }

        let err = aggregate(input.as_bytes(), &config(64, 4)).unwrap_err();
        match err {
            Error::Parse(ParseError { key, value, .. }) => {
                assert_eq!(key, "bad");
                assert_eq!(value, "twelve");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_skip_policy_keeps_going() {
        let input = "A;1.0\nB;nope\nA;3.0\n";
        let config = config(4, 2).malformed(MalformedPolicy::Skip);
        let outcome = aggregate(input.as_bytes(), &config).unwrap();
        assert_eq!(outcome.stats.skipped, 1);
        assert_eq!(outcome.snapshot.total_count(), 2);
        assert_eq!(outcome.snapshot.get("B"), None);
    }

    #[test]
    fn test_read_error_fails_the_run() {
        let input = SAMPLE.repeat(100);
        let reader = Flaky {
            data: input.as_bytes(),
            ok: 50,
        };
        let err = aggregate(reader, &config(16, 2)).unwrap_err();
        assert!(matches!(err, Error::Read(_)), "{err:?}");
    }

    #[test]
    fn test_panicking_thread_raises_abort() {
        let abort = AtomicBool::new(false);
        let panicked = thread::scope(|s| {
            s.spawn(|| {
                let _guard = AbortOnPanic(&abort);
                panic!("worker blew up");
            })
            .join()
            .is_err()
        });
        assert!(panicked);
        assert!(abort.load(Ordering::Relaxed));

        let calm = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                let _guard = AbortOnPanic(&calm);
            });
        });
        assert!(!calm.load(Ordering::Relaxed));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = aggregate(SAMPLE.as_bytes(), &config(0, 2)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_input_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path().join("nope.txt"));
        assert!(matches!(run(&config), Err(Error::Open { .. })));
    }

    #[test]
    fn test_run_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("measurements.txt");
        std::fs::write(&path, "Zürich;-1.5\nZürich;2.5\nOslo;0.0").unwrap();
        let outcome = run(&Config::new(&path).chunk_size(7).workers(2)).unwrap();
        assert_eq!(
            outcome.snapshot.get("Zürich"),
            Some(&Aggregate {
                count: 2,
                min: -1.5,
                max: 2.5,
                mean: 0.5
            })
        );
        assert_eq!(outcome.snapshot.get("Oslo"), Some(&Aggregate::new(0.0)));
    }

    #[test]
    fn test_hot_key_many_workers() {
        let input = "hot;1.0\nhot;3.0\n".repeat(5000);
        let outcome = aggregate(input.as_bytes(), &config(256, 8).shards(1)).unwrap();
        let hot = outcome.snapshot.get("hot").unwrap();
        assert_eq!(hot.count, 10_000);
        assert!((hot.mean - 2.0).abs() < 1e-9);
    }

    fn records() -> impl Strategy<Value = Vec<(String, f32)>> {
        let key = prop::sample::select(vec!["Abha", "Bālgudar", "Cúcuta", "Dodoma", "Ürümqi", ""]);
        let value = (-999i32..=999).prop_map(|v| v as f32 / 10.0);
        prop::collection::vec((key.prop_map(String::from), value), 1..200)
    }

    fn render(records: &[(String, f32)], trailing_newline: bool) -> String {
        let mut out = records
            .iter()
            .map(|(k, v)| format!("{k};{v:.1}"))
            .collect::<Vec<_>>()
            .join("\n");
        if trailing_newline {
            out.push('\n');
        }
        out
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_chunking_does_not_change_results(
            records in records(),
            chunk_size in 1usize..64,
            workers in 1usize..6,
            trailing_newline in any::<bool>(),
        ) {
            let input = render(&records, trailing_newline);
            let expected = reference(&input);
            let outcome = aggregate(input.as_bytes(), &config(chunk_size, workers)).unwrap();

            prop_assert_eq!(outcome.stats.records, records.len() as u64);
            prop_assert_eq!(outcome.snapshot.total_count(), records.len() as u64);
            assert_close(&outcome.snapshot, &expected);
            for (_, agg) in outcome.snapshot.iter() {
                prop_assert!(agg.min as f64 <= agg.mean + 1e-4);
                prop_assert!(agg.mean <= agg.max as f64 + 1e-4);
            }
        }
    }
}
