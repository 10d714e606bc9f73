use std::borrow::Cow;
use std::ops::AddAssign;

use rustc_hash::FxHashMap;
use serde::{Serialize, Serializer};
use smol_str::SmolStr;

use crate::config::MalformedPolicy;
use crate::error::ParseError;

pub type StrImpl = SmolStr;
pub type AggMap = FxHashMap<StrImpl, Aggregate>;

pub const DELIMITER: u8 = b';';
pub const TERMINATOR: u8 = b'\n';

/// Running statistics for one key.
///
/// `count` is always at least one: an aggregate only comes into existence
/// from an observation. The mean is carried in `f64` so that it stays accurate
/// over billions of `f32` observations. It is written out at `f32` precision
/// like `min` and `max`, so a serialized mean never lands outside them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Aggregate {
    pub count: u64,
    pub min: f32,
    pub max: f32,
    #[serde(serialize_with = "serialize_as_f32")]
    pub mean: f64,
}

fn serialize_as_f32<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f32(*value as f32)
}

impl Aggregate {
    /// A one-count aggregate for a single observation.
    #[inline]
    pub fn new(value: f32) -> Self {
        Self {
            count: 1,
            min: value,
            max: value,
            mean: value as f64,
        }
    }

    #[inline]
    pub fn insert(&mut self, value: f32) {
        self.merge(Aggregate::new(value));
    }

    /// Folds `other` into `self`.
    ///
    /// The mean update is the count-weighted average of both means, written
    /// as a delta so the intermediate `mean * count` products never appear.
    #[inline]
    pub fn merge(&mut self, other: Aggregate) {
        let count = self.count + other.count;
        self.mean += (other.mean - self.mean) * (other.count as f64 / count as f64);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count = count;
    }
}

/// Merges two aggregates into a new one. Commutative, and associative within
/// floating-point tolerance.
#[inline]
pub fn combine(mut a: Aggregate, b: Aggregate) -> Aggregate {
    a.merge(b);
    a
}

/// Anything a parsed record can be folded into.
pub trait Fold {
    fn fold(&mut self, key: &str, value: f32);
}

impl Fold for AggMap {
    #[inline]
    fn fold(&mut self, key: &str, value: f32) {
        // look up by &str first so a hit never allocates a key
        if let Some(agg) = self.get_mut(key) {
            agg.insert(value);
            return;
        }
        self.insert(StrImpl::new(key), Aggregate::new(value));
    }
}

/// What one call to [`process_chunk`] saw.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStats {
    pub records: u64,
    pub skipped: u64,
    pub blank: u64,
}

impl AddAssign for ChunkStats {
    fn add_assign(&mut self, other: ChunkStats) {
        self.records += other.records;
        self.skipped += other.skipped;
        self.blank += other.blank;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingKey,
    ReadingValue { delimiter: usize },
}

impl State {
    fn delimiter_in_line(self, line_start: usize) -> Option<usize> {
        match self {
            State::ReadingKey => None,
            State::ReadingValue { delimiter } => Some(delimiter - line_start),
        }
    }
}

/// Scans `chunk` record by record and folds every record into `sink` as soon
/// as its terminator is seen.
///
/// The end of the slice acts as a terminator, so a final record without a
/// trailing newline is still picked up. `offset` is the position of
/// `chunk[0]` in the input and only feeds error messages.
///
/// `;` and `\n` are ASCII and can never occur inside a multi-byte UTF-8
/// sequence, so scanning bytes splits records exactly where scanning decoded
/// characters would. Keys are decoded when a record is flushed.
///
/// Only the first `;` of a line separates key from value. Any later `;` is
/// kept as part of the value, so `A;1;2` is a malformed record (handled per
/// `policy`) rather than being read as `A;12`.
pub fn process_chunk<F: Fold + ?Sized>(
    chunk: &[u8],
    offset: u64,
    sink: &mut F,
    policy: MalformedPolicy,
) -> Result<ChunkStats, ParseError> {
    let mut stats = ChunkStats::default();
    let mut state = State::ReadingKey;
    let mut line_start = 0;

    for (i, &c) in chunk.iter().enumerate() {
        match (state, c) {
            (_, TERMINATOR) => {
                let line = Line {
                    bytes: &chunk[line_start..i],
                    delimiter: state.delimiter_in_line(line_start),
                    offset: offset + line_start as u64,
                };
                line.flush(sink, policy, &mut stats)?;
                line_start = i + 1;
                state = State::ReadingKey;
            }
            (State::ReadingKey, DELIMITER) => {
                state = State::ReadingValue { delimiter: i };
            }
            _ => {}
        }
    }

    if line_start < chunk.len() {
        let line = Line {
            bytes: &chunk[line_start..],
            delimiter: state.delimiter_in_line(line_start),
            offset: offset + line_start as u64,
        };
        line.flush(sink, policy, &mut stats)?;
    }

    Ok(stats)
}

struct Line<'a> {
    bytes: &'a [u8],
    delimiter: Option<usize>,
    offset: u64,
}

impl Line<'_> {
    fn flush<F: Fold + ?Sized>(
        &self,
        sink: &mut F,
        policy: MalformedPolicy,
        stats: &mut ChunkStats,
    ) -> Result<(), ParseError> {
        // tolerate CRLF line endings
        let bytes = self.bytes.strip_suffix(b"\r").unwrap_or(self.bytes);
        let (key, value) = match self.delimiter {
            Some(d) if d < bytes.len() => (&bytes[..d], &bytes[d + 1..]),
            _ => (bytes, &[][..]),
        };

        if let Some(value) = parse_value(value) {
            sink.fold(&String::from_utf8_lossy(key), value);
            stats.records += 1;
            return Ok(());
        }

        if key.is_empty() {
            stats.blank += 1;
            return Ok(());
        }

        let err = ParseError {
            offset: self.offset,
            key: String::from_utf8_lossy(key).into_owned(),
            value: String::from_utf8_lossy(value).into_owned(),
        };
        match policy {
            MalformedPolicy::Abort => Err(err),
            MalformedPolicy::Skip => {
                tracing::warn!(%err, "skipping malformed record");
                stats.skipped += 1;
                Ok(())
            }
        }
    }
}

/// Reads a decimal value. Non-finite results are rejected, since a single
/// `inf` or `NaN` would poison every statistic of its key.
pub fn parse_value(raw: &[u8]) -> Option<f32> {
    let text: Cow<str> = String::from_utf8_lossy(raw);
    text.parse::<f32>().ok().filter(|v| v.is_finite())
}
