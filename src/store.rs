use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use serde::Serialize;

use crate::compute::{AggMap, Aggregate, Fold, StrImpl};

/// Key → aggregate map shared by every worker of a run.
///
/// Keys are spread over a fixed set of lock-protected shards. An update looks
/// up and merges under the same shard lock, so concurrent updates to one key
/// are serialized and none of them is lost, while updates to keys in other
/// shards proceed in parallel.
pub struct AggregateStore {
    shards: Box<[CachePadded<Mutex<AggMap>>]>,
}

impl AggregateStore {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| CachePadded::new(Mutex::new(AggMap::default())))
            .collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard(&self, key: &str) -> &Mutex<AggMap> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        // the high bits of an Fx hash are the well-mixed ones
        let idx = (hasher.finish() >> 32) as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Merges `agg` into the aggregate stored for `key`, creating it if absent.
    pub fn update(&self, key: &str, agg: Aggregate) {
        let mut shard = self.shard(key).lock();
        match shard.get_mut(key) {
            Some(existing) => existing.merge(agg),
            None => {
                shard.insert(StrImpl::new(key), agg);
            }
        }
    }

    #[inline]
    pub fn update_value(&self, key: &str, value: f32) {
        self.update(key, Aggregate::new(value));
    }

    pub fn get(&self, key: &str) -> Option<Aggregate> {
        self.shard(key).lock().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }

    /// Consumes the store. Taking `self` by value means no worker can still
    /// hold a reference to it.
    pub fn into_snapshot(self) -> Snapshot {
        let mut entries = BTreeMap::new();
        for shard in self.shards.into_vec() {
            for (key, agg) in CachePadded::into_inner(shard).into_inner() {
                entries.insert(key.to_string(), agg);
            }
        }
        Snapshot { entries }
    }
}

impl Fold for &AggregateStore {
    #[inline]
    fn fold(&mut self, key: &str, value: f32) {
        self.update_value(key, value);
    }
}

/// Final, immutable result of a run, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    entries: BTreeMap<String, Aggregate>,
}

impl Snapshot {
    pub fn get(&self, key: &str) -> Option<&Aggregate> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Aggregate)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Sum of counts over every key, i.e. the number of records folded in.
    pub fn total_count(&self) -> u64 {
        self.entries.values().map(|a| a.count).sum()
    }

    pub fn as_map(&self) -> &BTreeMap<String, Aggregate> {
        &self.entries
    }

    pub fn into_map(self) -> BTreeMap<String, Aggregate> {
        self.entries
    }
}

impl From<AggMap> for Snapshot {
    fn from(map: AggMap) -> Self {
        Snapshot {
            entries: map.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }
}
