//! Concurrent interning maps. These are the only shared mutable structures
//! that multiple phases write to from worker threads. Each map is sharded by
//! key hash; a shard owns both the key index and the interned values, so an
//! insert takes exactly one shard lock. Ids remain valid after the map is
//! frozen into its read-only form.

use std::hash::BuildHasher;
use std::hash::Hash;
use std::sync::Mutex;

const SHARD_BITS: u32 = 4;
pub(crate) const NUM_SHARDS: usize = 1 << SHARD_BITS;

/// Identifies a value interned in a `ConcurrentMap` or its frozen form.
/// The shard number lives in the top bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub(crate) struct MapId(u32);

impl MapId {
    fn new(shard: usize, index: usize) -> MapId {
        debug_assert!(index < (1 << (32 - SHARD_BITS)));
        MapId(((shard as u32) << (32 - SHARD_BITS)) | index as u32)
    }

    fn shard(self) -> usize {
        (self.0 >> (32 - SHARD_BITS)) as usize
    }

    fn index(self) -> usize {
        (self.0 & ((1 << (32 - SHARD_BITS)) - 1)) as usize
    }
}

pub(crate) struct ConcurrentMap<K, V> {
    shards: Vec<Mutex<Shard<K, V>>>,
}

struct Shard<K, V> {
    indices: hashbrown::HashMap<K, u32, foldhash::fast::FixedState>,
    values: Vec<V>,
}

impl<K: Eq + Hash + Copy, V> ConcurrentMap<K, V> {
    pub(crate) fn new() -> ConcurrentMap<K, V> {
        ConcurrentMap {
            shards: (0..NUM_SHARDS)
                .map(|_| {
                    Mutex::new(Shard {
                        indices: hashbrown::HashMap::default(),
                        values: Vec::new(),
                    })
                })
                .collect(),
        }
    }

    /// Insert-or-get. If `key` is new, `make` produces the value to intern,
    /// otherwise `merge` is applied to the existing value.
    pub(crate) fn insert_with(
        &self,
        key: K,
        make: impl FnOnce() -> V,
        merge: impl FnOnce(&mut V),
    ) -> MapId {
        let shard_num = shard_for(&key);
        let mut shard = self.shards[shard_num].lock().unwrap();
        match shard.indices.get(&key) {
            Some(&index) => {
                let index = index as usize;
                merge(&mut shard.values[index]);
                MapId::new(shard_num, index)
            }
            None => {
                let index = shard.values.len();
                shard.values.push(make());
                shard.indices.insert(key, index as u32);
                MapId::new(shard_num, index)
            }
        }
    }

    /// Consumes the map, producing a form that can be indexed without taking
    /// locks. Call this once the phase doing the interning has joined.
    pub(crate) fn freeze(self) -> FrozenMap<V> {
        FrozenMap {
            shards: self
                .shards
                .into_iter()
                .map(|shard| shard.into_inner().unwrap().values)
                .collect(),
        }
    }
}

fn shard_for<K: Hash>(key: &K) -> usize {
    (foldhash::fast::FixedState::default().hash_one(key) as usize) & (NUM_SHARDS - 1)
}

pub(crate) struct FrozenMap<V> {
    shards: Vec<Vec<V>>,
}

impl<V> FrozenMap<V> {
    pub(crate) fn get(&self, id: MapId) -> &V {
        &self.shards[id.shard()][id.index()]
    }

    pub(crate) fn get_mut(&mut self, id: MapId) -> &mut V {
        &mut self.shards[id.shard()][id.index()]
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(Vec::len).sum()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (MapId, &V)> {
        self.shards.iter().enumerate().flat_map(|(s, values)| {
            values
                .iter()
                .enumerate()
                .map(move |(i, v)| (MapId::new(s, i), v))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::ConcurrentMap;

    #[test]
    fn insert_or_get_returns_stable_ids() {
        let map = ConcurrentMap::new();
        let a = map.insert_with(b"foo".as_slice(), || 1u32, |_| {});
        let b = map.insert_with(b"foo".as_slice(), || 2u32, |v| *v += 10);
        let c = map.insert_with(b"bar".as_slice(), || 3u32, |_| {});
        assert_eq!(a, b);
        assert_ne!(a, c);
        let frozen = map.freeze();
        assert_eq!(*frozen.get(a), 11);
        assert_eq!(*frozen.get(c), 3);
        assert_eq!(frozen.len(), 2);
    }
}
