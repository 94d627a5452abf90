//! Process-wide LRU cache of decoded tile payloads, bounded by
//! `sm.tile_cache_size` bytes. Strict LRU under a mutex; no priority.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::tile::Tile;

/// Cache key: the open fragment's unique generation id, the stream
/// index, and the tile rank.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TileKey {
    pub fragment_uid: u64,
    pub stream: usize,
    pub rank: u64,
}

struct Inner {
    entries: LruCache<TileKey, Arc<Tile>>,
    budget: usize,
    used: usize,
}

/// Decoded tiles shared across all readers of the process.
pub struct TileCache {
    inner: Option<Mutex<Inner>>,
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.inner.as_ref() {
            None => f.write_str("TileCache(disabled)"),
            Some(inner) => {
                let inner = inner.lock();
                f.debug_struct("TileCache")
                    .field("budget", &inner.budget)
                    .field("used", &inner.used)
                    .field("tiles", &inner.entries.len())
                    .finish()
            }
        }
    }
}

impl TileCache {
    /// A zero budget disables caching entirely.
    pub fn new(budget: u64) -> Self {
        let inner = (budget > 0).then(|| {
            Mutex::new(Inner {
                entries: LruCache::unbounded(),
                budget: budget as usize,
                used: 0,
            })
        });
        TileCache { inner }
    }

    pub fn get(&self, key: &TileKey) -> Option<Arc<Tile>> {
        let inner = self.inner.as_ref()?;
        inner.lock().entries.get(key).cloned()
    }

    pub fn insert(&self, key: TileKey, tile: Arc<Tile>) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let mut inner = inner.lock();
        let size = tile_weight(&tile);
        if size > inner.budget {
            return;
        }
        if let Some(old) = inner.entries.put(key, tile) {
            inner.used -= tile_weight(&old);
        }
        inner.used += size;
        while inner.used > inner.budget {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.used -= tile_weight(&evicted);
                }
                None => break,
            }
        }
    }

    /// Drops every cached tile of a closed fragment.
    pub fn evict_fragment(&self, fragment_uid: u64) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let mut inner = inner.lock();
        let stale: Vec<TileKey> = inner
            .entries
            .iter()
            .filter(|(k, _)| k.fragment_uid == fragment_uid)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some(tile) = inner.entries.pop(&key) {
                inner.used -= tile_weight(&tile);
            }
        }
    }

    #[cfg(test)]
    fn used(&self) -> usize {
        self.inner.as_ref().map(|i| i.lock().used).unwrap_or(0)
    }
}

fn tile_weight(tile: &Tile) -> usize {
    tile.payload_size()
        + tile.var_offsets().len() * std::mem::size_of::<u64>()
        + tile.validity().len()
}

#[cfg(test)]
mod tests {
    use tiledb_common::datatype::Datatype;

    use super::*;
    use crate::schema::CellSize;
    use crate::tile::TileType;

    fn tile_of(bytes: usize) -> Arc<Tile> {
        Arc::new(
            Tile::from_payload(
                TileType::Attribute,
                Datatype::UInt8,
                0,
                0,
                CellSize::Fixed(1),
                vec![0u8; bytes],
                Vec::new(),
                Vec::new(),
            )
            .unwrap(),
        )
    }

    fn key(rank: u64) -> TileKey {
        TileKey {
            fragment_uid: 1,
            stream: 0,
            rank,
        }
    }

    #[test]
    fn disabled_when_budget_zero() {
        let cache = TileCache::new(0);
        cache.insert(key(0), tile_of(10));
        assert!(cache.get(&key(0)).is_none());
    }

    #[test]
    fn lru_eviction_under_budget() {
        let cache = TileCache::new(100);
        cache.insert(key(0), tile_of(40));
        cache.insert(key(1), tile_of(40));
        // Touch rank 0 so rank 1 is the eviction victim
        assert!(cache.get(&key(0)).is_some());
        cache.insert(key(2), tile_of(40));

        assert!(cache.get(&key(0)).is_some());
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.get(&key(2)).is_some());
        assert!(cache.used() <= 100);
    }

    #[test]
    fn evict_fragment_drops_all_ranks() {
        let cache = TileCache::new(1000);
        cache.insert(key(0), tile_of(10));
        cache.insert(key(1), tile_of(10));
        cache.insert(
            TileKey {
                fragment_uid: 2,
                stream: 0,
                rank: 0,
            },
            tile_of(10),
        );

        cache.evict_fragment(1);
        assert!(cache.get(&key(0)).is_none());
        assert!(cache.get(&key(1)).is_none());
        assert!(cache
            .get(&TileKey {
                fragment_uid: 2,
                stream: 0,
                rank: 0
            })
            .is_some());
    }

    #[test]
    fn oversized_tile_bypasses_cache() {
        let cache = TileCache::new(16);
        cache.insert(key(0), tile_of(64));
        assert!(cache.get(&key(0)).is_none());
        assert_eq!(0, cache.used());
    }
}
