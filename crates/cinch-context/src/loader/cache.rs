//! Content cache for the loader.
//!
//! Entries are keyed by URI and hold either a whole file or a sparse set of
//! chunks. Expiry is checked lazily on lookup against the loader's
//! [`Clock`](crate::clock::Clock): a whole file expires with its entry, a
//! chunk expires on its own. Total size is bounded in bytes: inserting past
//! the ceiling evicts the entry created longest ago until the new entry fits.
//! Items larger than the whole ceiling are never cached.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone)]
pub(crate) enum CachedContent {
    Whole(Arc<[u8]>),
    Chunked {
        total_size: u64,
        chunk_size: u64,
        chunks: BTreeMap<usize, CachedChunk>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct CachedChunk {
    data: Arc<[u8]>,
    loaded_at: Instant,
}

#[derive(Debug)]
struct CacheEntry {
    content: CachedContent,
    /// When the entry was created. Chunks carry their own load times.
    loaded_at: Instant,
    bytes: usize,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Byte- and TTL-bounded cache of loaded content.
#[derive(Debug)]
pub(crate) struct ContentCache {
    entries: HashMap<String, CacheEntry>,
    max_bytes: usize,
    ttl: Duration,
    total_bytes: usize,
    hits: u64,
    misses: u64,
}

impl ContentCache {
    pub(crate) fn new(max_bytes: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_bytes,
            ttl,
            total_bytes: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Live entry for `uri`. Expired chunks are dropped first, and so is
    /// the entry once it is expired or has no chunks left.
    fn live(&mut self, uri: &str, now: Instant) -> Option<&CacheEntry> {
        let ttl = self.ttl;
        let expired = |loaded_at: Instant| now.saturating_duration_since(loaded_at) >= ttl;
        let mut freed = 0;
        let entry = self.entries.get_mut(uri)?;
        let dead = match &mut entry.content {
            CachedContent::Whole(_) => expired(entry.loaded_at),
            CachedContent::Chunked { chunks, .. } => {
                chunks.retain(|_, chunk| {
                    let keep = !expired(chunk.loaded_at);
                    if !keep {
                        freed += chunk.data.len();
                    }
                    keep
                });
                entry.bytes -= freed;
                chunks.is_empty()
            }
        };
        self.total_bytes -= freed;
        if freed > 0 {
            trace!(uri, bytes = freed, "expired chunks dropped");
        }
        if dead {
            trace!(uri, "cache entry expired");
            self.remove(uri);
            return None;
        }
        self.entries.get(uri)
    }

    /// Look up a whole-file entry.
    pub(crate) fn get_whole(&mut self, uri: &str, now: Instant) -> Option<Arc<[u8]>> {
        let found = match self.live(uri, now).map(|e| &e.content) {
            Some(CachedContent::Whole(data)) => Some(Arc::clone(data)),
            _ => None,
        };
        self.count(found.is_some());
        found
    }

    /// Look up chunks `indices` of a chunked entry. Returns `None` unless all
    /// of them are cached. Only a full match counts (as one hit); partial
    /// matches are counted by the per-chunk lookups that follow.
    pub(crate) fn peek_chunks(
        &mut self,
        uri: &str,
        indices: &[usize],
        now: Instant,
    ) -> Option<Vec<Arc<[u8]>>> {
        let found: Option<Vec<Arc<[u8]>>> = match self.live(uri, now).map(|e| &e.content) {
            Some(CachedContent::Chunked { chunks, .. }) => {
                indices
                    .iter()
                    .map(|i| chunks.get(i).map(|c| Arc::clone(&c.data)))
                    .collect()
            }
            _ => None,
        };
        if found.is_some() {
            self.hits += 1;
        }
        found
    }

    /// `(total_size, chunk_size)` of a live chunked entry.
    pub(crate) fn chunk_layout(&mut self, uri: &str, now: Instant) -> Option<(u64, u64)> {
        match self.live(uri, now).map(|e| &e.content) {
            Some(CachedContent::Chunked {
                total_size,
                chunk_size,
                ..
            }) => Some((*total_size, *chunk_size)),
            _ => None,
        }
    }

    /// Cached chunk, counted as a hit or a miss.
    pub(crate) fn get_chunk(
        &mut self,
        uri: &str,
        index: usize,
        now: Instant,
    ) -> Option<Arc<[u8]>> {
        let found = match self.live(uri, now).map(|e| &e.content) {
            Some(CachedContent::Chunked { chunks, .. }) => {
                chunks.get(&index).map(|c| Arc::clone(&c.data))
            }
            _ => None,
        };
        self.count(found.is_some());
        found
    }

    /// Live content of an entry without touching the counters, for status
    /// queries.
    pub(crate) fn content(&mut self, uri: &str, now: Instant) -> Option<&CachedContent> {
        self.live(uri, now).map(|e| &e.content)
    }

    pub(crate) fn insert_whole(&mut self, uri: &str, data: Arc<[u8]>, now: Instant) -> bool {
        let bytes = data.len();
        if bytes > self.max_bytes {
            trace!(uri, bytes, "too large to cache");
            return false;
        }
        self.remove(uri);
        self.make_room(bytes);
        self.entries.insert(
            uri.to_string(),
            CacheEntry {
                content: CachedContent::Whole(data),
                loaded_at: now,
                bytes,
            },
        );
        self.total_bytes += bytes;
        true
    }

    /// Add one chunk to a chunked entry, creating the entry if needed.
    pub(crate) fn insert_chunk(
        &mut self,
        uri: &str,
        total_size: u64,
        chunk_size: u64,
        index: usize,
        data: Arc<[u8]>,
        now: Instant,
    ) -> bool {
        let bytes = data.len();
        let layout_matches = self.entries.get(uri).map(|entry| match &entry.content {
            CachedContent::Chunked {
                total_size: t,
                chunk_size: c,
                ..
            } if *t == total_size && *c == chunk_size => Some(entry.bytes),
            _ => None,
        });
        let existing = match layout_matches {
            Some(Some(bytes)) => bytes,
            Some(None) => {
                self.remove(uri);
                0
            }
            None => 0,
        };
        if existing + bytes > self.max_bytes {
            trace!(uri, index, "chunk does not fit in cache");
            return false;
        }
        self.make_room_except(bytes, Some(uri));

        let entry = self.entries.entry(uri.to_string()).or_insert_with(|| CacheEntry {
            content: CachedContent::Chunked {
                total_size,
                chunk_size,
                chunks: BTreeMap::new(),
            },
            loaded_at: now,
            bytes: 0,
        });
        let chunk = CachedChunk {
            data,
            loaded_at: now,
        };
        if let CachedContent::Chunked { chunks, .. } = &mut entry.content
            && let Some(previous) = chunks.insert(index, chunk)
        {
            entry.bytes -= previous.data.len();
            self.total_bytes -= previous.data.len();
        }
        entry.bytes += bytes;
        self.total_bytes += bytes;
        true
    }

    pub(crate) fn remove(&mut self, uri: &str) -> bool {
        match self.entries.remove(uri) {
            Some(entry) => {
                self.total_bytes -= entry.bytes;
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    pub(crate) fn set_limits(&mut self, max_bytes: usize, ttl: Duration) {
        self.max_bytes = max_bytes;
        self.ttl = ttl;
        self.make_room(0);
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            bytes: self.total_bytes,
            max_bytes: self.max_bytes,
            hits: self.hits,
            misses: self.misses,
        }
    }

    fn count(&mut self, hit: bool) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }

    fn make_room(&mut self, incoming: usize) {
        self.make_room_except(incoming, None);
    }

    /// Evict oldest entries (by creation time) until `incoming` more bytes fit.
    fn make_room_except(&mut self, incoming: usize, keep: Option<&str>) {
        while self.total_bytes + incoming > self.max_bytes {
            let Some(oldest) = self
                .entries
                .iter()
                .filter(|(uri, _)| Some(uri.as_str()) != keep)
                .min_by_key(|(_, entry)| entry.loaded_at)
                .map(|(uri, _)| uri.clone())
            else {
                break;
            };
            trace!(uri = %oldest, "evicting cache entry");
            self.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(n: usize) -> Arc<[u8]> {
        vec![7u8; n].into()
    }

    #[test]
    fn whole_entries_hit_and_miss() {
        let mut cache = ContentCache::new(1024, Duration::from_secs(60));
        let now = Instant::now();
        assert!(cache.get_whole("a", now).is_none());
        cache.insert_whole("a", bytes(10), now);
        assert_eq!(cache.get_whole("a", now).unwrap().len(), 10);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut cache = ContentCache::new(1024, Duration::from_secs(300));
        let t0 = Instant::now();
        cache.insert_whole("a", bytes(10), t0);
        assert!(cache.get_whole("a", t0 + Duration::from_secs(299)).is_some());
        assert!(cache.get_whole("a", t0 + Duration::from_secs(300)).is_none());
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn byte_ceiling_evicts_oldest() {
        let mut cache = ContentCache::new(100, Duration::from_secs(60));
        let t0 = Instant::now();
        cache.insert_whole("old", bytes(40), t0);
        cache.insert_whole("mid", bytes(40), t0 + Duration::from_secs(1));
        cache.insert_whole("new", bytes(40), t0 + Duration::from_secs(2));
        let now = t0 + Duration::from_secs(3);
        assert!(cache.get_whole("old", now).is_none());
        assert!(cache.get_whole("mid", now).is_some());
        assert!(cache.get_whole("new", now).is_some());
        assert_eq!(cache.stats().bytes, 80);
    }

    #[test]
    fn oversized_items_are_not_cached() {
        let mut cache = ContentCache::new(100, Duration::from_secs(60));
        let now = Instant::now();
        cache.insert_whole("keep", bytes(50), now);
        assert!(!cache.insert_whole("huge", bytes(101), now));
        assert!(cache.get_whole("keep", now).is_some());
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn chunks_accumulate_in_one_entry() {
        let mut cache = ContentCache::new(1024, Duration::from_secs(60));
        let now = Instant::now();
        cache.insert_chunk("big", 1000, 100, 3, bytes(100), now);
        cache.insert_chunk("big", 1000, 100, 4, bytes(100), now);
        assert_eq!(cache.chunk_layout("big", now), Some((1000, 100)));
        assert!(cache.peek_chunks("big", &[3, 4], now).is_some());
        assert!(cache.peek_chunks("big", &[3, 5], now).is_none());
        assert!(cache.get_chunk("big", 5, now).is_none());
        assert_eq!(cache.stats().bytes, 200);

        // Re-inserting a chunk does not double count.
        cache.insert_chunk("big", 1000, 100, 3, bytes(100), now);
        assert_eq!(cache.stats().bytes, 200);
    }

    #[test]
    fn growing_chunk_entry_evicts_others_not_itself() {
        let mut cache = ContentCache::new(250, Duration::from_secs(60));
        let t0 = Instant::now();
        cache.insert_chunk("big", 1000, 100, 0, bytes(100), t0);
        cache.insert_whole("small", bytes(100), t0 + Duration::from_secs(1));
        cache.insert_chunk("big", 1000, 100, 1, bytes(100), t0 + Duration::from_secs(2));
        let now = t0 + Duration::from_secs(3);
        assert!(cache.get_whole("small", now).is_none());
        assert!(cache.peek_chunks("big", &[0, 1], now).is_some());
    }

    #[test]
    fn chunks_expire_individually() {
        let mut cache = ContentCache::new(1024, Duration::from_secs(30));
        let t0 = Instant::now();
        cache.insert_chunk("big", 1000, 100, 0, bytes(100), t0);
        cache.insert_chunk("big", 1000, 100, 1, bytes(100), t0 + Duration::from_secs(25));

        let later = t0 + Duration::from_secs(50);
        assert!(cache.get_chunk("big", 0, later).is_none());
        assert!(cache.get_chunk("big", 1, later).is_some());
        assert_eq!(cache.stats().bytes, 100);
        match cache.content("big", later) {
            Some(CachedContent::Chunked { chunks, .. }) => {
                assert_eq!(chunks.keys().copied().collect::<Vec<_>>(), vec![1]);
            }
            other => panic!("unexpected content: {other:?}"),
        }

        assert!(cache.get_chunk("big", 1, t0 + Duration::from_secs(55)).is_none());
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn late_chunks_keep_entry_age_for_eviction() {
        let mut cache = ContentCache::new(250, Duration::from_secs(60));
        let t0 = Instant::now();
        cache.insert_chunk("big", 1000, 100, 0, bytes(50), t0);
        cache.insert_whole("small", bytes(100), t0 + Duration::from_secs(1));
        cache.insert_chunk("big", 1000, 100, 1, bytes(50), t0 + Duration::from_secs(2));
        cache.insert_whole("new", bytes(100), t0 + Duration::from_secs(3));

        let now = t0 + Duration::from_secs(4);
        assert!(cache.chunk_layout("big", now).is_none());
        assert!(cache.get_whole("small", now).is_some());
        assert!(cache.get_whole("new", now).is_some());
    }

    #[test]
    fn remove_and_clear_reset_bytes() {
        let mut cache = ContentCache::new(1024, Duration::from_secs(60));
        let now = Instant::now();
        cache.insert_whole("a", bytes(10), now);
        cache.insert_whole("b", bytes(20), now);
        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert_eq!(cache.stats().bytes, 20);
        cache.clear();
        assert_eq!(cache.stats().bytes, 0);
    }
}
