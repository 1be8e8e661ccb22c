//! Incremental loading of file content.
//!
//! The loader picks a strategy from the item's size:
//!
//! | Size                  | No range                   | With range                      |
//! |-----------------------|----------------------------|---------------------------------|
//! | `≤ max_full_load_size` | full read, cached         | lazy, or from a cached whole file |
//! | `≤ max_lazy_load_size` | lazy: first `max_full_load_size` bytes | lazy: only the range |
//! | larger                | chunked: chunk 0           | chunked: chunks covering it     |
//!
//! The defaults are 1 MiB and 10 MiB.
//!
//! Lazy loads are never cached as the whole file. Chunks are cached one by
//! one under the file's URI, so later requests only read what is missing.
//!
//! Every load runs in its own tokio task behind a [`LoadGate`]: at most
//! `max_concurrent_loads` reads are in flight and waiting requests are
//! admitted by [`LoadPriority`]. A caller that stops awaiting does not cancel
//! the read; its result still lands in the cache.

pub mod cache;
pub mod gate;
pub mod source;

pub use cache::CacheStats;
pub use gate::{LoadGate, LoadPriority, SlotGuard};
pub use source::{
    ContentSource, ContentStat, FsContentSource, InMemorySource, SourceFuture, SourceRead,
};

use crate::budget::estimate_tokens;
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, LoadError};
use crate::events::{ContextEvent, EventSink, NoopSink};
use cache::{CachedContent, ContentCache};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

// ── Configuration ──────────────────────────────────────────────────

/// Configuration for [`IncrementalLoader`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoaderConfig {
    /// Largest item loaded whole. Default: 1 MiB.
    pub max_full_load_size: u64,
    /// Largest item loaded lazily; anything bigger is chunked. Default: 10 MiB.
    pub max_lazy_load_size: u64,
    /// Default: 64 KiB.
    pub chunk_size: u64,
    /// Default: 5.
    pub max_concurrent_loads: usize,
    /// Default: 5 minutes.
    #[serde(with = "crate::config::duration_secs")]
    #[schemars(with = "f64")]
    pub cache_ttl: Duration,
    /// Default: 64 MiB.
    pub max_cache_bytes: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_full_load_size: MIB,
            max_lazy_load_size: 10 * MIB,
            chunk_size: 64 * KIB,
            max_concurrent_loads: 5,
            cache_ttl: Duration::from_secs(300),
            max_cache_bytes: (64 * MIB) as usize,
        }
    }
}

impl LoaderConfig {
    pub fn with_max_concurrent_loads(mut self, n: usize) -> Self {
        self.max_concurrent_loads = n;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_max_cache_bytes(mut self, bytes: usize) -> Self {
        self.max_cache_bytes = bytes;
        self
    }

    pub fn with_size_limits(mut self, max_full: u64, max_lazy: u64, chunk_size: u64) -> Self {
        self.max_full_load_size = max_full;
        self.max_lazy_load_size = max_lazy;
        self.chunk_size = chunk_size;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be positive".into());
        }
        if self.max_full_load_size > self.max_lazy_load_size {
            return Err("max_full_load_size must not exceed max_lazy_load_size".into());
        }
        if self.max_concurrent_loads == 0 {
            return Err("max_concurrent_loads must be positive".into());
        }
        Ok(())
    }

    /// Strategy for an item of `size` bytes.
    pub fn strategy_for(&self, size: u64, ranged: bool) -> LoadStrategy {
        if size > self.max_lazy_load_size {
            LoadStrategy::Chunked
        } else if ranged || size > self.max_full_load_size {
            LoadStrategy::Lazy
        } else {
            LoadStrategy::Full
        }
    }
}

// ── Requests and results ───────────────────────────────────────────

/// Half-open byte range `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How an item was loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    Full,
    Lazy,
    Chunked,
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStrategy::Full => write!(f, "full"),
            LoadStrategy::Lazy => write!(f, "lazy"),
            LoadStrategy::Chunked => write!(f, "chunked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub uri: String,
    pub priority: LoadPriority,
    pub range: Option<ByteRange>,
}

impl LoadRequest {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            priority: LoadPriority::Normal,
            range: None,
        }
    }

    pub fn with_priority(mut self, priority: LoadPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        self.range = Some(ByteRange::new(start, end));
        self
    }
}

/// Which chunks of a chunked item are cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkStatus {
    pub uri: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: usize,
    /// Sorted.
    pub loaded: Vec<usize>,
}

impl ChunkStatus {
    pub fn is_complete(&self) -> bool {
        self.loaded.len() == self.total_chunks
    }
}

/// Loaded bytes of an item. `content` is a shared, read-only view.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedFile {
    pub uri: String,
    pub total_size: u64,
    pub content: Arc<[u8]>,
    /// `None` when `content` is the whole item.
    pub loaded_range: Option<ByteRange>,
    pub strategy: LoadStrategy,
    pub chunks: Option<ChunkStatus>,
}

impl LoadedFile {
    pub fn is_partial(&self) -> bool {
        self.loaded_range.is_some()
    }

    /// Content as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.text())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadResult {
    pub file: LoadedFile,
    /// No read hit the source.
    pub from_cache: bool,
}

// ── Chunk arithmetic ───────────────────────────────────────────────

fn total_chunks(size: u64, chunk_size: u64) -> usize {
    size.div_ceil(chunk_size) as usize
}

fn chunk_bounds(index: usize, chunk_size: u64, size: u64) -> ByteRange {
    let start = index as u64 * chunk_size;
    ByteRange::new(start, (start + chunk_size).min(size))
}

/// Indices of the chunks overlapping a non-empty `range`.
fn chunk_span(range: ByteRange, chunk_size: u64) -> Vec<usize> {
    let first = (range.start / chunk_size) as usize;
    let last = ((range.end - 1) / chunk_size) as usize;
    (first..=last).collect()
}

/// Concatenate consecutive chunks starting at `first` and cut out `range`.
fn assemble(chunks: &[Arc<[u8]>], first: usize, chunk_size: u64, range: ByteRange) -> Arc<[u8]> {
    let base = first as u64 * chunk_size;
    let mut buf = Vec::with_capacity(range.len() as usize);
    for chunk in chunks {
        buf.extend_from_slice(chunk);
    }
    let end = ((range.end - base) as usize).min(buf.len());
    let start = ((range.start - base) as usize).min(end);
    buf.truncate(end);
    buf.drain(..start);
    buf.into()
}

fn check_range(uri: &str, range: ByteRange, size: u64) -> Result<(), LoadError> {
    if range.start >= range.end || range.end > size {
        return Err(LoadError::InvalidRange {
            uri: uri.to_string(),
            start: range.start,
            end: range.end,
            size,
        });
    }
    Ok(())
}

fn status_of(uri: &str, content: &CachedContent) -> Option<ChunkStatus> {
    match content {
        CachedContent::Chunked {
            total_size,
            chunk_size,
            chunks,
        } => Some(ChunkStatus {
            uri: uri.to_string(),
            total_size: *total_size,
            chunk_size: *chunk_size,
            total_chunks: total_chunks(*total_size, *chunk_size),
            loaded: chunks.keys().copied().collect(),
        }),
        CachedContent::Whole(_) => None,
    }
}

/// Run a load in its own task so an abandoned caller does not cancel it.
async fn detached<T, F>(uri: String, load: F) -> Result<T, LoadError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, LoadError>> + Send + 'static,
{
    tokio::spawn(load)
        .await
        .map_err(|e| LoadError::Interrupted {
            uri,
            reason: e.to_string(),
        })?
}

// ── Loader ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct Shared {
    source: Arc<dyn ContentSource>,
    cache: Arc<Mutex<ContentCache>>,
    gate: Arc<LoadGate>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl Shared {
    async fn stat(&self, uri: &str) -> Result<u64, LoadError> {
        self.source
            .stat(uri)
            .await
            .map(|s| s.size)
            .map_err(|e| LoadError::from_io(uri, e))
    }

    fn chunk_status(&self, uri: &str) -> Option<ChunkStatus> {
        let now = self.clock.now();
        let mut cache = crate::lock(&self.cache);
        cache.content(uri, now).and_then(|c| status_of(uri, c))
    }

    fn emit_loaded(&self, result: &LoadResult) {
        self.events.emit(&ContextEvent::FileLoaded {
            uri: result.file.uri.clone(),
            strategy: result.file.strategy,
            bytes: result.file.content.len(),
            from_cache: result.from_cache,
        });
    }

    /// Serve `request` from the cache alone, if possible.
    fn from_cache(&self, request: &LoadRequest) -> Result<Option<LoadResult>, LoadError> {
        let uri = request.uri.as_str();
        let now = self.clock.now();
        let mut cache = crate::lock(&self.cache);

        if let Some(data) = cache.get_whole(uri, now) {
            let total_size = data.len() as u64;
            let file = match request.range {
                None => LoadedFile {
                    uri: uri.to_string(),
                    total_size,
                    content: data,
                    loaded_range: None,
                    strategy: LoadStrategy::Full,
                    chunks: None,
                },
                Some(range) => {
                    check_range(uri, range, total_size)?;
                    let slice = data
                        .get(range.start as usize..range.end as usize)
                        .unwrap_or_default();
                    LoadedFile {
                        uri: uri.to_string(),
                        total_size,
                        content: slice.into(),
                        loaded_range: Some(range),
                        strategy: LoadStrategy::Lazy,
                        chunks: None,
                    }
                }
            };
            return Ok(Some(LoadResult {
                file,
                from_cache: true,
            }));
        }

        let Some((total_size, chunk_size)) = cache.chunk_layout(uri, now) else {
            return Ok(None);
        };
        let range = match request.range {
            Some(range) => {
                check_range(uri, range, total_size)?;
                range
            }
            None => chunk_bounds(0, chunk_size, total_size),
        };
        if range.is_empty() {
            return Ok(None);
        }
        let indices = chunk_span(range, chunk_size);
        let Some(chunks) = cache.peek_chunks(uri, &indices, now) else {
            return Ok(None);
        };
        let content = assemble(&chunks, indices[0], chunk_size, range);
        let status = cache.content(uri, now).and_then(|c| status_of(uri, c));
        Ok(Some(LoadResult {
            file: LoadedFile {
                uri: uri.to_string(),
                total_size,
                content,
                loaded_range: Some(range),
                strategy: LoadStrategy::Chunked,
                chunks: status,
            },
            from_cache: true,
        }))
    }

    /// Fetch `indices` of a chunked item, reading only those not cached.
    /// Returns the chunks in order and whether any read hit the source.
    async fn fetch_chunks(
        &self,
        uri: &str,
        total_size: u64,
        chunk_size: u64,
        indices: &[usize],
    ) -> Result<(Vec<Arc<[u8]>>, bool), LoadError> {
        let mut out = Vec::with_capacity(indices.len());
        let mut read_any = false;
        for &index in indices {
            let cached = crate::lock(&self.cache).get_chunk(uri, index, self.clock.now());
            if let Some(chunk) = cached {
                out.push(chunk);
                continue;
            }
            let bounds = chunk_bounds(index, chunk_size, total_size);
            let data: Arc<[u8]> = self
                .source
                .read_range(uri, bounds.start, bounds.end)
                .await
                .map_err(|e| LoadError::from_io(uri, e))?
                .into();
            read_any = true;
            crate::lock(&self.cache).insert_chunk(
                uri,
                total_size,
                chunk_size,
                index,
                Arc::clone(&data),
                self.clock.now(),
            );
            trace!(uri, index, bytes = data.len(), "loaded chunk");
            self.events.emit(&ContextEvent::ChunkLoaded {
                uri: uri.to_string(),
                index,
                bytes: data.len(),
            });
            out.push(data);
        }
        Ok((out, read_any))
    }

    async fn read_whole(&self, uri: &str) -> Result<Arc<[u8]>, LoadError> {
        let data: Arc<[u8]> = self
            .source
            .read(uri)
            .await
            .map_err(|e| LoadError::from_io(uri, e))?
            .into();
        crate::lock(&self.cache).insert_whole(uri, Arc::clone(&data), self.clock.now());
        Ok(data)
    }

    async fn load(
        &self,
        request: LoadRequest,
        config: LoaderConfig,
    ) -> Result<LoadResult, LoadError> {
        if let Some(result) = self.from_cache(&request)? {
            trace!(uri = %request.uri, "served from cache");
            self.emit_loaded(&result);
            return Ok(result);
        }

        let _slot = self.gate.acquire(request.priority).await;
        let uri = request.uri.as_str();
        let size = self.stat(uri).await?;
        if let Some(range) = request.range {
            check_range(uri, range, size)?;
        }
        let strategy = config.strategy_for(size, request.range.is_some());
        debug!(uri, size, %strategy, priority = %request.priority, "loading");

        let result = match strategy {
            LoadStrategy::Full => {
                let content = self.read_whole(uri).await?;
                LoadResult {
                    file: LoadedFile {
                        uri: uri.to_string(),
                        total_size: content.len() as u64,
                        content,
                        loaded_range: None,
                        strategy,
                        chunks: None,
                    },
                    from_cache: false,
                }
            }
            LoadStrategy::Lazy => {
                let range = request
                    .range
                    .unwrap_or_else(|| ByteRange::new(0, size.min(config.max_full_load_size)));
                let content: Arc<[u8]> = self
                    .source
                    .read_range(uri, range.start, range.end)
                    .await
                    .map_err(|e| LoadError::from_io(uri, e))?
                    .into();
                LoadResult {
                    file: LoadedFile {
                        uri: uri.to_string(),
                        total_size: size,
                        content,
                        loaded_range: Some(range),
                        strategy,
                        chunks: None,
                    },
                    from_cache: false,
                }
            }
            LoadStrategy::Chunked => {
                let chunk_size = config.chunk_size;
                let range = request
                    .range
                    .unwrap_or_else(|| chunk_bounds(0, chunk_size, size));
                let indices = chunk_span(range, chunk_size);
                let (chunks, read_any) = self.fetch_chunks(uri, size, chunk_size, &indices).await?;
                LoadResult {
                    file: LoadedFile {
                        uri: uri.to_string(),
                        total_size: size,
                        content: assemble(&chunks, indices[0], chunk_size, range),
                        loaded_range: Some(range),
                        strategy,
                        chunks: self.chunk_status(uri),
                    },
                    from_cache: !read_any,
                }
            }
        };
        self.emit_loaded(&result);
        Ok(result)
    }

    async fn load_chunks(
        &self,
        uri: String,
        mut indices: Vec<usize>,
        priority: LoadPriority,
        chunk_size: u64,
    ) -> Result<ChunkStatus, LoadError> {
        indices.sort_unstable();
        indices.dedup();

        let _slot = self.gate.acquire(priority).await;
        let size = self.stat(&uri).await?;
        let total = total_chunks(size, chunk_size);
        if let Some(&bad) = indices.iter().find(|&&i| i >= total) {
            return Err(LoadError::ChunkOutOfBounds {
                uri,
                index: bad,
                total_chunks: total,
            });
        }
        self.fetch_chunks(&uri, size, chunk_size, &indices).await?;
        Ok(self.chunk_status(&uri).unwrap_or(ChunkStatus {
            uri,
            total_size: size,
            chunk_size,
            total_chunks: total,
            loaded: Vec::new(),
        }))
    }

    async fn load_full_content(
        &self,
        uri: String,
        priority: LoadPriority,
        config: LoaderConfig,
    ) -> Result<LoadedFile, LoadError> {
        let cached = crate::lock(&self.cache).get_whole(&uri, self.clock.now());
        if let Some(content) = cached {
            return Ok(LoadedFile {
                total_size: content.len() as u64,
                uri,
                content,
                loaded_range: None,
                strategy: LoadStrategy::Full,
                chunks: None,
            });
        }

        let _slot = self.gate.acquire(priority).await;
        let size = self.stat(&uri).await?;
        if size <= config.max_lazy_load_size {
            let content = self.read_whole(&uri).await?;
            return Ok(LoadedFile {
                total_size: content.len() as u64,
                uri,
                content,
                loaded_range: None,
                strategy: LoadStrategy::Full,
                chunks: None,
            });
        }

        let chunk_size = config.chunk_size;
        let indices: Vec<usize> = (0..total_chunks(size, chunk_size)).collect();
        let (chunks, _) = self.fetch_chunks(&uri, size, chunk_size, &indices).await?;
        let content = assemble(&chunks, 0, chunk_size, ByteRange::new(0, size));
        debug!(uri = %uri, size, chunks = indices.len(), "materialized chunked content");
        Ok(LoadedFile {
            chunks: self.chunk_status(&uri),
            uri,
            total_size: size,
            content,
            loaded_range: None,
            strategy: LoadStrategy::Chunked,
        })
    }
}

/// Size-aware content loader with caching and priority scheduling.
pub struct IncrementalLoader {
    shared: Shared,
    config: Mutex<LoaderConfig>,
}

impl IncrementalLoader {
    /// Create a loader. An invalid `config` is replaced by the defaults.
    pub fn new(config: LoaderConfig, source: Arc<dyn ContentSource>) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                warn!(error = %e, "invalid loader config, using defaults");
                LoaderConfig::default()
            }
        };
        let cache = ContentCache::new(config.max_cache_bytes, config.cache_ttl);
        Self {
            shared: Shared {
                source,
                cache: Arc::new(Mutex::new(cache)),
                gate: LoadGate::new(config.max_concurrent_loads),
                clock: Arc::new(SystemClock),
                events: Arc::new(NoopSink),
            },
            config: Mutex::new(config),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.shared.clock = clock;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.shared.events = sink;
        self
    }

    /// Load an item, or a range of it, with the strategy its size calls for.
    pub async fn load_file(&self, request: LoadRequest) -> Result<LoadResult, LoadError> {
        let shared = self.shared.clone();
        let config = self.config();
        let uri = request.uri.clone();
        detached(uri, async move { shared.load(request, config).await }).await
    }

    /// Load several items concurrently. Results come back in request order;
    /// the gate still bounds how many reads run at once.
    pub async fn load_files(
        &self,
        requests: Vec<LoadRequest>,
    ) -> Vec<Result<LoadResult, LoadError>> {
        futures::future::join_all(requests.into_iter().map(|r| self.load_file(r))).await
    }

    /// Make sure chunks `indices` of `uri` are cached.
    pub async fn load_chunks(
        &self,
        uri: &str,
        indices: &[usize],
        priority: LoadPriority,
    ) -> Result<ChunkStatus, LoadError> {
        let shared = self.shared.clone();
        let chunk_size = self.config().chunk_size;
        let owned_uri = uri.to_string();
        let indices = indices.to_vec();
        detached(uri.to_string(), async move {
            shared.load_chunks(owned_uri, indices, priority, chunk_size).await
        })
        .await
    }

    /// Load every byte of `uri`. Chunked items are assembled from all of
    /// their chunks.
    pub async fn load_full_content(
        &self,
        uri: &str,
        priority: LoadPriority,
    ) -> Result<LoadedFile, LoadError> {
        let shared = self.shared.clone();
        let config = self.config();
        let owned_uri = uri.to_string();
        detached(uri.to_string(), async move {
            shared.load_full_content(owned_uri, priority, config).await
        })
        .await
    }

    /// Cached chunks of a chunked item.
    pub fn chunk_status(&self, uri: &str) -> Option<ChunkStatus> {
        self.shared.chunk_status(uri)
    }

    /// Drop `uri` from the cache. Returns whether anything was cached.
    pub fn invalidate(&self, uri: &str) -> bool {
        let removed = crate::lock(&self.shared.cache).remove(uri);
        debug!(uri, removed, "invalidated");
        self.shared.events.emit(&ContextEvent::Invalidated {
            uri: uri.to_string(),
        });
        removed
    }

    pub fn clear_cache(&self) {
        crate::lock(&self.shared.cache).clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        crate::lock(&self.shared.cache).stats()
    }

    /// Loads currently holding a slot.
    pub fn active_loads(&self) -> usize {
        self.shared.gate.active()
    }

    /// Loads waiting for a slot.
    pub fn queued_loads(&self) -> usize {
        self.shared.gate.queued()
    }

    pub fn config(&self) -> LoaderConfig {
        crate::lock(&self.config).clone()
    }

    /// Replace the configuration. Cache limits and the concurrency ceiling
    /// take effect immediately; loads in flight finish with the old sizes.
    /// An invalid config is rejected and the current one is kept.
    pub fn update_config(&self, config: LoaderConfig) -> Result<(), ConfigError> {
        config.validate().map_err(ConfigError::Invalid)?;
        self.shared
            .gate
            .set_max_concurrent(config.max_concurrent_loads);
        crate::lock(&self.shared.cache).set_limits(config.max_cache_bytes, config.cache_ttl);
        *crate::lock(&self.config) = config;
        Ok(())
    }
}
