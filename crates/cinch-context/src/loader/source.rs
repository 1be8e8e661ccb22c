//! Storage seam for the loader.
//!
//! [`ContentSource`] abstracts where bytes come from. The loader only needs
//! the size of an item and the ability to read all of it or a byte range.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Boxed future returned by [`ContentSource`] methods.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Metadata of a stored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentStat {
    pub size: u64,
}

/// Byte storage addressed by URI.
pub trait ContentSource: Send + Sync {
    fn stat<'a>(&'a self, uri: &'a str) -> SourceFuture<'a, ContentStat>;

    fn read<'a>(&'a self, uri: &'a str) -> SourceFuture<'a, Vec<u8>>;

    /// Read bytes `start..end` (end exclusive).
    fn read_range<'a>(&'a self, uri: &'a str, start: u64, end: u64) -> SourceFuture<'a, Vec<u8>>;
}

// ── Filesystem ─────────────────────────────────────────────────────

/// Files under a root directory. URIs are paths relative to the root.
#[derive(Debug, Clone)]
pub struct FsContentSource {
    root: PathBuf,
}

impl FsContentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `uri` under the root, rejecting absolute paths and `..`.
    fn resolve(&self, uri: &str) -> io::Result<PathBuf> {
        let relative = Path::new(uri);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("path escapes source root: {uri}"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl ContentSource for FsContentSource {
    fn stat<'a>(&'a self, uri: &'a str) -> SourceFuture<'a, ContentStat> {
        Box::pin(async move {
            let meta = tokio::fs::metadata(self.resolve(uri)?).await?;
            if !meta.is_file() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("not a file: {uri}"),
                ));
            }
            Ok(ContentStat { size: meta.len() })
        })
    }

    fn read<'a>(&'a self, uri: &'a str) -> SourceFuture<'a, Vec<u8>> {
        Box::pin(async move { tokio::fs::read(self.resolve(uri)?).await })
    }

    fn read_range<'a>(&'a self, uri: &'a str, start: u64, end: u64) -> SourceFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let mut file = tokio::fs::File::open(self.resolve(uri)?).await?;
            file.seek(io::SeekFrom::Start(start)).await?;
            let len = end.saturating_sub(start);
            let mut buf = Vec::with_capacity(len as usize);
            file.take(len).read_to_end(&mut buf).await?;
            Ok(buf)
        })
    }
}

// ── In memory ──────────────────────────────────────────────────────

/// A read performed against an [`InMemorySource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRead {
    Full(String),
    Range(String, u64, u64),
}

/// Map-backed source that records every read.
#[derive(Debug, Default)]
pub struct InMemorySource {
    files: Mutex<HashMap<String, Arc<Vec<u8>>>>,
    reads: Mutex<Vec<SourceRead>>,
    stats: AtomicUsize,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an item.
    pub fn insert(&self, uri: impl Into<String>, content: impl Into<Vec<u8>>) {
        crate::lock(&self.files).insert(uri.into(), Arc::new(content.into()));
    }

    pub fn with_file(self, uri: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.insert(uri, content);
        self
    }

    pub fn remove(&self, uri: &str) -> bool {
        crate::lock(&self.files).remove(uri).is_some()
    }

    /// Every read so far, in order.
    pub fn reads(&self) -> Vec<SourceRead> {
        crate::lock(&self.reads).clone()
    }

    pub fn read_count(&self) -> usize {
        crate::lock(&self.reads).len()
    }

    pub fn stat_count(&self) -> usize {
        self.stats.load(Ordering::Relaxed)
    }

    fn get(&self, uri: &str) -> io::Result<Arc<Vec<u8>>> {
        crate::lock(&self.files)
            .get(uri)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such item: {uri}")))
    }
}

impl ContentSource for InMemorySource {
    fn stat<'a>(&'a self, uri: &'a str) -> SourceFuture<'a, ContentStat> {
        Box::pin(async move {
            self.stats.fetch_add(1, Ordering::Relaxed);
            let data = self.get(uri)?;
            Ok(ContentStat {
                size: data.len() as u64,
            })
        })
    }

    fn read<'a>(&'a self, uri: &'a str) -> SourceFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let data = self.get(uri)?;
            crate::lock(&self.reads).push(SourceRead::Full(uri.to_string()));
            Ok(data.to_vec())
        })
    }

    fn read_range<'a>(&'a self, uri: &'a str, start: u64, end: u64) -> SourceFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let data = self.get(uri)?;
            let len = data.len() as u64;
            let (s, e) = (start.min(len) as usize, end.min(len) as usize);
            crate::lock(&self.reads).push(SourceRead::Range(uri.to_string(), start, end));
            Ok(data.get(s..e.max(s)).unwrap_or_default().to_vec())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_source_reads_ranges() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), b"0123456789").unwrap();
        let source = FsContentSource::new(dir.path());

        assert_eq!(source.stat("data.txt").await.unwrap().size, 10);
        assert_eq!(source.read("data.txt").await.unwrap(), b"0123456789");
        assert_eq!(source.read_range("data.txt", 3, 7).await.unwrap(), b"3456");
        assert_eq!(source.read_range("data.txt", 8, 20).await.unwrap(), b"89");
    }

    #[tokio::test]
    async fn fs_source_rejects_escapes_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = FsContentSource::new(dir.path());
        let err = source.read("../etc/passwd").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        let err = source.stat("missing.rs").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn fs_source_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let source = FsContentSource::new(dir.path());
        assert!(source.stat("sub").await.is_err());
    }

    #[tokio::test]
    async fn memory_source_records_reads() {
        let source = InMemorySource::new().with_file("a", "hello world");
        source.read("a").await.unwrap();
        assert_eq!(source.read_range("a", 6, 11).await.unwrap(), b"world");
        assert_eq!(
            source.reads(),
            vec![
                SourceRead::Full("a".into()),
                SourceRead::Range("a".into(), 6, 11),
            ]
        );
        assert!(source.read("b").await.is_err());
        assert_eq!(source.read_count(), 2);
    }
}
