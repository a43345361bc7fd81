//! Process-wide bounded cache of mapped pack file regions.
//!
//! Each window is an aligned `(pack, start, length)` slice backed by
//! either an mmap or a heap buffer. Readers of resident windows only
//! take the shared read lock; window creation and LRU eviction take
//! the write lock.

use crate::config::CoreConfig;
use crate::errors::{Error, Result};
use crate::pack::PackId;
use flate2::{Decompress, FlushDecompress, Status};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct WindowCacheConfig {
    pub window_size: usize,
    pub limit: u64,
    pub mmap: bool,
}

impl Default for WindowCacheConfig {
    fn default() -> Self {
        Self::from(&CoreConfig::default())
    }
}

impl From<&CoreConfig> for WindowCacheConfig {
    fn from(config: &CoreConfig) -> Self {
        Self {
            window_size: config.packed_git_window_size,
            limit: config.packed_git_limit,
            mmap: config.packed_git_mmap,
        }
    }
}

/// What a pack reader hands the cache so windows can be (re)loaded.
pub struct PackSource<'a> {
    pub id: PackId,
    pub file: &'a File,
    pub len: u64,
}

enum Backing {
    Map(memmap2::Mmap),
    Heap(Vec<u8>),
}

pub struct Window {
    pack: PackId,
    start: u64,
    data: Backing,
    last_used: AtomicU64,
}

impl Window {
    fn bytes(&self) -> &[u8] {
        match &self.data {
            Backing::Map(map) => map,
            Backing::Heap(buf) => buf,
        }
    }

    fn contains(&self, pos: u64) -> bool {
        pos >= self.start && pos < self.start + self.bytes().len() as u64
    }

    /// Slice from `pos` to the end of this window.
    fn tail(&self, pos: u64) -> &[u8] {
        &self.bytes()[(pos - self.start) as usize..]
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    pack: PackId,
    start: u64,
}

#[derive(Default)]
struct Table {
    windows: HashMap<WindowKey, Arc<Window>>,
    total_bytes: u64,
}

pub struct WindowCache {
    config: WindowCacheConfig,
    clock: AtomicU64,
    table: RwLock<Table>,
}

impl WindowCache {
    pub fn new(mut config: WindowCacheConfig) -> Self {
        if config.window_size == 0 {
            config.window_size = 8 * 1024;
        }
        if config.mmap {
            // mmap offsets must be page aligned
            config.window_size = config.window_size.next_multiple_of(4096);
        }
        Self {
            config,
            clock: AtomicU64::new(1),
            table: RwLock::new(Table::default()),
        }
    }

    pub fn window_size(&self) -> usize {
        self.config.window_size
    }

    fn pin(&self, src: &PackSource<'_>, pos: u64) -> Result<Arc<Window>> {
        if pos >= src.len {
            return Err(Error::corrupt(format!(
                "read at {pos} past end of pack ({} bytes)",
                src.len
            )));
        }
        let start = pos - pos % self.config.window_size as u64;
        let key = WindowKey {
            pack: src.id,
            start,
        };
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);

        if let Some(window) = self.table.read().windows.get(&key) {
            window.last_used.store(tick, Ordering::Relaxed);
            return Ok(window.clone());
        }

        // Load outside any lock so concurrent readers of other
        // windows never wait on file I/O.
        let len = (src.len - start).min(self.config.window_size as u64) as usize;
        let data = self.load(src, start, len)?;
        let window = Arc::new(Window {
            pack: src.id,
            start,
            data,
            last_used: AtomicU64::new(tick),
        });

        let mut table = self.table.write();
        if let Some(existing) = table.windows.get(&key) {
            return Ok(existing.clone());
        }
        table.total_bytes += len as u64;
        table.windows.insert(key, window.clone());
        self.evict(&mut table, &key);
        Ok(window)
    }

    fn load(&self, src: &PackSource<'_>, start: u64, len: usize) -> Result<Backing> {
        if self.config.mmap {
            let map = unsafe {
                memmap2::MmapOptions::new()
                    .offset(start)
                    .len(len)
                    .map(src.file)
            };
            match map {
                Ok(map) => return Ok(Backing::Map(map)),
                Err(err) => {
                    tracing::debug!("mmap of pack window failed, using heap read: {err}");
                }
            }
        }
        let mut buf = vec![0u8; len];
        src.file.read_exact_at(&mut buf, start)?;
        Ok(Backing::Heap(buf))
    }

    fn evict(&self, table: &mut Table, keep: &WindowKey) {
        while table.total_bytes > self.config.limit && table.windows.len() > 1 {
            let victim = table
                .windows
                .iter()
                .filter(|&(key, _)| key != keep)
                .min_by_key(|(_, w)| w.last_used.load(Ordering::Relaxed))
                .map(|(key, _)| *key);
            match victim {
                Some(key) => {
                    if let Some(gone) = table.windows.remove(&key) {
                        table.total_bytes -= gone.bytes().len() as u64;
                    }
                }
                None => break,
            }
        }
    }

    /// Drop every window of a pack that is being closed.
    pub fn purge(&self, pack: PackId) {
        let mut table = self.table.write();
        let dead: Vec<WindowKey> = table
            .windows
            .keys()
            .filter(|key| key.pack == pack)
            .copied()
            .collect();
        for key in dead {
            if let Some(gone) = table.windows.remove(&key) {
                table.total_bytes -= gone.bytes().len() as u64;
            }
        }
    }

    pub fn resident_bytes(&self) -> u64 {
        self.table.read().total_bytes
    }
}

/// Per-operation handle that keeps the most recently used window
/// pinned so consecutive reads of the same region skip the table.
pub struct WindowCursor {
    cache: Arc<WindowCache>,
    current: Option<Arc<Window>>,
}

impl WindowCursor {
    pub fn new(cache: Arc<WindowCache>) -> Self {
        Self {
            cache,
            current: None,
        }
    }

    fn window(&mut self, src: &PackSource<'_>, pos: u64) -> Result<&Window> {
        let hit = matches!(&self.current, Some(w) if w.pack == src.id && w.contains(pos));
        if !hit {
            self.current = Some(self.cache.pin(src, pos)?);
        }
        Ok(self.current.as_deref().expect("window just pinned"))
    }

    /// Copy bytes starting at `pos`, spanning window boundaries, into
    /// `dst`. Short copies only happen at end of pack.
    pub fn copy(&mut self, src: &PackSource<'_>, mut pos: u64, dst: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < dst.len() && pos < src.len {
            let window = self.window(src, pos)?;
            let avail = window.tail(pos);
            let n = avail.len().min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&avail[..n]);
            filled += n;
            pos += n as u64;
        }
        Ok(filled)
    }

    pub fn copy_exact(&mut self, src: &PackSource<'_>, pos: u64, dst: &mut [u8]) -> Result<()> {
        if self.copy(src, pos, dst)? != dst.len() {
            return Err(Error::corrupt("unexpected end of pack"));
        }
        Ok(())
    }

    pub fn read_byte(&mut self, src: &PackSource<'_>, pos: u64) -> Result<u8> {
        let mut b = [0u8; 1];
        self.copy_exact(src, pos, &mut b)?;
        Ok(b[0])
    }

    /// Inflate the zlib stream at `pos` into exactly `expected`
    /// bytes, spanning window boundaries transparently.
    pub fn inflate(
        &mut self,
        src: &PackSource<'_>,
        mut pos: u64,
        expected: usize,
    ) -> Result<Vec<u8>> {
        // one spare byte so an overrun is observable and stream end
        // can be discovered on a later call than the final output
        let mut out = vec![0u8; expected + 1];
        let mut out_pos = 0;
        let mut z = Decompress::new(true);
        loop {
            let window = self.window(src, pos)?;
            let input = window.tail(pos);
            let in_before = z.total_in();
            let out_before = z.total_out();
            let status = z
                .decompress(input, &mut out[out_pos..], FlushDecompress::None)
                .map_err(|err| Error::corrupt(format!("zlib: {err}")))?;
            let consumed = z.total_in() - in_before;
            let produced = z.total_out() - out_before;
            pos += consumed;
            out_pos += produced as usize;
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if out_pos > expected {
                        return Err(Error::corrupt(
                            "inflated data overruns the declared object size",
                        ));
                    }
                    if pos >= src.len {
                        return Err(Error::corrupt("zlib stream truncated"));
                    }
                    if consumed == 0 && produced == 0 {
                        return Err(Error::corrupt("zlib stream stalled"));
                    }
                }
            }
        }
        if out_pos != expected {
            return Err(Error::corrupt(format!(
                "object inflated to {out_pos} bytes, header said {expected}"
            )));
        }
        out.truncate(expected);
        Ok(out)
    }

    /// Inflate at most `dst.len()` leading bytes of the stream at
    /// `pos`, for probing delta headers without materializing the
    /// whole payload. Returns how many bytes were produced.
    pub fn inflate_prefix(
        &mut self,
        src: &PackSource<'_>,
        mut pos: u64,
        dst: &mut [u8],
    ) -> Result<usize> {
        let mut out_pos = 0;
        let mut z = Decompress::new(true);
        while out_pos < dst.len() {
            let window = self.window(src, pos)?;
            let input = window.tail(pos);
            let in_before = z.total_in();
            let out_before = z.total_out();
            let status = z
                .decompress(input, &mut dst[out_pos..], FlushDecompress::None)
                .map_err(|err| Error::corrupt(format!("zlib: {err}")))?;
            let consumed = z.total_in() - in_before;
            let produced = z.total_out() - out_before;
            pos += consumed;
            out_pos += produced as usize;
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if pos >= src.len || (consumed == 0 && produced == 0) {
                        return Err(Error::corrupt("zlib stream truncated"));
                    }
                }
            }
        }
        Ok(out_pos)
    }

    pub fn release(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn pack_fixture(dir: &TempDir, name: &str, bytes: &[u8]) -> File {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        File::open(path).unwrap()
    }

    #[test]
    fn copy_spans_window_boundaries() {
        let dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0u8..=255).cycle().take(40_000).collect();
        let file = pack_fixture(&dir, "a.pack", &content);

        let cache = Arc::new(WindowCache::new(WindowCacheConfig {
            window_size: 4096,
            limit: 1 << 20,
            mmap: false,
        }));
        let src = PackSource {
            id: PackId::next(),
            file: &file,
            len: content.len() as u64,
        };
        let mut cursor = WindowCursor::new(cache);

        let mut buf = vec![0u8; 10_000];
        cursor.copy_exact(&src, 3000, &mut buf).unwrap();
        assert_eq!(&buf[..], &content[3000..13_000]);
    }

    #[test]
    fn inflate_spans_window_boundaries() {
        let dir = TempDir::new().unwrap();
        let payload: Vec<u8> = (0u8..=255).cycle().take(30_000).collect();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).unwrap();
        let mut content = vec![0xEE; 100]; // leading junk the stream skips
        content.extend_from_slice(&encoder.finish().unwrap());
        let file = pack_fixture(&dir, "b.pack", &content);

        let cache = Arc::new(WindowCache::new(WindowCacheConfig {
            window_size: 1024,
            limit: 1 << 20,
            mmap: false,
        }));
        let src = PackSource {
            id: PackId::next(),
            file: &file,
            len: content.len() as u64,
        };
        let mut cursor = WindowCursor::new(cache);
        let out = cursor.inflate(&src, 100, payload.len()).unwrap();
        assert_eq!(out, payload);

        // declared size smaller than the stream is corrupt
        let mut cursor = WindowCursor::new(Arc::new(WindowCache::new(WindowCacheConfig {
            window_size: 1024,
            limit: 1 << 20,
            mmap: false,
        })));
        assert!(cursor.inflate(&src, 100, payload.len() - 1).is_err());
    }

    #[test]
    fn eviction_respects_the_byte_ceiling() {
        let dir = TempDir::new().unwrap();
        let content = vec![0x42u8; 64 * 1024];
        let file = pack_fixture(&dir, "c.pack", &content);

        let cache = Arc::new(WindowCache::new(WindowCacheConfig {
            window_size: 4096,
            limit: 3 * 4096,
            mmap: false,
        }));
        let src = PackSource {
            id: PackId::next(),
            file: &file,
            len: content.len() as u64,
        };
        let mut cursor = WindowCursor::new(cache.clone());
        let mut byte = [0u8; 1];
        for pos in (0..content.len() as u64).step_by(4096) {
            cursor.copy_exact(&src, pos, &mut byte).unwrap();
        }
        assert!(cache.resident_bytes() <= 4 * 4096);
    }

    #[test]
    fn purge_drops_a_closed_packs_windows() {
        let dir = TempDir::new().unwrap();
        let content = vec![1u8; 8192];
        let file = pack_fixture(&dir, "d.pack", &content);

        let cache = Arc::new(WindowCache::new(WindowCacheConfig::default()));
        let id = PackId::next();
        let src = PackSource {
            id,
            file: &file,
            len: content.len() as u64,
        };
        let mut cursor = WindowCursor::new(cache.clone());
        let mut byte = [0u8; 1];
        cursor.copy_exact(&src, 0, &mut byte).unwrap();
        assert!(cache.resident_bytes() > 0);
        cursor.release();
        cache.purge(id);
        assert_eq!(cache.resident_bytes(), 0);
    }

    #[test]
    fn mmap_mode_reads_the_same_bytes() {
        let dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0u8..=255).cycle().take(20_000).collect();
        let file = pack_fixture(&dir, "e.pack", &content);

        let cache = Arc::new(WindowCache::new(WindowCacheConfig {
            window_size: 4096,
            limit: 1 << 20,
            mmap: true,
        }));
        let src = PackSource {
            id: PackId::next(),
            file: &file,
            len: content.len() as u64,
        };
        let mut cursor = WindowCursor::new(cache);
        let mut buf = vec![0u8; 9000];
        cursor.copy_exact(&src, 5000, &mut buf).unwrap();
        assert_eq!(&buf[..], &content[5000..14_000]);
    }
}
