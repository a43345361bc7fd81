//! Random-access object extraction from one pack/index pair.

use crate::errors::{Error, Result};
use crate::object::{ObjectId, ObjectKind, ID_RAW_LEN};
use crate::pack::idx::PackIndex;
use crate::pack::window::{PackSource, WindowCursor};
use crate::pack::{decode_entry_header, decode_ofs_delta, delta, Engine, EntryHeader, PackId};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Longest delta chain accepted before a pack is declared corrupt.
const MAX_DELTA_DEPTH: usize = 4096;

/// One object extracted from a pack.
pub struct PackedObject {
    pub kind: ObjectKind,
    pub data: Bytes,
    /// Entry offset inside the pack.
    pub offset: u64,
    /// Number of deltas applied to reconstruct the payload.
    pub delta_depth: u32,
}

/// An open `.pack` file together with its `.idx` sidecar.
pub struct PackFile {
    id: PackId,
    path: PathBuf,
    file: File,
    len: u64,
    index: PackIndex,
    sorted_offsets: Vec<u64>,
    mtime: SystemTime,
    engine: Arc<Engine>,
    invalid: AtomicBool,
}

impl PackFile {
    /// Open `path` (a `.pack`) and its sibling `.idx`.
    pub fn open(path: impl AsRef<Path>, engine: Arc<Engine>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let index = PackIndex::open(path.with_extension("idx"))?;
        let file = File::open(&path)?;
        let meta = file.metadata()?;
        let len = meta.len();
        if len < 12 + ID_RAW_LEN as u64 {
            return Err(Error::corrupt(format!(
                "pack {} shorter than header + trailer",
                path.display()
            )));
        }
        let mut sorted_offsets: Vec<u64> = index.entries().map(|e| e.offset).collect();
        sorted_offsets.sort_unstable();
        Ok(Self {
            id: PackId::next(),
            path,
            file,
            len,
            index,
            sorted_offsets,
            mtime: meta.modified()?,
            engine,
            invalid: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> PackId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    pub fn object_count(&self) -> usize {
        self.index.object_count()
    }

    pub fn has_object(&self, id: &ObjectId) -> bool {
        !self.is_invalid() && self.index.has_object(id)
    }

    /// A pack is tainted once corruption is seen; callers treat it as
    /// read-failed for the rest of the process.
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Relaxed)
    }

    fn taint(&self) {
        self.invalid.store(true, Ordering::Relaxed);
        self.engine.windows.purge(self.id);
        self.engine.delta_bases.purge(self.id);
        tracing::warn!("pack {} tainted by corruption", self.path.display());
    }

    fn source(&self) -> PackSource<'_> {
        PackSource {
            id: self.id,
            file: &self.file,
            len: self.len,
        }
    }

    pub fn cursor(&self) -> WindowCursor {
        WindowCursor::new(self.engine.windows.clone())
    }

    /// Extract the object named `id`, or `None` when this pack does
    /// not contain it.
    pub fn get(&self, id: &ObjectId) -> Result<Option<PackedObject>> {
        if self.is_invalid() {
            return Err(Error::corrupt(format!(
                "pack {} previously failed to read",
                self.path.display()
            )));
        }
        match self.index.find_offset(id) {
            Some(offset) => self.load(offset).map(Some),
            None => Ok(None),
        }
    }

    /// Extract the object at `offset`, resolving any delta chain.
    pub fn load(&self, offset: u64) -> Result<PackedObject> {
        let result = self.load_inner(offset);
        if matches!(result, Err(Error::Corruption(_))) {
            self.taint();
        }
        result
    }

    fn load_inner(&self, offset: u64) -> Result<PackedObject> {
        let src = self.source();
        let mut cursor = self.cursor();

        struct Frame {
            entry_offset: u64,
            data_offset: u64,
            delta_size: u64,
        }

        // walk down the chain until a cached base or a whole object
        let mut frames: Vec<Frame> = Vec::new();
        let mut pos = offset;
        let (mut kind, mut data) = loop {
            if let Some((kind, bytes)) = self.engine.delta_bases.get(self.id, pos) {
                break (kind, bytes.to_vec());
            }
            let entry = self.read_entry(&mut cursor, &src, pos)?;
            match entry.header {
                EntryHeader::Whole(kind) => {
                    let data = cursor.inflate(&src, entry.data_offset, entry.size as usize)?;
                    break (kind, data);
                }
                EntryHeader::OfsDelta | EntryHeader::RefDelta => {
                    if frames.len() >= MAX_DELTA_DEPTH {
                        return Err(Error::corrupt(format!(
                            "delta chain at {offset} exceeds {MAX_DELTA_DEPTH} links"
                        )));
                    }
                    frames.push(Frame {
                        entry_offset: pos,
                        data_offset: entry.data_offset,
                        delta_size: entry.size,
                    });
                    pos = entry.base_offset.expect("delta entries carry a base");
                }
            }
        };

        // unwind, applying deltas outward and caching every
        // intermediate base except commits
        let delta_depth = frames.len() as u32;
        let mut base_key = pos;
        while let Some(frame) = frames.pop() {
            if kind != ObjectKind::Commit {
                self.engine
                    .delta_bases
                    .put(self.id, base_key, kind, Bytes::from(data.clone()));
            }
            let delta_stream =
                cursor.inflate(&src, frame.data_offset, frame.delta_size as usize)?;
            data = delta::apply(&data, &delta_stream)?;
            base_key = frame.entry_offset;
        }

        Ok(PackedObject {
            kind,
            data: Bytes::from(data),
            offset,
            delta_depth,
        })
    }

    /// Type and inflated size of the object at `id` without
    /// materializing its payload (delta headers are probed for the
    /// declared result size).
    pub fn object_info(&self, id: &ObjectId) -> Result<Option<(ObjectKind, u64)>> {
        let Some(offset) = self.index.find_offset(id) else {
            return Ok(None);
        };
        let src = self.source();
        let mut cursor = self.cursor();

        let mut pos = offset;
        let mut result_size = None;
        let mut depth = 0;
        loop {
            depth += 1;
            if depth > MAX_DELTA_DEPTH {
                return Err(Error::corrupt(format!(
                    "delta chain at {offset} exceeds {MAX_DELTA_DEPTH} links"
                )));
            }
            let entry = self.read_entry(&mut cursor, &src, pos)?;
            match entry.header {
                EntryHeader::Whole(kind) => {
                    return Ok(Some((kind, result_size.unwrap_or(entry.size))));
                }
                EntryHeader::OfsDelta | EntryHeader::RefDelta => {
                    if result_size.is_none() {
                        // the outermost delta declares the final size
                        let mut prefix = [0u8; 32];
                        let got = cursor.inflate_prefix(&src, entry.data_offset, &mut prefix)?;
                        let (_, size, _) = delta::header(&prefix[..got])?;
                        result_size = Some(size);
                    }
                    pos = entry.base_offset.expect("delta entries carry a base");
                }
            }
        }
    }

    /// Recompute the CRC-32 of the packed entry for `id` and compare
    /// it to the index (V2 only).
    pub fn check_crc(&self, id: &ObjectId) -> Result<()> {
        let expected = self.index.find_crc32(id)?;
        let offset = self
            .index
            .find_offset(id)
            .ok_or_else(|| Error::not_found(id.to_hex()))?;
        let end = match self.sorted_offsets.iter().find(|&&o| o > offset) {
            Some(&next) => next,
            None => self.len - ID_RAW_LEN as u64,
        };

        let src = self.source();
        let mut cursor = self.cursor();
        let mut hasher = crc32fast::Hasher::new();
        let mut remaining = end - offset;
        let mut pos = offset;
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let n = (buf.len() as u64).min(remaining) as usize;
            cursor.copy_exact(&src, pos, &mut buf[..n])?;
            hasher.update(&buf[..n]);
            pos += n as u64;
            remaining -= n as u64;
        }
        let actual = hasher.finalize();
        if actual != expected {
            self.taint();
            return Err(Error::corrupt(format!(
                "CRC mismatch for {id} (index {expected:#010x}, pack {actual:#010x})"
            )));
        }
        Ok(())
    }

    /// Recompute the trailing SHA-1 over the whole pack and compare
    /// it against both the trailer and the index's copy.
    pub fn verify(&self) -> Result<()> {
        let src = self.source();
        let mut cursor = self.cursor();
        let mut hasher = Sha1::new();
        let mut pos = 0u64;
        let body = self.len - ID_RAW_LEN as u64;
        let mut buf = [0u8; 8192];
        while pos < body {
            let n = (buf.len() as u64).min(body - pos) as usize;
            cursor.copy_exact(&src, pos, &mut buf[..n])?;
            hasher.update(&buf[..n]);
            pos += n as u64;
        }
        let actual = ObjectId::from_hasher(hasher);

        let mut trailer = [0u8; ID_RAW_LEN];
        cursor.copy_exact(&src, body, &mut trailer)?;
        let stored = ObjectId::from_raw(trailer);

        if actual != stored || stored != self.index.pack_checksum() {
            self.taint();
            return Err(Error::corrupt(format!(
                "pack checksum mismatch in {}",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Purge cached state; the pack is unusable afterwards.
    pub fn close(&self) {
        self.engine.windows.purge(self.id);
        self.engine.delta_bases.purge(self.id);
    }

    fn read_entry(
        &self,
        cursor: &mut WindowCursor,
        src: &PackSource<'_>,
        offset: u64,
    ) -> Result<Entry> {
        let mut pos = offset;
        let (header, size) = decode_entry_header(|| {
            let b = cursor.read_byte(src, pos)?;
            pos += 1;
            Ok(b)
        })?;
        let base_offset = match header {
            EntryHeader::OfsDelta => {
                let ofs = decode_ofs_delta(|| {
                    let b = cursor.read_byte(src, pos)?;
                    pos += 1;
                    Ok(b)
                })?;
                let base = offset.checked_sub(ofs).filter(|_| ofs != 0).ok_or_else(|| {
                    Error::corrupt(format!("delta base offset underflows at {offset}"))
                })?;
                Some(base)
            }
            EntryHeader::RefDelta => {
                let mut raw = [0u8; ID_RAW_LEN];
                cursor.copy_exact(src, pos, &mut raw)?;
                pos += ID_RAW_LEN as u64;
                let base_id = ObjectId::from_raw(raw);
                let base = self
                    .index
                    .find_offset(&base_id)
                    .ok_or(Error::MissingObject(base_id))?;
                Some(base)
            }
            EntryHeader::Whole(_) => None,
        };
        Ok(Entry {
            header,
            size,
            data_offset: pos,
            base_offset,
        })
    }
}

struct Entry {
    header: EntryHeader,
    size: u64,
    data_offset: u64,
    base_offset: Option<u64>,
}
