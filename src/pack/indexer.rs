//! Streaming pack ingestion.
//!
//! Consumes a pack off the wire in one pass, writing bytes through to
//! a temp `.pack` as they arrive, then resolves deltas against the
//! temp file, optionally repairs a thin pack from the local store,
//! writes the `.idx`, and atomically publishes both.

use crate::errors::{Error, Result};
use crate::object::{hash_bytes, ObjectId, ObjectKind, ID_RAW_LEN};
use crate::odb::ObjectDatabase;
use crate::pack::file::PackFile;
use crate::pack::idx::{write_index, IdxEntry};
use crate::pack::{
    decode_entry_header, decode_ofs_delta, delta, encode_entry_header, EntryHeader, PACK_MAGIC,
};
use crate::progress::{check_cancelled, ProgressMonitor};
use crate::revision;
use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Structural validation of incoming objects (`receive.fsckObjects`).
#[derive(Default)]
pub struct ObjectChecker;

impl ObjectChecker {
    pub fn check(&self, kind: ObjectKind, data: &[u8]) -> Result<()> {
        match kind {
            ObjectKind::Blob => Ok(()),
            ObjectKind::Commit => revision::parse_commit(data).map(drop),
            ObjectKind::Tag => revision::parse_tag(data).map(drop),
            ObjectKind::Tree => {
                let entries = revision::parse_tree(data)?;
                for entry in &entries {
                    if entry.name.is_empty()
                        || entry.name == b"."
                        || entry.name == b".."
                        || entry.name.contains(&b'/')
                    {
                        return Err(Error::corrupt(format!(
                            "tree entry name {:?} is invalid",
                            String::from_utf8_lossy(&entry.name)
                        )));
                    }
                }
                for pair in entries.windows(2) {
                    if tree_order(&pair[0], &pair[1]) != std::cmp::Ordering::Less {
                        return Err(Error::corrupt("tree entries out of order"));
                    }
                }
                Ok(())
            }
        }
    }
}

// Trees sort as if subtree names carried a trailing '/'.
fn tree_order(a: &revision::TreeEntry, b: &revision::TreeEntry) -> std::cmp::Ordering {
    let mut i = 0;
    loop {
        let ca = a.name.get(i).copied().or_else(|| {
            (a.is_tree() && i == a.name.len()).then_some(b'/')
        });
        let cb = b.name.get(i).copied().or_else(|| {
            (b.is_tree() && i == b.name.len()).then_some(b'/')
        });
        match (ca, cb) {
            (None, None) => return std::cmp::Ordering::Equal,
            (None, Some(_)) => return std::cmp::Ordering::Less,
            (Some(_), None) => return std::cmp::Ordering::Greater,
            (Some(x), Some(y)) if x != y => return x.cmp(&y),
            _ => i += 1,
        }
    }
}

#[derive(Copy, Clone)]
struct PendingDelta {
    offset: u64,
    crc: u32,
    /// Declared inflated size of the delta stream.
    size: u64,
}

struct Staged {
    pack_temp: NamedTempFile,
    idx_temp: NamedTempFile,
    name: ObjectId,
    object_count: u32,
    thin_added: u32,
}

/// One-shot ingester for a pack arriving on `src`.
pub struct PackIndexer<'db, R: Read> {
    db: &'db ObjectDatabase,
    src: Option<R>,
    index_version: Option<u32>,
    fix_thin: bool,
    keep_empty: bool,
    checker: Option<ObjectChecker>,
    staged: Option<Staged>,
    empty_dropped: bool,
}

impl<'db, R: Read> PackIndexer<'db, R> {
    pub fn new(db: &'db ObjectDatabase, src: R) -> Self {
        Self {
            db,
            src: Some(src),
            index_version: None,
            fix_thin: false,
            keep_empty: false,
            checker: None,
            staged: None,
            empty_dropped: false,
        }
    }

    /// Force the index version written; the default is the oldest
    /// format that can represent the pack.
    pub fn set_index_version(&mut self, version: u32) -> &mut Self {
        self.index_version = Some(version);
        self
    }

    /// Permit deltas whose bases live in the local store, appending
    /// those bases to make the pack self-contained.
    pub fn set_fix_thin(&mut self, fix: bool) -> &mut Self {
        self.fix_thin = fix;
        self
    }

    /// Keep a pack that turned out to contain no objects.
    pub fn set_keep_empty(&mut self, keep: bool) -> &mut Self {
        self.keep_empty = keep;
        self
    }

    pub fn set_object_checker(&mut self, checker: ObjectChecker) -> &mut Self {
        self.checker = Some(checker);
        self
    }

    /// Consume the stream to completion: parse, validate, resolve
    /// deltas and stage the temp `.pack`/`.idx` pair.
    pub fn index(&mut self, progress: &mut dyn ProgressMonitor) -> Result<()> {
        let mut src = self.src.take().ok_or_else(|| {
            Error::Unsupported("pack stream already consumed".into())
        })?;
        let pack_dir = self.db.pack_directory();
        std::fs::create_dir_all(&pack_dir)?;
        let pack_temp = tempfile::Builder::new()
            .prefix("incoming_")
            .suffix(".pack")
            .tempfile_in(&pack_dir)?;

        let mut input = StreamIn::new(&mut src, pack_temp.as_file());

        // --- header ---
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if magic != PACK_MAGIC {
            return Err(Error::corrupt("stream does not begin with PACK"));
        }
        let version = input.read_u32()?;
        if !matches!(version, 2 | 3) {
            return Err(Error::Unsupported(format!("pack version {version}")));
        }
        let declared = input.read_u32()?;

        // --- object phase ---
        progress.begin_task("Receiving objects", Some(declared as u64));
        let mut entries: Vec<IdxEntry> = Vec::with_capacity(declared as usize);
        let mut whole: Vec<(u64, ObjectId)> = Vec::new();
        let mut by_id: HashMap<ObjectId, Vec<PendingDelta>> = HashMap::new();
        let mut by_ofs: HashMap<u64, Vec<PendingDelta>> = HashMap::new();
        let mut delta_count = 0u64;

        for i in 0..declared {
            check_cancelled(progress)?;
            let offset = input.offset();
            input.begin_crc();
            let (header, size) = decode_entry_header(|| input.read_byte())?;
            match header {
                EntryHeader::Whole(kind) => {
                    let data = input.inflate(size, true)?;
                    let crc = input.take_crc();
                    let id = hash_bytes(kind, &data);
                    if let Some(checker) = &self.checker {
                        checker.check(kind, &data)?;
                    }
                    collision_check(self.db, &id, kind, &data)?;
                    entries.push(IdxEntry {
                        id,
                        offset,
                        crc32: Some(crc),
                    });
                    whole.push((offset, id));
                }
                EntryHeader::OfsDelta => {
                    let ofs = decode_ofs_delta(|| input.read_byte())?;
                    let base = offset.checked_sub(ofs).filter(|_| ofs != 0).ok_or_else(
                        || Error::corrupt(format!("delta base offset underflows at {offset}")),
                    )?;
                    input.inflate(size, false)?;
                    let crc = input.take_crc();
                    by_ofs
                        .entry(base)
                        .or_default()
                        .push(PendingDelta { offset, crc, size });
                    delta_count += 1;
                }
                EntryHeader::RefDelta => {
                    let mut raw = [0u8; ID_RAW_LEN];
                    input.read_exact(&mut raw)?;
                    let base = ObjectId::from_raw(raw);
                    input.inflate(size, false)?;
                    let crc = input.take_crc();
                    by_id
                        .entry(base)
                        .or_default()
                        .push(PendingDelta { offset, crc, size });
                    delta_count += 1;
                }
            }
            progress.update(i as u64 + 1);
        }
        progress.end_task();

        // --- footer ---
        let computed = input.digest();
        let mut trailer = [0u8; ID_RAW_LEN];
        input.read_trailer(&mut trailer)?;
        if trailer != *computed.as_bytes() {
            return Err(Error::corrupt(format!(
                "pack checksum mismatch (stream {}, computed {computed})",
                ObjectId::from_raw(trailer)
            )));
        }
        let pack_end = input.offset();
        drop(input);

        // --- delta resolution ---
        progress.begin_task("Resolving deltas", Some(delta_count));
        let mut resolver = Resolver {
            file: pack_temp.as_file(),
            limit: pack_end,
            db: self.db,
            checker: self.checker.as_ref(),
            entries: &mut entries,
            by_id: &mut by_id,
            by_ofs: &mut by_ofs,
            resolved: 0,
        };
        for (offset, id) in &whole {
            resolver.resolve_forest(progress, *id, *offset)?;
        }

        // --- thin-pack completion ---
        let mut write_pos = pack_end;
        let mut thin_added = 0u32;
        if self.fix_thin && !resolver.by_id.is_empty() {
            let mut missing: Vec<ObjectId> = resolver.by_id.keys().copied().collect();
            missing.sort();
            for base_id in missing {
                check_cancelled(progress)?;
                let loader = self.db.open_object(&base_id)?;
                let kind = loader.kind();
                let data = loader.into_bytes();

                let mut entry = Vec::with_capacity(data.len() / 2 + 32);
                encode_entry_header(&mut entry, EntryHeader::Whole(kind), data.len() as u64);
                let mut encoder =
                    ZlibEncoder::new(&mut entry, Compression::default());
                encoder.write_all(&data)?;
                encoder.finish()?;

                let mut crc = crc32fast::Hasher::new();
                crc.update(&entry);
                pack_temp.as_file().write_all_at(&entry, write_pos)?;

                resolver.entries.push(IdxEntry {
                    id: base_id,
                    offset: write_pos,
                    crc32: Some(crc.finalize()),
                });
                resolver.limit = write_pos + entry.len() as u64;
                let kids = resolver.take_children(&base_id, write_pos);
                resolver.resolve_list(progress, kind, &data, kids)?;
                write_pos += entry.len() as u64;
                thin_added += 1;
                tracing::debug!("thin pack repaired with base {base_id}");
            }
        }
        if let Some(base) = resolver.by_id.keys().next() {
            return Err(Error::MissingObject(*base));
        }
        if !resolver.by_ofs.is_empty() {
            return Err(Error::corrupt("pack contains orphan offset deltas"));
        }
        progress.end_task();

        // --- finalize the pack file ---
        let pack_sha = if thin_added == 0 {
            pack_temp.as_file().write_all_at(&trailer, write_pos)?;
            ObjectId::from_raw(trailer)
        } else {
            let new_count = declared + thin_added;
            pack_temp
                .as_file()
                .write_all_at(&new_count.to_be_bytes(), 8)?;
            let sha = hash_file_range(pack_temp.as_file(), write_pos)?;
            pack_temp.as_file().write_all_at(sha.as_bytes(), write_pos)?;
            sha
        };
        pack_temp.as_file().sync_all()?;

        let object_count = entries.len() as u32;
        if object_count == 0 && !self.keep_empty {
            self.empty_dropped = true;
            return Ok(());
        }

        // --- index and pack name ---
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let mut name_hasher = Sha1::new();
        for entry in &entries {
            name_hasher.update(entry.id.as_bytes());
        }
        let name = ObjectId::from_hasher(name_hasher);

        let idx_temp = tempfile::Builder::new()
            .prefix("incoming_")
            .suffix(".idx")
            .tempfile_in(&pack_dir)?;
        write_index(idx_temp.as_file(), &mut entries, pack_sha, self.index_version)?;
        idx_temp.as_file().sync_all()?;

        self.staged = Some(Staged {
            pack_temp,
            idx_temp,
            name,
            object_count,
            thin_added,
        });
        Ok(())
    }

    /// Number of objects indexed, counting appended thin bases.
    pub fn object_count(&self) -> u32 {
        self.staged.as_ref().map_or(0, |s| s.object_count)
    }

    pub fn thin_bases_added(&self) -> u32 {
        self.staged.as_ref().map_or(0, |s| s.thin_added)
    }

    /// Name the pack after its sorted object ids and move the staged
    /// pair into `objects/pack/`. An already-present pack of the same
    /// name wins; we never overwrite. `None` means the pack was empty
    /// and dropped.
    pub fn rename_and_open_pack(mut self) -> Result<Option<Arc<PackFile>>> {
        if self.empty_dropped {
            return Ok(None);
        }
        let staged = self
            .staged
            .take()
            .ok_or_else(|| Error::Unsupported("index() has not completed".into()))?;
        let pack_dir = self.db.pack_directory();
        let hex = staged.name.to_hex();
        let pack_path = pack_dir.join(format!("pack-{hex}.pack"));
        let idx_path = pack_dir.join(format!("pack-{hex}.idx"));

        for temp in [&staged.pack_temp, &staged.idx_temp] {
            let mut perms = temp.as_file().metadata()?.permissions();
            perms.set_mode(0o444);
            temp.as_file().set_permissions(perms)?;
        }

        if !pack_path.exists() {
            match staged.pack_temp.persist_noclobber(&pack_path) {
                Ok(_) => match staged.idx_temp.persist_noclobber(&idx_path) {
                    Ok(_) => {}
                    Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(err) => {
                        let _ = std::fs::remove_file(&pack_path);
                        return Err(err.error.into());
                    }
                },
                Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.error.into()),
            }
        }

        self.db.scan_for_packs()?;
        let opened = self
            .db
            .packs()
            .into_iter()
            .find(|p| p.path() == pack_path)
            .ok_or_else(|| Error::not_found(format!("freshly indexed {}", pack_path.display())))?;
        Ok(Some(opened))
    }
}

fn collision_check(
    db: &ObjectDatabase,
    id: &ObjectId,
    kind: ObjectKind,
    data: &[u8],
) -> Result<()> {
    if !db.has_object(id) {
        return Ok(());
    }
    let existing = db.open_object(id)?;
    if existing.kind() != kind || existing.cached_bytes()[..] != *data {
        return Err(Error::corrupt(format!(
            "object {id} already exists with different content"
        )));
    }
    Ok(())
}

fn hash_file_range(file: &File, len: u64) -> Result<ObjectId> {
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 8192];
    let mut pos = 0u64;
    while pos < len {
        let want = (buf.len() as u64).min(len - pos) as usize;
        let got = file.read_at(&mut buf[..want], pos)?;
        if got == 0 {
            return Err(Error::corrupt("pack temp file truncated"));
        }
        hasher.update(&buf[..got]);
        pos += got as u64;
    }
    Ok(ObjectId::from_hasher(hasher))
}

// ---------------------------------------------------------------
// streaming input

/// Buffered reader over the incoming stream that writes every
/// consumed byte through to the temp pack while folding it into the
/// running pack SHA-1 and the per-entry CRC.
struct StreamIn<'a, R: Read> {
    src: &'a mut R,
    out: &'a File,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    offset: u64,
    digest: Sha1,
    crc: Option<crc32fast::Hasher>,
}

impl<'a, R: Read> StreamIn<'a, R> {
    fn new(src: &'a mut R, out: &'a File) -> Self {
        Self {
            src,
            out,
            buf: vec![0u8; 64 * 1024],
            start: 0,
            end: 0,
            offset: 0,
            digest: Sha1::new(),
            crc: None,
        }
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn begin_crc(&mut self) {
        self.crc = Some(crc32fast::Hasher::new());
    }

    fn take_crc(&mut self) -> u32 {
        self.crc.take().map_or(0, |h| h.finalize())
    }

    fn digest(&self) -> ObjectId {
        ObjectId::from_hasher(self.digest.clone())
    }

    fn fill(&mut self) -> Result<&[u8]> {
        if self.start == self.end {
            let n = self.src.read(&mut self.buf)?;
            if n == 0 {
                return Err(Error::corrupt("unexpected end of pack stream"));
            }
            self.start = 0;
            self.end = n;
        }
        Ok(&self.buf[self.start..self.end])
    }

    /// Consume `n` buffered bytes: write them to the temp pack and
    /// fold them into the digests.
    fn advance(&mut self, n: usize) -> Result<()> {
        let chunk = &self.buf[self.start..self.start + n];
        self.out.write_all_at(chunk, self.offset)?;
        self.digest.update(chunk);
        if let Some(crc) = &mut self.crc {
            crc.update(chunk);
        }
        self.start += n;
        self.offset += n as u64;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8> {
        let b = self.fill()?[0];
        self.advance(1)?;
        Ok(b)
    }

    fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < dst.len() {
            let chunk = self.fill()?;
            let n = chunk.len().min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&chunk[..n]);
            self.advance(n)?;
            filled += n;
        }
        Ok(())
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read_exact(&mut raw)?;
        Ok(u32::from_be_bytes(raw))
    }

    /// The trailing pack SHA-1 is read raw: not written through and
    /// not folded into the running digest it is compared against.
    fn read_trailer(&mut self, dst: &mut [u8; ID_RAW_LEN]) -> Result<()> {
        let mut filled = 0;
        while filled < dst.len() {
            let chunk = self.fill()?;
            let n = chunk.len().min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&chunk[..n]);
            self.start += n;
            filled += n;
        }
        Ok(())
    }

    /// Inflate one entry's zlib stream. `keep` materializes the
    /// payload; deltas are inflate-discarded in the object phase.
    fn inflate(&mut self, expected: u64, keep: bool) -> Result<Vec<u8>> {
        let expected = expected as usize;
        // one spare byte in keep mode so overruns are observable
        let mut out = vec![0u8; if keep { expected + 1 } else { 64 * 1024 }];
        let mut produced_total = 0usize;
        let mut out_pos = 0usize;
        let mut z = Decompress::new(true);
        loop {
            let chunk = self.fill()?;
            let in_before = z.total_in();
            let out_before = z.total_out();
            let status = z
                .decompress(chunk, &mut out[out_pos..], FlushDecompress::None)
                .map_err(|err| Error::corrupt(format!("zlib: {err}")))?;
            let consumed = (z.total_in() - in_before) as usize;
            let produced = (z.total_out() - out_before) as usize;
            self.advance(consumed)?;
            produced_total += produced;
            if keep {
                out_pos += produced;
            }
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if produced_total > expected {
                        return Err(Error::corrupt(
                            "inflated data overruns the declared object size",
                        ));
                    }
                    if consumed == 0 && produced == 0 {
                        return Err(Error::corrupt("zlib stream stalled"));
                    }
                }
            }
        }
        if produced_total != expected {
            return Err(Error::corrupt(format!(
                "object inflated to {produced_total} bytes, header said {expected}"
            )));
        }
        if keep {
            out.truncate(expected);
            Ok(out)
        } else {
            Ok(Vec::new())
        }
    }
}

// ---------------------------------------------------------------
// resolution against the temp file

struct Resolver<'a> {
    file: &'a File,
    /// Logical end of entry data in the temp file.
    limit: u64,
    db: &'a ObjectDatabase,
    checker: Option<&'a ObjectChecker>,
    entries: &'a mut Vec<IdxEntry>,
    by_id: &'a mut HashMap<ObjectId, Vec<PendingDelta>>,
    by_ofs: &'a mut HashMap<u64, Vec<PendingDelta>>,
    resolved: u64,
}

impl<'a> Resolver<'a> {
    /// Children waiting on a base, id-keyed and offset-keyed lists
    /// interleaved by ascending position.
    fn take_children(&mut self, id: &ObjectId, offset: u64) -> Vec<PendingDelta> {
        let a = self.by_id.remove(id).unwrap_or_default();
        let b = self.by_ofs.remove(&offset).unwrap_or_default();
        let mut out = Vec::with_capacity(a.len() + b.len());
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            if a[i].offset <= b[j].offset {
                out.push(a[i]);
                i += 1;
            } else {
                out.push(b[j]);
                j += 1;
            }
        }
        out.extend_from_slice(&a[i..]);
        out.extend_from_slice(&b[j..]);
        out
    }

    fn resolve_forest(
        &mut self,
        progress: &mut dyn ProgressMonitor,
        base_id: ObjectId,
        base_offset: u64,
    ) -> Result<()> {
        let kids = self.take_children(&base_id, base_offset);
        if kids.is_empty() {
            return Ok(());
        }
        let (kind, data) = self.read_whole_at(base_offset)?;
        self.resolve_list(progress, kind, &data, kids)
    }

    fn resolve_list(
        &mut self,
        progress: &mut dyn ProgressMonitor,
        kind: ObjectKind,
        base_data: &[u8],
        kids: Vec<PendingDelta>,
    ) -> Result<()> {
        for kid in kids {
            check_cancelled(progress)?;
            let delta_stream = self.read_delta_at(&kid)?;
            let result = delta::apply(base_data, &delta_stream)?;
            let id = hash_bytes(kind, &result);
            if let Some(checker) = self.checker {
                checker.check(kind, &result)?;
            }
            collision_check(self.db, &id, kind, &result)?;
            self.entries.push(IdxEntry {
                id,
                offset: kid.offset,
                crc32: Some(kid.crc),
            });
            self.resolved += 1;
            progress.update(self.resolved);

            let grandkids = self.take_children(&id, kid.offset);
            if !grandkids.is_empty() {
                self.resolve_list(progress, kind, &result, grandkids)?;
            }
        }
        Ok(())
    }

    fn read_whole_at(&self, offset: u64) -> Result<(ObjectKind, Vec<u8>)> {
        let mut reader = TempReader::new(self.file, offset, self.limit, false);
        let (header, size) = decode_entry_header(|| reader.read_byte())?;
        let EntryHeader::Whole(kind) = header else {
            return Err(Error::corrupt(format!(
                "expected a whole object at {offset}"
            )));
        };
        let data = reader.inflate(size)?;
        Ok((kind, data))
    }

    /// Re-read a delta entry, re-verifying the CRC recorded while it
    /// streamed in.
    fn read_delta_at(&self, kid: &PendingDelta) -> Result<Vec<u8>> {
        let mut reader = TempReader::new(self.file, kid.offset, self.limit, true);
        let (header, size) = decode_entry_header(|| reader.read_byte())?;
        match header {
            EntryHeader::OfsDelta => {
                decode_ofs_delta(|| reader.read_byte())?;
            }
            EntryHeader::RefDelta => {
                let mut raw = [0u8; ID_RAW_LEN];
                reader.read_exact(&mut raw)?;
            }
            EntryHeader::Whole(_) => {
                return Err(Error::corrupt(format!(
                    "expected a delta at {}",
                    kid.offset
                )))
            }
        }
        let data = reader.inflate(size)?;
        let crc = reader.finish_crc();
        if crc != kid.crc {
            return Err(Error::corrupt(format!(
                "delta at {} changed on disk (CRC {crc:#010x} != {:#010x})",
                kid.offset, kid.crc
            )));
        }
        Ok(data)
    }
}

/// Positional reader over the staged temp pack.
struct TempReader<'f> {
    file: &'f File,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    next_read: u64,
    limit: u64,
    crc: Option<crc32fast::Hasher>,
}

impl<'f> TempReader<'f> {
    fn new(file: &'f File, offset: u64, limit: u64, with_crc: bool) -> Self {
        Self {
            file,
            buf: vec![0u8; 8192],
            start: 0,
            end: 0,
            next_read: offset,
            limit,
            crc: with_crc.then(crc32fast::Hasher::new),
        }
    }

    fn fill(&mut self) -> Result<&[u8]> {
        if self.start == self.end {
            if self.next_read >= self.limit {
                return Err(Error::corrupt("read past end of staged pack"));
            }
            let want = (self.buf.len() as u64).min(self.limit - self.next_read) as usize;
            let got = self.file.read_at(&mut self.buf[..want], self.next_read)?;
            if got == 0 {
                return Err(Error::corrupt("staged pack truncated"));
            }
            self.start = 0;
            self.end = got;
            self.next_read += got as u64;
        }
        Ok(&self.buf[self.start..self.end])
    }

    fn consume(&mut self, n: usize) {
        if let Some(crc) = &mut self.crc {
            crc.update(&self.buf[self.start..self.start + n]);
        }
        self.start += n;
    }

    fn read_byte(&mut self) -> Result<u8> {
        let b = self.fill()?[0];
        self.consume(1);
        Ok(b)
    }

    fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < dst.len() {
            let chunk = self.fill()?;
            let n = chunk.len().min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&chunk[..n]);
            self.consume(n);
            filled += n;
        }
        Ok(())
    }

    fn finish_crc(&mut self) -> u32 {
        self.crc.take().map_or(0, |h| h.finalize())
    }

    fn inflate(&mut self, expected: u64) -> Result<Vec<u8>> {
        let expected = expected as usize;
        let mut out = vec![0u8; expected + 1];
        let mut out_pos = 0usize;
        let mut z = Decompress::new(true);
        loop {
            let (consumed, status) = {
                let chunk = self.fill()?;
                let in_before = z.total_in();
                let out_before = z.total_out();
                let status = z
                    .decompress(chunk, &mut out[out_pos..], FlushDecompress::None)
                    .map_err(|err| Error::corrupt(format!("zlib: {err}")))?;
                out_pos += (z.total_out() - out_before) as usize;
                ((z.total_in() - in_before) as usize, status)
            };
            self.consume(consumed);
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if out_pos > expected {
                        return Err(Error::corrupt(
                            "inflated data overruns the declared object size",
                        ));
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
}

/// Convenience entry point: ingest `src` into the database and
/// publish the result.
pub fn ingest_pack<R: Read>(
    db: &ObjectDatabase,
    src: R,
    fix_thin: bool,
    progress: &mut dyn ProgressMonitor,
) -> Result<Option<Arc<PackFile>>> {
    let mut indexer = PackIndexer::new(db, src);
    indexer.set_fix_thin(fix_thin);
    indexer.index(progress)?;
    indexer.rename_and_open_pack()
}
