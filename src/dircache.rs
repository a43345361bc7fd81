//! The working-tree index: a sorted-entries binary file updated
//! through a builder/editor finish protocol under the lock-file
//! discipline, with racy-clean smudging at write time.

use crate::errors::{Error, Result};
use crate::lock::LockFile;
use crate::object::{ObjectId, ID_RAW_LEN};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const DIRC_MAGIC: [u8; 4] = *b"DIRC";
pub const DIRC_VERSION: u32 = 2;

/// Entry flag bits.
pub const FLAG_ASSUME_VALID: u16 = 0x8000;
pub const FLAG_EXTENDED: u16 = 0x4000;
pub const STAGE_MASK: u16 = 0x3000;
/// 12-bit name length saturates here; longer paths scan for NUL.
pub const NAME_MASK: u16 = 0x0fff;

const ENTRY_FIXED_LEN: usize = 62;

/// One file recorded in the dircache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirCacheEntry {
    pub ctime_secs: u32,
    pub ctime_nsecs: u32,
    pub mtime_secs: u32,
    pub mtime_nsecs: u32,
    pub dev: u32,
    pub ino: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub id: ObjectId,
    pub flags: u16,
    pub path: Vec<u8>,
}

impl DirCacheEntry {
    pub fn new(path: impl Into<Vec<u8>>, stage: u8) -> Self {
        let path = path.into();
        let name_len = path.len().min(NAME_MASK as usize) as u16;
        Self {
            ctime_secs: 0,
            ctime_nsecs: 0,
            mtime_secs: 0,
            mtime_nsecs: 0,
            dev: 0,
            ino: 0,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            size: 0,
            id: ObjectId::zero(),
            flags: ((stage as u16) << 12) & STAGE_MASK | name_len,
            path,
        }
    }

    /// Stage 0 is merged; 1/2/3 are base/ours/theirs of an
    /// unresolved merge.
    pub fn stage(&self) -> u8 {
        ((self.flags & STAGE_MASK) >> 12) as u8
    }

    pub fn is_assume_valid(&self) -> bool {
        self.flags & FLAG_ASSUME_VALID != 0
    }

    /// Copy stat data from the filesystem; the next status check
    /// compares against these fields.
    pub fn set_stat(&mut self, meta: &std::fs::Metadata) {
        use std::os::unix::fs::MetadataExt;
        self.ctime_secs = meta.ctime() as u32;
        self.ctime_nsecs = meta.ctime_nsec() as u32;
        self.mtime_secs = meta.mtime() as u32;
        self.mtime_nsecs = meta.mtime_nsec() as u32;
        self.dev = meta.dev() as u32;
        self.ino = meta.ino() as u32;
        self.mode = meta.mode();
        self.uid = meta.uid();
        self.gid = meta.gid();
        self.size = meta.size() as u32;
    }

    fn key(&self) -> (&[u8], u8) {
        (&self.path, self.stage())
    }

    fn cmp_key(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }

    /// An entry whose stat time ties with the index commit time
    /// cannot be trusted; a zero length forces content comparison.
    fn is_racy(&self, smudge: SystemTime) -> bool {
        let Ok(elapsed) = smudge.duration_since(SystemTime::UNIX_EPOCH) else {
            return false;
        };
        let smudge_secs = elapsed.as_secs() as u32;
        let smudge_nsecs = elapsed.subsec_nanos();
        if self.mtime_secs != smudge_secs {
            return self.mtime_secs > smudge_secs;
        }
        // same second; a filesystem without nanosecond stamps stores 0
        self.mtime_nsecs == 0 || smudge_nsecs == 0 || self.mtime_nsecs >= smudge_nsecs
    }
}

/// The cached-tree annotation stored in the `TREE` extension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheTree {
    pub name: Vec<u8>,
    /// Number of index entries covered, `-1` when invalidated.
    pub entry_span: i32,
    pub id: Option<ObjectId>,
    pub children: Vec<CacheTree>,
}

pub struct DirCache {
    path: PathBuf,
    entries: Vec<DirCacheEntry>,
    tree_ext: Option<CacheTree>,
    read_stamp: Option<SystemTime>,
    lock: Option<LockFile>,
}

impl DirCache {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
            tree_ext: None,
            read_stamp: None,
            lock: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[DirCacheEntry] {
        &self.entries
    }

    pub fn cache_tree(&self) -> Option<&CacheTree> {
        self.tree_ext.as_ref()
    }

    pub fn set_cache_tree(&mut self, tree: Option<CacheTree>) {
        self.tree_ext = tree;
    }

    /// Reload from disk unless the file's mtime is unchanged since
    /// the last read. A missing file is an empty cache.
    pub fn read(&mut self) -> Result<()> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.entries.clear();
                self.tree_ext = None;
                self.read_stamp = None;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let mtime = meta.modified().ok();
        if mtime.is_some() && mtime == self.read_stamp {
            return Ok(());
        }
        let bytes = std::fs::read(&self.path)?;
        let (entries, tree_ext) = parse(&bytes)?;
        self.entries = entries;
        self.tree_ext = tree_ext;
        self.read_stamp = mtime;
        Ok(())
    }

    /// Take the index lock, then refresh from disk; a read failure
    /// releases the lock before surfacing.
    pub fn lock(&mut self) -> Result<()> {
        let mut lock = LockFile::new(&self.path);
        if !lock.lock()? {
            return Err(Error::LockFailure(self.path.display().to_string()));
        }
        self.lock = Some(lock);
        if let Err(err) = self.read() {
            self.unlock();
            return Err(err);
        }
        Ok(())
    }

    pub fn unlock(&mut self) {
        if let Some(mut lock) = self.lock.take() {
            lock.abort();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Serialize into the held lock, smudging entries whose stat
    /// times tie with the moment of writing.
    pub fn write(&mut self) -> Result<()> {
        let lock = self
            .lock
            .as_mut()
            .ok_or_else(|| Error::LockFailure(self.path.display().to_string()))?;
        let smudge = lock.writer()?.metadata()?.modified()?;
        let buf = serialize(&self.entries, self.tree_ext.as_ref(), smudge)?;
        lock.write_all(&buf)?;
        Ok(())
    }

    /// Publish the written index; the commit mtime becomes the new
    /// read stamp.
    pub fn commit(&mut self) -> Result<()> {
        let mut lock = self
            .lock
            .take()
            .ok_or_else(|| Error::LockFailure(self.path.display().to_string()))?;
        lock.commit()?;
        self.read_stamp = lock.commit_time();
        Ok(())
    }

    /// Index of the lowest-stage entry at `path`, or the insertion
    /// point where it would go.
    pub fn find_entry(&self, path: &[u8]) -> std::result::Result<usize, usize> {
        let at = self
            .entries
            .partition_point(|e| (e.path.as_slice(), e.stage()) < (path, 0));
        if self.entries.get(at).is_some_and(|e| e.path == path) {
            Ok(at)
        } else {
            Err(at)
        }
    }

    /// The contiguous run of entries whose paths live under
    /// `prefix/`.
    pub fn entries_within(&self, prefix: &[u8]) -> &[DirCacheEntry] {
        let mut bound = prefix.to_vec();
        bound.push(b'/');
        let start = self
            .entries
            .partition_point(|e| e.path.as_slice() < bound.as_slice());
        let mut end = start;
        while end < self.entries.len() && self.entries[end].path.starts_with(&bound) {
            end += 1;
        }
        &self.entries[start..end]
    }

    pub fn builder(&mut self) -> DirCacheBuilder<'_> {
        DirCacheBuilder {
            cache: self,
            kept: Vec::new(),
            added: Vec::new(),
        }
    }

    pub fn editor(&mut self) -> DirCacheEditor<'_> {
        DirCacheEditor {
            cache: self,
            edits: Vec::new(),
        }
    }
}

impl Drop for DirCache {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Accumulates retained spans and new entries, then replaces the
/// cache contents with their ordered two-way merge.
pub struct DirCacheBuilder<'a> {
    cache: &'a mut DirCache,
    kept: Vec<DirCacheEntry>,
    added: Vec<DirCacheEntry>,
}

impl<'a> DirCacheBuilder<'a> {
    /// Retain a contiguous span of the existing entries.
    pub fn keep(&mut self, start: usize, count: usize) -> &mut Self {
        self.kept
            .extend_from_slice(&self.cache.entries[start..start + count]);
        self
    }

    pub fn add(&mut self, entry: DirCacheEntry) -> &mut Self {
        self.added.push(entry);
        self
    }

    pub fn finish(self) -> Result<()> {
        let mut added = self.added;
        added.sort_by(|a, b| a.cmp_key(b));

        let mut merged = Vec::with_capacity(self.kept.len() + added.len());
        let (mut i, mut j) = (0, 0);
        while i < self.kept.len() && j < added.len() {
            match self.kept[i].cmp_key(&added[j]) {
                Ordering::Less => {
                    merged.push(self.kept[i].clone());
                    i += 1;
                }
                Ordering::Greater => {
                    merged.push(added[j].clone());
                    j += 1;
                }
                Ordering::Equal => {
                    return Err(duplicate(&added[j]));
                }
            }
        }
        merged.extend_from_slice(&self.kept[i..]);
        merged.extend_from_slice(&added[j..]);

        for pair in merged.windows(2) {
            if pair[0].cmp_key(&pair[1]) != Ordering::Less {
                return Err(duplicate(&pair[1]));
            }
        }

        self.cache.entries = merged;
        self.cache.tree_ext = None;
        Ok(())
    }
}

fn duplicate(entry: &DirCacheEntry) -> Error {
    Error::corrupt(format!(
        "duplicate dircache entry {} stage {}",
        String::from_utf8_lossy(&entry.path),
        entry.stage()
    ))
}

/// Path-addressed edit commands applied in one sorted sweep.
pub enum PathEdit {
    /// Insert or replace the entry at its path (all stages collapse).
    Upsert(DirCacheEntry),
    /// Remove every stage of one path.
    DeletePath(Vec<u8>),
    /// Remove everything under `path/`.
    DeleteTree(Vec<u8>),
}

impl PathEdit {
    fn path(&self) -> &[u8] {
        match self {
            PathEdit::Upsert(entry) => &entry.path,
            PathEdit::DeletePath(path) | PathEdit::DeleteTree(path) => path,
        }
    }
}

pub struct DirCacheEditor<'a> {
    cache: &'a mut DirCache,
    edits: Vec<PathEdit>,
}

impl<'a> DirCacheEditor<'a> {
    pub fn add(&mut self, edit: PathEdit) -> &mut Self {
        self.edits.push(edit);
        self
    }

    pub fn finish(self) -> Result<()> {
        let mut edits = self.edits;
        edits.sort_by(|a, b| a.path().cmp(b.path()));

        let old = std::mem::take(&mut self.cache.entries);
        let mut merged = Vec::with_capacity(old.len());
        let mut i = 0;
        for edit in &edits {
            while i < old.len() && old[i].path.as_slice() < edit.path() {
                merged.push(old[i].clone());
                i += 1;
            }
            match edit {
                PathEdit::Upsert(entry) => {
                    while i < old.len() && old[i].path == entry.path {
                        i += 1;
                    }
                    merged.push(entry.clone());
                }
                PathEdit::DeletePath(path) => {
                    while i < old.len() && old[i].path.as_slice() == path.as_slice() {
                        i += 1;
                    }
                }
                PathEdit::DeleteTree(path) => {
                    let mut bound = path.clone();
                    bound.push(b'/');
                    while i < old.len() && old[i].path.starts_with(&bound) {
                        i += 1;
                    }
                }
            }
        }
        merged.extend_from_slice(&old[i..]);

        self.cache.entries = merged;
        self.cache.tree_ext = None;
        Ok(())
    }
}

// ---------------------------------------------------------------
// wire format

fn parse(bytes: &[u8]) -> Result<(Vec<DirCacheEntry>, Option<CacheTree>)> {
    if bytes.len() < 12 + ID_RAW_LEN {
        return Err(Error::corrupt("index file too short"));
    }
    let body_len = bytes.len() - ID_RAW_LEN;
    let mut hasher = Sha1::new();
    hasher.update(&bytes[..body_len]);
    let actual = ObjectId::from_hasher(hasher);
    let stored = ObjectId::from_bytes(&bytes[body_len..])?;
    if actual != stored {
        return Err(Error::corrupt("index checksum mismatch"));
    }

    let mut reader = Cursor::new(&bytes[..body_len]);
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != DIRC_MAGIC {
        return Err(Error::corrupt("not an index file"));
    }
    let version = reader.read_u32::<BigEndian>()?;
    if version != DIRC_VERSION {
        return Err(Error::Unsupported(format!("index version {version}")));
    }
    let count = reader.read_u32::<BigEndian>()? as usize;

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(parse_entry(&mut reader)?);
    }
    for pair in entries.windows(2) {
        if pair[0].cmp_key(&pair[1]) != Ordering::Less {
            return Err(Error::corrupt("index entries out of order"));
        }
    }

    // extensions: 4-byte name, 4-byte length, payload
    let mut tree_ext = None;
    while (reader.position() as usize) < body_len {
        let mut name = [0u8; 4];
        reader.read_exact(&mut name)?;
        let len = reader.read_u32::<BigEndian>()? as usize;
        let at = reader.position() as usize;
        if at + len > body_len {
            return Err(Error::corrupt("index extension overruns file"));
        }
        let payload = &bytes[at..at + len];
        reader.set_position((at + len) as u64);

        if name == *b"TREE" {
            tree_ext = Some(parse_cache_tree(payload)?);
        } else if name[0].is_ascii_uppercase() {
            tracing::debug!(
                "skipping optional index extension {}",
                String::from_utf8_lossy(&name)
            );
        } else {
            return Err(Error::Unsupported(format!(
                "mandatory index extension {}",
                String::from_utf8_lossy(&name)
            )));
        }
    }

    Ok((entries, tree_ext))
}

fn parse_entry(reader: &mut Cursor<&[u8]>) -> Result<DirCacheEntry> {
    let ctime_secs = reader.read_u32::<BigEndian>()?;
    let ctime_nsecs = reader.read_u32::<BigEndian>()?;
    let mtime_secs = reader.read_u32::<BigEndian>()?;
    let mtime_nsecs = reader.read_u32::<BigEndian>()?;
    let dev = reader.read_u32::<BigEndian>()?;
    let ino = reader.read_u32::<BigEndian>()?;
    let mode = reader.read_u32::<BigEndian>()?;
    let uid = reader.read_u32::<BigEndian>()?;
    let gid = reader.read_u32::<BigEndian>()?;
    let size = reader.read_u32::<BigEndian>()?;
    let mut raw = [0u8; ID_RAW_LEN];
    reader.read_exact(&mut raw)?;
    let id = ObjectId::from_raw(raw);
    let flags = reader.read_u16::<BigEndian>()?;
    if flags & FLAG_EXTENDED != 0 {
        return Err(Error::Unsupported("extended index entry flags".into()));
    }

    let data = *reader.get_ref();
    let name_at = reader.position() as usize;
    let name_len = (flags & NAME_MASK) as usize;
    let path = if name_len < NAME_MASK as usize {
        let end = name_at + name_len;
        if end > data.len() {
            return Err(Error::corrupt("index entry name overruns file"));
        }
        data[name_at..end].to_vec()
    } else {
        // length saturated: the real name is NUL-delimited
        let end = data[name_at..]
            .iter()
            .position(|&b| b == 0)
            .map(|off| name_at + off)
            .ok_or_else(|| Error::corrupt("unterminated index entry name"))?;
        data[name_at..end].to_vec()
    };

    // NUL padding rounds each entry to an 8-byte multiple
    let entry_len = ENTRY_FIXED_LEN + path.len();
    let padded = (entry_len / 8 + 1) * 8;
    let next = name_at - ENTRY_FIXED_LEN + padded;
    if next > data.len() {
        return Err(Error::corrupt("index entry padding overruns file"));
    }
    reader.set_position(next as u64);

    Ok(DirCacheEntry {
        ctime_secs,
        ctime_nsecs,
        mtime_secs,
        mtime_nsecs,
        dev,
        ino,
        mode,
        uid,
        gid,
        size,
        id,
        flags,
        path,
    })
}

fn serialize(
    entries: &[DirCacheEntry],
    tree_ext: Option<&CacheTree>,
    smudge: SystemTime,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(entries.len() * 96 + 64);
    out.write_all(&DIRC_MAGIC)?;
    out.write_u32::<BigEndian>(DIRC_VERSION)?;
    out.write_u32::<BigEndian>(entries.len() as u32)?;

    for entry in entries {
        out.write_u32::<BigEndian>(entry.ctime_secs)?;
        out.write_u32::<BigEndian>(entry.ctime_nsecs)?;
        out.write_u32::<BigEndian>(entry.mtime_secs)?;
        out.write_u32::<BigEndian>(entry.mtime_nsecs)?;
        out.write_u32::<BigEndian>(entry.dev)?;
        out.write_u32::<BigEndian>(entry.ino)?;
        out.write_u32::<BigEndian>(entry.mode)?;
        out.write_u32::<BigEndian>(entry.uid)?;
        out.write_u32::<BigEndian>(entry.gid)?;
        let size = if entry.stage() == 0 && entry.is_racy(smudge) {
            0
        } else {
            entry.size
        };
        out.write_u32::<BigEndian>(size)?;
        out.write_all(entry.id.as_bytes())?;
        let name_len = entry.path.len().min(NAME_MASK as usize) as u16;
        out.write_u16::<BigEndian>(entry.flags & !NAME_MASK | name_len)?;
        out.write_all(&entry.path)?;

        let entry_len = ENTRY_FIXED_LEN + entry.path.len();
        let padded = (entry_len / 8 + 1) * 8;
        out.resize(out.len() + (padded - entry_len), 0);
    }

    if let Some(tree) = tree_ext {
        let mut payload = Vec::new();
        write_cache_tree(&mut payload, tree);
        out.write_all(b"TREE")?;
        out.write_u32::<BigEndian>(payload.len() as u32)?;
        out.write_all(&payload)?;
    }

    let mut hasher = Sha1::new();
    hasher.update(&out);
    let checksum = ObjectId::from_hasher(hasher);
    out.write_all(checksum.as_bytes())?;
    Ok(out)
}

// `TREE` payload: per node `<name>\0<entry_span> <subtree_count>\n`
// followed by the tree id when the span is valid, children depth
// first.
fn parse_cache_tree(payload: &[u8]) -> Result<CacheTree> {
    let mut pos = 0;
    let tree = parse_cache_tree_node(payload, &mut pos)?;
    Ok(tree)
}

fn parse_cache_tree_node(payload: &[u8], pos: &mut usize) -> Result<CacheTree> {
    let nul = payload[*pos..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::corrupt("cache tree name unterminated"))?;
    let name = payload[*pos..*pos + nul].to_vec();
    *pos += nul + 1;

    let line_end = payload[*pos..]
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| Error::corrupt("cache tree header unterminated"))?;
    let header = std::str::from_utf8(&payload[*pos..*pos + line_end])
        .map_err(|_| Error::corrupt("cache tree header not UTF-8"))?;
    *pos += line_end + 1;

    let (span_text, subtrees_text) = header
        .split_once(' ')
        .ok_or_else(|| Error::corrupt("cache tree header malformed"))?;
    let entry_span: i32 = span_text
        .parse()
        .map_err(|_| Error::corrupt("cache tree span not a number"))?;
    let subtree_count: usize = subtrees_text
        .parse()
        .map_err(|_| Error::corrupt("cache tree count not a number"))?;

    let id = if entry_span >= 0 {
        if *pos + ID_RAW_LEN > payload.len() {
            return Err(Error::corrupt("cache tree id truncated"));
        }
        let id = ObjectId::from_bytes(&payload[*pos..*pos + ID_RAW_LEN])?;
        *pos += ID_RAW_LEN;
        Some(id)
    } else {
        None
    };

    let mut children = Vec::with_capacity(subtree_count);
    for _ in 0..subtree_count {
        children.push(parse_cache_tree_node(payload, pos)?);
    }
    Ok(CacheTree {
        name,
        entry_span,
        id,
        children,
    })
}

fn write_cache_tree(out: &mut Vec<u8>, tree: &CacheTree) {
    out.extend_from_slice(&tree.name);
    out.push(0);
    out.extend_from_slice(
        format!("{} {}\n", tree.entry_span, tree.children.len()).as_bytes(),
    );
    if tree.entry_span >= 0 {
        if let Some(id) = &tree.id {
            out.extend_from_slice(id.as_bytes());
        }
    }
    for child in &tree.children {
        write_cache_tree(out, child);
    }
}
