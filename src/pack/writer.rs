//! Outbound pack construction from a set of wanted and known ids.

use crate::errors::{Error, Result};
use crate::object::{ObjectId, ObjectKind, ID_RAW_LEN};
use crate::odb::ObjectDatabase;
use crate::pack::idx::{write_index, IdxEntry};
use crate::pack::{delta, encode_entry_header, encode_ofs_delta, EntryHeader, PACK_MAGIC};
use crate::progress::{check_cancelled, ProgressMonitor};
use crate::revision;
use bytes::Bytes;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::io::Write;

/// How many recent same-type objects are tried as delta bases.
const DELTA_WINDOW: usize = 10;

/// The object set chosen for one pack: everything reachable from
/// `wants` minus everything reachable from `haves`.
pub struct PackObjectList {
    objects: Vec<(ObjectId, ObjectKind)>,
    /// Have-side objects usable as external delta bases (thin packs).
    edge_bases: Vec<(ObjectId, ObjectKind)>,
}

impl PackObjectList {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.objects.iter().map(|(id, _)| id)
    }
}

/// Result of writing one pack; entries feed the index writer.
pub struct WrittenPack {
    pub checksum: ObjectId,
    pub entries: Vec<IdxEntry>,
}

impl WrittenPack {
    pub fn object_count(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn write_index<W: Write>(&self, out: W, force_version: Option<u32>) -> Result<u32> {
        let mut entries = self.entries.clone();
        write_index(out, &mut entries, self.checksum, force_version)
    }
}

pub struct PackWriter<'db> {
    db: &'db ObjectDatabase,
    thin: bool,
}

impl<'db> PackWriter<'db> {
    pub fn new(db: &'db ObjectDatabase) -> Self {
        Self { db, thin: false }
    }

    /// Allow deltas against have-side objects that are not shipped;
    /// only ever valid on the wire.
    pub fn set_thin(&mut self, thin: bool) -> &mut Self {
        self.thin = thin;
        self
    }

    /// Walk the graph from `wants`, stopping at anything reachable
    /// from `haves`.
    pub fn object_list(&self, wants: &[ObjectId], haves: &[ObjectId]) -> Result<PackObjectList> {
        let have_set = closure(self.db, haves, true)?;

        let mut seen = HashSet::new();
        let mut commits = Vec::new();
        let mut trees = Vec::new();
        let mut blobs = Vec::new();
        let mut tags = Vec::new();

        let mut stack: Vec<ObjectId> = wants.to_vec();
        while let Some(id) = stack.pop() {
            if have_set.contains(&id) || !seen.insert(id) {
                continue;
            }
            let loader = self.db.open_object(&id)?;
            let kind = loader.kind();
            let data = loader.into_bytes();
            match kind {
                ObjectKind::Commit => {
                    let info = revision::parse_commit(&data)?;
                    stack.push(info.tree);
                    stack.extend(info.parents);
                    commits.push((id, kind));
                }
                ObjectKind::Tree => {
                    for entry in revision::parse_tree(&data)? {
                        if !entry.is_gitlink() {
                            stack.push(entry.id);
                        }
                    }
                    trees.push((id, kind));
                }
                ObjectKind::Blob => blobs.push((id, kind)),
                ObjectKind::Tag => {
                    stack.push(revision::parse_tag(&data)?.target);
                    tags.push((id, kind));
                }
            }
        }

        // edge bases for thin packs: the have tips themselves plus
        // their immediate trees, a small bounded set
        let mut edge_bases = Vec::new();
        if self.thin {
            for id in haves {
                let Ok(loader) = self.db.open_object(id) else {
                    continue;
                };
                let kind = loader.kind();
                edge_bases.push((*id, kind));
                if kind == ObjectKind::Commit {
                    if let Ok(info) = revision::parse_commit(loader.cached_bytes()) {
                        if let Ok(tree) = self.db.open_object(&info.tree) {
                            edge_bases.push((info.tree, tree.kind()));
                        }
                    }
                }
            }
        }

        let mut objects = commits;
        objects.append(&mut trees);
        objects.append(&mut blobs);
        objects.append(&mut tags);
        Ok(PackObjectList {
            objects,
            edge_bases,
        })
    }

    /// Emit header, objects (whole or delta against a sliding window
    /// of recent similar objects), and the SHA-1 trailer.
    pub fn write_pack<W: Write>(
        &self,
        list: &PackObjectList,
        out: W,
        progress: &mut dyn ProgressMonitor,
    ) -> Result<WrittenPack> {
        let mut out = CountingWriter::new(out);
        out.write_all(&PACK_MAGIC)?;
        out.write_all(&2u32.to_be_bytes())?;
        out.write_all(&(list.objects.len() as u32).to_be_bytes())?;

        progress.begin_task("Writing objects", Some(list.objects.len() as u64));

        // sliding window of recently written objects, per type
        struct Emitted {
            offset: u64,
            data: Bytes,
        }
        let mut windows: HashMap<ObjectKind, Vec<Emitted>> = HashMap::new();

        // thin bases resolve by id, not offset
        let mut edges: HashMap<ObjectKind, Vec<(ObjectId, Bytes)>> = HashMap::new();
        for (id, kind) in &list.edge_bases {
            if let Ok(loader) = self.db.open_object(id) {
                edges
                    .entry(*kind)
                    .or_default()
                    .push((*id, loader.into_bytes()));
            }
        }

        let mut entries = Vec::with_capacity(list.objects.len());
        for (done, (id, kind)) in list.objects.iter().enumerate() {
            check_cancelled(progress)?;
            let data = self.db.open_object(id)?.into_bytes();
            let offset = out.offset();
            out.begin_crc();

            enum Choice {
                Whole,
                Ofs { base_offset: u64, delta: Vec<u8> },
                Ref { base: ObjectId, delta: Vec<u8> },
            }

            let mut choice = Choice::Whole;
            let mut best = data.len();
            let window = windows.entry(*kind).or_default();
            for candidate in window.iter().rev().take(DELTA_WINDOW) {
                let attempt = delta::diff(&candidate.data, &data);
                if attempt.len() < best {
                    best = attempt.len();
                    choice = Choice::Ofs {
                        base_offset: candidate.offset,
                        delta: attempt,
                    };
                }
            }
            if self.thin {
                for (base_id, base_data) in edges.get(kind).map_or(&[][..], |v| v.as_slice()) {
                    let attempt = delta::diff(base_data, &data);
                    if attempt.len() < best {
                        best = attempt.len();
                        choice = Choice::Ref {
                            base: *base_id,
                            delta: attempt,
                        };
                    }
                }
            }

            let mut header = Vec::with_capacity(32);
            match &choice {
                Choice::Whole => {
                    encode_entry_header(&mut header, EntryHeader::Whole(*kind), data.len() as u64);
                    out.write_all(&header)?;
                    deflate_into(&mut out, &data)?;
                }
                Choice::Ofs { base_offset, delta } => {
                    encode_entry_header(&mut header, EntryHeader::OfsDelta, delta.len() as u64);
                    encode_ofs_delta(&mut header, offset - base_offset);
                    out.write_all(&header)?;
                    deflate_into(&mut out, delta)?;
                }
                Choice::Ref { base, delta } => {
                    encode_entry_header(&mut header, EntryHeader::RefDelta, delta.len() as u64);
                    header.extend_from_slice(base.as_bytes());
                    out.write_all(&header)?;
                    deflate_into(&mut out, delta)?;
                }
            }

            entries.push(IdxEntry {
                id: *id,
                offset,
                crc32: Some(out.take_crc()),
            });
            window.push(Emitted { offset, data });
            if window.len() > DELTA_WINDOW {
                window.remove(0);
            }
            progress.update(done as u64 + 1);
        }
        progress.end_task();

        let checksum = out.digest();
        out.write_raw(checksum.as_bytes())?;
        Ok(WrittenPack { checksum, entries })
    }
}

fn deflate_into<W: Write>(out: &mut CountingWriter<W>, data: &[u8]) -> Result<()> {
    let mut encoder = ZlibEncoder::new(out, Compression::default());
    encoder.write_all(data)?;
    encoder.finish()?;
    Ok(())
}

/// Everything reachable from `tips`. With `tolerate_missing`, absent
/// objects are skipped rather than fatal (haves may name history we
/// no longer fully store).
fn closure(
    db: &ObjectDatabase,
    tips: &[ObjectId],
    tolerate_missing: bool,
) -> Result<HashSet<ObjectId>> {
    let mut seen = HashSet::new();
    let mut stack: Vec<ObjectId> = tips.to_vec();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let loader = match db.open_object(&id) {
            Ok(loader) => loader,
            Err(err) if tolerate_missing && err.is_not_found() => {
                seen.remove(&id);
                continue;
            }
            Err(err) => return Err(err),
        };
        let data = loader.cached_bytes();
        match loader.kind() {
            ObjectKind::Commit => {
                let info = revision::parse_commit(data)?;
                stack.push(info.tree);
                stack.extend(info.parents);
            }
            ObjectKind::Tree => {
                for entry in revision::parse_tree(data)? {
                    if !entry.is_gitlink() {
                        stack.push(entry.id);
                    }
                }
            }
            ObjectKind::Blob => {}
            ObjectKind::Tag => stack.push(revision::parse_tag(data)?.target),
        }
    }
    Ok(seen)
}

/// [`Write`] wrapper tracking offset, pack digest and per-entry CRC.
/// The trailer goes through [`write_raw`] so it is not folded into
/// the digest it carries.
///
/// [`write_raw`]: CountingWriter::write_raw
struct CountingWriter<W: Write> {
    inner: W,
    offset: u64,
    digest: Sha1,
    crc: Option<crc32fast::Hasher>,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
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

    fn write_raw(&mut self, bytes: &[u8; ID_RAW_LEN]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        if let Some(crc) = &mut self.crc {
            crc.update(&buf[..n]);
        }
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
