//! Pack index files: random-access name → offset lookup over a pack.
//!
//! Two on-disk versions are accepted. V1 interleaves 32-bit offsets
//! with names; V2 splits names, CRCs and offsets into planes and
//! spills offsets ≥ 2^31 into a trailing 64-bit table.

use crate::errors::{Error, Result};
use crate::object::{ObjectId, ID_RAW_LEN};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use io_tee::TeeWriter;
use sha1::{Digest, Sha1};
use std::io::{Cursor, Read, Write};
use std::path::Path;

pub const IDX_MAGIC: [u8; 4] = [0xff, 0x74, 0x4f, 0x63];
const FANOUT_ENTRIES: usize = 256;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// One record of an index: where `id` lives in the pack, and for V2
/// files the CRC-32 of its packed representation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IdxEntry {
    pub id: ObjectId,
    pub offset: u64,
    pub crc32: Option<u32>,
}

/// An in-memory pack index, V1 or V2.
pub struct PackIndex {
    version: u32,
    fanout: [u32; FANOUT_ENTRIES],
    names: Vec<ObjectId>,
    offsets: Vec<u64>,
    crcs: Option<Vec<u32>>,
    pack_checksum: ObjectId,
}

impl PackIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::parse(&bytes)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 * ID_RAW_LEN {
            return Err(Error::corrupt("index file too short"));
        }
        verify_trailing_checksum(bytes)?;

        let mut reader = Cursor::new(&bytes[..bytes.len() - ID_RAW_LEN]);
        let version = {
            let mut magic = [0u8; 4];
            reader.read_exact(&mut magic)?;
            if magic == IDX_MAGIC {
                let version = reader.read_u32::<BigEndian>()?;
                if version != 2 {
                    return Err(Error::Unsupported(format!("pack index version {version}")));
                }
                2
            } else {
                reader.set_position(0);
                1
            }
        };

        let mut fanout = [0u32; FANOUT_ENTRIES];
        for slot in fanout.iter_mut() {
            *slot = reader.read_u32::<BigEndian>()?;
        }
        if fanout.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::corrupt("index fan-out not monotone"));
        }
        let count = fanout[FANOUT_ENTRIES - 1] as usize;

        let mut names = Vec::with_capacity(count);
        let mut offsets = Vec::with_capacity(count);
        let mut crcs = None;

        if version == 1 {
            let mut raw = [0u8; ID_RAW_LEN];
            for _ in 0..count {
                let offset = reader.read_u32::<BigEndian>()? as u64;
                reader.read_exact(&mut raw)?;
                names.push(ObjectId::from_raw(raw));
                offsets.push(offset);
            }
        } else {
            let mut raw = [0u8; ID_RAW_LEN];
            for _ in 0..count {
                reader.read_exact(&mut raw)?;
                names.push(ObjectId::from_raw(raw));
            }
            let mut crc_plane = Vec::with_capacity(count);
            for _ in 0..count {
                crc_plane.push(reader.read_u32::<BigEndian>()?);
            }
            crcs = Some(crc_plane);
            let mut small = Vec::with_capacity(count);
            for _ in 0..count {
                small.push(reader.read_u32::<BigEndian>()?);
            }
            let spilled = small.iter().filter(|&&o| o & LARGE_OFFSET_FLAG != 0).count();
            let mut large = Vec::with_capacity(spilled);
            for _ in 0..spilled {
                large.push(reader.read_u64::<BigEndian>()?);
            }
            for o in small {
                if o & LARGE_OFFSET_FLAG != 0 {
                    let slot = (o & !LARGE_OFFSET_FLAG) as usize;
                    let resolved = *large
                        .get(slot)
                        .ok_or_else(|| Error::corrupt("64-bit offset slot out of range"))?;
                    offsets.push(resolved);
                } else {
                    offsets.push(o as u64);
                }
            }
        }

        if names.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::corrupt("index names not strictly ascending"));
        }
        for (i, name) in names.iter().enumerate() {
            let first = name.first_byte() as usize;
            let lo = if first == 0 { 0 } else { fanout[first - 1] as usize };
            if i < lo || i >= fanout[first] as usize {
                return Err(Error::corrupt("index fan-out inconsistent with names"));
            }
        }

        let mut pack_raw = [0u8; ID_RAW_LEN];
        reader.read_exact(&mut pack_raw)?;

        Ok(Self {
            version,
            fanout,
            names,
            offsets,
            crcs,
            pack_checksum: ObjectId::from_raw(pack_raw),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn object_count(&self) -> usize {
        self.names.len()
    }

    pub fn pack_checksum(&self) -> ObjectId {
        self.pack_checksum
    }

    fn position_of(&self, id: &ObjectId) -> Option<usize> {
        let first = id.first_byte() as usize;
        let lo = if first == 0 {
            0
        } else {
            self.fanout[first - 1] as usize
        };
        let hi = self.fanout[first] as usize;
        self.names[lo..hi]
            .binary_search(id)
            .ok()
            .map(|found| lo + found)
    }

    pub fn has_object(&self, id: &ObjectId) -> bool {
        self.position_of(id).is_some()
    }

    pub fn find_offset(&self, id: &ObjectId) -> Option<u64> {
        self.position_of(id).map(|at| self.offsets[at])
    }

    /// CRC-32 of the packed entry; V1 files carry none.
    pub fn find_crc32(&self, id: &ObjectId) -> Result<u32> {
        let crcs = self
            .crcs
            .as_ref()
            .ok_or_else(|| Error::Unsupported("pack index V1 stores no CRCs".into()))?;
        let at = self
            .position_of(id)
            .ok_or_else(|| Error::not_found(id.to_hex()))?;
        Ok(crcs[at])
    }

    /// All entries in ascending id order.
    pub fn entries(&self) -> impl Iterator<Item = IdxEntry> + '_ {
        self.names.iter().enumerate().map(|(i, &id)| IdxEntry {
            id,
            offset: self.offsets[i],
            crc32: self.crcs.as_ref().map(|c| c[i]),
        })
    }

    /// Ids whose hex form starts with the abbreviation.
    pub fn matching(&self, prefix: &crate::object::AbbreviatedObjectId) -> Vec<ObjectId> {
        let first = self
            .names
            .partition_point(|name| prefix.prefix_compare(name) == std::cmp::Ordering::Greater);
        self.names[first..]
            .iter()
            .take_while(|name| prefix.matches(name))
            .copied()
            .collect()
    }
}

/// Writes `entries` as a pack index, emitting the oldest format that
/// can represent the data unless `force_version` demands otherwise.
/// Returns the version written.
pub fn write_index<W: Write>(
    out: W,
    entries: &mut Vec<IdxEntry>,
    pack_checksum: ObjectId,
    force_version: Option<u32>,
) -> Result<u32> {
    entries.sort_by(|a, b| a.id.cmp(&b.id));

    let needs_v2 = entries.iter().any(|e| e.offset > i32::MAX as u64);
    let version = match force_version {
        Some(v @ (1 | 2)) => {
            if v == 1 && needs_v2 {
                return Err(Error::Unsupported(
                    "pack too large for index version 1".into(),
                ));
            }
            v
        }
        Some(v) => return Err(Error::Unsupported(format!("pack index version {v}"))),
        None if needs_v2 => 2,
        None => 1,
    };

    let mut hasher = Sha1::new();
    let mut out = out;
    let mut writer = TeeWriter::new(&mut hasher, &mut out);

    let mut fanout = [0u32; FANOUT_ENTRIES];
    for entry in entries.iter() {
        fanout[entry.id.first_byte() as usize] += 1;
    }
    for i in 1..FANOUT_ENTRIES {
        fanout[i] += fanout[i - 1];
    }

    if version == 1 {
        for f in fanout {
            writer.write_u32::<BigEndian>(f)?;
        }
        for entry in entries.iter() {
            writer.write_u32::<BigEndian>(entry.offset as u32)?;
            writer.write_all(entry.id.as_bytes())?;
        }
    } else {
        writer.write_all(&IDX_MAGIC)?;
        writer.write_u32::<BigEndian>(2)?;
        for f in fanout {
            writer.write_u32::<BigEndian>(f)?;
        }
        for entry in entries.iter() {
            writer.write_all(entry.id.as_bytes())?;
        }
        for entry in entries.iter() {
            writer.write_u32::<BigEndian>(entry.crc32.unwrap_or(0))?;
        }
        let mut large: Vec<u64> = Vec::new();
        for entry in entries.iter() {
            if entry.offset > i32::MAX as u64 {
                writer.write_u32::<BigEndian>(LARGE_OFFSET_FLAG | large.len() as u32)?;
                large.push(entry.offset);
            } else {
                writer.write_u32::<BigEndian>(entry.offset as u32)?;
            }
        }
        for offset in large {
            writer.write_u64::<BigEndian>(offset)?;
        }
    }
    writer.write_all(pack_checksum.as_bytes())?;

    let own = ObjectId::from_hasher(hasher);
    out.write_all(own.as_bytes())?;
    Ok(version)
}

fn verify_trailing_checksum(bytes: &[u8]) -> Result<()> {
    let split = bytes.len() - ID_RAW_LEN;
    let mut hasher = Sha1::new();
    hasher.update(&bytes[..split]);
    let actual = ObjectId::from_hasher(hasher);
    let stored = ObjectId::from_bytes(&bytes[split..])?;
    if actual != stored {
        return Err(Error::corrupt(format!(
            "index checksum mismatch (stored {stored}, computed {actual})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::hash_bytes;
    use crate::object::ObjectKind;

    fn entry(id: ObjectId, offset: u64, crc32: u32) -> IdxEntry {
        IdxEntry {
            id,
            offset,
            crc32: Some(crc32),
        }
    }

    fn round_trip(entries: &mut Vec<IdxEntry>, force: Option<u32>) -> (u32, PackIndex) {
        let mut buf = Vec::new();
        let version = write_index(&mut buf, entries, ObjectId::zero(), force).unwrap();
        (version, PackIndex::parse(&buf).unwrap())
    }

    #[test]
    fn empty_index_round_trips() {
        let (version, idx) = round_trip(&mut Vec::new(), None);
        assert_eq!(version, 1);
        assert_eq!(idx.object_count(), 0);
        assert!(!idx.has_object(&ObjectId::zero()));
    }

    #[test]
    fn single_object_lookup_works_in_both_versions() {
        let id = hash_bytes(ObjectKind::Blob, b"hello\n");
        for force in [None, Some(2)] {
            let (version, idx) = round_trip(&mut vec![entry(id, 12, 0xdead_beef)], force);
            assert_eq!(version, force.unwrap_or(1));
            assert_eq!(idx.find_offset(&id), Some(12));
            assert!(idx.has_object(&id));
            assert_eq!(idx.entries().count(), 1);
            match version {
                1 => assert!(matches!(idx.find_crc32(&id), Err(Error::Unsupported(_)))),
                _ => assert_eq!(idx.find_crc32(&id).unwrap(), 0xdead_beef),
            }
        }
    }

    #[test]
    fn offset_at_2_gib_forces_v2_and_spills() {
        let a = hash_bytes(ObjectKind::Blob, b"a");
        let b = hash_bytes(ObjectKind::Blob, b"b");
        let mut entries = vec![entry(a, 12, 1), entry(b, 1u64 << 31, 2)];
        let (version, idx) = round_trip(&mut entries, None);
        assert_eq!(version, 2);
        assert_eq!(idx.find_offset(&b), Some(1u64 << 31));
        assert_eq!(idx.find_offset(&a), Some(12));

        // forcing V1 on such a pack is refused
        let mut buf = Vec::new();
        assert!(write_index(&mut buf, &mut entries, ObjectId::zero(), Some(1)).is_err());
    }

    #[test]
    fn multiple_large_offsets_use_distinct_slots() {
        let mut entries: Vec<IdxEntry> = (0u8..4)
            .map(|i| {
                entry(
                    hash_bytes(ObjectKind::Blob, &[i]),
                    (1u64 << 31) + i as u64 * (1u64 << 32),
                    i as u32,
                )
            })
            .collect();
        let (version, idx) = round_trip(&mut entries, None);
        assert_eq!(version, 2);
        for i in 0u8..4 {
            let id = hash_bytes(ObjectKind::Blob, &[i]);
            assert_eq!(
                idx.find_offset(&id),
                Some((1u64 << 31) + i as u64 * (1u64 << 32))
            );
        }
    }

    #[test]
    fn entries_iterate_in_ascending_id_order() {
        let mut entries: Vec<IdxEntry> = (0u8..32)
            .map(|i| entry(hash_bytes(ObjectKind::Blob, &[i]), 12 + i as u64, i as u32))
            .collect();
        let (_, idx) = round_trip(&mut entries, Some(2));
        let ids: Vec<ObjectId> = idx.entries().map(|e| e.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 32);
    }

    #[test]
    fn corrupt_checksum_is_rejected() {
        let id = hash_bytes(ObjectKind::Blob, b"x");
        let mut buf = Vec::new();
        write_index(
            &mut buf,
            &mut vec![entry(id, 12, 0)],
            ObjectId::zero(),
            None,
        )
        .unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(PackIndex::parse(&buf), Err(Error::Corruption(_))));
    }

    #[test]
    fn abbreviation_scan_finds_candidates() {
        let ids: Vec<ObjectId> = (0u8..64).map(|i| hash_bytes(ObjectKind::Blob, &[i])).collect();
        let mut entries: Vec<IdxEntry> = ids
            .iter()
            .map(|&id| entry(id, 12, 0))
            .collect();
        let (_, idx) = round_trip(&mut entries, Some(2));

        let target = ids[17];
        let hex = target.to_hex();
        let abbrev = crate::object::AbbreviatedObjectId::from_hex(&hex.as_bytes()[..7]).unwrap();
        assert!(idx.matching(&abbrev).contains(&target));
    }
}
