//! The pack layer: on-disk pack/index formats, the window cache, the
//! cached random-access reader, the streaming ingester and the
//! outbound writer.

pub mod cache;
pub mod delta;
pub mod file;
pub mod idx;
pub mod indexer;
pub mod window;
pub mod writer;

use crate::config::CoreConfig;
use crate::errors::{Error, Result};
use crate::object::ObjectKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The shared read-side machinery: one window cache and one
/// delta-base cache, constructed once and handed to every pack
/// reader. Hosts that want process-wide sharing keep one `Engine`;
/// nothing in the crate is a true singleton.
pub struct Engine {
    pub windows: Arc<window::WindowCache>,
    pub delta_bases: Arc<cache::DeltaBaseCache>,
}

impl Engine {
    pub fn new(config: &CoreConfig) -> Arc<Self> {
        Arc::new(Self {
            windows: Arc::new(window::WindowCache::new(config.into())),
            delta_bases: Arc::new(cache::DeltaBaseCache::new(config.delta_base_cache_limit)),
        })
    }
}

impl Default for Engine {
    fn default() -> Self {
        let config = CoreConfig::default();
        Self {
            windows: Arc::new(window::WindowCache::new((&config).into())),
            delta_bases: Arc::new(cache::DeltaBaseCache::new(config.delta_base_cache_limit)),
        }
    }
}

pub const PACK_MAGIC: [u8; 4] = *b"PACK";

/// Pack entry type codes 6 and 7: objects stored as deltas.
pub const OFS_DELTA: u8 = 6;
pub const REF_DELTA: u8 = 7;

/// Process-unique identity of one open pack file, used to key the
/// window cache and the delta-base cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackId(u64);

impl PackId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Header of one pack entry before its zlib stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryHeader {
    Whole(ObjectKind),
    OfsDelta,
    RefDelta,
}

impl EntryHeader {
    pub fn code(self) -> u8 {
        match self {
            Self::Whole(kind) => kind.pack_code(),
            Self::OfsDelta => OFS_DELTA,
            Self::RefDelta => REF_DELTA,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1..=4 => Ok(Self::Whole(ObjectKind::from_pack_code(code)?)),
            OFS_DELTA => Ok(Self::OfsDelta),
            REF_DELTA => Ok(Self::RefDelta),
            5 => Err(Error::corrupt("reserved object type 5")),
            _ => Err(Error::corrupt(format!("invalid object type {code}"))),
        }
    }
}

/// Decode an entry header: one byte supplies the 3-bit type and the
/// low 4 size bits, continuation bytes append 7 bits at a time in
/// little-endian order.
pub fn decode_entry_header<F>(mut next_byte: F) -> Result<(EntryHeader, u64)>
where
    F: FnMut() -> Result<u8>,
{
    let b = next_byte()?;
    let header = EntryHeader::from_code((b >> 4) & 0x7)?;
    let mut size = (b & 0x0f) as u64;
    let mut shift = 4;
    let mut cont = b & 0x80 != 0;
    while cont {
        let b = next_byte()?;
        if shift > 57 {
            return Err(Error::corrupt("object size varint too long"));
        }
        size |= ((b & 0x7f) as u64) << shift;
        shift += 7;
        cont = b & 0x80 != 0;
    }
    Ok((header, size))
}

pub fn encode_entry_header(out: &mut Vec<u8>, header: EntryHeader, size: u64) {
    let mut size = size;
    let mut b = (header.code() << 4) | (size & 0x0f) as u8;
    size >>= 4;
    while size > 0 {
        out.push(b | 0x80);
        b = (size & 0x7f) as u8;
        size >>= 7;
    }
    out.push(b);
}

/// Decode the negative-offset varint that follows an `OFS_DELTA`
/// header. Continuation bytes add one before shifting, so the
/// encoding has no redundant forms.
pub fn decode_ofs_delta<F>(mut next_byte: F) -> Result<u64>
where
    F: FnMut() -> Result<u8>,
{
    let mut b = next_byte()?;
    let mut ofs = (b & 0x7f) as u64;
    while b & 0x80 != 0 {
        b = next_byte()?;
        ofs = ofs
            .checked_add(1)
            .and_then(|o| o.checked_mul(128))
            .ok_or_else(|| Error::corrupt("delta base offset varint overflow"))?
            | (b & 0x7f) as u64;
    }
    Ok(ofs)
}

pub fn encode_ofs_delta(out: &mut Vec<u8>, ofs: u64) {
    let mut buf = [0u8; 10];
    let mut pos = buf.len() - 1;
    let mut ofs = ofs;
    buf[pos] = (ofs & 0x7f) as u8;
    while ofs >> 7 != 0 {
        ofs = (ofs >> 7) - 1;
        pos -= 1;
        buf[pos] = 0x80 | (ofs & 0x7f) as u8;
    }
    out.extend_from_slice(&buf[pos..]);
}

/// 7-bit little-endian varint used for the base and result sizes at
/// the front of a delta stream.
pub fn decode_varint<F>(mut next_byte: F) -> Result<u64>
where
    F: FnMut() -> Result<u8>,
{
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        let b = next_byte()?;
        if shift > 63 {
            return Err(Error::corrupt("varint too long"));
        }
        value |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub fn encode_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let b = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(b);
            return;
        }
        out.push(b | 0x80);
    }
}

/// Byte-by-byte reader adapter for the decoders above.
pub(crate) fn slice_bytes<'a>(data: &'a [u8], pos: &'a mut usize) -> impl FnMut() -> Result<u8> + 'a {
    move || {
        let b = *data
            .get(*pos)
            .ok_or_else(|| Error::corrupt("truncated stream"))?;
        *pos += 1;
        Ok(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ofs_round_trip(value: u64) -> u64 {
        let mut buf = Vec::new();
        encode_ofs_delta(&mut buf, value);
        let mut pos = 0;
        let decoded = decode_ofs_delta(slice_bytes(&buf, &mut pos)).unwrap();
        assert_eq!(pos, buf.len());
        decoded
    }

    fn varint_round_trip(value: u64) -> u64 {
        let mut buf = Vec::new();
        encode_varint(&mut buf, value);
        let mut pos = 0;
        let decoded = decode_varint(slice_bytes(&buf, &mut pos)).unwrap();
        assert_eq!(pos, buf.len());
        decoded
    }

    #[test]
    fn varint_round_trips_across_the_range() {
        for value in [
            0u64,
            1,
            0x7f,
            0x80,
            0x3fff,
            0x4000,
            u32::MAX as u64,
            (1u64 << 62) + 12345,
        ] {
            assert_eq!(varint_round_trip(value), value);
        }
    }

    #[test]
    fn ofs_delta_round_trips_near_continuation_boundaries() {
        for value in [0u64, 1, 0x7f, 0x80, 0x3fff, 0x4000, 0x20_3fff, 1 << 40] {
            assert_eq!(ofs_round_trip(value), value);
        }
    }

    #[test]
    fn ofs_delta_boundary_encodings_are_minimal() {
        let mut buf = Vec::new();
        encode_ofs_delta(&mut buf, 0x7f);
        assert_eq!(buf.len(), 1);

        buf.clear();
        encode_ofs_delta(&mut buf, 0x80);
        assert_eq!(buf.len(), 2);

        // 0x3fff is the largest two-byte offset: 127 + (127+1)*128 - 1
        buf.clear();
        encode_ofs_delta(&mut buf, 0x407f);
        assert_eq!(buf.len(), 2);
        buf.clear();
        encode_ofs_delta(&mut buf, 0x4080);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn entry_header_round_trips() {
        use crate::object::ObjectKind;

        for (header, size) in [
            (EntryHeader::Whole(ObjectKind::Blob), 0u64),
            (EntryHeader::Whole(ObjectKind::Commit), 15),
            (EntryHeader::Whole(ObjectKind::Tree), 16),
            (EntryHeader::OfsDelta, 1 << 20),
            (EntryHeader::RefDelta, u32::MAX as u64),
        ] {
            let mut buf = Vec::new();
            encode_entry_header(&mut buf, header, size);
            let mut pos = 0;
            let (got_header, got_size) =
                decode_entry_header(slice_bytes(&buf, &mut pos)).unwrap();
            assert_eq!(got_header, header);
            assert_eq!(got_size, size);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn reserved_and_invalid_types_are_rejected() {
        assert!(EntryHeader::from_code(0).is_err());
        assert!(EntryHeader::from_code(5).is_err());
    }
}
