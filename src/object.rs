use crate::errors::{Error, Result};
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::fmt::{Debug, Display};
use std::io::Read;
use std::str::FromStr;

/// The four object types stored in the object database, tagged with
/// their pack entry type codes.
///
/// Codes 6 (`OFS_DELTA`) and 7 (`REF_DELTA`) appear only inside pack
/// files and never name a stored object's type; they live in
/// `pack::EntryKind` instead. Type 5 is reserved, type 0 invalid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Commit = 1,
    Tree = 2,
    Blob = 3,
    Tag = 4,
}

impl ObjectKind {
    pub fn from_pack_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Commit),
            2 => Ok(Self::Tree),
            3 => Ok(Self::Blob),
            4 => Ok(Self::Tag),
            _ => Err(Error::corrupt(format!("invalid object type {code}"))),
        }
    }

    pub fn pack_code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
        }
    }
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "commit" => Ok(Self::Commit),
            "tree" => Ok(Self::Tree),
            "blob" => Ok(Self::Blob),
            "tag" => Ok(Self::Tag),
            _ => Err(String::from(s)),
        }
    }
}

pub const ID_RAW_LEN: usize = 20;
pub const ID_HEX_LEN: usize = 40;

/// A 20-byte object name. Equality, hashing and the total order all
/// work on the raw bytes; the lowercase hex form is produced on
/// demand.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    raw: [u8; ID_RAW_LEN],
}

impl ObjectId {
    pub fn zero() -> Self {
        Self {
            raw: [0; ID_RAW_LEN],
        }
    }

    pub fn from_raw(raw: [u8; ID_RAW_LEN]) -> Self {
        Self { raw }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; ID_RAW_LEN] = bytes
            .try_into()
            .map_err(|_| Error::MalformedId(format!("{} raw bytes", bytes.len())))?;
        Ok(Self { raw })
    }

    pub fn from_hex(hex: &[u8]) -> Result<Self> {
        if hex.len() != ID_HEX_LEN {
            return Err(Error::MalformedId(
                String::from_utf8_lossy(hex).into_owned(),
            ));
        }
        let mut raw = [0u8; ID_RAW_LEN];
        for (i, pair) in hex.chunks_exact(2).enumerate() {
            raw[i] = hex_value(pair[0])? << 4 | hex_value(pair[1])?;
        }
        Ok(Self { raw })
    }

    pub fn from_hasher(hasher: Sha1) -> Self {
        Self {
            raw: hasher.finalize().into(),
        }
    }

    pub fn first_byte(&self) -> u8 {
        self.raw[0]
    }

    pub fn as_bytes(&self) -> &[u8; ID_RAW_LEN] {
        &self.raw
    }

    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(ID_HEX_LEN);
        use std::fmt::Write;
        for byte in self.raw.iter() {
            write!(hex, "{:02x}", byte).unwrap();
        }
        hex
    }

    pub fn is_zero(&self) -> bool {
        self.raw == [0; ID_RAW_LEN]
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s.as_bytes())
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId<{}>", self.to_hex())
    }
}

/// Mutable 20-byte scratch buffer for parsers that overwrite the same
/// id many times (pack index iteration, packed-refs parsing).
#[derive(Default)]
pub struct MutableObjectId {
    raw: [u8; ID_RAW_LEN],
}

impl MutableObjectId {
    pub fn set_raw(&mut self, bytes: &[u8; ID_RAW_LEN]) {
        self.raw = *bytes;
    }

    pub fn set_hex(&mut self, hex: &[u8]) -> Result<()> {
        let id = ObjectId::from_hex(hex)?;
        self.raw = id.raw;
        Ok(())
    }

    pub fn to_object_id(&self) -> ObjectId {
        ObjectId { raw: self.raw }
    }
}

/// An abbreviated object name of 1 to 40 hex nibbles. Unused trailing
/// nibbles of the raw buffer are zero; `nibbles` is the shared-prefix
/// length used by comparisons.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct AbbreviatedObjectId {
    nibbles: u8,
    raw: [u8; ID_RAW_LEN],
}

impl AbbreviatedObjectId {
    pub fn from_hex(hex: &[u8]) -> Result<Self> {
        if hex.is_empty() || hex.len() > ID_HEX_LEN {
            return Err(Error::MalformedId(
                String::from_utf8_lossy(hex).into_owned(),
            ));
        }
        let mut raw = [0u8; ID_RAW_LEN];
        for (i, &b) in hex.iter().enumerate() {
            let v = hex_value(b)?;
            if i % 2 == 0 {
                raw[i / 2] = v << 4;
            } else {
                raw[i / 2] |= v;
            }
        }
        Ok(Self {
            nibbles: hex.len() as u8,
            raw,
        })
    }

    pub fn len(&self) -> usize {
        self.nibbles as usize
    }

    pub fn is_complete(&self) -> bool {
        self.nibbles as usize == ID_HEX_LEN
    }

    /// The full id, if all 40 nibbles are present.
    pub fn to_object_id(&self) -> Option<ObjectId> {
        self.is_complete().then_some(ObjectId { raw: self.raw })
    }

    /// Order this abbreviation against a full id, comparing only the
    /// nibbles this abbreviation carries.
    pub fn prefix_compare(&self, other: &ObjectId) -> Ordering {
        let full = self.nibbles as usize / 2;
        match self.raw[..full].cmp(&other.raw[..full]) {
            Ordering::Equal if self.nibbles % 2 == 1 => {
                (self.raw[full] & 0xf0).cmp(&(other.raw[full] & 0xf0))
            }
            ord => ord,
        }
    }

    pub fn matches(&self, other: &ObjectId) -> bool {
        self.prefix_compare(other) == Ordering::Equal
    }
}

impl Display for AbbreviatedObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = ObjectId { raw: self.raw }.to_hex();
        f.write_str(&hex[..self.nibbles as usize])
    }
}

impl Debug for AbbreviatedObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AbbreviatedObjectId<{}>", self)
    }
}

fn hex_value(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(Error::MalformedId(format!("bad hex digit {:#04x}", b))),
    }
}

/// Hash an object's canonical form: `<type> <size>\0` followed by the
/// payload, streamed so large blobs never need full materialization.
pub fn hash_object<R: Read>(kind: ObjectKind, size: u64, mut payload: R) -> Result<ObjectId> {
    let mut hasher = Sha1::new();
    hasher.update(kind.name().as_bytes());
    hasher.update(b" ");
    hasher.update(size.to_string().as_bytes());
    hasher.update(b"\0");
    let copied = std::io::copy(&mut payload, &mut hasher)?;
    if copied != size {
        return Err(Error::corrupt(format!(
            "object payload is {copied} bytes, header said {size}"
        )));
    }
    Ok(ObjectId::from_hasher(hasher))
}

pub fn hash_bytes(kind: ObjectKind, data: &[u8]) -> ObjectId {
    let mut hasher = Sha1::new();
    hasher.update(kind.name().as_bytes());
    hasher.update(b" ");
    hasher.update(data.len().to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(data);
    ObjectId::from_hasher(hasher)
}

/// Who performed a ref mutation; rendered into reflog records as
/// `name <email> seconds ±HHMM`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
    pub when_secs: i64,
    pub tz_offset_mins: i32,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            when_secs: 0,
            tz_offset_mins: 0,
        }
    }

    pub fn at(mut self, when_secs: i64, tz_offset_mins: i32) -> Self {
        self.when_secs = when_secs;
        self.tz_offset_mins = tz_offset_mins;
        self
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.tz_offset_mins < 0 { '-' } else { '+' };
        let offset = self.tz_offset_mins.abs();
        write!(
            f,
            "{} <{}> {} {}{:02}{:02}",
            self.name,
            self.email,
            self.when_secs,
            sign,
            offset / 60,
            offset % 60
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn parses_hex_and_round_trips() {
        let id = ObjectId::from_hex(b"ce013625030ba8dba906f756967f9e9ca394464a").unwrap();
        assert_eq!(
            id.as_bytes(),
            &hex!("ce013625030ba8dba906f756967f9e9ca394464a")
        );
        assert_eq!(id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(matches!(
            ObjectId::from_hex(b"zz013625030ba8dba906f756967f9e9ca394464a"),
            Err(Error::MalformedId(_))
        ));
        assert!(matches!(
            ObjectId::from_hex(b"ce01"),
            Err(Error::MalformedId(_))
        ));
    }

    #[test]
    fn hashes_the_canonical_form() {
        // `echo 'hello' | git hash-object --stdin`
        let id = hash_bytes(ObjectKind::Blob, b"hello\n");
        assert_eq!(id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");

        let streamed = hash_object(ObjectKind::Blob, 6, &b"hello\n"[..]).unwrap();
        assert_eq!(streamed, id);
    }

    #[test]
    fn streaming_hash_checks_declared_size() {
        assert!(hash_object(ObjectKind::Blob, 7, &b"hello\n"[..]).is_err());
    }

    #[test]
    fn abbreviation_prefix_compare_is_consistent_with_full_order() {
        let a = ObjectId::from_hex(b"ab00000000000000000000000000000000000000").unwrap();
        let b = ObjectId::from_hex(b"ab10000000000000000000000000000000000000").unwrap();

        let abbrev = AbbreviatedObjectId::from_hex(b"ab1").unwrap();
        assert_eq!(abbrev.prefix_compare(&a), Ordering::Greater);
        assert_eq!(abbrev.prefix_compare(&b), Ordering::Equal);
        assert!(abbrev.matches(&b));

        // odd nibble counts only look at the high half of the last byte
        let odd = AbbreviatedObjectId::from_hex(b"ab012").unwrap();
        let c = ObjectId::from_hex(b"ab02ffffffffffffffffffffffffffffffffffff").unwrap();
        assert_eq!(odd.prefix_compare(&c), Ordering::Less);

        let full =
            AbbreviatedObjectId::from_hex(b"ab00000000000000000000000000000000000000").unwrap();
        assert!(full.is_complete());
        assert_eq!(full.to_object_id(), Some(a));
        assert_eq!(full.prefix_compare(&a), Ordering::Equal);
    }

    #[test]
    fn mutable_id_reuses_its_buffer() {
        let mut scratch = MutableObjectId::default();
        scratch
            .set_hex(b"ce013625030ba8dba906f756967f9e9ca394464a")
            .unwrap();
        assert_eq!(
            scratch.to_object_id().to_hex(),
            "ce013625030ba8dba906f756967f9e9ca394464a"
        );
        scratch.set_raw(&[0xab; 20]);
        assert_eq!(scratch.to_object_id().first_byte(), 0xab);
    }

    #[test]
    fn identity_renders_reflog_form() {
        let ident = Identity::new("A U Thor", "author@example.com").at(1_700_000_000, -330);
        assert_eq!(
            ident.to_string(),
            "A U Thor <author@example.com> 1700000000 -0530"
        );
    }
}
