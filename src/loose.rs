//! One-file-per-object storage under `objects/xx/yyyy…`.
//!
//! Two wire formats are read: the legacy whole-file zlib stream whose
//! plaintext starts `<type> <size>\0`, and the packed-style form with
//! a raw varint header followed by a zlib stream of the payload only.
//! Writing always emits the legacy form, the oldest format every
//! reader accepts.

use crate::errors::{Error, Result};
use crate::object::{ObjectId, ObjectKind};
use crate::pack::{decode_entry_header, EntryHeader};
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use io_tee::TeeWriter;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LooseFormat {
    Legacy,
    Packed,
}

#[derive(Debug)]
pub struct LooseObject {
    pub kind: ObjectKind,
    pub data: Bytes,
    pub format: LooseFormat,
}

/// Reader/writer over one `objects/` directory.
pub struct LooseStore {
    dir: PathBuf,
}

impl LooseStore {
    pub fn new(objects_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: objects_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.dir.join(&hex[..2]).join(&hex[2..])
    }

    pub fn has(&self, id: &ObjectId) -> bool {
        self.path_of(id).is_file()
    }

    pub fn read(&self, id: &ObjectId) -> Result<LooseObject> {
        let path = self.path_of(id);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found(id.to_hex()))
            }
            Err(err) => return Err(err.into()),
        };

        let mut probe = [0u8; 2];
        file.read_exact(&mut probe)
            .map_err(|_| Error::corrupt(format!("loose object {id} is truncated")))?;
        file.seek(SeekFrom::Start(0))?;

        // legacy streams carry a bare zlib header: 0x78 and a 16-bit
        // big-endian word divisible by 31
        let word = u16::from_be_bytes(probe);
        if probe[0] == 0x78 && word % 31 == 0 {
            self.read_legacy(id, file)
        } else {
            self.read_packed(id, file)
        }
    }

    fn read_legacy(&self, id: &ObjectId, file: File) -> Result<LooseObject> {
        let decoder = ZlibDecoder::new(file);
        let mut reader = BufReader::new(decoder);

        let mut kind_buf = Vec::with_capacity(8);
        reader.read_until(b' ', &mut kind_buf)?;
        if kind_buf.pop() != Some(b' ') {
            return Err(Error::corrupt(format!("loose object {id} has no header")));
        }
        let kind = std::str::from_utf8(&kind_buf)
            .ok()
            .and_then(|s| ObjectKind::from_str(s).ok())
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "unrecognized object type {:?} in {id}",
                    String::from_utf8_lossy(&kind_buf)
                ))
            })?;

        let mut size_buf = Vec::with_capacity(16);
        reader.read_until(b'\0', &mut size_buf)?;
        if size_buf.pop() != Some(b'\0') {
            return Err(Error::corrupt(format!("loose object {id} has no size")));
        }
        let size: u64 = std::str::from_utf8(&size_buf)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::corrupt(format!("bad size in loose object {id}")))?;

        let mut data = Vec::with_capacity(size as usize);
        reader.read_to_end(&mut data)?;
        if data.len() as u64 != size {
            return Err(Error::corrupt(format!(
                "loose object {id} is {} bytes, header said {size}",
                data.len()
            )));
        }
        Ok(LooseObject {
            kind,
            data: Bytes::from(data),
            format: LooseFormat::Legacy,
        })
    }

    fn read_packed(&self, id: &ObjectId, file: File) -> Result<LooseObject> {
        let mut reader = BufReader::new(file);
        let (header, size) = decode_entry_header(|| {
            let mut b = [0u8; 1];
            reader.read_exact(&mut b)?;
            Ok(b[0])
        })?;
        let kind = match header {
            EntryHeader::Whole(kind) => kind,
            _ => {
                return Err(Error::corrupt(format!(
                    "loose object {id} declares a delta type"
                )))
            }
        };

        let mut data = Vec::with_capacity(size as usize);
        ZlibDecoder::new(reader).read_to_end(&mut data)?;
        if data.len() as u64 != size {
            return Err(Error::corrupt(format!(
                "loose object {id} is {} bytes, header said {size}",
                data.len()
            )));
        }
        Ok(LooseObject {
            kind,
            data: Bytes::from(data),
            format: LooseFormat::Packed,
        })
    }

    /// Deflate-and-hash `data` into a temp file, then move it into
    /// place. Existing objects are never rewritten.
    pub fn insert(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId> {
        std::fs::create_dir_all(&self.dir)?;
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        let id = {
            let mut encoder = ZlibEncoder::new(temp.as_file_mut(), Compression::default());
            let mut hasher = Sha1::new();
            let mut writer = TeeWriter::new(&mut hasher, &mut encoder);
            write!(writer, "{} {}\0", kind, data.len())?;
            writer.write_all(data)?;
            encoder.finish()?;
            ObjectId::from_hasher(hasher)
        };
        let path = self.path_of(&id);
        if path.is_file() {
            return Ok(id);
        }

        let mut perms = temp.as_file().metadata()?.permissions();
        perms.set_mode(0o444);
        temp.as_file().set_permissions(perms)?;

        // fan-out directory appears lazily with the first object
        if let Some(parent) = path.parent() {
            match std::fs::create_dir(parent) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
        }
        match temp.persist_noclobber(&path) {
            Ok(_) => Ok(id),
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(id),
            Err(err) => Err(err.error.into()),
        }
    }

    /// Candidate ids in this store matching an abbreviated name.
    pub fn matching(&self, prefix: &crate::object::AbbreviatedObjectId) -> Vec<ObjectId> {
        let hex = prefix.to_string();
        let fanout = self.dir.join(&hex[..2.min(hex.len())]);
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&fanout) else {
            return out;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(rest) = name.to_str() else { continue };
            let full = format!("{}{}", &hex[..2.min(hex.len())], rest);
            if let Ok(id) = ObjectId::from_hex(full.as_bytes()) {
                if prefix.matches(&id) {
                    out.push(id);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn legacy_round_trip_matches_the_known_blob_id() {
        let dir = TempDir::new().unwrap();
        let store = LooseStore::new(dir.path().join("objects"));

        let id = store.insert(ObjectKind::Blob, b"hello\n").unwrap();
        assert_eq!(id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");

        let obj = store.read(&id).unwrap();
        assert_eq!(obj.kind, ObjectKind::Blob);
        assert_eq!(&obj.data[..], b"hello\n");
        assert_eq!(obj.format, LooseFormat::Legacy);

        // the object file is immutable
        let path = dir
            .path()
            .join("objects/ce/013625030ba8dba906f756967f9e9ca394464a");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o222, 0);

        // inserting again is a no-op
        assert_eq!(store.insert(ObjectKind::Blob, b"hello\n").unwrap(), id);
    }

    #[test]
    fn zero_byte_payload_round_trips_in_both_formats() {
        let dir = TempDir::new().unwrap();
        let store = LooseStore::new(dir.path().join("objects"));

        let id = store.insert(ObjectKind::Blob, b"").unwrap();
        let obj = store.read(&id).unwrap();
        assert!(obj.data.is_empty());

        // hand-write the packed-style form of the same empty blob
        let packed_id = crate::object::hash_bytes(ObjectKind::Tree, b"");
        let hex = packed_id.to_hex();
        let parent = dir.path().join("objects").join(&hex[..2]);
        std::fs::create_dir_all(&parent).unwrap();
        let mut raw = Vec::new();
        crate::pack::encode_entry_header(
            &mut raw,
            EntryHeader::Whole(ObjectKind::Tree),
            0,
        );
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"").unwrap();
        raw.extend_from_slice(&encoder.finish().unwrap());
        std::fs::write(parent.join(&hex[2..]), &raw).unwrap();

        let obj = store.read(&packed_id).unwrap();
        assert_eq!(obj.kind, ObjectKind::Tree);
        assert!(obj.data.is_empty());
        assert_eq!(obj.format, LooseFormat::Packed);
    }

    #[test]
    fn packed_style_header_is_detected_by_the_probe() {
        let dir = TempDir::new().unwrap();
        let store = LooseStore::new(dir.path().join("objects"));

        let payload = b"packed style payload";
        let id = crate::object::hash_bytes(ObjectKind::Blob, payload);
        let hex = id.to_hex();
        let parent = dir.path().join("objects").join(&hex[..2]);
        std::fs::create_dir_all(&parent).unwrap();

        let mut raw = Vec::new();
        crate::pack::encode_entry_header(
            &mut raw,
            EntryHeader::Whole(ObjectKind::Blob),
            payload.len() as u64,
        );
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        raw.extend_from_slice(&encoder.finish().unwrap());
        std::fs::write(parent.join(&hex[2..]), &raw).unwrap();

        let obj = store.read(&id).unwrap();
        assert_eq!(obj.format, LooseFormat::Packed);
        assert_eq!(&obj.data[..], payload);
    }

    #[test]
    fn missing_object_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LooseStore::new(dir.path().join("objects"));
        let id = crate::object::hash_bytes(ObjectKind::Blob, b"nope");
        assert!(store.read(&id).unwrap_err().is_not_found());
        assert!(!store.has(&id));
    }

    #[test]
    fn size_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = LooseStore::new(dir.path().join("objects"));
        let id = crate::object::hash_bytes(ObjectKind::Blob, b"zzz");
        let hex = id.to_hex();
        let parent = dir.path().join("objects").join(&hex[..2]);
        std::fs::create_dir_all(&parent).unwrap();

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"blob 5\0zzz").unwrap();
        std::fs::write(parent.join(&hex[2..]), encoder.finish().unwrap()).unwrap();
        assert!(matches!(store.read(&id), Err(Error::Corruption(_))));
    }

    #[test]
    fn abbreviation_scan_matches_prefixes() {
        let dir = TempDir::new().unwrap();
        let store = LooseStore::new(dir.path().join("objects"));
        let id = store.insert(ObjectKind::Blob, b"hello\n").unwrap();

        let abbrev =
            crate::object::AbbreviatedObjectId::from_hex(&id.to_hex().as_bytes()[..8]).unwrap();
        assert_eq!(store.matching(&abbrev), vec![id]);
    }
}
