//! Federation of loose stores, open packs and alternate databases.

use crate::config::CoreConfig;
use crate::errors::{Error, Result};
use crate::loose::{LooseFormat, LooseStore};
use crate::object::{AbbreviatedObjectId, ObjectId, ObjectKind};
use crate::pack::file::PackFile;
use crate::pack::{Engine, PackId};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a loader's bytes came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoaderSource {
    Loose(LooseFormat),
    Packed {
        pack: PackId,
        offset: u64,
        delta_depth: u32,
    },
}

/// A fully materialized object. The closed set of storage variants
/// is an enum tag rather than open polymorphism; the payload is
/// cheap to clone and share.
pub struct ObjectLoader {
    kind: ObjectKind,
    data: Bytes,
    source: LoaderSource,
}

impl ObjectLoader {
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn cached_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn source(&self) -> LoaderSource {
        self.source
    }
}

/// An object database rooted at one `objects/` directory, plus the
/// alternates reachable from it.
pub struct ObjectDatabase {
    engine: Arc<Engine>,
    directories: Vec<LooseStore>,
    packs: RwLock<Vec<Arc<PackFile>>>,
}

impl ObjectDatabase {
    pub fn open(objects_dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(objects_dir, &CoreConfig::default())
    }

    pub fn open_with_config(objects_dir: impl AsRef<Path>, config: &CoreConfig) -> Result<Self> {
        let mut directories = Vec::new();
        let mut seen = HashSet::new();
        collect_directories(objects_dir.as_ref(), &mut directories, &mut seen);
        if directories.is_empty() {
            return Err(Error::not_found(format!(
                "object directory {}",
                objects_dir.as_ref().display()
            )));
        }
        let db = Self {
            engine: Engine::new(config),
            directories,
            packs: RwLock::new(Vec::new()),
        };
        db.scan_for_packs()?;
        Ok(db)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The primary loose store (never an alternate).
    pub fn loose(&self) -> &LooseStore {
        &self.directories[0]
    }

    pub fn pack_directory(&self) -> PathBuf {
        self.directories[0].dir().join("pack")
    }

    /// Re-scan every `pack/` subdirectory, opening any
    /// `pack-<hex>.pack` whose `.idx` sidecar exists. Already-open
    /// packs are kept; the list is ordered newest mtime first.
    pub fn scan_for_packs(&self) -> Result<()> {
        let mut packs = self.packs.write();
        packs.retain(|p| p.path().is_file() && !p.is_invalid());

        for store in &self.directories {
            let pack_dir = store.dir().join("pack");
            let Ok(entries) = std::fs::read_dir(&pack_dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if !name.starts_with("pack-") || !name.ends_with(".pack") {
                    continue;
                }
                if packs.iter().any(|p| p.path() == path) {
                    continue;
                }
                if !path.with_extension("idx").is_file() {
                    tracing::debug!("skipping {} (no index)", path.display());
                    continue;
                }
                match PackFile::open(&path, self.engine.clone()) {
                    Ok(pack) => packs.push(Arc::new(pack)),
                    Err(err) => {
                        tracing::warn!("cannot open pack {}: {err}", path.display());
                    }
                }
            }
        }
        packs.sort_by(|a, b| b.mtime().cmp(&a.mtime()));
        Ok(())
    }

    pub fn packs(&self) -> Vec<Arc<PackFile>> {
        self.packs.read().clone()
    }

    /// Packs in search order, for callers that prefer one pack over
    /// another when an object exists in several.
    pub fn packs_containing(&self, id: &ObjectId) -> Vec<Arc<PackFile>> {
        self.packs
            .read()
            .iter()
            .filter(|p| p.has_object(id))
            .cloned()
            .collect()
    }

    pub fn has_object(&self, id: &ObjectId) -> bool {
        self.packs.read().iter().any(|p| p.has_object(id))
            || self.directories.iter().any(|d| d.has(id))
    }

    /// Search packs first (newest first), then each loose store.
    /// When every candidate route fails the causes are aggregated.
    pub fn open_object(&self, id: &ObjectId) -> Result<ObjectLoader> {
        let mut failures: Vec<Error> = Vec::new();

        for pack in self.packs.read().iter() {
            if !pack.has_object(id) {
                continue;
            }
            match pack.get(id) {
                Ok(Some(obj)) => {
                    return Ok(ObjectLoader {
                        kind: obj.kind,
                        data: obj.data,
                        source: LoaderSource::Packed {
                            pack: pack.id(),
                            offset: obj.offset,
                            delta_depth: obj.delta_depth,
                        },
                    })
                }
                Ok(None) => {}
                Err(err) => failures.push(err),
            }
        }

        for store in &self.directories {
            match store.read(id) {
                Ok(obj) => {
                    return Ok(ObjectLoader {
                        kind: obj.kind,
                        data: obj.data,
                        source: LoaderSource::Loose(obj.format),
                    })
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => failures.push(err),
            }
        }

        match failures.len() {
            0 => Err(Error::MissingObject(*id)),
            1 => Err(failures.pop().expect("one failure")),
            _ => Err(Error::CompoundFailure(failures)),
        }
    }

    /// As [`open_object`], and additionally demand a type.
    pub fn open_typed(&self, id: &ObjectId, want: ObjectKind) -> Result<ObjectLoader> {
        let loader = self.open_object(id)?;
        if loader.kind() != want {
            return Err(Error::IncorrectObjectType {
                id: *id,
                want,
                got: loader.kind(),
            });
        }
        Ok(loader)
    }

    pub fn insert_loose(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId> {
        self.directories[0].insert(kind, data)
    }

    /// All known ids matching an abbreviation, across packs and every
    /// loose directory.
    pub fn resolve_abbreviation(&self, prefix: &AbbreviatedObjectId) -> Vec<ObjectId> {
        let mut out: Vec<ObjectId> = Vec::new();
        for pack in self.packs.read().iter() {
            out.extend(pack.index().matching(prefix));
        }
        for store in &self.directories {
            out.extend(store.matching(prefix));
        }
        out.sort();
        out.dedup();
        out
    }
}

fn collect_directories(dir: &Path, out: &mut Vec<LooseStore>, seen: &mut HashSet<PathBuf>) {
    let canonical = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !seen.insert(canonical.clone()) || !dir.is_dir() {
        return;
    }
    out.push(LooseStore::new(dir));

    let alternates = dir.join("info").join("alternates");
    let Ok(text) = std::fs::read_to_string(&alternates) else {
        return;
    };
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let path = if Path::new(line).is_absolute() {
            PathBuf::from(line)
        } else {
            dir.join(line)
        };
        collect_directories(&path, out, seen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn loose_objects_are_found_through_the_database() {
        let dir = TempDir::new().unwrap();
        let objects = dir.path().join("objects");
        std::fs::create_dir_all(&objects).unwrap();
        let db = ObjectDatabase::open(&objects).unwrap();

        let id = db.insert_loose(ObjectKind::Blob, b"hello\n").unwrap();
        assert!(db.has_object(&id));

        let loader = db.open_object(&id).unwrap();
        assert_eq!(loader.kind(), ObjectKind::Blob);
        assert_eq!(loader.size(), 6);
        assert_eq!(&loader.cached_bytes()[..], b"hello\n");
        assert!(matches!(loader.source(), LoaderSource::Loose(_)));
    }

    #[test]
    fn missing_objects_report_missing() {
        let dir = TempDir::new().unwrap();
        let objects = dir.path().join("objects");
        std::fs::create_dir_all(&objects).unwrap();
        let db = ObjectDatabase::open(&objects).unwrap();

        let id = crate::object::hash_bytes(ObjectKind::Blob, b"nothing");
        assert!(matches!(
            db.open_object(&id),
            Err(Error::MissingObject(missing)) if missing == id
        ));
    }

    #[test]
    fn wrong_type_is_reported() {
        let dir = TempDir::new().unwrap();
        let objects = dir.path().join("objects");
        std::fs::create_dir_all(&objects).unwrap();
        let db = ObjectDatabase::open(&objects).unwrap();

        let id = db.insert_loose(ObjectKind::Blob, b"data").unwrap();
        assert!(matches!(
            db.open_typed(&id, ObjectKind::Commit),
            Err(Error::IncorrectObjectType { .. })
        ));
    }

    #[test]
    fn alternates_are_searched_and_cycles_tolerated() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("a/objects");
        let alternate = dir.path().join("b/objects");
        std::fs::create_dir_all(primary.join("info")).unwrap();
        std::fs::create_dir_all(alternate.join("info")).unwrap();

        // a -> b -> a cycle
        std::fs::write(
            primary.join("info/alternates"),
            alternate.to_str().unwrap(),
        )
        .unwrap();
        std::fs::write(
            alternate.join("info/alternates"),
            primary.to_str().unwrap(),
        )
        .unwrap();

        let other = LooseStore::new(&alternate);
        let id = other.insert(ObjectKind::Blob, b"shared\n").unwrap();

        let db = ObjectDatabase::open(&primary).unwrap();
        assert!(db.has_object(&id));
        assert_eq!(&db.open_object(&id).unwrap().cached_bytes()[..], b"shared\n");

        // writes always land in the primary store
        let local = db.insert_loose(ObjectKind::Blob, b"local\n").unwrap();
        assert!(db.loose().has(&local));
        assert!(!other.has(&local));
    }

    #[test]
    fn abbreviations_resolve_across_stores() {
        let dir = TempDir::new().unwrap();
        let objects = dir.path().join("objects");
        std::fs::create_dir_all(&objects).unwrap();
        let db = ObjectDatabase::open(&objects).unwrap();

        let id = db.insert_loose(ObjectKind::Blob, b"abbrev me\n").unwrap();
        let hex = id.to_hex();
        let prefix = AbbreviatedObjectId::from_hex(&hex.as_bytes()[..10]).unwrap();
        assert_eq!(db.resolve_abbreviation(&prefix), vec![id]);
    }
}
