//! The dual loose/packed reference store.
//!
//! Loose files always win over packed entries, symbolic chains are
//! followed to a bounded depth, and every mutation goes through the
//! lock-file protocol with an optional reflog append.

use crate::errors::{Error, Result};
use crate::lock::LockFile;
use crate::object::{Identity, ObjectId, ObjectKind};
use crate::odb::ObjectDatabase;
use crate::revision;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Prefixes tried, in order, when resolving a partial name.
pub const SEARCH_PATH: [&str; 5] = ["", "refs/", "refs/tags/", "refs/heads/", "refs/remotes/"];

/// Symbolic chains longer than this are cyclic.
const MAX_SYMBOLIC_DEPTH: usize = 5;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefStorage {
    New,
    Loose,
    Packed,
    /// A loose symbolic ref resolving to a packed target. Writers
    /// treat it exactly as `Loose`; the tag is informational.
    LoosePacked,
    Network,
}

#[derive(Clone, Debug)]
pub struct Ref {
    pub name: String,
    pub storage: RefStorage,
    /// Immediate symbolic target, when the named file is `ref: …`.
    pub symbolic_target: Option<String>,
    /// Terminal object id after following any symbolic chain.
    pub object_id: Option<ObjectId>,
    /// Cached dereference of an annotated-tag chain; `None` with
    /// `peeled_known` set means "not a tag".
    pub peeled: Option<ObjectId>,
    pub peeled_known: bool,
}

impl Ref {
    pub fn is_symbolic(&self) -> bool {
        self.symbolic_target.is_some()
    }
}

#[derive(Clone)]
enum RawTarget {
    Id(ObjectId),
    Symbolic(String),
}

#[derive(Clone)]
struct RawRef {
    target: RawTarget,
    storage: RefStorage,
    peeled: Option<ObjectId>,
}

#[derive(Default)]
struct Caches {
    loose: HashMap<String, (RawRef, Option<SystemTime>)>,
    packed: HashMap<String, (ObjectId, Option<ObjectId>)>,
    packed_stamp: Option<(Option<SystemTime>, u64)>,
}

pub struct RefDatabase {
    git_dir: PathBuf,
    caches: Mutex<Caches>,
    modified: AtomicU64,
    notified: AtomicU64,
}

impl RefDatabase {
    pub fn open(git_dir: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: git_dir.into(),
            caches: Mutex::new(Caches::default()),
            modified: AtomicU64::new(0),
            notified: AtomicU64::new(0),
        }
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Resolve a possibly-partial name: `main` finds
    /// `refs/heads/main`, a tag of the same name wins earlier in the
    /// search path.
    pub fn read(&self, partial: &str) -> Result<Option<Ref>> {
        for prefix in SEARCH_PATH {
            let full = format!("{prefix}{partial}");
            if let Some(found) = self.exact(&full)? {
                if found.object_id.is_some() {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    /// Resolve a full name through its symbolic chain.
    pub fn exact(&self, name: &str) -> Result<Option<Ref>> {
        if !is_valid_name(name) {
            return Ok(None);
        }
        let first = match self.read_one(name)? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let mut symbolic_target = None;
        let mut current = first;
        let mut depth = 0;
        loop {
            match current.target {
                RawTarget::Id(id) => {
                    let storage = match (symbolic_target.is_some(), current.storage) {
                        (true, RefStorage::Packed) => RefStorage::LoosePacked,
                        (true, _) => RefStorage::Loose,
                        (false, storage) => storage,
                    };
                    return Ok(Some(Ref {
                        name: name.to_string(),
                        storage,
                        symbolic_target,
                        object_id: Some(id),
                        peeled: current.peeled,
                        peeled_known: current.peeled.is_some(),
                    }));
                }
                RawTarget::Symbolic(next) => {
                    depth += 1;
                    if depth > MAX_SYMBOLIC_DEPTH {
                        return Err(Error::corrupt(format!(
                            "cyclic symbolic reference at {name}"
                        )));
                    }
                    if symbolic_target.is_none() {
                        symbolic_target = Some(next.clone());
                    }
                    match self.read_one(&next)? {
                        Some(raw) => current = raw,
                        None => {
                            // dangling symref: visible but unresolved
                            return Ok(Some(Ref {
                                name: name.to_string(),
                                storage: RefStorage::Loose,
                                symbolic_target,
                                object_id: None,
                                peeled: None,
                                peeled_known: false,
                            }));
                        }
                    }
                }
            }
        }
    }

    /// One resolution step: the loose file if present (never stale
    /// with respect to packed), else the packed entry.
    fn read_one(&self, name: &str) -> Result<Option<RawRef>> {
        let path = self.git_dir.join(name);
        let mut caches = self.caches.lock();

        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                let mtime = meta.modified().ok();
                if let Some((cached, stamp)) = caches.loose.get(name) {
                    if *stamp == mtime && mtime.is_some() {
                        return Ok(Some(cached.clone()));
                    }
                }
                let raw = parse_loose(name, &fs::read(&path)?)?;
                caches
                    .loose
                    .insert(name.to_string(), (raw.clone(), mtime));
                Ok(Some(raw))
            }
            _ => {
                caches.loose.remove(name);
                self.ensure_packed(&mut caches)?;
                Ok(caches.packed.get(name).map(|(id, peeled)| RawRef {
                    target: RawTarget::Id(*id),
                    storage: RefStorage::Packed,
                    peeled: *peeled,
                }))
            }
        }
    }

    /// Re-read `packed-refs` when its `(mtime, length)` stamp moved.
    fn ensure_packed(&self, caches: &mut Caches) -> Result<()> {
        let path = self.git_dir.join("packed-refs");
        let stamp = fs::metadata(&path)
            .ok()
            .map(|m| (m.modified().ok(), m.len()))
            .unwrap_or((None, 0));
        if caches.packed_stamp == Some(stamp) {
            return Ok(());
        }
        caches.packed = match fs::read_to_string(&path) {
            Ok(text) => parse_packed(&text)?,
            Err(err) if err.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        caches.packed_stamp = Some(stamp);
        Ok(())
    }

    /// Every ref under `refs/` plus `HEAD`, loose entries shadowing
    /// packed ones, sorted by name.
    pub fn all_refs(&self) -> Result<Vec<Ref>> {
        let mut names = Vec::new();
        collect_loose_names(&self.git_dir.join("refs"), "refs", &mut names);
        {
            let mut caches = self.caches.lock();
            self.ensure_packed(&mut caches)?;
            names.extend(caches.packed.keys().cloned());
        }
        names.push("HEAD".to_string());
        names.sort();
        names.dedup();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(r) = self.exact(&name)? {
                if r.object_id.is_some() {
                    out.push(r);
                }
            }
        }
        Ok(out)
    }

    /// Fill `peeled` by dereferencing annotated tags through the
    /// object store.
    pub fn peel(&self, r: &Ref, odb: &ObjectDatabase) -> Result<Ref> {
        if r.peeled_known {
            return Ok(r.clone());
        }
        let mut out = r.clone();
        out.peeled_known = true;
        out.peeled = None;

        let Some(mut id) = r.object_id else {
            return Ok(out);
        };
        let mut depth = 0;
        loop {
            let loader = odb.open_object(&id)?;
            if loader.kind() != ObjectKind::Tag {
                break;
            }
            depth += 1;
            if depth > 32 {
                return Err(Error::corrupt(format!("tag chain at {} too deep", r.name)));
            }
            id = revision::parse_tag(loader.cached_bytes())?.target;
            out.peeled = Some(id);
        }
        Ok(out)
    }

    pub fn new_update(&self, name: &str, new_id: ObjectId) -> RefUpdate<'_> {
        RefUpdate {
            db: self,
            name: name.to_string(),
            new_id,
            expected_old: None,
            force: false,
            detach: false,
            ident: None,
            message: None,
        }
    }

    /// Point `name` at another ref (`ref: target`), e.g. HEAD.
    pub fn write_symbolic(&self, name: &str, target: &str) -> Result<()> {
        if !is_valid_name(name) || !is_valid_name(target) {
            return Err(Error::corrupt(format!("invalid ref name {name}")));
        }
        let mut lock = LockFile::new(self.git_dir.join(name));
        if !lock.lock()? {
            return Err(Error::LockFailure(name.to_string()));
        }
        lock.write_all(format!("ref: {target}\n").as_bytes())?;
        lock.commit()?;
        self.caches.lock().loose.remove(name);
        self.bump();
        Ok(())
    }

    /// Remove `name` everywhere: rewrite `packed-refs` without it
    /// under its own lock, then unlink the loose file.
    pub fn delete(&self, name: &str) -> Result<()> {
        let packed_path = self.git_dir.join("packed-refs");
        {
            let mut caches = self.caches.lock();
            self.ensure_packed(&mut caches)?;
            if caches.packed.contains_key(name) {
                let mut lock = LockFile::new(&packed_path);
                if !lock.lock()? {
                    return Err(Error::LockFailure("packed-refs".to_string()));
                }
                let mut survivors: Vec<(String, (ObjectId, Option<ObjectId>))> = caches
                    .packed
                    .iter()
                    .filter(|(n, _)| n.as_str() != name)
                    .map(|(n, v)| (n.clone(), *v))
                    .collect();
                survivors.sort_by(|a, b| a.0.cmp(&b.0));
                let mut text = String::from("# pack-refs with: peeled fully-peeled sorted \n");
                for (n, (id, peeled)) in &survivors {
                    text.push_str(&format!("{id} {n}\n"));
                    if let Some(p) = peeled {
                        text.push_str(&format!("^{p}\n"));
                    }
                }
                lock.write_all(text.as_bytes())?;
                lock.commit()?;
                caches.packed_stamp = None;
            }
            caches.loose.remove(name);
        }

        match fs::remove_file(self.git_dir.join(name)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let _ = fs::remove_file(self.git_dir.join("logs").join(name));
        self.bump();
        Ok(())
    }

    fn bump(&self) {
        self.modified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn modification_count(&self) -> u64 {
        self.modified.load(Ordering::Relaxed)
    }

    /// True once since the last poll if refs may have changed.
    pub fn poll_changed(&self) -> bool {
        let modified = self.modified.load(Ordering::Relaxed);
        let notified = self.notified.swap(modified, Ordering::Relaxed);
        notified < modified
    }

    fn append_reflog(
        &self,
        name: &str,
        old: Option<ObjectId>,
        new: ObjectId,
        ident: &Identity,
        message: &str,
    ) -> Result<()> {
        let path = self.git_dir.join("logs").join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let record = format!(
            "{} {} {}\t{}\n",
            old.unwrap_or_else(ObjectId::zero),
            new,
            ident,
            message
        );
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        use std::io::Write;
        file.write_all(record.as_bytes())?;
        Ok(())
    }
}

/// Outcome categories of a reference update.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateResult {
    NoChange,
    New,
    FastForward,
    Forced,
    Rejected,
    LockFailure,
    IoFailure,
}

/// A single-ref compare-and-swap through the lock-file protocol.
pub struct RefUpdate<'db> {
    db: &'db RefDatabase,
    name: String,
    new_id: ObjectId,
    expected_old: Option<Option<ObjectId>>,
    force: bool,
    detach: bool,
    ident: Option<Identity>,
    message: Option<String>,
}

impl<'db> RefUpdate<'db> {
    /// Require the current value to match before updating;
    /// `Some(None)` demands the ref not exist yet.
    pub fn set_expected_old(&mut self, expected: Option<ObjectId>) -> &mut Self {
        self.expected_old = Some(expected);
        self
    }

    pub fn set_force(&mut self, force: bool) -> &mut Self {
        self.force = force;
        self
    }

    /// Write to the symbolic ref itself instead of its target.
    pub fn set_detaching_symbolic(&mut self, detach: bool) -> &mut Self {
        self.detach = detach;
        self
    }

    pub fn set_identity(&mut self, ident: Identity, message: impl Into<String>) -> &mut Self {
        self.ident = Some(ident);
        self.message = Some(message.into());
        self
    }

    /// Update without an ancestry oracle: a non-equal existing value
    /// is only replaced when forced.
    pub fn update(&mut self) -> Result<UpdateResult> {
        self.update_with(|_, _| Ok(false))
    }

    /// Update with `is_ancestor(old, new)` supplied by a revision
    /// walker.
    pub fn update_with<F>(&mut self, mut is_ancestor: F) -> Result<UpdateResult>
    where
        F: FnMut(&ObjectId, &ObjectId) -> Result<bool>,
    {
        if !is_valid_name(&self.name) {
            return Err(Error::corrupt(format!("invalid ref name {}", self.name)));
        }

        // 1. resolve through the symbolic chain unless detaching
        let (leaf, current) = if self.detach {
            let current = self.db.exact(&self.name)?.and_then(|r| r.object_id);
            (self.name.clone(), current)
        } else {
            self.leaf_of()?
        };

        // 2. expected-old gate
        if let Some(expected) = self.expected_old {
            if expected != current {
                return Ok(UpdateResult::LockFailure);
            }
        }

        // 3. categorize
        let result = match current {
            Some(old) if old == self.new_id => return Ok(UpdateResult::NoChange),
            None => UpdateResult::New,
            Some(old) => {
                if is_ancestor(&old, &self.new_id)? {
                    UpdateResult::FastForward
                } else if self.force {
                    UpdateResult::Forced
                } else {
                    return Ok(UpdateResult::Rejected);
                }
            }
        };

        // 4. write the loose file under lock; a stale packed entry is
        // hidden by it from now on
        let mut lock = LockFile::new(self.db.git_dir.join(&leaf));
        match lock.lock() {
            Ok(true) => {}
            Ok(false) => return Ok(UpdateResult::LockFailure),
            Err(err) => {
                tracing::warn!("locking {leaf}: {err}");
                return Ok(UpdateResult::LockFailure);
            }
        }
        if let Err(err) = lock
            .write_all(format!("{}\n", self.new_id).as_bytes())
            .and_then(|_| lock.commit())
        {
            tracing::warn!("committing {leaf}: {err}");
            lock.abort();
            return Ok(UpdateResult::IoFailure);
        }

        self.db.caches.lock().loose.remove(&leaf);
        if let (Some(ident), Some(message)) = (&self.ident, &self.message) {
            self.db
                .append_reflog(&leaf, current, self.new_id, ident, message)?;
        }
        self.db.bump();
        Ok(result)
    }

    fn leaf_of(&self) -> Result<(String, Option<ObjectId>)> {
        let mut current = self.name.clone();
        for _ in 0..=MAX_SYMBOLIC_DEPTH {
            match self.db.read_one(&current)? {
                None => return Ok((current, None)),
                Some(raw) => match raw.target {
                    RawTarget::Id(id) => return Ok((current, Some(id))),
                    RawTarget::Symbolic(next) => current = next,
                },
            }
        }
        Err(Error::corrupt(format!(
            "cyclic symbolic reference at {}",
            self.name
        )))
    }
}

fn parse_loose(name: &str, content: &[u8]) -> Result<RawRef> {
    if let Some(target) = content.strip_prefix(b"ref: ") {
        let target = String::from_utf8_lossy(target).trim().to_string();
        return Ok(RawRef {
            target: RawTarget::Symbolic(target),
            storage: RefStorage::Loose,
            peeled: None,
        });
    }
    if content.len() >= 40 {
        if let Ok(id) = ObjectId::from_hex(&content[..40]) {
            return Ok(RawRef {
                target: RawTarget::Id(id),
                storage: RefStorage::Loose,
                peeled: None,
            });
        }
    }
    Err(Error::corrupt(format!("unreadable loose ref {name}")))
}

fn parse_packed(text: &str) -> Result<HashMap<String, (ObjectId, Option<ObjectId>)>> {
    let mut out: HashMap<String, (ObjectId, Option<ObjectId>)> = HashMap::new();
    let mut last: Option<String> = None;
    for line in text.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(peeled_hex) = line.strip_prefix('^') {
            let peeled = ObjectId::from_hex(peeled_hex.trim().as_bytes())?;
            let name = last.as_ref().ok_or_else(|| {
                Error::corrupt("packed-refs ^peel line without a preceding ref")
            })?;
            if let Some(entry) = out.get_mut(name) {
                entry.1 = Some(peeled);
            }
            continue;
        }
        let (hex, name) = line
            .split_once(' ')
            .ok_or_else(|| Error::corrupt(format!("malformed packed-refs line {line:?}")))?;
        let id = ObjectId::from_hex(hex.as_bytes())?;
        out.insert(name.trim().to_string(), (id, None));
        last = Some(name.trim().to_string());
    }
    Ok(out)
}

fn collect_loose_names(dir: &Path, prefix: &str, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.ends_with(".lock") {
            continue;
        }
        let child = format!("{prefix}/{name}");
        let path = entry.path();
        if path.is_dir() {
            collect_loose_names(&path, &child, out);
        } else {
            out.push(child);
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return false;
    }
    for part in name.split('/') {
        if part.is_empty() || part == "." || part == ".." || part.ends_with(".lock") {
            return false;
        }
    }
    !name
        .bytes()
        .any(|b| b < 0x20 || b == b' ' || b == b'~' || b == b'^' || b == b':' || b == 0x7f)
}
