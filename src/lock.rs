use crate::errors::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Exclusive single-writer replacement of a file `F` through a
/// sibling `F.lock`.
///
/// Creation of the sibling is the atomicity point; an advisory
/// `flock` on it guards against a stale sibling left by a crashed
/// process being adopted by two writers at once.
pub struct LockFile {
    target: PathBuf,
    lock_path: PathBuf,
    file: Option<File>,
    commit_time: Option<SystemTime>,
}

impl LockFile {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        let lock_path = target.with_file_name(name);
        Self {
            target,
            lock_path,
            file: None,
            commit_time: None,
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Try to take the lock. `Ok(false)` means another writer holds
    /// it; no partial state is left behind in that case.
    pub fn lock(&mut self) -> Result<bool> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(f) => f,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        // The sibling now exists but may also be visible to a process
        // that crashed mid-commit; the region lock arbitrates. Losing
        // it means contention, and the file must be left in place for
        // its legitimate owner.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            drop(file);
            return Ok(false);
        }
        self.file = Some(file);
        Ok(true)
    }

    fn held(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::LockFailure(self.target.display().to_string()))
    }

    /// Write handle into `F.lock`.
    pub fn writer(&mut self) -> Result<&mut File> {
        self.held()
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        Ok(self.held()?.write_all(bytes)?)
    }

    /// Seed `F.lock` with the current content of `F`, for callers
    /// that append under the lock. A missing `F` seeds nothing.
    pub fn copy_current_content(&mut self) -> Result<()> {
        let target = self.target.clone();
        let out = self.held()?;
        match File::open(&target) {
            Ok(mut current) => {
                let mut buf = Vec::new();
                current.read_to_end(&mut buf)?;
                out.write_all(&buf)?;
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Flush, release and rename `F.lock` into place. On platforms
    /// that refuse to rename over an existing file the target is
    /// removed and the rename retried once.
    pub fn commit(&mut self) -> Result<()> {
        let file = self
            .file
            .take()
            .ok_or_else(|| Error::LockFailure(self.target.display().to_string()))?;
        file.sync_all()?;
        unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        drop(file);

        if let Err(first) = std::fs::rename(&self.lock_path, &self.target) {
            let _ = std::fs::remove_file(&self.target);
            if std::fs::rename(&self.lock_path, &self.target).is_err() {
                let _ = std::fs::remove_file(&self.lock_path);
                return Err(Error::LockFailure(format!(
                    "renaming {} failed: {first}",
                    self.lock_path.display()
                )));
            }
        }
        self.commit_time = std::fs::metadata(&self.target)
            .and_then(|m| m.modified())
            .ok();
        Ok(())
    }

    /// Drop the lock and delete `F.lock`.
    pub fn abort(&mut self) {
        if let Some(file) = self.file.take() {
            unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
            drop(file);
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Modification time of `F` recorded right after a successful
    /// commit; the dircache racy-clean check depends on it.
    pub fn commit_time(&self) -> Option<SystemTime> {
        self.commit_time
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.abort();
    }
}
