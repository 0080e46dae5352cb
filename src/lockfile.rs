use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use parking_lot::lock_api::{RawRwLock as _, RawRwLockRecursive as _};
use parking_lot::{Mutex, RawRwLock};
use uuid::Uuid;

use crate::errors::{LfError, Result};
use crate::sys::{self, LockKind};

/// The capability set of a lock handle. `LockFile` is the POSIX
/// implementation; consumers that only need the operations can hold an
/// `Arc<dyn Locker>`.
pub trait Locker: Send + Sync {
    /// Acquire the writer lock. Panics if the handle is read-only.
    fn lock(&self);

    /// Acquire the writer lock, allowing recursive acquisitions within the
    /// same process. On a read-only handle this degrades to `read_lock`.
    fn recursive_lock(&self);

    /// Acquire the reader lock.
    fn read_lock(&self);

    /// Release the lock. Panics when the lock is not held or when the
    /// acquisition counter is corrupted.
    fn unlock(&self);

    /// Record, for others sharing the lock, that the caller was the last
    /// writer. Must be called with the writer lock held.
    fn record_write(&self) -> Result<()>;

    #[deprecated(note = "use record_write")]
    fn touch(&self) -> Result<()> {
        self.record_write()
    }

    /// Check whether another party stamped the lock file since this handle
    /// last looked. Must be called with the lock held.
    fn detect_modification(&self) -> Result<bool>;

    #[deprecated(note = "use detect_modification")]
    fn modified(&self) -> Result<bool> {
        self.detect_modification()
    }

    /// Check whether the lock file's mtime is strictly after `when`. Errors
    /// count as touched.
    fn touched_since(&self, when: SystemTime) -> bool;

    /// Whether the handle was obtained in read-write mode.
    fn is_read_write(&self) -> bool;

    /// Whether a thread in this process holds the lock for writing.
    fn is_locked_for_writing(&self) -> bool;

    /// Sanity check for callers that know they hold the lock; panics if it
    /// is not held.
    fn assert_locked(&self);

    /// Like `assert_locked`, and additionally panics if the lock is not
    /// held for writing.
    fn assert_locked_for_writing(&self);
}

/// A file-backed lock shared between processes, where the file also caches
/// an identifier of the last party that changed the protected data.
///
/// Obtain one through [`crate::get_lock_file`] or
/// [`crate::get_ro_lock_file`], never by construction.
pub struct LockFile {
    path: PathBuf,
    read_only: bool,
    // Serializes in-process acquirers before the kernel lock is engaged.
    rw_mutex: RawRwLock,
    // Holding flag, readable without `state` (see assert_locked).
    locked: AtomicBool,
    state: Mutex<LockState>,
}

struct LockState {
    counter: u64,
    file: Option<File>,
    kind: LockKind,
    recursive: bool,
    last_writer: String,
}

fn writer_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl LockFile {
    /// Called by the registry, at most once per canonical path within a
    /// process. Validates that the path can be opened in the requested mode.
    pub(crate) fn new(path: PathBuf, read_only: bool) -> Result<LockFile> {
        sys::open_lock(&path, read_only).map_err(|source| LfError::Open {
            path: path.clone(),
            source,
        })?;
        Ok(LockFile {
            path,
            read_only,
            rw_mutex: RawRwLock::INIT,
            locked: AtomicBool::new(false),
            state: Mutex::new(LockState {
                counter: 0,
                file: None,
                kind: if read_only { LockKind::Read } else { LockKind::Write },
                recursive: false,
                last_writer: writer_id(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn do_lock(&self, kind: LockKind, recursive: bool) {
        match kind {
            LockKind::Read => self.rw_mutex.lock_shared_recursive(),
            // Recursive writers take the in-process mutex in shared mode so
            // the same process can re-enter; non-recursive writers exclude
            // them by taking it exclusively.
            LockKind::Write if recursive => self.rw_mutex.lock_shared_recursive(),
            LockKind::Write => self.rw_mutex.lock_exclusive(),
        }
        let mut state = self.state.lock();
        if state.counter == 0 {
            // First reference in this process: open a fresh descriptor and
            // take the kernel lock. Later same-process acquirers are already
            // ordered by rw_mutex and share it; a second fcntl call on a new
            // descriptor would silently succeed, so only this single call is
            // safe.
            let file = match sys::open_lock(&self.path, self.read_only) {
                Ok(f) => f,
                Err(e) => panic!("error opening {:?}: {e}", self.path),
            };
            sys::lock_file(&file, kind);
            tracing::trace!("acquired kernel {:?} lock on {:?}", kind, self.path);
            state.file = Some(file);
        }
        state.kind = kind;
        state.recursive = recursive;
        state.counter += 1;
        self.locked.store(true, Ordering::Relaxed);
    }

    /// Locks the lock file as a writer. Panics if the handle is read-only.
    pub fn lock(&self) {
        if self.read_only {
            panic!("can't take write lock on read-only lock file");
        }
        self.do_lock(LockKind::Write, false);
    }

    /// Locks the lock file as a writer, but allows recursive acquisitions
    /// within the same process. On a read-only handle this takes the reader
    /// lock instead.
    pub fn recursive_lock(&self) {
        if self.read_only {
            self.read_lock();
        } else {
            self.do_lock(LockKind::Write, true);
        }
    }

    /// Locks the lock file as a reader.
    pub fn read_lock(&self) {
        self.do_lock(LockKind::Read, false);
    }

    /// Unlocks the lock file.
    pub fn unlock(&self) {
        let mut state = self.state.lock();
        if !self.locked.load(Ordering::Relaxed) {
            // Unlocking an unlocked lock is a violation of the lock
            // semantics; reveal it instead of corrupting the counter.
            panic!("calling unlock on unlocked lock");
        }
        if state.counter == 0 {
            // There is no recovering from a corrupted counter; the data the
            // lock protects must not be touched again.
            panic!("lock {:?} has been unlocked too often", self.path);
        }
        state.counter -= 1;
        if state.counter == 0 {
            // Only release when the counter reaches zero; a process may hold
            // read or recursive locks many times over. Closing the
            // descriptor releases the kernel lock.
            self.locked.store(false, Ordering::Relaxed);
            state.file = None;
            tracing::trace!("released kernel lock on {:?}", self.path);
        }
        if state.kind == LockKind::Read || state.recursive {
            // SAFETY: this acquisition took rw_mutex in shared mode.
            unsafe { self.rw_mutex.unlock_shared() }
        } else {
            // SAFETY: this acquisition took rw_mutex in exclusive mode.
            unsafe { self.rw_mutex.unlock_exclusive() }
        }
    }

    pub fn is_locked_for_writing(&self) -> bool {
        let state = self.state.lock();
        self.locked.load(Ordering::Relaxed) && state.kind == LockKind::Write
    }

    pub fn assert_locked(&self) {
        // Deliberately no `state` here: the caller claims to hold the lock,
        // and on that path the flag is constant true with no writers. A
        // variant that returns the flag would be meaningless; another thread
        // might be the holder.
        if !self.locked.load(Ordering::Relaxed) {
            panic!("internal error: lock is not held by the expected owner");
        }
    }

    pub fn assert_locked_for_writing(&self) {
        self.assert_locked();
        if self.state.lock().kind != LockKind::Write {
            panic!("internal error: lock is not held for writing");
        }
    }

    pub fn is_read_write(&self) -> bool {
        !self.read_only
    }

    /// Stamps a fresh last-writer identifier into the lock file. Panics if
    /// the lock is not held for writing.
    pub fn record_write(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !self.locked.load(Ordering::Relaxed) || state.kind != LockKind::Write {
            panic!("attempted to update last-writer in lockfile without the write lock");
        }
        let id = writer_id();
        let mut file = state
            .file
            .as_ref()
            .expect("lock is held but no descriptor is open");
        file.seek(SeekFrom::Start(0))?;
        let n = file.write(id.as_bytes())?;
        if n != id.len() {
            return Err(LfError::OutOfSpace {
                path: self.path.clone(),
            });
        }
        state.last_writer = id;
        Ok(())
    }

    /// Reports whether the lock file was stamped by a party other than the
    /// one this handle last saw, replacing the cached identifier with the
    /// on-disk one. Panics if the lock is not held.
    pub fn detect_modification(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if !self.locked.load(Ordering::Relaxed) {
            panic!("attempted to check last-writer in lockfile without locking it first");
        }
        let mut buf = vec![0u8; state.last_writer.len()];
        let mut file = state
            .file
            .as_ref()
            .expect("lock is held but no descriptor is open");
        file.seek(SeekFrom::Start(0))?;
        let n = file.read(&mut buf)?;
        if n != buf.len() {
            // A shorter file than the cached identifier means a writer this
            // handle has never observed.
            return Ok(true);
        }
        let on_disk = String::from_utf8_lossy(&buf).into_owned();
        let differed = on_disk != state.last_writer;
        state.last_writer = on_disk;
        Ok(differed)
    }

    /// Reports whether the lock file's mtime is strictly after `when`.
    /// Errors, including the descriptor not being open, count as touched.
    pub fn touched_since(&self, when: SystemTime) -> bool {
        let state = self.state.lock();
        let Some(file) = state.file.as_ref() else {
            return true;
        };
        match file.metadata().and_then(|m| m.modified()) {
            Ok(mtime) => mtime > when,
            Err(_) => true,
        }
    }
}

impl std::fmt::Debug for LockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFile")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl Locker for LockFile {
    fn lock(&self) {
        LockFile::lock(self)
    }
    fn recursive_lock(&self) {
        LockFile::recursive_lock(self)
    }
    fn read_lock(&self) {
        LockFile::read_lock(self)
    }
    fn unlock(&self) {
        LockFile::unlock(self)
    }
    fn record_write(&self) -> Result<()> {
        LockFile::record_write(self)
    }
    fn detect_modification(&self) -> Result<bool> {
        LockFile::detect_modification(self)
    }
    fn touched_since(&self, when: SystemTime) -> bool {
        LockFile::touched_since(self, when)
    }
    fn is_read_write(&self) -> bool {
        LockFile::is_read_write(self)
    }
    fn is_locked_for_writing(&self) -> bool {
        LockFile::is_locked_for_writing(self)
    }
    fn assert_locked(&self) {
        LockFile::assert_locked(self)
    }
    fn assert_locked_for_writing(&self) {
        LockFile::assert_locked_for_writing(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rw_lock(td: &TempDir) -> LockFile {
        LockFile::new(td.path().join("l.lock"), false).unwrap()
    }

    fn ro_lock(td: &TempDir) -> LockFile {
        let path = td.path().join("l.lock");
        std::fs::write(&path, b"").unwrap();
        LockFile::new(path, true).unwrap()
    }

    #[test]
    fn counter_tracks_recursive_nesting() {
        let td = TempDir::new().unwrap();
        let l = rw_lock(&td);
        {
            let s = l.state.lock();
            assert_eq!(s.counter, 0);
            assert!(s.file.is_none());
        }

        l.recursive_lock();
        l.recursive_lock();
        l.recursive_lock();
        {
            let s = l.state.lock();
            assert_eq!(s.counter, 3);
            assert!(s.file.is_some());
            assert!(s.recursive);
            assert_eq!(s.kind, LockKind::Write);
        }

        l.unlock();
        l.unlock();
        assert!(l.state.lock().file.is_some());
        l.unlock();
        {
            let s = l.state.lock();
            assert_eq!(s.counter, 0);
            assert!(s.file.is_none());
        }
    }

    #[test]
    fn nested_readers_share_the_descriptor() {
        let td = TempDir::new().unwrap();
        let l = rw_lock(&td);

        l.read_lock();
        l.read_lock();
        {
            let s = l.state.lock();
            assert_eq!(s.counter, 2);
            assert_eq!(s.kind, LockKind::Read);
        }
        l.unlock();
        l.unlock();
        assert_eq!(l.state.lock().counter, 0);
    }

    #[test]
    fn acquire_release_leaves_last_writer_alone() {
        let td = TempDir::new().unwrap();
        let l = rw_lock(&td);
        let before = l.state.lock().last_writer.clone();

        l.lock();
        assert!(l.is_locked_for_writing());
        l.unlock();

        assert!(!l.is_locked_for_writing());
        assert_eq!(l.state.lock().last_writer, before);
    }

    #[test]
    #[should_panic(expected = "unlocked lock")]
    fn unlock_when_unlocked_panics() {
        let td = TempDir::new().unwrap();
        let l = rw_lock(&td);
        l.unlock();
    }

    #[test]
    #[should_panic(expected = "read-only lock file")]
    fn write_lock_on_read_only_handle_panics() {
        let td = TempDir::new().unwrap();
        let l = ro_lock(&td);
        l.lock();
    }

    #[test]
    #[should_panic(expected = "without the write lock")]
    fn record_write_under_read_lock_panics() {
        let td = TempDir::new().unwrap();
        let l = rw_lock(&td);
        l.read_lock();
        let _ = l.record_write();
    }

    #[test]
    #[should_panic(expected = "without locking it first")]
    fn detect_modification_without_lock_panics() {
        let td = TempDir::new().unwrap();
        let l = rw_lock(&td);
        let _ = l.detect_modification();
    }

    #[test]
    #[should_panic(expected = "not held by the expected owner")]
    fn assert_locked_without_lock_panics() {
        let td = TempDir::new().unwrap();
        let l = rw_lock(&td);
        l.assert_locked();
    }

    #[test]
    #[should_panic(expected = "not held for writing")]
    fn assert_locked_for_writing_under_read_lock_panics() {
        let td = TempDir::new().unwrap();
        let l = rw_lock(&td);
        l.read_lock();
        l.assert_locked_for_writing();
    }

    #[test]
    fn assert_locked_for_writing_under_write_lock() {
        let td = TempDir::new().unwrap();
        let l = rw_lock(&td);
        l.lock();
        l.assert_locked();
        l.assert_locked_for_writing();
        l.unlock();
    }
}
