use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::errors::{LfError, Result};
use crate::lockfile::{LockFile, Locker};

// One lock object per canonical path per process. Two objects for the same
// path would each carry their own in-process mutex and break the
// single-descriptor kernel-lock discipline, so entries are never evicted.
static LOCK_FILES: OnceLock<Mutex<HashMap<PathBuf, Arc<LockFile>>>> = OnceLock::new();

fn obtain(path: &Path, read_only: bool) -> Result<Arc<LockFile>> {
    let canonical = std::path::absolute(path).map_err(|source| LfError::AbsolutePath {
        path: path.to_path_buf(),
        source,
    })?;
    let mut map = LOCK_FILES.get_or_init(|| Mutex::new(HashMap::new())).lock();
    if let Some(existing) = map.get(&canonical) {
        if read_only && existing.is_read_write() {
            return Err(LfError::NotReadOnly { path: canonical });
        }
        if !read_only && !existing.is_read_write() {
            return Err(LfError::NotReadWrite { path: canonical });
        }
        return Ok(existing.clone());
    }
    let lock_file = Arc::new(LockFile::new(canonical.clone(), read_only)?);
    tracing::debug!("created lock file for {:?}", canonical);
    map.insert(canonical, lock_file.clone());
    Ok(lock_file)
}

/// Opens a read-write lock file, creating it if necessary. The returned
/// object may already be locked if the path has already been requested by
/// the current process.
pub fn get_lock_file<P: AsRef<Path>>(path: P) -> Result<Arc<LockFile>> {
    obtain(path.as_ref(), false)
}

/// Opens a read-only lock file. The returned object may already be locked
/// if the path has already been requested by the current process.
pub fn get_ro_lock_file<P: AsRef<Path>>(path: P) -> Result<Arc<LockFile>> {
    obtain(path.as_ref(), true)
}

#[deprecated(note = "use get_lock_file")]
pub fn get_lockfile<P: AsRef<Path>>(path: P) -> Result<Arc<dyn Locker>> {
    let lock_file: Arc<dyn Locker> = get_lock_file(path)?;
    Ok(lock_file)
}

#[deprecated(note = "use get_ro_lock_file")]
pub fn get_ro_lockfile<P: AsRef<Path>>(path: P) -> Result<Arc<dyn Locker>> {
    let lock_file: Arc<dyn Locker> = get_ro_lock_file(path)?;
    Ok(lock_file)
}
