use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Kernel advisory lock mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

impl LockKind {
    fn as_libc(self) -> libc::c_short {
        match self {
            LockKind::Read => libc::F_RDLCK as libc::c_short,
            LockKind::Write => libc::F_WRLCK as libc::c_short,
        }
    }
}

/// Opens the lock file at `path`. Read-only mode never creates the file;
/// read-write mode creates it with owner-only permissions if absent. The
/// descriptor is close-on-exec.
pub fn open_lock(path: &Path, read_only: bool) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    if read_only {
        opts.read(true);
    } else {
        opts.read(true).write(true).create(true).mode(0o600);
    }
    opts.custom_flags(libc::O_CLOEXEC);
    opts.open(path)
}

// Lock description covering the whole file: offset 0, length 0 (to EOF).
fn whole_file(kind: LockKind) -> libc::flock {
    libc::flock {
        l_type: kind.as_libc(),
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    }
}

/// Takes a blocking advisory lock on the whole file via `fcntl(F_SETLKW)`,
/// retrying transient failures until the kernel grants the lock.
pub fn lock_file(file: &File, kind: LockKind) {
    let flk = whole_file(kind);
    // SAFETY: the descriptor is a valid open file and flk outlives the call.
    while unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &flk) } != 0 {
        thread::sleep(Duration::from_millis(10));
    }
}
