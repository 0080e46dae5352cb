use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = LfError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum LfError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("making path {path:?} absolute: {source}")]
    AbsolutePath { path: PathBuf, source: std::io::Error },
    #[error("opening lock file {path:?}: {source}")]
    Open { path: PathBuf, source: std::io::Error },
    #[error("lock {path:?} is not a read-only lock")]
    NotReadOnly { path: PathBuf },
    #[error("lock {path:?} is not a read-write lock")]
    NotReadWrite { path: PathBuf },
    #[error("short write to lock file {path:?}")]
    OutOfSpace { path: PathBuf },
}
