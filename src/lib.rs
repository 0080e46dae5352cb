pub mod errors;
pub mod lockfile;
pub mod registry;
mod sys;

pub use lockfile::{LockFile, Locker};
pub use registry::{get_lock_file, get_ro_lock_file};
#[allow(deprecated)]
pub use registry::{get_lockfile, get_ro_lockfile};
