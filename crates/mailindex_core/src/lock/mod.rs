//! Index and log locking.
//!
//! - [`LockManager`] - reference-counted shared/exclusive locks on the index
//!   file with lock generations
//! - [`DotLock`] - `<path>.lock` files for filesystems without reliable
//!   advisory locks, also used to stage full-file rewrites
//! - [`FileLock`] - a waiting exclusive lock used for the transaction log

mod dotlock;
mod file_lock;
mod manager;
pub(crate) mod wait;

pub use dotlock::{dotlock_path, DotLock};
pub use file_lock::FileLock;
pub use manager::{LockId, LockManager, LockType};

/// How files are locked against other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMethod {
    /// Advisory `flock`-style locks on the file itself.
    #[default]
    Flock,
    /// `<path>.lock` files. Readers take no OS lock and every index write
    /// recreates the file.
    Dotlock,
}
