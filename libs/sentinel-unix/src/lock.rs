//! `flock(2)` based lock files.

use std::{
    fs::File,
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::Path,
    sync::Arc,
};

use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("opening lock file {path:?}: {error}")]
    Open {
        path: Arc<Path>,
        error: std::io::Error,
    },
    #[error("flock on {path:?}: {error}")]
    Flock { path: Arc<Path>, error: Errno },
    #[error("lock on {0:?} is held by another process")]
    AlreadyLocked(Arc<Path>),
}

/// A held lock. There is no explicit unlock: the lock goes away when
/// the last file descriptor referring to it is closed, which means
/// that a forked child keeps holding it after the parent drops its
/// copy.
#[derive(Debug)]
pub struct LockFile {
    path: Arc<Path>,
    _file: File,
}

impl LockFile {
    /// Try to take the lock without blocking. The file is created if
    /// missing, never truncated.
    pub fn try_acquire(path: Arc<Path>, exclusive: bool) -> Result<Self, LockError> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)
            .map_err(|error| LockError::Open {
                path: path.clone(),
                error,
            })?;
        let arg = if exclusive {
            FlockArg::LockExclusiveNonblock
        } else {
            FlockArg::LockSharedNonblock
        };
        match flock(file.as_raw_fd(), arg) {
            Ok(()) => Ok(Self { path, _file: file }),
            // Same as Errno::EAGAIN
            Err(Errno::EWOULDBLOCK) => Err(LockError::AlreadyLocked(path)),
            Err(error) => Err(LockError::Flock { path, error }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether some process holds an exclusive lock on `path`. Takes a
/// shared lock for testing, so that concurrent testers don't see each
/// other as the holder.
pub fn is_locked(path: Arc<Path>) -> Result<bool, LockError> {
    match LockFile::try_acquire(path, false) {
        Ok(lock) => {
            drop(lock);
            Ok(false)
        }
        Err(LockError::AlreadyLocked(_)) => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let path: Arc<Path> = dir.path().join("x.lock").into();
        let _a = LockFile::try_acquire(path.clone(), false).unwrap();
        let _b = LockFile::try_acquire(path.clone(), false).unwrap();
        assert!(!is_locked(path).unwrap());
    }

    #[test]
    fn t_exclusive_lock_is_seen() {
        let dir = tempfile::tempdir().unwrap();
        let path: Arc<Path> = dir.path().join("x.lock").into();
        assert!(!is_locked(path.clone()).unwrap());
        let held = LockFile::try_acquire(path.clone(), true).unwrap();
        // flock locks belong to the open file description, a second
        // open() of the same path in the same process conflicts, too.
        assert!(is_locked(path.clone()).unwrap());
        match LockFile::try_acquire(path.clone(), true) {
            Err(LockError::AlreadyLocked(p)) => assert_eq!(&*p, &*path),
            other => panic!("expected AlreadyLocked, got {other:?}"),
        }
        drop(held);
        assert!(!is_locked(path).unwrap());
    }
}
