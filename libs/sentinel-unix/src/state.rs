//! The state the daemon is wanted to be in, shared between the
//! control invocations (`stop`, `status`) and the running daemon
//! through an mmap'ed 8-byte file. The upper 32 bits hold a
//! `DaemonWant` tag, the lower 32 bits the session pid (0 = none).
//!
//! Protect the file from modification by other parties: truncating
//! it while it is mapped can crash the daemon.

use std::{
    fs::OpenOptions,
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::Path,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use memmap2::{MmapMut, MmapOptions};

const WORD_LEN: u64 = std::mem::size_of::<AtomicU64>() as u64;

#[derive(thiserror::Error, Debug)]
pub enum StateFileError {
    #[error("state file {path:?}: {error}")]
    Io {
        path: Arc<Path>,
        error: std::io::Error,
    },
    #[error("state file {path:?} has invalid length {len}")]
    InvalidLength { path: Arc<Path>, len: u64 },
    #[error("state file {path:?} contains invalid want tag {tag}")]
    InvalidWant { path: Arc<Path>, tag: u32 },
}

/// What state we want the daemon to be in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonWant {
    Down,
    Up,
}

impl DaemonWant {
    const fn tag(self) -> u32 {
        match self {
            DaemonWant::Down => b'd' as u32,
            DaemonWant::Up => b'u' as u32,
        }
    }

    fn from_tag(tag: u32) -> Option<Self> {
        if tag == DaemonWant::Down.tag() {
            Some(DaemonWant::Down)
        } else if tag == DaemonWant::Up.tag() {
            Some(DaemonWant::Up)
        } else {
            None
        }
    }
}

fn pack(want: DaemonWant, pid: Option<i32>) -> u64 {
    ((want.tag() as u64) << 32) | (pid.unwrap_or(0) as u32 as u64)
}

pub struct DaemonState {
    path: Arc<Path>,
    word: NonNull<AtomicU64>,
    // Keeps `word` valid.
    _mmap: MmapMut,
}

impl DaemonState {
    pub fn open(path: Arc<Path>) -> Result<Self, StateFileError> {
        let io = |error| StateFileError::Io {
            path: path.clone(),
            error,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)
            .map_err(io)?;
        let len = file.metadata().map_err(io)?.len();
        match len {
            0 => file
                .write_all(&pack(DaemonWant::Down, None).to_ne_bytes())
                .map_err(io)?,
            WORD_LEN => (),
            _ => {
                return Err(StateFileError::InvalidLength {
                    path: path.clone(),
                    len,
                })
            }
        }
        let mut mmap = unsafe {
            // Safe as long as nobody truncates the file, see module
            // docs.
            MmapOptions::new().len(WORD_LEN as usize).map_mut(&file)
        }
        .map_err(io)?;
        // Mappings are page aligned, thus suitably aligned for an
        // AtomicU64.
        let word = NonNull::new(mmap.as_mut_ptr() as *mut AtomicU64)
            .expect("mmap never gives a null pointer");
        Ok(Self {
            path,
            word,
            _mmap: mmap,
        })
    }

    fn word(&self) -> &AtomicU64 {
        unsafe {
            // Safe because the mapping lives as long as self.
            self.word.as_ref()
        }
    }

    pub fn path(&self) -> &Arc<Path> {
        &self.path
    }

    /// The pid, if set, does not imply that the daemon is up; check
    /// the lock for that.
    pub fn read(&self) -> Result<(DaemonWant, Option<i32>), StateFileError> {
        let v = self.word().load(Ordering::SeqCst);
        let tag = (v >> 32) as u32;
        let want = DaemonWant::from_tag(tag).ok_or_else(|| StateFileError::InvalidWant {
            path: self.path.clone(),
            tag,
        })?;
        let pid = v as u32 as i32;
        Ok((want, if pid == 0 { None } else { Some(pid) }))
    }

    pub fn store(&self, want: DaemonWant, pid: Option<i32>) {
        self.word().store(pack(want, pid), Ordering::SeqCst);
    }

    /// Change the want, keeping the pid. Returns the previous raw
    /// value.
    pub fn store_want(&self, want: DaemonWant) -> u64 {
        let upper = (want.tag() as u64) << 32;
        match self
            .word()
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |old| {
                Some((old & u32::MAX as u64) | upper)
            }) {
            Ok(old) => old,
            Err(old) => old,
        }
    }
}

/// Handed to the daemon's main function so that it can check whether
/// it is asked to exit.
pub struct DaemonStateReader<'t>(Option<&'t DaemonState>);

impl<'t> DaemonStateReader<'t> {
    /// For running in the foreground, where stopping happens via
    /// signals only.
    pub fn foreground() -> Self {
        Self(None)
    }

    pub(crate) fn new(state: &'t DaemonState) -> Self {
        Self(Some(state))
    }

    /// Whether the daemon was asked to go down.
    pub fn want_exit(&self) -> bool {
        match self.0 {
            None => false,
            Some(state) => match state.read() {
                Ok((DaemonWant::Down, _)) => true,
                Ok((DaemonWant::Up, _)) => false,
                Err(e) => {
                    eprintln!("warning: can't read daemon state, keeping going: {e}");
                    false
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_state_roundtrips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path: Arc<Path> = dir.path().join("state.mmap").into();
        let state = DaemonState::open(path.clone()).unwrap();
        assert_eq!(state.read().unwrap(), (DaemonWant::Down, None));
        state.store(DaemonWant::Up, Some(4711));

        // A second mapping (e.g. from a `stop` invocation) sees it.
        let other = DaemonState::open(path).unwrap();
        assert_eq!(other.read().unwrap(), (DaemonWant::Up, Some(4711)));
        other.store_want(DaemonWant::Down);
        assert_eq!(state.read().unwrap(), (DaemonWant::Down, Some(4711)));
        assert!(DaemonStateReader::new(&state).want_exit());
        assert!(!DaemonStateReader::foreground().want_exit());
    }

    #[test]
    fn t_rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path: Arc<Path> = dir.path().join("state.mmap").into();
        std::fs::write(&path, b"hello").unwrap();
        match DaemonState::open(path) {
            Err(StateFileError::InvalidLength { len, .. }) => assert_eq!(len, 5),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("expected an error"),
        }
    }
}
