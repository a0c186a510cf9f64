//! Forking and detaching from the controlling terminal.

use std::{fs::File, os::fd::AsRawFd};

use anyhow::{anyhow, Context, Result};
use nix::{
    errno::Errno,
    sys::stat::{umask, Mode},
    unistd::{chdir, dup2, fork, setsid, ForkResult, Pid},
};
use num_threads::is_single_threaded;

/// `fork(2)` with a simpler result: `Some(child)` in the parent,
/// `None` in the child.
///
/// Can only be used while there are no other threads running; it
/// checks and panics if there are!
pub fn easy_fork() -> Result<Option<Pid>, Errno> {
    match is_single_threaded() {
        Some(true) => (),
        Some(false) => panic!("easy_fork: other threads are running, refusing to fork"),
        None => panic!("easy_fork: can't determine if other threads are running"),
    }
    match unsafe {
        // Safe because there are no other threads (checked above).
        fork()
    }? {
        ForkResult::Parent { child, .. } => Ok(Some(child)),
        ForkResult::Child => Ok(None),
    }
}

/// Detach the current (freshly forked) process from the terminal:
/// new session, then a second fork whose parent (the session leader)
/// exits, so that the process continuing from here can never acquire
/// a controlling terminal. Then umask 022, working directory `/`,
/// stdin from `/dev/null`. Returns the new session id, which stays
/// the process group id of the continuing process. stdout and stderr
/// are left alone, see `logging::Logger::redirect_to_logger`.
pub fn detach() -> Result<Pid> {
    let session_pid = setsid().context("setsid")?;
    if easy_fork().context("second fork")?.is_some() {
        std::process::exit(0);
    }
    umask(Mode::from_bits_truncate(0o022));
    chdir("/").context("chdir to /")?;
    let dev_null = File::open("/dev/null").context("opening /dev/null")?;
    dup2(dev_null.as_raw_fd(), 0).map_err(|e| anyhow!("redirecting stdin to /dev/null: {e}"))?;
    Ok(session_pid)
}
