//! Run / start / stop a service as a daemon process (group).
//!
//! `start` forks, detaches the child from the terminal into its own
//! session, and captures its stdout/stderr into log files. An
//! exclusive flock on `daemon.lock` held by the daemon tells whether
//! it is running; the want-state file (see `state`) is how `stop`
//! asks it to exit at its next check.

use std::{
    io::{stdout, Write},
    path::Path,
    sync::Arc,
    thread::sleep,
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use cj_path_util::path_util::AppendToPath;
use nix::{
    sys::signal::Signal,
    unistd::{getpid, Pid},
};

use crate::{
    fork::{detach, easy_fork},
    lock::{is_locked, LockError, LockFile},
    logging::{Logger, LoggingOpts, TimestampOpts},
    signal::send_signal_to_process_group,
    state::{DaemonState, DaemonStateReader, DaemonWant, StateFileError},
};

#[derive(Debug, Clone, Copy, clap::Subcommand)]
pub enum DaemonMode {
    /// Do not put into background, just run forever in the foreground.
    Run,

    /// Start daemon into background.
    Start,

    /// Stop daemon running in background (does not stop daemons in
    /// `run` mode, only those in `start` mode).
    Stop(StopOpts),

    /// `stop` (waiting for the daemon to end) then `start`.
    Restart(StopOpts),

    /// Report if there is a daemon in `start` mode.
    Status,
}

#[derive(Debug, Clone, Copy, clap::Args)]
pub struct StopOpts {
    /// By default, 'stop' stops the daemon gracefully (it notices the
    /// wish for termination at its next check, usually within a
    /// second). This stops the daemon via signals instead, first
    /// SIGINT, then SIGKILL.
    #[clap(short, long)]
    pub force: bool,

    /// When doing graceful termination, by default `stop` does not
    /// wait for the daemon to carry it out. This changes it to wait.
    #[clap(short, long)]
    pub wait: bool,

    /// The time in seconds after sending SIGINT before sending
    /// SIGKILL
    #[clap(short, long, default_value = "30")]
    pub timeout_before_sigkill: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("daemon is already running (lock {0:?} is taken)")]
    AlreadyRunning(Arc<Path>),
    #[error("{0}")]
    Lock(#[from] LockError),
    #[error("{0}")]
    StateFile(#[from] StateFileError),
    #[error("{context}: {error}")]
    Errno {
        context: &'static str,
        error: nix::errno::Errno,
    },
    #[error("{0:#}")]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct StopReport {
    pub was_pid: Option<i32>,
    pub was_running: bool,
    pub sent_sigint: bool,
    pub sent_sigkill: bool,
}

pub struct Daemon<F: FnOnce(DaemonStateReader) -> anyhow::Result<()>> {
    /// Where the lock and state files and the `logs` dir are placed
    /// (created if missing).
    pub state_dir: Arc<Path>,
    pub logging_opts: LoggingOpts,
    pub timestamp_opts: TimestampOpts,
    /// The daemon's main function; the daemon ends when it returns. It
    /// should periodically call `want_exit()` on its argument and
    /// return when that gives true.
    pub run: F,
}

impl<F: FnOnce(DaemonStateReader) -> anyhow::Result<()>> Daemon<F> {
    pub fn create_dirs(&self) -> anyhow::Result<()> {
        for dir in [self.state_dir.to_path_buf(), self.log_dir()] {
            std::fs::create_dir_all(&dir).with_context(|| anyhow!("creating dir {dir:?}"))?;
        }
        Ok(())
    }

    fn dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn log_dir(&self) -> std::path::PathBuf {
        self.dir().append("logs")
    }

    pub fn lock_path(&self) -> Arc<Path> {
        self.dir().append("daemon.lock").into()
    }

    /// Path to the 8-byte mmap file holding the want state. Protect
    /// it from modification by other parties!
    pub fn state_path(&self) -> Arc<Path> {
        self.dir().append("daemon_state.mmap").into()
    }

    fn daemon_state(&self) -> Result<DaemonState, StateFileError> {
        DaemonState::open(self.state_path())
    }

    pub fn is_running(&self) -> Result<bool, LockError> {
        is_locked(self.lock_path())
    }

    pub fn stop(&self, opts: StopOpts) -> anyhow::Result<StopReport> {
        let StopOpts {
            force,
            wait,
            timeout_before_sigkill,
        } = opts;

        let daemon_state = self.daemon_state()?;
        let (_old_want, was_pid) = daemon_state.read()?;
        let was_running = self.is_running()?;

        // Set the want even if not running: it may be stale from
        // before a reboot.
        daemon_state.store_want(DaemonWant::Down);

        let mut sent_sigint = false;
        let mut sent_sigkill = false;

        if was_running {
            if force {
                let Some(pid) = was_pid else {
                    bail!("daemon is running but its state file has no pid, can't signal it")
                };
                let pid = Pid::from_raw(pid);
                if send_signal_to_process_group(pid, Some(Signal::SIGINT))? {
                    sent_sigint = true;
                    for _ in 0..timeout_before_sigkill * 5 {
                        sleep(Duration::from_millis(200));
                        if !send_signal_to_process_group(pid, None)? {
                            break;
                        }
                    }
                    if send_signal_to_process_group(pid, Some(Signal::SIGKILL))? {
                        sent_sigkill = true;
                    }
                }
            } else if wait {
                while self.is_running()? {
                    sleep(Duration::from_millis(500));
                }
            }
        }
        Ok(StopReport {
            was_pid,
            was_running,
            sent_sigint,
            sent_sigkill,
        })
    }

    /// Fork off the daemon. Returns in the parent only; the child
    /// exits when `run` returns (exit code 1 if it returned an
    /// error). Must be called while there are no other threads,
    /// panics otherwise!
    pub fn start(self) -> Result<(), DaemonError> {
        let lock = match LockFile::try_acquire(self.lock_path(), true) {
            Ok(lock) => lock,
            Err(LockError::AlreadyLocked(path)) => return Err(DaemonError::AlreadyRunning(path)),
            Err(e) => return Err(e.into()),
        };
        let daemon_state = self.daemon_state()?;
        daemon_state.store(DaemonWant::Up, None);
        let log_dir = self.log_dir();
        let Self {
            state_dir: _,
            logging_opts,
            timestamp_opts,
            run,
        } = self;

        _ = stdout().flush();
        if let Some(child) = easy_fork().map_err(|error| DaemonError::Errno {
            context: "fork",
            error,
        })? {
            // The child holds onto the lock via its copy of the file
            // descriptor.
            drop(lock);
            eprintln!("started daemon with pid {child}");
            return Ok(());
        }

        // In the daemon.
        let result = (|| -> anyhow::Result<()> {
            let session_pid = detach()?;
            daemon_state.store(DaemonWant::Up, Some(session_pid.as_raw()));
            Logger {
                logging_opts,
                timestamp_opts,
                dir_path: log_dir.into(),
            }
            .redirect_to_logger(session_pid)
            .map_err(|e| anyhow!("{e}"))?;
            eprintln!("daemon started, pid {}", getpid());
            run(DaemonStateReader::new(&daemon_state))
        })();
        daemon_state.store(DaemonWant::Down, None);
        let code = match result {
            Ok(()) => {
                eprintln!("daemon exiting");
                0
            }
            Err(e) => {
                eprintln!("daemon terminated by error: {e:#}");
                1
            }
        };
        drop(lock);
        std::process::exit(code)
    }

    pub fn print_status(&self) -> anyhow::Result<()> {
        let daemon_state = self.daemon_state()?;
        let is_running = self.is_running()?;
        let (want, pid) = daemon_state.read()?;
        let is = if is_running { "running" } else { "stopped" };
        let mut out = stdout().lock();
        match pid {
            Some(pid) if is_running => writeln!(&mut out, "{is} (pid: {pid}, want: {want:?})")?,
            _ => writeln!(&mut out, "{is} (want: {want:?})")?,
        }
        Ok(())
    }

    /// Must be called while there are no other threads, panics
    /// otherwise!
    pub fn execute(self, mode: DaemonMode) -> Result<(), DaemonError> {
        self.create_dirs()?;
        match mode {
            DaemonMode::Run => (self.run)(DaemonStateReader::foreground())?,
            DaemonMode::Start => self.start()?,
            DaemonMode::Stop(opts) => {
                let report = self.stop(opts)?;
                if !report.was_running {
                    eprintln!("daemon was not running");
                }
            }
            DaemonMode::Restart(opts) => {
                let report = self.stop(StopOpts { wait: true, ..opts })?;
                if report.sent_sigkill {
                    eprintln!("had to kill the daemon");
                }
                self.start()?
            }
            DaemonMode::Status => self.print_status()?,
        }
        Ok(())
    }
}
