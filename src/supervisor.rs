//! The local logger process: is it running, stop it, start it.

use std::time::{Duration, Instant};

use nix::sys::signal::Signal;

use crate::{
    archive::{ArchiveManager, ArchiveReport, RestartError},
    process_control::{ProcessControl, ProcessControlError},
    shutdown::{sleep_unless_shutdown, ShutdownCheck},
};

/// How often to re-check whether the logger went away after a stop
/// request.
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct LoggerSupervisor<P: ProcessControl> {
    pub control: P,
    /// Passed to `stop_process` / `start_process`.
    pub program: String,
    /// What the logger shows up as in the process table.
    pub process_name: String,
    /// How long to wait for the logger to exit after a stop request
    /// before sending SIGTERM, and again after that.
    pub stop_confirm_timeout: Duration,
}

impl<P: ProcessControl> LoggerSupervisor<P> {
    pub fn control(&self) -> &P {
        &self.control
    }

    /// Asks the OS every time, never cached.
    pub fn is_running(&self) -> Result<bool, ProcessControlError> {
        self.control.is_process_running(&self.process_name)
    }

    /// Issue a stop request if the logger runs; does not wait for it
    /// to exit.
    pub fn stop(&self) -> Result<(), ProcessControlError> {
        if self.is_running()? {
            eprintln!("stopping logger {:?}", self.program);
            self.control.stop_process(&self.program)?;
        }
        Ok(())
    }

    /// Poll until the logger is gone, up to `stop_confirm_timeout`.
    /// Returns whether it is gone. A timeout too large to represent
    /// waits until the logger is gone or shutdown is requested.
    fn wait_gone(&self, shutdown: &dyn ShutdownCheck) -> Result<bool, ProcessControlError> {
        let deadline = Instant::now().checked_add(self.stop_confirm_timeout);
        loop {
            if !self.is_running()? {
                return Ok(true);
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    (deadline - now).min(STOP_POLL_INTERVAL)
                }
                None => STOP_POLL_INTERVAL,
            };
            sleep_unless_shutdown(pause, shutdown)?;
        }
    }

    /// `stop`, then wait until the process table confirms the logger
    /// is gone, sending SIGTERM if the stop request did not suffice.
    pub fn stop_and_confirm(&self, shutdown: &dyn ShutdownCheck) -> Result<(), ProcessControlError> {
        self.stop()?;
        if self.wait_gone(shutdown)? {
            return Ok(());
        }
        let n = self
            .control
            .signal_process(&self.process_name, Signal::SIGTERM)?;
        eprintln!(
            "logger {:?} did not stop within {:?}, sent SIGTERM to {n} process(es)",
            self.process_name, self.stop_confirm_timeout
        );
        if self.wait_gone(shutdown)? {
            Ok(())
        } else {
            Err(ProcessControlError::StillRunning(self.process_name.clone()))
        }
    }

    /// Start the logger without touching its segments. Only the
    /// archive protocol calls this.
    pub fn start(&self) -> Result<(), ProcessControlError> {
        eprintln!("starting logger {:?}", self.program);
        self.control.start_process(&self.program)
    }

    /// If the logger is not running, bring it up through the full
    /// archive-and-restart protocol: segments left by a logger that
    /// ended unsupervised are never resumed. Returns the archive
    /// report if a restart happened.
    pub fn ensure_started(
        &self,
        archive: &ArchiveManager,
        shutdown: &dyn ShutdownCheck,
    ) -> Result<Option<ArchiveReport>, RestartError> {
        if self.is_running()? {
            Ok(None)
        } else {
            archive.restart(self, shutdown).map(Some)
        }
    }
}
