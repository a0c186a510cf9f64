//! Querying, stopping and starting processes by program name.

use std::path::PathBuf;

use nix::sys::signal::Signal;
use sentinel_unix::{
    proc_table::{ProcTable, ProcTableError},
    signal::send_signal_to_pid,
};

use crate::{command::run, shutdown::Interrupted};

#[derive(thiserror::Error, Debug)]
pub enum ProcessControlError {
    #[error("querying the process table: {0}")]
    ProcessTable(#[from] ProcTableError),
    #[error("{0:#}")]
    Command(anyhow::Error),
    #[error("signalling {name:?}: {error:#}")]
    Signal { name: String, error: anyhow::Error },
    #[error("{0:?} is still running after being asked to stop")]
    StillRunning(String),
    #[error("{0}")]
    Interrupted(#[from] Interrupted),
}

pub trait ProcessControl {
    fn is_process_running(&self, name: &str) -> Result<bool, ProcessControlError>;

    /// Ask `program` to stop via its control interface. Returns once
    /// the request has been issued.
    fn stop_process(&self, program: &str) -> Result<(), ProcessControlError>;

    fn start_process(&self, program: &str) -> Result<(), ProcessControlError>;

    /// Send `signal` to all processes named `name`; returns how many
    /// were signalled.
    fn signal_process(&self, name: &str, signal: Signal) -> Result<usize, ProcessControlError>;
}

/// `/proc` for queries and signals, the program's own `stop` and
/// `start` subcommands for control.
#[derive(Debug, Clone, Default)]
pub struct SystemProcessControl {
    pub proc_table: ProcTable,
}

impl SystemProcessControl {
    pub fn new(proc_path: PathBuf) -> Self {
        Self {
            proc_table: ProcTable { proc_path },
        }
    }
}

impl ProcessControl for SystemProcessControl {
    fn is_process_running(&self, name: &str) -> Result<bool, ProcessControlError> {
        Ok(!self.proc_table.find_named(name)?.is_empty())
    }

    fn stop_process(&self, program: &str) -> Result<(), ProcessControlError> {
        run(program, &["stop"], &[0]).map_err(ProcessControlError::Command)?;
        Ok(())
    }

    fn start_process(&self, program: &str) -> Result<(), ProcessControlError> {
        run(program, &["start"], &[0]).map_err(ProcessControlError::Command)?;
        Ok(())
    }

    fn signal_process(&self, name: &str, signal: Signal) -> Result<usize, ProcessControlError> {
        let mut signalled = 0;
        for entry in self.proc_table.find_named(name)? {
            let existed = send_signal_to_pid(entry.pid, Some(signal)).map_err(|error| {
                ProcessControlError::Signal {
                    name: name.into(),
                    error,
                }
            })?;
            if existed {
                signalled += 1;
            }
        }
        Ok(signalled)
    }
}
