use anyhow::{anyhow, bail, Result};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};

/// Send `signal` to `pid` (`None` only checks for existence). Returns
/// false if there is no such process.
pub fn send_signal_to_pid(pid: Pid, signal: Option<Signal>) -> Result<bool> {
    match kill(pid, signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(Errno::EPERM) => bail!("don't have permission to send signal to pid {pid}"),
        Err(e) => bail!("sending {signal:?} to pid {pid}: {e}"),
    }
}

/// Same as `send_signal_to_pid` but for the process group led by
/// `pid`.
pub fn send_signal_to_process_group(pid: Pid, signal: Option<Signal>) -> Result<bool> {
    let process_group_id: i32 = pid
        .as_raw()
        .checked_neg()
        .ok_or_else(|| anyhow!("pid {pid} can't be negated"))?;
    send_signal_to_pid(Pid::from_raw(process_group_id), signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn t_existence_checks() {
        assert!(send_signal_to_pid(getpid(), None).unwrap());
        // Above the kernel's maximum pid.
        assert!(!send_signal_to_pid(Pid::from_raw(4_194_305), None).unwrap());
    }
}
