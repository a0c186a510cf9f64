//! Sleeping in a way that can be cut short when the daemon is asked
//! to exit.

use std::{
    thread::sleep,
    time::{Duration, Instant},
};

/// Longest uninterrupted sleep.
pub const SLEEP_SLICE: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("interrupted by shutdown request")]
pub struct Interrupted;

/// Something that can tell whether we have been asked to exit.
pub trait ShutdownCheck {
    fn shutdown_requested(&self) -> bool;
}

impl<F: Fn() -> bool> ShutdownCheck for F {
    fn shutdown_requested(&self) -> bool {
        self()
    }
}

/// For code paths that are never interrupted (one-shot commands,
/// tests).
pub struct Never;

impl ShutdownCheck for Never {
    fn shutdown_requested(&self) -> bool {
        false
    }
}

/// Sleep for `duration`, checking `check` at least every
/// `SLEEP_SLICE`. Also checks once before sleeping at all, thus a
/// zero duration still notices a pending request. A duration too
/// large to represent as a point in time sleeps until interrupted.
pub fn sleep_unless_shutdown(
    duration: Duration,
    check: &dyn ShutdownCheck,
) -> Result<(), Interrupted> {
    let deadline = Instant::now().checked_add(duration);
    loop {
        if check.shutdown_requested() {
            return Err(Interrupted);
        }
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(());
                }
                (deadline - now).min(SLEEP_SLICE)
            }
            None => SLEEP_SLICE,
        };
        sleep(slice);
    }
}
