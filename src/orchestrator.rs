//! The main loop: probe, debounce, dispatch, sleep.

use std::time::{Duration, Instant};

use crate::{
    address_resolver::AddressResolver,
    archive::{ArchiveManager, RestartError},
    failover::{Action, Debouncer, Decision, ObservationWindow},
    hwaddr::{LocalIdentity, MasterProbeResult},
    process_control::ProcessControl,
    shutdown::{sleep_unless_shutdown, Interrupted, ShutdownCheck},
    supervisor::LoggerSupervisor,
};

pub struct Orchestrator<R: AddressResolver, P: ProcessControl> {
    pub resolver: R,
    pub supervisor: LoggerSupervisor<P>,
    pub archive: ArchiveManager,
    pub local: LocalIdentity,
    pub master_host: String,
    /// Between probes, and after each dispatch.
    pub poll_interval: Duration,
    /// Log every probe and computed action.
    pub verbose: bool,
    /// When not verbose, how often to log that we are alive.
    pub activity_log_interval: Duration,
}

impl<R: AddressResolver, P: ProcessControl> Orchestrator<R, P> {
    /// One probe of the master. Probe errors count as "nothing
    /// answered" for this poll.
    pub fn observe(&self) -> MasterProbeResult {
        match self.resolver.probe_master(&self.master_host) {
            Ok(result) => result,
            Err(e) => {
                eprintln!("warning: {e}, treating as no reply");
                MasterProbeResult::empty()
            }
        }
    }

    /// Probe until the same action is computed on two consecutive
    /// polls, sleeping the poll interval between probes.
    pub fn debounce(
        &self,
        window: &ObservationWindow,
        shutdown: &dyn ShutdownCheck,
    ) -> Result<Decision, Interrupted> {
        let mut debouncer = Debouncer::default();
        loop {
            let decision = window.decide(self.observe(), &self.local);
            if self.verbose {
                eprintln!(
                    "master {:?} answered from {}: {}",
                    self.master_host, decision.observation, decision.action
                );
            }
            if debouncer.observe(decision.action).is_some() {
                return Ok(decision);
            }
            sleep_unless_shutdown(self.poll_interval, shutdown)?;
        }
    }

    pub fn dispatch(
        &self,
        action: Action,
        shutdown: &dyn ShutdownCheck,
    ) -> Result<(), RestartError> {
        match action {
            Action::Stop => self.supervisor.stop()?,
            Action::Start => {
                self.supervisor.ensure_started(&self.archive, shutdown)?;
            }
            Action::Restart => {
                self.archive.restart(&self.supervisor, shutdown)?;
            }
        }
        Ok(())
    }

    /// One debounce phase plus dispatch. On a failed dispatch the
    /// window is returned unchanged, so that the next cycle computes
    /// the same action again.
    pub fn cycle(
        &self,
        window: ObservationWindow,
        shutdown: &dyn ShutdownCheck,
    ) -> Result<ObservationWindow, Interrupted> {
        let decision = self.debounce(&window, shutdown)?;
        if self.verbose
            || decision.action == Action::Restart
            || window.last_action != Some(decision.action)
        {
            eprintln!(
                "committed action {} (master {:?} answered from {})",
                decision.action, self.master_host, decision.observation
            );
        }
        match self.dispatch(decision.action, shutdown) {
            Ok(()) => Ok(window.committed(&decision)),
            Err(RestartError::Interrupted(e)) => Err(e),
            Err(e) => {
                eprintln!("error: action {} failed: {e}", decision.action);
                Ok(window)
            }
        }
    }

    /// Run cycles until `shutdown` says so. Returns the window as of
    /// the last completed cycle.
    pub fn run(&self, shutdown: &dyn ShutdownCheck) -> ObservationWindow {
        eprintln!(
            "watching master {:?}, local addresses {}, poll interval {:?}",
            self.master_host, self.local, self.poll_interval
        );
        let mut window = ObservationWindow::default();
        let mut last_activity_log = Instant::now();
        loop {
            window = match self.cycle(window.clone(), shutdown) {
                Ok(window) => window,
                Err(Interrupted) => break,
            };
            if !self.verbose && last_activity_log.elapsed() >= self.activity_log_interval {
                if let Some(action) = window.last_action {
                    eprintln!("alive, last action {action}");
                }
                last_activity_log = Instant::now();
            }
            if sleep_unless_shutdown(self.poll_interval, shutdown).is_err() {
                break;
            }
        }
        eprintln!("shutdown requested, leaving main loop");
        window
    }
}
