//! Deciding what to do with the local logger, from which hosts
//! answered as master, plus the debounce rule that keeps single-poll
//! flips from being acted on.

use std::fmt::Display;

use crate::hwaddr::{LocalIdentity, MasterProbeResult};

/// What to do with the local logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// The local host is (or may be) the master: never shadow
    /// ourselves.
    Stop,
    /// Same remote master as before: make sure the logger runs.
    Start,
    /// Remote master changed or is unknown: quarantine the segments,
    /// then start the logger afresh.
    Restart,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Stop => "stop",
            Action::Start => "start",
            Action::Restart => "restart",
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True iff nothing answered that isn't us. Vacuously true for an
/// empty observation: without a confirmed remote master, stop.
pub fn is_local_master(observed: &MasterProbeResult, local: &LocalIdentity) -> bool {
    observed.addresses().iter().all(|addr| local.contains(addr))
}

pub fn decide(
    previous: Option<&MasterProbeResult>,
    current: &MasterProbeResult,
    local: &LocalIdentity,
) -> Action {
    if is_local_master(current, local) {
        return Action::Stop;
    }
    match previous {
        None => Action::Restart,
        Some(previous) if previous == current => Action::Start,
        Some(_) => Action::Restart,
    }
}

/// An action together with the probe result that justified it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub observation: MasterProbeResult,
}

/// The state carried from one cycle of the main loop to the next.
/// Starts out empty at process start and is owned by the main loop.
#[derive(Debug, Clone, Default)]
pub struct ObservationWindow {
    /// The probe result recorded at the last commit.
    pub previous: Option<MasterProbeResult>,
    /// The action that was last committed.
    pub last_action: Option<Action>,
}

impl ObservationWindow {
    pub fn decide(&self, current: MasterProbeResult, local: &LocalIdentity) -> Decision {
        Decision {
            action: decide(self.previous.as_ref(), &current, local),
            observation: current,
        }
    }

    /// Returns the window for the next cycle.
    pub fn committed(self, decision: &Decision) -> Self {
        Self {
            previous: Some(decision.observation.clone()),
            last_action: Some(decision.action),
        }
    }
}

/// Commits an action once it was computed on two consecutive polls.
#[derive(Debug, Clone, Default)]
pub struct Debouncer {
    last: Option<Action>,
}

impl Debouncer {
    /// Feed the action computed on one poll; returns it if it is
    /// committed. After a commit, two fresh equal computations are
    /// needed for the next one.
    pub fn observe(&mut self, action: Action) -> Option<Action> {
        if self.last == Some(action) {
            self.last = None;
            Some(action)
        } else {
            self.last = Some(action);
            None
        }
    }

    pub fn pending(&self) -> Option<Action> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwaddr::HwAddr;

    fn addr(last: u8) -> HwAddr {
        HwAddr([0x02, 0, 0, 0, 0, last])
    }

    fn probe(lasts: &[u8]) -> MasterProbeResult {
        lasts.iter().copied().map(addr).collect()
    }

    fn local(lasts: &[u8]) -> LocalIdentity {
        LocalIdentity::new(lasts.iter().copied().map(addr).collect()).unwrap()
    }

    #[test]
    fn t_is_local_master() {
        let local = local(&[1, 2]);
        assert!(is_local_master(&probe(&[]), &local));
        assert!(is_local_master(&probe(&[1]), &local));
        assert!(is_local_master(&probe(&[1, 2]), &local));
        assert!(!is_local_master(&probe(&[3]), &local));
        // Ambiguous answers with one foreign address are remote.
        assert!(!is_local_master(&probe(&[1, 3]), &local));
    }

    #[test]
    fn t_first_observation() {
        let local = local(&[1]);
        assert_eq!(decide(None, &probe(&[]), &local), Action::Stop);
        assert_eq!(decide(None, &probe(&[1]), &local), Action::Stop);
        assert_eq!(decide(None, &probe(&[2]), &local), Action::Restart);
    }

    #[test]
    fn t_steady_state() {
        let local = local(&[1]);
        let remote = probe(&[2]);
        assert_eq!(decide(Some(&remote), &remote, &local), Action::Start);
        let ours = probe(&[1]);
        assert_eq!(decide(Some(&ours), &ours, &local), Action::Stop);
    }

    #[test]
    fn t_change_detected() {
        let local = local(&[1]);
        for previous in [probe(&[]), probe(&[1]), probe(&[3]), probe(&[2, 3])] {
            assert_eq!(
                decide(Some(&previous), &probe(&[2]), &local),
                Action::Restart,
                "previous {previous}"
            );
        }
        assert_eq!(decide(Some(&probe(&[2])), &probe(&[]), &local), Action::Stop);
    }

    #[test]
    fn t_debouncer() {
        let mut d = Debouncer::default();
        assert_eq!(d.observe(Action::Stop), None);
        // Single-poll flip.
        assert_eq!(d.observe(Action::Restart), None);
        assert_eq!(d.observe(Action::Stop), None);
        assert_eq!(d.observe(Action::Stop), Some(Action::Stop));
        assert_eq!(d.pending(), None);
        assert_eq!(d.observe(Action::Stop), None);
        assert_eq!(d.observe(Action::Stop), Some(Action::Stop));
    }

    #[test]
    fn t_window_threads_the_previous_observation() {
        let local = local(&[1]);
        let window = ObservationWindow::default();
        let decision = window.decide(probe(&[2]), &local);
        assert_eq!(decision.action, Action::Restart);
        let window = window.committed(&decision);
        assert_eq!(window.last_action, Some(Action::Restart));
        assert_eq!(window.decide(probe(&[2]), &local).action, Action::Start);
    }
}
