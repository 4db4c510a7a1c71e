//! Device lifecycle state machine
//!
//! The lifecycle is an explicit transition table over tagged states and
//! triggers. Anything not listed in [`LifecycleState::next`] is illegal and
//! leaves the state untouched.
//!
//! ```text
//! Uninitialized ─PowerOn─▶ PoweredOn ─BeginResolution─▶ ResolvingAddresses
//!   ─AddressesResolved | ResolutionTimedOut─▶ Converging
//!   ─AdjacenciesEstablished | ConvergenceTimedOut─▶ Operational
//!
//! any post-power-on state ─FaultDetected─▶ Faulted ─FaultCleared─▶ Recovering
//!   ─Reconverged | ConvergenceTimedOut─▶ Operational
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    PoweredOn,
    ResolvingAddresses,
    Converging,
    Operational,
    Faulted,
    Recovering,
}

/// Events that drive lifecycle transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    PowerOn,
    BeginResolution,
    AddressesResolved,
    ResolutionTimedOut,
    AdjacenciesEstablished,
    ConvergenceTimedOut,
    FaultDetected,
    FaultCleared,
    Reconverged,
}

/// Rejected transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition from {from} on {trigger:?}")]
pub struct IllegalTransition {
    pub from: LifecycleState,
    pub trigger: Trigger,
}

impl LifecycleState {
    /// The transition table
    pub fn next(self, trigger: Trigger) -> Option<LifecycleState> {
        use LifecycleState::*;
        use Trigger::*;

        match (self, trigger) {
            (Uninitialized, PowerOn) => Some(PoweredOn),
            (PoweredOn, BeginResolution) => Some(ResolvingAddresses),
            (ResolvingAddresses, AddressesResolved | ResolutionTimedOut) => Some(Converging),
            (Converging, AdjacenciesEstablished | ConvergenceTimedOut) => Some(Operational),
            (PoweredOn | ResolvingAddresses | Converging | Operational | Recovering, FaultDetected) => {
                Some(Faulted)
            }
            (Faulted, FaultCleared) => Some(Recovering),
            (Recovering, Reconverged | ConvergenceTimedOut) => Some(Operational),
            _ => None,
        }
    }

    /// Apply a trigger, failing on pairs the table does not list
    pub fn apply(self, trigger: Trigger) -> Result<LifecycleState, IllegalTransition> {
        self.next(trigger)
            .ok_or(IllegalTransition { from: self, trigger })
    }

    /// Whether the device has been powered on at some point
    pub fn is_powered(self) -> bool {
        !matches!(self, LifecycleState::Uninitialized)
    }

    /// Operational and Faulted hold until the coordinator halts
    pub fn is_stable(self) -> bool {
        matches!(self, LifecycleState::Operational | LifecycleState::Faulted)
    }

    /// Whether the device is still working through Day-1 bring-up
    pub fn is_bringing_up(self) -> bool {
        matches!(
            self,
            LifecycleState::PoweredOn
                | LifecycleState::ResolvingAddresses
                | LifecycleState::Converging
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::PoweredOn => "powered_on",
            LifecycleState::ResolvingAddresses => "resolving_addresses",
            LifecycleState::Converging => "converging",
            LifecycleState::Operational => "operational",
            LifecycleState::Faulted => "faulted",
            LifecycleState::Recovering => "recovering",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn test_bring_up_path() {
        let mut state = Uninitialized;
        for trigger in [
            Trigger::PowerOn,
            Trigger::BeginResolution,
            Trigger::AddressesResolved,
            Trigger::AdjacenciesEstablished,
        ] {
            state = state.apply(trigger).unwrap();
        }
        assert_eq!(state, Operational);
    }

    #[test]
    fn test_timeouts_still_advance() {
        assert_eq!(
            ResolvingAddresses.next(Trigger::ResolutionTimedOut),
            Some(Converging)
        );
        assert_eq!(
            Converging.next(Trigger::ConvergenceTimedOut),
            Some(Operational)
        );
        assert_eq!(
            Recovering.next(Trigger::ConvergenceTimedOut),
            Some(Operational)
        );
    }

    #[test]
    fn test_fault_and_recovery_cycle() {
        let state = Operational.apply(Trigger::FaultDetected).unwrap();
        assert_eq!(state, Faulted);
        let state = state.apply(Trigger::FaultCleared).unwrap();
        assert_eq!(state, Recovering);
        assert_eq!(state.apply(Trigger::Reconverged).unwrap(), Operational);
    }

    #[test]
    fn test_no_backward_moves() {
        assert!(Operational.next(Trigger::PowerOn).is_none());
        assert!(Converging.next(Trigger::BeginResolution).is_none());
        assert!(Operational.next(Trigger::AddressesResolved).is_none());
        assert!(Faulted.next(Trigger::FaultDetected).is_none());
        assert!(Uninitialized.next(Trigger::FaultDetected).is_none());

        let err = Faulted.apply(Trigger::Reconverged).unwrap_err();
        assert_eq!(err.from, Faulted);
        assert_eq!(err.trigger, Trigger::Reconverged);
    }

    #[test]
    fn test_predicates() {
        assert!(!Uninitialized.is_powered());
        assert!(Recovering.is_powered());
        assert!(Operational.is_stable());
        assert!(Faulted.is_stable());
        assert!(!Recovering.is_stable());
        assert!(Converging.is_bringing_up());
        assert!(!Operational.is_bringing_up());
    }
}
