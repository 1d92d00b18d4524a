//! Finite state machine for replica set member lifecycle
//!
//! A member moves `Absent -> PendingAdd -> Active` when its host enters the
//! desired set, and `Active -> PendingRemove -> Absent` when it leaves. The
//! reconciler derives each host's starting state from the live and desired
//! sets on every pass and drives it through this table, so a host can never
//! be pending addition and removal at once.

use std::collections::BTreeSet;
use std::fmt;

/// Membership state of one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberState {
    /// Not in the live configuration and not wanted
    Absent,
    /// Wanted but not yet in the live configuration
    PendingAdd,
    /// In the live configuration and wanted
    Active,
    /// In the live configuration but no longer wanted
    PendingRemove,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberState::Absent => write!(f, "absent"),
            MemberState::PendingAdd => write!(f, "pending-add"),
            MemberState::Active => write!(f, "active"),
            MemberState::PendingRemove => write!(f, "pending-remove"),
        }
    }
}

impl MemberState {
    /// State of `host` given the live and desired member sets
    ///
    /// A departing host is never scheduled for addition, even while the
    /// inventory still lists it.
    pub fn classify(
        host: &str,
        live: &BTreeSet<String>,
        desired: &BTreeSet<String>,
        departing: Option<&str>,
    ) -> Self {
        match (live.contains(host), desired.contains(host)) {
            (true, true) => MemberState::Active,
            (true, false) => MemberState::PendingRemove,
            (false, true) if departing != Some(host) => MemberState::PendingAdd,
            _ => MemberState::Absent,
        }
    }
}

/// Events driving a member between states
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemberEvent {
    /// `rs.add` for the host succeeded
    AddApplied,
    /// The host was not ready for a direct connection
    AddDeferred,
    /// `rs.remove` for the host succeeded
    RemoveApplied,
}

impl fmt::Display for MemberEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberEvent::AddApplied => write!(f, "AddApplied"),
            MemberEvent::AddDeferred => write!(f, "AddDeferred"),
            MemberEvent::RemoveApplied => write!(f, "RemoveApplied"),
        }
    }
}

/// Facts checked by transition guards
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Whether the host answered a direct readiness check
    pub host_ready: bool,
    /// Whether this process holds the coordinator role
    pub is_coordinator: bool,
}

impl TransitionContext {
    pub fn new(is_coordinator: bool, host_ready: bool) -> Self {
        Self {
            host_ready,
            is_coordinator,
        }
    }
}

#[derive(Debug)]
pub struct Transition {
    pub from: MemberState,
    pub to: MemberState,
    pub event: MemberEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: MemberState,
        to: MemberState,
        event: MemberEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: MemberState,
        to: MemberState,
        event: MemberEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: MemberState,
        event: MemberEvent,
    },
    GuardFailed {
        from: MemberState,
        to: MemberState,
        event: MemberEvent,
        reason: String,
    },
}

impl TransitionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TransitionResult::Success { .. })
    }
}

pub struct MemberStateMachine {
    transitions: Vec<Transition>,
}

impl Default for MemberStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemberStateMachine {
    pub fn new() -> Self {
        Self {
            transitions: vec![
                // === Addition ===
                Transition::new(
                    MemberState::PendingAdd,
                    MemberState::Active,
                    MemberEvent::AddApplied,
                    "Member added to the replica set",
                ),
                Transition::new(
                    MemberState::PendingAdd,
                    MemberState::PendingAdd,
                    MemberEvent::AddDeferred,
                    "Member not ready, addition deferred",
                ),
                // === Removal ===
                Transition::new(
                    MemberState::PendingRemove,
                    MemberState::Absent,
                    MemberEvent::RemoveApplied,
                    "Member removed from the replica set",
                ),
            ],
        }
    }

    pub fn transition(
        &self,
        current: &MemberState,
        event: MemberEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    pub fn can_transition(&self, from: &MemberState, event: &MemberEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    pub fn valid_events(&self, state: &MemberState) -> Vec<&MemberEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    /// Returns the failure reason when a guard blocks the transition
    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        if transition.from != transition.to && !ctx.is_coordinator {
            return Some("only the coordinator may change membership".to_string());
        }
        match transition.event {
            MemberEvent::AddApplied if !ctx.host_ready => {
                Some("host did not report ready".to_string())
            }
            _ => None,
        }
    }
}
