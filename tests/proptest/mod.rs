// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for membership planning, status projection and pbm
//! output handling
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. A reconcile plan never adds and removes the same host, and applying it
//!    converges
//! 2. A departing host is never scheduled for addition
//! 3. A non-nominal database status always wins the projection
//! 4. pbm error and status text is classified without panicking

use std::collections::BTreeSet;

use proptest::prelude::*;

use mongodb_operator::backup::pbm::{classify_output, process_pbm_error};
use mongodb_operator::controller::state_machine::TransitionContext;
use mongodb_operator::controller::status::{UnitStatus, project};
use mongodb_operator::controller::{
    MemberEvent, MemberState, MemberStateMachine, ReconcilePlan, UnitId,
};

// =============================================================================
// Strategies
// =============================================================================

/// Hostnames drawn from a small pool so that sets overlap often
fn host() -> impl Strategy<Value = String> {
    (0u32..8).prop_map(|n| format!("mongodb-{}.mongodb-endpoints", n))
}

fn host_set() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set(host(), 0..8)
}

fn departing() -> impl Strategy<Value = Option<String>> {
    prop::option::of(host())
}

fn app_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,20}[a-z0-9]"
}

fn unit_status() -> impl Strategy<Value = UnitStatus> {
    let message = "[a-zA-Z .]{0,20}";
    prop_oneof![
        message.prop_map(UnitStatus::Active),
        message.prop_map(UnitStatus::Maintenance),
        message.prop_map(UnitStatus::Waiting),
        message.prop_map(UnitStatus::Blocked),
    ]
}

fn member_state() -> impl Strategy<Value = MemberState> {
    prop_oneof![
        Just(MemberState::Absent),
        Just(MemberState::PendingAdd),
        Just(MemberState::Active),
        Just(MemberState::PendingRemove),
    ]
}

fn member_event() -> impl Strategy<Value = MemberEvent> {
    prop_oneof![
        Just(MemberEvent::AddApplied),
        Just(MemberEvent::AddDeferred),
        Just(MemberEvent::RemoveApplied),
    ]
}

// =============================================================================
// Reconcile plan properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: no host is both added and removed
    #[test]
    fn prop_plan_is_disjoint(live in host_set(), desired in host_set(), departing in departing()) {
        let plan = ReconcilePlan::compute(&live, &desired, departing.as_deref());
        prop_assert!(plan.to_add.is_disjoint(&plan.to_remove));
    }

    /// Property: removals are exactly the live hosts that are no longer wanted
    #[test]
    fn prop_removals_are_live_minus_desired(live in host_set(), desired in host_set(), departing in departing()) {
        let plan = ReconcilePlan::compute(&live, &desired, departing.as_deref());
        let expected: BTreeSet<String> = live.difference(&desired).cloned().collect();
        prop_assert_eq!(plan.to_remove, expected);
    }

    /// Property: additions are the missing desired hosts, never the departing one
    #[test]
    fn prop_additions_exclude_departing(live in host_set(), desired in host_set(), departing in departing()) {
        let plan = ReconcilePlan::compute(&live, &desired, departing.as_deref());
        let expected: BTreeSet<String> = desired
            .difference(&live)
            .filter(|h| departing.as_deref() != Some(h.as_str()))
            .cloned()
            .collect();
        prop_assert_eq!(&plan.to_add, &expected);
        if let Some(departing) = &departing {
            prop_assert!(!plan.to_add.contains(departing));
        }
    }

    /// Property: applying a plan leaves nothing for the next pass
    #[test]
    fn prop_applied_plan_is_idempotent(live in host_set(), desired in host_set(), departing in departing()) {
        let plan = ReconcilePlan::compute(&live, &desired, departing.as_deref());
        let mut next: BTreeSet<String> = live.difference(&plan.to_remove).cloned().collect();
        next.extend(plan.to_add.iter().cloned());

        let again = ReconcilePlan::compute(&next, &desired, departing.as_deref());
        prop_assert!(again.is_empty(), "second pass planned {:?}", again);
    }

    /// Property: classification agrees with the plan
    #[test]
    fn prop_classification_matches_plan(live in host_set(), desired in host_set(), departing in departing()) {
        let plan = ReconcilePlan::compute(&live, &desired, departing.as_deref());
        for host in live.union(&desired) {
            let state = MemberState::classify(host, &live, &desired, departing.as_deref());
            prop_assert_eq!(state == MemberState::PendingAdd, plan.to_add.contains(host));
            prop_assert_eq!(state == MemberState::PendingRemove, plan.to_remove.contains(host));
        }
    }
}

// =============================================================================
// Membership state machine properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: only the coordinator can move a member to another state
    #[test]
    fn prop_non_coordinator_never_changes_state(
        state in member_state(),
        event in member_event(),
        ready in any::<bool>(),
    ) {
        let sm = MemberStateMachine::new();
        let result = sm.transition(&state, event, &TransitionContext::new(false, ready));
        if let mongodb_operator::controller::state_machine::TransitionResult::Success { from, to, .. } = result {
            prop_assert_eq!(from, to);
        }
    }

    /// Property: an unready host is never added
    #[test]
    fn prop_unready_host_never_added(coordinator in any::<bool>()) {
        let sm = MemberStateMachine::new();
        let result = sm.transition(
            &MemberState::PendingAdd,
            MemberEvent::AddApplied,
            &TransitionContext::new(coordinator, false),
        );
        prop_assert!(!result.is_success());
    }
}

// =============================================================================
// Status projection properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: a non-nominal database status is reported unchanged
    #[test]
    fn prop_database_problem_wins(
        database in unit_status(),
        relation in any::<bool>(),
        backup in prop::option::of(unit_status()),
    ) {
        prop_assume!(!database.is_active());
        prop_assert_eq!(project(database.clone(), relation, backup), database);
    }

    /// Property: without the relation, backup status is ignored
    #[test]
    fn prop_no_relation_ignores_backup(
        database in unit_status(),
        backup in prop::option::of(unit_status()),
    ) {
        prop_assert_eq!(project(database.clone(), false, backup), database);
    }

    /// Property: the projection is always one of its inputs
    #[test]
    fn prop_projection_picks_an_input(
        database in unit_status(),
        relation in any::<bool>(),
        backup in prop::option::of(unit_status()),
    ) {
        let projected = project(database.clone(), relation, backup.clone());
        prop_assert!(projected == database || Some(&projected) == backup.as_ref());
    }
}

// =============================================================================
// Identity and pbm output properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: pod names parse back to the same unit
    #[test]
    fn prop_pod_name_round_trip(app in app_name(), ordinal in 0u32..1000) {
        let unit = UnitId::new(app.clone(), ordinal).unwrap();
        prop_assert_eq!(UnitId::from_pod_name(&unit.pod_name()).unwrap(), unit.clone());
        prop_assert!(unit.hostname().starts_with(&unit.pod_name()));
        let suffix = format!(".{}-endpoints", app);
        prop_assert!(unit.hostname().ends_with(&suffix));
    }

    /// Property: any pbm error text maps to a non-empty message
    #[test]
    fn prop_pbm_error_never_panics(output in ".{0,200}") {
        let message = process_pbm_error(&output);
        prop_assert!(!message.is_empty());
    }

    /// Property: arbitrary status output is classified without panicking
    #[test]
    fn prop_status_classification_never_panics(output in ".{0,200}") {
        let _ = classify_output(&output);
    }
}
