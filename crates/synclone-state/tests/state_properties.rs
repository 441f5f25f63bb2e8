//! Property tests for the state partition and identifier invariants.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::Utc;
use proptest::prelude::*;

use synclone_state::{CloneState, CloneStrategy, CompletedRepo, FailedRepo, SessionId};

fn repo_names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("[a-z][a-z0-9-]{0,12}", 0..20)
        .prop_map(|set| set.into_iter().collect())
}

/// One recorded outcome: which repo (by index) and whether it succeeded.
fn outcomes(max: usize) -> impl Strategy<Value = Vec<(usize, bool)>> {
    prop::collection::vec((0..max.max(1), any::<bool>()), 0..40)
}

fn state_with(names: &[String]) -> CloneState {
    let id = SessionId::new("github", "acme").unwrap();
    let mut state =
        CloneState::new(&id, PathBuf::from("/tmp/acme"), CloneStrategy::Reset, 4, 3).unwrap();
    state.set_pending(names.to_vec());
    state
}

fn completed(name: &str) -> CompletedRepo {
    CompletedRepo {
        url: format!("https://github.com/acme/{name}.git"),
        operation: "clone".to_string(),
        message: "ok".to_string(),
        finished_at: Utc::now(),
    }
}

fn failed(name: &str) -> FailedRepo {
    FailedRepo {
        url: format!("https://github.com/acme/{name}.git"),
        operation: "clone".to_string(),
        message: "refused".to_string(),
        attempt_count: 1,
        last_at: Utc::now(),
    }
}

proptest! {
    /// For any interleaving of record_completed / record_failed calls,
    /// pending, completed, and failed remain a disjoint partition of the
    /// originally enumerated set.
    #[test]
    fn partition_holds_under_any_interleaving(
        names in repo_names(),
        ops in outcomes(20),
    ) {
        let mut state = state_with(&names);
        let universe: BTreeSet<String> = names.iter().cloned().collect();

        for (idx, success) in ops {
            let Some(name) = names.get(idx % names.len().max(1)) else {
                continue;
            };
            if success {
                state.record_completed(name, completed(name));
            } else {
                state.record_failed(name, failed(name));
            }

            let pending: BTreeSet<String> = state.pending.iter().cloned().collect();
            let done: BTreeSet<String> = state.completed.keys().cloned().collect();
            let bad: BTreeSet<String> = state.failed.keys().cloned().collect();

            prop_assert!(pending.is_disjoint(&done));
            prop_assert!(pending.is_disjoint(&bad));
            prop_assert!(done.is_disjoint(&bad));

            let union: BTreeSet<String> =
                pending.union(&done).chain(bad.iter()).cloned().collect();
            prop_assert_eq!(&union, &universe);
            prop_assert_eq!(union.len(), state.total_repositories);
        }
    }

    /// format then parse is the identity for all colon-free segments.
    #[test]
    fn session_id_roundtrip(
        provider in "[a-z][a-z0-9-]{0,10}",
        org in "[A-Za-z0-9][A-Za-z0-9._-]{0,20}",
    ) {
        let id = SessionId::new(&provider, &org).unwrap();
        let parsed: SessionId = id.to_string().parse().unwrap();
        prop_assert_eq!(parsed.provider(), provider.as_str());
        prop_assert_eq!(parsed.organization(), org.as_str());
    }

    /// percent stays in [0, 100] and reaches 100 exactly when nothing is
    /// pending (for a non-empty enumeration).
    #[test]
    fn percent_is_bounded(names in repo_names(), ops in outcomes(20)) {
        let mut state = state_with(&names);
        for (idx, success) in ops {
            let Some(name) = names.get(idx % names.len().max(1)) else {
                continue;
            };
            if success {
                state.record_completed(name, completed(name));
            } else {
                state.record_failed(name, failed(name));
            }
        }
        let progress = state.progress();
        prop_assert!(progress.percent >= 0.0);
        prop_assert!(progress.percent <= 100.0);
        if !names.is_empty() && state.pending.is_empty() {
            prop_assert!((progress.percent - 100.0).abs() < 1e-9);
        }
    }
}
