#![forbid(unsafe_code)]

use super::*;
use crate::model::{TaskPriority, TaskStatus};

fn task(f: impl FnOnce(&mut TaskFields)) -> EntityFields {
    let mut fields = TaskFields::titled("base");
    f(&mut fields);
    EntityFields::Task(fields)
}

fn input<'a>(
    base: &'a EntityFields,
    local: &'a EntityFields,
    local_ts: i64,
    remote: &'a EntityFields,
    remote_ts: i64,
) -> MergeInput<'a> {
    MergeInput {
        base: Some(base),
        local,
        local_updated_at_ms: local_ts,
        remote,
        remote_updated_at_ms: remote_ts,
    }
}

#[test]
fn disjoint_changes_merge_without_policy() {
    let base = task(|_| {});
    let local = task(|t| t.title = "local title".to_string());
    let remote = task(|t| t.priority = TaskPriority::High);

    let policy = ConflictPolicy {
        status: FieldRule::Manual,
        text: FieldRule::Manual,
        scalar: FieldRule::Manual,
        on_delete: FieldRule::Manual,
    };
    let out = merge_fields(&policy, input(&base, &local, 1, &remote, 2));
    assert_eq!(
        out,
        MergeOutcome::Merged(task(|t| {
            t.title = "local title".to_string();
            t.priority = TaskPriority::High;
        }))
    );
}

#[test]
fn status_conflict_goes_to_server_by_default() {
    let base = task(|_| {});
    let local = task(|t| t.status = TaskStatus::Completed);
    let remote = task(|t| t.status = TaskStatus::InProgress);

    let out = merge_fields(&ConflictPolicy::default(), input(&base, &local, 500, &remote, 100));
    assert_eq!(out, MergeOutcome::Merged(remote.clone()));
}

#[test]
fn text_conflict_uses_latest_timestamp() {
    let base = task(|_| {});
    let local = task(|t| t.title = "mine".to_string());
    let remote = task(|t| t.title = "theirs".to_string());
    let policy = ConflictPolicy::default();

    assert_eq!(
        merge_fields(&policy, input(&base, &local, 200, &remote, 100)),
        MergeOutcome::Merged(local.clone())
    );
    assert_eq!(
        merge_fields(&policy, input(&base, &local, 100, &remote, 200)),
        MergeOutcome::Merged(remote.clone())
    );
    assert_eq!(
        merge_fields(&policy, input(&base, &local, 100, &remote, 100)),
        MergeOutcome::Unresolved(vec!["title"])
    );
}

#[test]
fn missing_base_treats_every_difference_as_a_conflict() {
    let local = task(|t| t.notes = Some("n".to_string()));
    let remote = task(|_| {});
    let policy = ConflictPolicy {
        text: FieldRule::Manual,
        ..ConflictPolicy::default()
    };
    let out = merge_fields(
        &policy,
        MergeInput {
            base: None,
            local: &local,
            local_updated_at_ms: 1,
            remote: &remote,
            remote_updated_at_ms: 2,
        },
    );
    assert_eq!(out, MergeOutcome::Unresolved(vec!["notes"]));
}

#[test]
fn kind_mismatch_is_unresolved() {
    let local = task(|_| {});
    let remote = EntityFields::Category(CategoryFields {
        name: "x".to_string(),
        color: "#fff".to_string(),
        sort_order: 0,
    });
    let out = merge_fields(&ConflictPolicy::default(), input(&local, &local, 1, &remote, 2));
    assert_eq!(out, MergeOutcome::Unresolved(vec!["kind"]));
}

#[test]
fn client_wins_rule_keeps_local() {
    let base = EntityFields::Category(CategoryFields {
        name: "Work".to_string(),
        color: "#000".to_string(),
        sort_order: 1,
    });
    let local = EntityFields::Category(CategoryFields {
        color: "#111".to_string(),
        ..base.as_category().cloned().expect("category")
    });
    let remote = EntityFields::Category(CategoryFields {
        color: "#222".to_string(),
        sort_order: 5,
        ..base.as_category().cloned().expect("category")
    });
    let policy = ConflictPolicy {
        scalar: FieldRule::ClientWins,
        ..ConflictPolicy::default()
    };
    let out = merge_fields(&policy, input(&base, &local, 1, &remote, 2));
    assert_eq!(
        out,
        MergeOutcome::Merged(EntityFields::Category(CategoryFields {
            name: "Work".to_string(),
            color: "#111".to_string(),
            sort_order: 5,
        }))
    );
}

#[test]
fn delete_rule_winner() {
    assert_eq!(FieldRule::Manual.winner(1, 2), None);
    assert_eq!(FieldRule::LatestWins.winner(3, 2), Some(Side::Local));
    assert_eq!(FieldRule::ServerWins.winner(3, 2), Some(Side::Remote));
}

#[test]
fn policy_parses_snake_case_rules() {
    let policy: ConflictPolicy =
        serde_json::from_str(r#"{"status":"client_wins"}"#).expect("parse");
    assert_eq!(policy.status, FieldRule::ClientWins);
    assert_eq!(policy.text, FieldRule::LatestWins);
    assert_eq!(policy.on_delete, FieldRule::Manual);
}
