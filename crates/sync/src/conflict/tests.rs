#![forbid(unsafe_code)]

use super::*;
use tk_core::ids::{ClientId, ServerId};
use tk_core::{EntityFields, FieldRule, TaskFields, TaskStatus};

fn task(title: &str, status: TaskStatus) -> EntityFields {
    let mut fields = TaskFields::titled(title);
    fields.status = status;
    EntityFields::Task(fields)
}

fn synced_record(base: EntityFields, local: EntityFields, local_at: i64) -> EntityRecord {
    let client_id = ClientId::try_new("c1").expect("client id");
    let mut record = EntityRecord::new_local(client_id, base.clone(), 0);
    record.server_id = Some(ServerId::new("srv-1"));
    record.server_version = Some(1);
    record.synced_fields = Some(base);
    record.apply_local_edit(local, local_at);
    record
}

fn remote(fields: EntityFields, version: i64, at: i64) -> RemoteEntity {
    RemoteEntity {
        client_id: ClientId::try_new("c1").expect("client id"),
        server_id: ServerId::new("srv-1"),
        version,
        fields,
        deleted: false,
        updated_at_ms: at,
    }
}

#[test]
fn disjoint_edits_merge_into_a_resend() {
    let base = task("plan", TaskStatus::Pending);
    let local = synced_record(base, task("plan trip", TaskStatus::Pending), 10);
    let server = remote(task("plan", TaskStatus::InProgress), 2, 5);

    let decision = ConflictResolver::default().resolve(&local, Some(&server));
    let Decision::Resolved(resolution) = decision else {
        panic!("expected a resolution, got {decision:?}");
    };
    assert_eq!(ResolutionKind::of(&resolution), ResolutionKind::Merged);
    match resolution {
        Resolution::Merged { fields, remote } => {
            assert_eq!(fields, task("plan trip", TaskStatus::InProgress));
            assert_eq!(remote.version, 2);
        }
        other => panic!("unexpected resolution {other:?}"),
    }
}

#[test]
fn status_clash_goes_to_the_server() {
    let base = task("plan", TaskStatus::Pending);
    let local = synced_record(base, task("plan", TaskStatus::Completed), 10);
    let server = remote(task("plan", TaskStatus::InProgress), 2, 5);

    match ConflictResolver::default().resolve(&local, Some(&server)) {
        Decision::Resolved(resolution) => {
            assert_eq!(ResolutionKind::of(&resolution), ResolutionKind::Accepted);
        }
        other => panic!("expected a resolution, got {other:?}"),
    }
}

#[test]
fn manual_rule_surfaces_the_clashing_fields() {
    let policy = ConflictPolicy {
        text: FieldRule::Manual,
        ..ConflictPolicy::default()
    };
    let base = task("plan", TaskStatus::Pending);
    let local = synced_record(base, task("local", TaskStatus::Pending), 10);
    let server = remote(task("server", TaskStatus::Pending), 2, 5);

    match ConflictResolver::new(policy).resolve(&local, Some(&server)) {
        Decision::Manual(detail) => {
            assert_eq!(detail.fields, vec!["title".to_string()]);
            assert_eq!(detail.local, task("local", TaskStatus::Pending));
            assert_eq!(detail.remote, Some(server));
        }
        other => panic!("expected manual, got {other:?}"),
    }
}

#[test]
fn delete_rules_follow_on_delete_policy() {
    let base = task("plan", TaskStatus::Pending);
    let mut deleted = synced_record(base.clone(), base.clone(), 10);
    deleted.apply_local_delete(20);
    let edited = remote(task("server edit", TaskStatus::Pending), 2, 15);

    // Default on_delete is manual.
    assert!(matches!(
        ConflictResolver::default().resolve(&deleted, Some(&edited)),
        Decision::Manual(_)
    ));

    let client_wins = ConflictResolver::new(ConflictPolicy {
        on_delete: FieldRule::ClientWins,
        ..ConflictPolicy::default()
    });
    assert_eq!(
        client_wins.resolve(&deleted, Some(&edited)),
        Decision::Resolved(Resolution::ResendDelete {
            server_id: ServerId::new("srv-1"),
            server_version: 2,
        })
    );

    let server_wins = ConflictResolver::new(ConflictPolicy {
        on_delete: FieldRule::ServerWins,
        ..ConflictPolicy::default()
    });
    assert_eq!(
        server_wins.resolve(&deleted, Some(&edited)),
        Decision::Resolved(Resolution::AcceptRemote(edited.clone()))
    );

    let live = synced_record(base.clone(), task("local edit", TaskStatus::Pending), 30);
    let mut tombstone = remote(base, 2, 25);
    tombstone.deleted = true;
    assert_eq!(
        server_wins.resolve(&live, Some(&tombstone)),
        Decision::Resolved(Resolution::AcceptRemote(tombstone.clone()))
    );
    // A local edit never resurrects a server-side delete.
    assert!(matches!(
        client_wins.resolve(&live, Some(&tombstone)),
        Decision::Manual(_)
    ));
    assert_eq!(
        server_wins.resolve(&live, None),
        Decision::Resolved(Resolution::DropLocal)
    );
}

#[test]
fn both_sides_deleted_needs_no_decision() {
    let base = task("plan", TaskStatus::Pending);
    let mut deleted = synced_record(base.clone(), base.clone(), 10);
    deleted.apply_local_delete(20);
    let mut tombstone = remote(base, 2, 25);
    tombstone.deleted = true;

    assert_eq!(
        ConflictResolver::default().resolve(&deleted, Some(&tombstone)),
        Decision::Resolved(Resolution::AcceptRemote(tombstone))
    );
    assert_eq!(
        ConflictResolver::default().resolve(&deleted, None),
        Decision::Resolved(Resolution::DropLocal)
    );
}
