#![forbid(unsafe_code)]

mod support;

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use support::*;
use tk_core::{BackoffPolicy, EntityFields, EntityKind, SyncStatus, TaskFields, TaskPriority};
use tk_storage::MemoryStore;
use tk_sync::SyncConfig;

const SLOTS: usize = 3;
const MAX_DROPS: usize = 2;

#[derive(Clone, Debug)]
enum Step {
    Create(usize),
    Title(usize, String),
    Notes(usize, Option<String>),
    Priority(usize, TaskPriority),
    Progress(usize, u8),
    Delete(usize),
    Sync,
    DropNextResponse,
}

fn step() -> impl Strategy<Value = Step> {
    let slot = 0..SLOTS;
    prop_oneof![
        3 => slot.clone().prop_map(Step::Create),
        3 => (slot.clone(), "[a-z]{1,8}").prop_map(|(n, title)| Step::Title(n, title)),
        2 => (slot.clone(), proptest::option::of("[a-z ]{1,12}"))
            .prop_map(|(n, notes)| Step::Notes(n, notes)),
        1 => (
            slot.clone(),
            prop_oneof![
                Just(TaskPriority::Low),
                Just(TaskPriority::Medium),
                Just(TaskPriority::High),
            ]
        )
            .prop_map(|(n, priority)| Step::Priority(n, priority)),
        1 => (slot.clone(), 0u8..=100).prop_map(|(n, progress)| Step::Progress(n, progress)),
        1 => slot.prop_map(Step::Delete),
        2 => Just(Step::Sync),
        1 => Just(Step::DropNextResponse),
    ]
}

/// What the user believes: the visible tasks after every local edit.
#[derive(Default)]
struct Expected {
    live: BTreeMap<usize, TaskFields>,
    created: BTreeSet<usize>,
    drops: usize,
}

fn name(slot: usize) -> String {
    format!("t{slot}")
}

fn edit<S: tk_storage::Backend + Send>(
    h: &Harness<S>,
    expected: &mut Expected,
    slot: usize,
    change: impl FnOnce(&mut TaskFields),
) {
    let Some(fields) = expected.live.get_mut(&slot) else {
        return;
    };
    change(fields);
    h.update(&name(slot), EntityFields::Task(fields.clone()));
}

fn run(steps: &[Step]) -> Result<(), TestCaseError> {
    let config = SyncConfig {
        backoff: BackoffPolicy {
            max_attempts: 10,
            ..BackoffPolicy::default()
        },
        ..SyncConfig::default()
    };
    let h = harness(MemoryStore::new(), config);
    let mut expected = Expected::default();

    for step in steps {
        match step {
            Step::Create(slot) => {
                // A client id is never reused once it has existed.
                if expected.created.insert(*slot) {
                    let fields = TaskFields::titled(format!("task {slot}"));
                    h.create(&name(*slot), EntityFields::Task(fields.clone()));
                    expected.live.insert(*slot, fields);
                }
            }
            Step::Title(slot, title) => {
                edit(&h, &mut expected, *slot, |task| task.title = title.clone())
            }
            Step::Notes(slot, notes) => {
                edit(&h, &mut expected, *slot, |task| task.notes = notes.clone())
            }
            Step::Priority(slot, priority) => {
                edit(&h, &mut expected, *slot, |task| task.priority = *priority)
            }
            Step::Progress(slot, progress) => edit(&h, &mut expected, *slot, |task| {
                task.progress_percentage = *progress
            }),
            Step::Delete(slot) => {
                if expected.live.remove(slot).is_some() {
                    h.delete(&name(*slot));
                }
            }
            Step::Sync => {
                h.sync();
                h.clock.advance(500);
            }
            Step::DropNextResponse => {
                if expected.drops < MAX_DROPS {
                    expected.drops += 1;
                    h.remote.drop_responses(1);
                }
            }
        }
    }

    h.sync_until_quiet(20);

    let state = h.engine.current_sync_state().expect("state");
    prop_assert_eq!(state.outbox.total(), 0);
    prop_assert_eq!(state.open_conflicts, 0);

    let server = h.remote.live_entities(EntityKind::Task);
    prop_assert_eq!(server.len(), expected.live.len());
    prop_assert_eq!(
        h.engine.list(EntityKind::Task).expect("list").len(),
        expected.live.len()
    );
    for slot in 0..SLOTS {
        let client = name(slot);
        let local = h.engine.get(&id(&client)).expect("get");
        let remote = h.remote.entity(&id(&client)).filter(|remote| !remote.deleted);
        match expected.live.get(&slot) {
            Some(fields) => {
                let local = local.expect("local record");
                let remote = remote.expect("server entity");
                prop_assert_eq!(local.sync_status, SyncStatus::Synced);
                prop_assert_eq!(local.server_version, Some(remote.version));
                prop_assert_eq!(task_fields(&local), fields);
                prop_assert_eq!(remote.fields.as_task(), Some(fields));
            }
            None => {
                prop_assert!(local.is_none());
                prop_assert!(remote.is_none());
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn local_edits_converge_with_the_server(steps in prop::collection::vec(step(), 1..24)) {
        run(&steps)?;
    }
}
