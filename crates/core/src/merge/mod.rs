#![forbid(unsafe_code)]

//! Three-way field merge between the local copy, the server copy and the last synced snapshot.

mod policy;

pub use policy::{ConflictPolicy, FieldClass, FieldRule, Side};

use crate::model::{CategoryFields, EntityFields, TaskFields};

#[derive(Clone, Copy, Debug)]
pub struct MergeInput<'a> {
    /// Last snapshot both sides agreed on. `None` treats every differing field as changed on
    /// both sides.
    pub base: Option<&'a EntityFields>,
    pub local: &'a EntityFields,
    pub local_updated_at_ms: i64,
    pub remote: &'a EntityFields,
    pub remote_updated_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(EntityFields),
    /// Names of the fields the policy could not decide.
    Unresolved(Vec<&'static str>),
}

pub fn merge_fields(policy: &ConflictPolicy, input: MergeInput<'_>) -> MergeOutcome {
    let mut picker = Picker {
        policy,
        local_updated_at_ms: input.local_updated_at_ms,
        remote_updated_at_ms: input.remote_updated_at_ms,
        unresolved: Vec::new(),
    };

    let merged = match (input.local, input.remote) {
        (EntityFields::Task(local), EntityFields::Task(remote)) => {
            let base = input.base.and_then(EntityFields::as_task);
            EntityFields::Task(merge_task(&mut picker, base, local, remote))
        }
        (EntityFields::Category(local), EntityFields::Category(remote)) => {
            let base = input.base.and_then(EntityFields::as_category);
            EntityFields::Category(merge_category(&mut picker, base, local, remote))
        }
        _ => return MergeOutcome::Unresolved(vec!["kind"]),
    };

    if picker.unresolved.is_empty() {
        MergeOutcome::Merged(merged)
    } else {
        MergeOutcome::Unresolved(picker.unresolved)
    }
}

fn merge_task(
    p: &mut Picker<'_>,
    base: Option<&TaskFields>,
    local: &TaskFields,
    remote: &TaskFields,
) -> TaskFields {
    TaskFields {
        title: p.pick(
            "title",
            FieldClass::Text,
            base.map(|b| &b.title),
            &local.title,
            &remote.title,
        ),
        description: p.pick(
            "description",
            FieldClass::Text,
            base.map(|b| &b.description),
            &local.description,
            &remote.description,
        ),
        notes: p.pick(
            "notes",
            FieldClass::Text,
            base.map(|b| &b.notes),
            &local.notes,
            &remote.notes,
        ),
        priority: p.pick(
            "priority",
            FieldClass::Scalar,
            base.map(|b| &b.priority),
            &local.priority,
            &remote.priority,
        ),
        status: p.pick(
            "status",
            FieldClass::Status,
            base.map(|b| &b.status),
            &local.status,
            &remote.status,
        ),
        due_date_ms: p.pick(
            "due_date",
            FieldClass::Scalar,
            base.map(|b| &b.due_date_ms),
            &local.due_date_ms,
            &remote.due_date_ms,
        ),
        category_id: p.pick(
            "category_id",
            FieldClass::Scalar,
            base.map(|b| &b.category_id),
            &local.category_id,
            &remote.category_id,
        ),
        progress_percentage: p.pick(
            "progress_percentage",
            FieldClass::Status,
            base.map(|b| &b.progress_percentage),
            &local.progress_percentage,
            &remote.progress_percentage,
        ),
        completed_at_ms: p.pick(
            "completed_at",
            FieldClass::Status,
            base.map(|b| &b.completed_at_ms),
            &local.completed_at_ms,
            &remote.completed_at_ms,
        ),
    }
}

fn merge_category(
    p: &mut Picker<'_>,
    base: Option<&CategoryFields>,
    local: &CategoryFields,
    remote: &CategoryFields,
) -> CategoryFields {
    CategoryFields {
        name: p.pick(
            "name",
            FieldClass::Text,
            base.map(|b| &b.name),
            &local.name,
            &remote.name,
        ),
        color: p.pick(
            "color",
            FieldClass::Scalar,
            base.map(|b| &b.color),
            &local.color,
            &remote.color,
        ),
        sort_order: p.pick(
            "sort_order",
            FieldClass::Scalar,
            base.map(|b| &b.sort_order),
            &local.sort_order,
            &remote.sort_order,
        ),
    }
}

struct Picker<'a> {
    policy: &'a ConflictPolicy,
    local_updated_at_ms: i64,
    remote_updated_at_ms: i64,
    unresolved: Vec<&'static str>,
}

impl Picker<'_> {
    fn pick<T: PartialEq + Clone>(
        &mut self,
        name: &'static str,
        class: FieldClass,
        base: Option<&T>,
        local: &T,
        remote: &T,
    ) -> T {
        if local == remote {
            return local.clone();
        }
        if let Some(base) = base {
            if local == base {
                return remote.clone();
            }
            if remote == base {
                return local.clone();
            }
        }
        let rule = self.policy.rule_for(class);
        match rule.winner(self.local_updated_at_ms, self.remote_updated_at_ms) {
            Some(Side::Local) => local.clone(),
            Some(Side::Remote) => remote.clone(),
            None => {
                self.unresolved.push(name);
                remote.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests;
