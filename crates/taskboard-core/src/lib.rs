use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Context,
    Task,
    Note,
}

impl Entity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Task => "task",
            Self::Note => "note",
        }
    }
}

impl Display for Entity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal, user-surfaced failures. Every store operation performs its own
/// ownership check inline and reports through this taxonomy; nothing here is
/// retried.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("unauthorized: no caller identity was resolved")]
    Unauthorized,
    #[error("forbidden: {0} belongs to a different user")]
    Forbidden(Entity),
    #[error("{0} not found")]
    NotFound(Entity),
    #[error("a context named `{0}` already exists")]
    DuplicateName(String),
    #[error("context still has tasks; move or delete them before removing it")]
    ContextHasTasks,
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(value).map(Self)
            }
        }
    };
}

ulid_id!(UserId);
ulid_id!(ContextId);
ulid_id!(TaskId);
ulid_id!(NoteId);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Backlog,
    InProgress,
    Done,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in-progress",
            Self::Done => "done",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "backlog" => Some(Self::Backlog),
            "in-progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named workspace scoping one user's tasks. `(user_id, name)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Context {
    pub context_id: ContextId,
    pub user_id: UserId,
    pub name: String,
    pub icon: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One task. `position` is meaningful only relative to the other tasks in the
/// same `(user_id, context_id, status)` bucket, where the positions form a
/// dense `0..n-1` sequence after every mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub context_id: ContextId,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub position: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completion_date: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Note {
    pub note_id: NoteId,
    pub user_id: UserId,
    pub task_id: TaskId,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Per-user preference row, created lazily on first write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Preference {
    pub user_id: UserId,
    pub selected_context_id: Option<ContextId>,
}

/// Three-state partial-update field: an omitted field keeps the stored value,
/// an explicit `null` clears it, and a value replaces it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Patch<T> {
    #[default]
    Keep,
    Clear,
    Set(T),
}

impl<T> Patch<T> {
    #[must_use]
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }

    #[must_use]
    pub fn apply(self, current: Option<T>) -> Option<T> {
        match self {
            Self::Keep => current,
            Self::Clear => None,
            Self::Set(value) => Some(value),
        }
    }
}

impl<'de, T> Deserialize<'de> for Patch<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // A present-but-null field is a clear; field absence is handled by
        // `#[serde(default)]` on the containing struct.
        Option::<T>::deserialize(deserializer).map(|value| value.map_or(Self::Clear, Self::Set))
    }
}

impl<T> Serialize for Patch<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // `Keep` must be suppressed by `skip_serializing_if = "Patch::is_keep"`
        // on the field; there is no in-band encoding for it.
        match self {
            Self::Keep | Self::Clear => serializer.serialize_none(),
            Self::Set(value) => serializer.serialize_some(value),
        }
    }
}

/// Serde adapter for `Patch<OffsetDateTime>` fields carrying RFC 3339 strings.
pub mod patch_rfc3339 {
    use serde::{Deserializer, Serializer};
    use time::OffsetDateTime;

    use super::Patch;

    /// # Errors
    /// Returns an error when the value is present but not a valid RFC 3339
    /// timestamp.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Patch<OffsetDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        time::serde::rfc3339::option::deserialize(deserializer)
            .map(|value| value.map_or(Patch::Clear, Patch::Set))
    }

    /// # Errors
    /// Returns an error when the timestamp cannot be formatted.
    pub fn serialize<S>(value: &Patch<OffsetDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let option = match value {
            Patch::Keep | Patch::Clear => None,
            Patch::Set(timestamp) => Some(*timestamp),
        };
        time::serde::rfc3339::option::serialize(&option, serializer)
    }
}

/// Partial update for a context. Both fields keep the stored value when
/// omitted; neither can be cleared.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Partial update for a task's non-ordering fields. `completion_date` is the
/// one field where clearing and keeping must stay distinguishable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Patch::is_keep", with = "patch_rfc3339")]
    pub completion_date: Patch<OffsetDateTime>,
}

/// One task's membership in a bucket, as loaded from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketEntry {
    pub task_id: TaskId,
    pub position: i64,
}

/// A single position assignment the store must write back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionWrite {
    pub task_id: TaskId,
    pub position: i64,
}

/// The full set of writes for one status/position move, applied as one
/// atomic unit by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePlan {
    /// Dense renumbering of the source bucket after the moved task left it.
    /// Empty for same-bucket moves.
    pub source_writes: Vec<PositionWrite>,
    /// Dense renumbering of the destination bucket, excluding the moved task.
    pub destination_writes: Vec<PositionWrite>,
    /// The moved task's final position; written together with its new status.
    pub moved: PositionWrite,
}

fn sorted_entries(bucket: &[BucketEntry]) -> Vec<BucketEntry> {
    let mut entries = bucket.to_vec();
    // Tie-break on task id so duplicate positions (corrupt input) still yield
    // a deterministic renumbering.
    entries.sort_by(|lhs, rhs| {
        lhs.position.cmp(&rhs.position).then_with(|| lhs.task_id.cmp(&rhs.task_id))
    });
    entries
}

/// Position for a task appended to the end of `bucket`: one past the current
/// maximum, or `0` for an empty bucket. New tasks never jump the queue.
#[must_use]
pub fn append_position(bucket: &[BucketEntry]) -> i64 {
    bucket.iter().map(|entry| entry.position).max().map_or(0, |max| max + 1)
}

/// Dense `0..n-1` renumbering of `bucket` with `removed` taken out, in the
/// surviving tasks' existing relative order. Emits writes only for tasks
/// whose position actually changes.
#[must_use]
pub fn renumber_without(bucket: &[BucketEntry], removed: TaskId) -> Vec<PositionWrite> {
    let mut writes = Vec::new();
    let mut next: i64 = 0;
    for entry in sorted_entries(bucket) {
        if entry.task_id == removed {
            continue;
        }
        if entry.position != next {
            writes.push(PositionWrite { task_id: entry.task_id, position: next });
        }
        next += 1;
    }
    writes
}

/// Plan moving `moved` into `destination` at `new_index`, clamped to the
/// destination length (an index past the end appends).
///
/// `source` is the moved task's current bucket including the task itself;
/// `destination` is the target bucket, which equals `source` for a
/// same-status move. `crosses_buckets` selects whether the source bucket
/// needs its own renumbering pass. The two passes are independent dense
/// resequencings; after both, each bucket's positions are exactly `0..n-1`.
#[must_use]
pub fn plan_move(
    source: &[BucketEntry],
    destination: &[BucketEntry],
    moved: TaskId,
    new_index: usize,
    crosses_buckets: bool,
) -> MovePlan {
    let source_writes =
        if crosses_buckets { renumber_without(source, moved) } else { Vec::new() };

    let mut remaining: Vec<BucketEntry> =
        sorted_entries(destination).into_iter().filter(|entry| entry.task_id != moved).collect();
    let index = new_index.min(remaining.len());
    remaining.insert(index, BucketEntry { task_id: moved, position: -1 });

    let mut destination_writes = Vec::new();
    let mut moved_position: i64 = 0;
    let mut next: i64 = 0;
    for entry in remaining {
        if entry.task_id == moved {
            moved_position = next;
        } else if entry.position != next {
            destination_writes.push(PositionWrite { task_id: entry.task_id, position: next });
        }
        next += 1;
    }

    MovePlan {
        source_writes,
        destination_writes,
        moved: PositionWrite { task_id: moved, position: moved_position },
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn entry(position: i64) -> BucketEntry {
        BucketEntry { task_id: TaskId::new(), position }
    }

    fn bucket(positions: &[i64]) -> Vec<BucketEntry> {
        positions.iter().map(|position| entry(*position)).collect()
    }

    #[test]
    fn append_position_starts_at_zero_for_empty_bucket() {
        assert_eq!(append_position(&[]), 0);
    }

    #[test]
    fn append_position_extends_past_current_maximum() {
        assert_eq!(append_position(&bucket(&[0, 1, 2])), 3);
        // Gaps from legacy data do not cause collisions either.
        assert_eq!(append_position(&bucket(&[0, 2])), 3);
    }

    #[test]
    fn renumber_without_closes_the_gap_left_by_the_removed_task() {
        let entries = bucket(&[0, 1, 2]);
        let writes = renumber_without(&entries, entries[1].task_id);

        assert_eq!(writes, vec![PositionWrite { task_id: entries[2].task_id, position: 1 }]);
    }

    #[test]
    fn renumber_without_skips_tasks_already_in_place() {
        let entries = bucket(&[0, 1, 2, 3]);
        let writes = renumber_without(&entries, entries[3].task_id);

        assert!(writes.is_empty());
    }

    #[test]
    fn same_bucket_move_to_front_shifts_everything_before_the_old_slot() {
        let entries = bucket(&[0, 1, 2]);
        let moved = entries[2].task_id;
        let plan = plan_move(&entries, &entries, moved, 0, false);

        assert!(plan.source_writes.is_empty());
        assert_eq!(plan.moved, PositionWrite { task_id: moved, position: 0 });
        assert_eq!(
            plan.destination_writes,
            vec![
                PositionWrite { task_id: entries[0].task_id, position: 1 },
                PositionWrite { task_id: entries[1].task_id, position: 2 },
            ]
        );
    }

    #[test]
    fn same_bucket_move_to_current_index_is_a_no_op() {
        let entries = bucket(&[0, 1, 2]);
        let moved = entries[1].task_id;
        let plan = plan_move(&entries, &entries, moved, 1, false);

        assert!(plan.source_writes.is_empty());
        assert!(plan.destination_writes.is_empty());
        assert_eq!(plan.moved, PositionWrite { task_id: moved, position: 1 });
    }

    #[test]
    fn cross_bucket_move_renumbers_both_buckets_densely() {
        let source = bucket(&[0, 1, 2]);
        let destination = bucket(&[0, 1]);
        let moved = source[0].task_id;
        let plan = plan_move(&source, &destination, moved, 1, true);

        assert_eq!(
            plan.source_writes,
            vec![
                PositionWrite { task_id: source[1].task_id, position: 0 },
                PositionWrite { task_id: source[2].task_id, position: 1 },
            ]
        );
        assert_eq!(
            plan.destination_writes,
            vec![PositionWrite { task_id: destination[1].task_id, position: 2 }]
        );
        assert_eq!(plan.moved, PositionWrite { task_id: moved, position: 1 });
    }

    #[test]
    fn move_past_the_destination_end_appends() {
        let source = bucket(&[0]);
        let destination = bucket(&[0, 1]);
        let moved = source[0].task_id;
        let plan = plan_move(&source, &destination, moved, 99, true);

        assert!(plan.destination_writes.is_empty());
        assert_eq!(plan.moved, PositionWrite { task_id: moved, position: 2 });
    }

    #[test]
    fn move_into_empty_destination_lands_at_zero() {
        let source = bucket(&[0, 1]);
        let moved = source[1].task_id;
        let plan = plan_move(&source, &[], moved, 0, true);

        assert_eq!(plan.source_writes.len(), 0);
        assert_eq!(plan.moved, PositionWrite { task_id: moved, position: 0 });
    }

    #[test]
    fn task_status_wire_names_round_trip() {
        for status in [TaskStatus::Backlog, TaskStatus::InProgress, TaskStatus::Done] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("paused"), None);

        let json = match serde_json::to_string(&TaskStatus::InProgress) {
            Ok(json) => json,
            Err(err) => panic!("status should serialize: {err}"),
        };
        assert_eq!(json, "\"in-progress\"");
    }

    #[test]
    fn task_patch_distinguishes_omit_null_and_value() {
        let keep: TaskPatch = match serde_json::from_str("{}") {
            Ok(patch) => patch,
            Err(err) => panic!("empty patch should parse: {err}"),
        };
        assert_eq!(keep.completion_date, Patch::Keep);
        assert_eq!(keep.title, None);

        let clear: TaskPatch = match serde_json::from_str(r#"{"completion_date": null}"#) {
            Ok(patch) => patch,
            Err(err) => panic!("null patch should parse: {err}"),
        };
        assert_eq!(clear.completion_date, Patch::Clear);

        let set: TaskPatch =
            match serde_json::from_str(r#"{"completion_date": "2026-01-05T00:00:00Z"}"#) {
                Ok(patch) => patch,
                Err(err) => panic!("value patch should parse: {err}"),
            };
        assert!(matches!(set.completion_date, Patch::Set(_)));
    }

    #[test]
    fn task_patch_keep_is_omitted_from_serialized_form() {
        let json = match serde_json::to_string(&TaskPatch::default()) {
            Ok(json) => json,
            Err(err) => panic!("default patch should serialize: {err}"),
        };
        assert_eq!(json, "{}");
    }

    #[test]
    fn patch_apply_matches_its_three_states() {
        assert_eq!(Patch::<i64>::Keep.apply(Some(7)), Some(7));
        assert_eq!(Patch::<i64>::Clear.apply(Some(7)), None);
        assert_eq!(Patch::Set(9).apply(Some(7)), Some(9));
    }

    /// Model-level check of the dense-order invariant: apply a plan to a pair
    /// of buckets and verify both end up as permutations of `0..n-1`.
    fn apply_plan(
        source: &mut Vec<BucketEntry>,
        destination: &mut Vec<BucketEntry>,
        plan: &MovePlan,
        cross: bool,
    ) {
        if cross {
            let moved = plan.moved.task_id;
            source.retain(|entry| entry.task_id != moved);
            for write in &plan.source_writes {
                if let Some(entry) =
                    source.iter_mut().find(|entry| entry.task_id == write.task_id)
                {
                    entry.position = write.position;
                }
            }
            destination
                .push(BucketEntry { task_id: moved, position: plan.moved.position });
        } else if let Some(entry) =
            destination.iter_mut().find(|entry| entry.task_id == plan.moved.task_id)
        {
            entry.position = plan.moved.position;
        }
        for write in &plan.destination_writes {
            if let Some(entry) =
                destination.iter_mut().find(|entry| entry.task_id == write.task_id)
            {
                entry.position = write.position;
            }
        }
    }

    fn assert_dense(bucket: &[BucketEntry]) {
        let mut positions: Vec<i64> = bucket.iter().map(|entry| entry.position).collect();
        positions.sort_unstable();
        let expected: Vec<i64> = (0..bucket.len() as i64).collect();
        assert_eq!(positions, expected, "bucket positions must be a permutation of 0..n-1");
    }

    proptest! {
        #[test]
        fn property_moves_preserve_dense_ordering(
            source_len in 1_usize..8,
            dest_len in 0_usize..8,
            moved_index in 0_usize..8,
            new_index in 0_usize..10,
            cross in any::<bool>(),
        ) {
            let mut source: Vec<BucketEntry> = (0..source_len as i64).map(entry).collect();
            let mut destination: Vec<BucketEntry> = if cross {
                (0..dest_len as i64).map(entry).collect()
            } else {
                source.clone()
            };
            let moved = source[moved_index % source_len].task_id;

            let plan = plan_move(&source, &destination, moved, new_index, cross);
            apply_plan(&mut source, &mut destination, &plan, cross);

            assert_dense(&destination);
            if cross {
                assert_dense(&source);
            }

            let final_entry = destination.iter().find(|entry| entry.task_id == moved);
            prop_assert_eq!(
                final_entry.map(|entry| entry.position),
                Some(plan.moved.position)
            );
        }

        #[test]
        fn property_repeating_a_move_changes_nothing(
            len in 1_usize..8,
            moved_index in 0_usize..8,
            new_index in 0_usize..10,
        ) {
            let mut bucket_state: Vec<BucketEntry> = (0..len as i64).map(entry).collect();
            let moved = bucket_state[moved_index % len].task_id;

            let first = plan_move(&bucket_state, &bucket_state, moved, new_index, false);
            let mut scratch = bucket_state.clone();
            apply_plan(&mut scratch, &mut bucket_state, &first, false);

            let second = plan_move(&bucket_state, &bucket_state, moved, new_index, false);
            prop_assert!(second.destination_writes.is_empty());
            prop_assert_eq!(second.moved, first.moved);
        }
    }
}
