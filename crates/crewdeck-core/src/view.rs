use crate::{SessionState, Task, TaskKind, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Priority,
    UpdatedAt,
    Title,
    Status,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Structured filter over the board. Empty sets mean "no restriction".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardFilter {
    #[serde(default)]
    pub statuses: HashSet<TaskStatus>,
    #[serde(default)]
    pub priorities: HashSet<i64>,
    #[serde(default)]
    pub kinds: HashSet<TaskKind>,
    #[serde(default)]
    pub session_states: HashSet<SessionState>,
    #[serde(default)]
    pub hide_epic_children: bool,
    #[serde(default)]
    pub stale_after_days: Option<u32>,
}

impl BoardFilter {
    fn matches(&self, task: &Task, now: DateTime<Utc>) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if !self.priorities.is_empty() && !self.priorities.contains(&task.priority) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&task.kind) {
            return false;
        }
        if !self.session_states.is_empty() && !self.session_states.contains(&task.session_state) {
            return false;
        }
        if self.hide_epic_children && task.parent_epic.is_some() {
            return false;
        }
        if let Some(days) = self.stale_after_days {
            if task.is_stale(now, days) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewConfig {
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub sort: SortField,
    #[serde(default)]
    pub direction: SortDirection,
    #[serde(default)]
    pub filter: BoardFilter,
}

/// Per-column ordered task ids under a given [`ViewConfig`]. Always
/// derivable from the snapshot plus the config, never authoritative.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilteredView {
    pub columns: BTreeMap<TaskStatus, Vec<String>>,
}

impl FilteredView {
    pub fn derive(tasks: &[Task], config: &ViewConfig, now: DateTime<Utc>) -> Self {
        let needle = config.search.trim().to_lowercase();
        let mut per_column: BTreeMap<TaskStatus, Vec<&Task>> = BTreeMap::new();
        for task in tasks {
            if !config.filter.matches(task, now) {
                continue;
            }
            if !needle.is_empty() && !matches_search(task, &needle) {
                continue;
            }
            per_column.entry(task.status).or_default().push(task);
        }

        let mut columns = BTreeMap::new();
        for (status, mut column) in per_column {
            column.sort_by(|a, b| compare_tasks(a, b, config.sort, config.direction));
            columns.insert(status, column.iter().map(|task| task.id.clone()).collect());
        }
        Self { columns }
    }

    pub fn column(&self, status: TaskStatus) -> &[String] {
        self.columns.get(&status).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn visible_count(&self) -> usize {
        self.columns.values().map(Vec::len).sum()
    }
}

fn matches_search(task: &Task, needle: &str) -> bool {
    task.title.to_lowercase().contains(needle) || task.id.to_lowercase().contains(needle)
}

fn compare_tasks(a: &Task, b: &Task, field: SortField, direction: SortDirection) -> Ordering {
    let ordering = match field {
        SortField::Priority => a.priority.cmp(&b.priority),
        SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        SortField::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
        SortField::Status => a.status.cmp(&b.status),
    };
    let ordering = match direction {
        SortDirection::Ascending => ordering,
        SortDirection::Descending => ordering.reverse(),
    };
    // Stable tie-break so equal keys keep a deterministic order.
    ordering.then_with(|| a.id.cmp(&b.id))
}
