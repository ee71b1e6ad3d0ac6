use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod view;

pub use view::{BoardFilter, FilteredView, SortDirection, SortField, ViewConfig};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, rename = "type")]
    pub kind: TaskKind,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub session_state: SessionState,
    #[serde(default)]
    pub commits_behind: Option<i64>,
    #[serde(default)]
    pub dirty: Option<bool>,
    #[serde(default)]
    pub additions: Option<i64>,
    #[serde(default)]
    pub deletions: Option<i64>,
    #[serde(default)]
    pub merge_conflict: bool,
    #[serde(default)]
    pub parent_epic: Option<String>,
}

impl Task {
    pub fn is_stale(&self, now: DateTime<Utc>, after_days: u32) -> bool {
        now.signed_duration_since(self.updated_at) > chrono::Duration::days(i64::from(after_days))
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl TaskStatus {
    /// Column order on the board, left to right.
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Open,
        TaskStatus::InProgress,
        TaskStatus::Blocked,
        TaskStatus::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Closed => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TaskStatus::Closed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "open" => Ok(TaskStatus::Open),
            "in_progress" | "in-progress" | "inprogress" => Ok(TaskStatus::InProgress),
            "blocked" => Ok(TaskStatus::Blocked),
            "closed" => Ok(TaskStatus::Closed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Bug,
    Feature,
    #[default]
    Task,
    Epic,
    Chore,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Bug => "bug",
            TaskKind::Feature => "feature",
            TaskKind::Task => "task",
            TaskKind::Epic => "epic",
            TaskKind::Chore => "chore",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "bug" => Ok(TaskKind::Bug),
            "feature" => Ok(TaskKind::Feature),
            "task" => Ok(TaskKind::Task),
            "epic" => Ok(TaskKind::Epic),
            "chore" => Ok(TaskKind::Chore),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Initializing,
    Busy,
    Warning,
    Waiting,
    Paused,
    Done,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::Busy => "busy",
            SessionState::Warning => "warning",
            SessionState::Waiting => "waiting",
            SessionState::Paused => "paused",
            SessionState::Done => "done",
            SessionState::Error => "error",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field-level patch applied to a task by an optimistic update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub session_state: Option<SessionState>,
}

impl TaskPatch {
    pub fn apply(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(state) = self.session_state {
            task.session_state = state;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.session_state.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Move(TaskStatus),
    Update(TaskPatch),
    Delete,
}

impl MutationKind {
    pub fn describe(&self) -> &'static str {
        match self {
            MutationKind::Move(_) => "move",
            MutationKind::Update(_) => "update",
            MutationKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Processing,
}

/// Bookkeeping for one in-flight optimistic change. At most one live entry
/// exists per task id; `prior` is the pre-mutation task used for rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingMutation {
    pub task_id: String,
    pub kind: MutationKind,
    pub prior: Task,
    pub status: MutationStatus,
    pub enqueued_at: DateTime<Utc>,
    /// Monotonic token distinguishing this entry from a superseded or
    /// superseding one for the same task id.
    #[serde(default)]
    pub token: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorktreeStatus {
    pub commits_behind: i64,
    pub dirty: bool,
    pub additions: i64,
    pub deletions: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub task_id: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMetrics {
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Batched dependency lookup result for one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDetail {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_dep_ids")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub parent_epic: Option<String>,
}

/// Trackers disagree on id types; accept a string or a number.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

fn deserialize_dep_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values: Vec<serde_json::Value> = Vec::deserialize(deserializer)?;
    let mut ids = Vec::new();
    for value in values {
        if let Some(s) = value.as_str() {
            ids.push(s.to_string());
        } else if let Some(n) = value.as_i64() {
            ids.push(n.to_string());
        }
    }
    Ok(ids)
}

/// Canonical view of the whole board at one point in time. Built once,
/// never mutated; consumers hold it behind an `Arc` and swap wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardSnapshot {
    pub generation: u64,
    pub fetched_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
    pub columns: BTreeMap<TaskStatus, Vec<Task>>,
    pub filtered: FilteredView,
}

impl BoardSnapshot {
    pub fn empty() -> Self {
        Self {
            generation: 0,
            fetched_at: DateTime::<Utc>::MIN_UTC,
            tasks: Vec::new(),
            columns: BTreeMap::new(),
            filtered: FilteredView::default(),
        }
    }

    pub fn build(
        generation: u64,
        tasks: Vec<Task>,
        config: &ViewConfig,
        fetched_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut columns: BTreeMap<TaskStatus, Vec<Task>> = BTreeMap::new();
        for task in &tasks {
            columns.entry(task.status).or_default().push(task.clone());
        }
        let filtered = FilteredView::derive(&tasks, config, now);
        Self {
            generation,
            fetched_at,
            tasks,
            columns,
            filtered,
        }
    }

    pub fn find_by_id(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    /// Position of a task inside its filtered column, if visible.
    pub fn find_position(&self, id: &str) -> Option<(TaskStatus, usize)> {
        for (status, ids) in &self.filtered.columns {
            if let Some(index) = ids.iter().position(|task_id| task_id == id) {
                return Some((*status, index));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
            .single()
            .expect("valid test timestamp")
    }

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.to_string(),
            title: format!("task {id}"),
            status,
            priority: 2,
            kind: TaskKind::Task,
            updated_at: ts(0),
            session_state: SessionState::Idle,
            commits_behind: None,
            dirty: None,
            additions: None,
            deletions: None,
            merge_conflict: false,
            parent_epic: None,
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert_eq!("in-progress".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn patch_applies_only_present_fields() {
        let mut t = task("t-1", TaskStatus::Open);
        let patch = TaskPatch {
            status: Some(TaskStatus::Blocked),
            priority: Some(0),
            ..TaskPatch::default()
        };
        patch.apply(&mut t);
        assert_eq!(t.status, TaskStatus::Blocked);
        assert_eq!(t.priority, 0);
        assert_eq!(t.title, "task t-1");
    }

    #[test]
    fn snapshot_groups_tasks_by_column() {
        let tasks = vec![
            task("t-1", TaskStatus::Open),
            task("t-2", TaskStatus::InProgress),
            task("t-3", TaskStatus::Open),
        ];
        let snapshot = BoardSnapshot::build(1, tasks, &ViewConfig::default(), ts(0), ts(0));
        assert_eq!(snapshot.columns[&TaskStatus::Open].len(), 2);
        assert_eq!(snapshot.columns[&TaskStatus::InProgress].len(), 1);
        assert!(snapshot.find_by_id("t-2").is_some());
        assert_eq!(
            snapshot.find_position("t-2"),
            Some((TaskStatus::InProgress, 0))
        );
    }

    #[test]
    fn numeric_ids_deserialize_as_strings() {
        let t: Task = serde_json::from_str(
            r#"{"id": 42, "title": "imported", "status": "open",
                "updated_at": "2024-01-01T00:00:00Z"}"#,
        )
        .expect("numeric id accepted");
        assert_eq!(t.id, "42");

        let detail: TaskDetail = serde_json::from_str(
            r#"{"id": "t-1", "dependencies": [7, "t-2"]}"#,
        )
        .expect("mixed dependency ids accepted");
        assert_eq!(detail.dependencies, ["7", "t-2"]);
    }

    #[test]
    fn staleness_uses_updated_at() {
        let t = task("t-1", TaskStatus::Open);
        assert!(!t.is_stale(ts(0), 7));
        assert!(t.is_stale(ts(0) + chrono::Duration::days(8), 7));
    }
}
