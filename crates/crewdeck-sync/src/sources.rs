use async_trait::async_trait;
use crewdeck_core::{
    MutationKind, SessionInfo, SessionMetrics, Task, TaskDetail, ViewConfig, WorktreeStatus,
};
use std::collections::HashMap;
use tokio::sync::watch;

/// Read side of the external task tracker.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn list(&self, project_path: &str) -> anyhow::Result<Vec<Task>>;
    /// Batched detail lookup; carries dependency and parent-epic links.
    async fn show_with_dependencies(&self, ids: &[String]) -> anyhow::Result<Vec<TaskDetail>>;
}

#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn list_active(&self, project_path: &str) -> anyhow::Result<Vec<SessionInfo>>;
}

/// Ephemeral per-session counters; best effort, so the signature is
/// infallible and an empty map is a valid answer.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn snapshot(&self) -> HashMap<String, SessionMetrics>;
}

#[async_trait]
pub trait WorktreeStatusSource: Send + Sync {
    /// Path of the task's working copy, if one has been created.
    fn path_for(&self, project_path: &str, task_id: &str) -> Option<String>;
    async fn status(&self, path: &str, base_ref: &str) -> anyhow::Result<WorktreeStatus>;
    async fn has_conflict(&self, path: &str) -> anyhow::Result<bool>;
}

/// The only writer of ground truth.
#[async_trait]
pub trait MutationExecutor: Send + Sync {
    async fn execute(&self, kind: &MutationKind, task_id: &str) -> anyhow::Result<()>;
}

pub trait ConfigSource: Send + Sync {
    fn current(&self) -> ViewConfig;
    /// Change stream; the receiver's value is a monotonically increasing
    /// epoch bumped on every config edit.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

pub trait ProjectContext: Send + Sync {
    fn current_path(&self) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Warn,
    Error,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, level: NotifyLevel, message: &str);
}
