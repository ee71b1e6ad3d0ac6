use crate::cache::TtlCache;
use crate::mutations::{MutationLog, Processed, Rollback};
use crate::serializer::{BoxedOp, CommandSerializer, OpHandle, OpOutcome};
use crate::sources::{
    ConfigSource, MetricsSource, MutationExecutor, NotificationSink, NotifyLevel, ProjectContext,
    SessionSource, TaskSource, WorktreeStatusSource,
};
use chrono::{DateTime, Utc};
use crewdeck_core::{
    BoardSnapshot, FilteredView, MutationKind, PendingMutation, SessionState, Task, TaskDetail,
    TaskStatus, WorktreeStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const DEFAULT_DEBOUNCE_MS: u64 = 500;
const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
const DEFAULT_STATUS_TTL_SECS: i64 = 10;
const DEFAULT_GRAPH_TTL_SECS: i64 = 30;
const DEFAULT_MUTATION_WAIT_LIMIT_MS: u64 = 30_000;
const DEFAULT_BUSY_INACTIVITY_WARN_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct BoardConfig {
    pub debounce_ms: u64,
    pub poll_interval_ms: u64,
    /// TTL of the per-path worktree status cache; tuned to outlive the
    /// polling interval so steady-state polling mostly hits cache.
    pub status_ttl_secs: i64,
    pub graph_ttl_secs: i64,
    pub base_ref: String,
    /// Queue-wait cap for backing mutation calls; `None` waits forever.
    pub mutation_wait_limit_ms: Option<u64>,
    /// A busy session with no metric activity for this long is shown as
    /// warning instead.
    pub busy_inactivity_warn_secs: i64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            status_ttl_secs: DEFAULT_STATUS_TTL_SECS,
            graph_ttl_secs: DEFAULT_GRAPH_TTL_SECS,
            base_ref: "main".to_string(),
            mutation_wait_limit_ms: Some(DEFAULT_MUTATION_WAIT_LIMIT_MS),
            busy_inactivity_warn_secs: DEFAULT_BUSY_INACTIVITY_WARN_SECS,
        }
    }
}

/// External processes the board reads from and writes through. The store
/// never owns any of them; ground truth stays with the collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub tasks: Arc<dyn TaskSource>,
    pub sessions: Arc<dyn SessionSource>,
    pub metrics: Arc<dyn MetricsSource>,
    pub worktrees: Arc<dyn WorktreeStatusSource>,
    pub executor: Arc<dyn MutationExecutor>,
    pub config: Arc<dyn ConfigSource>,
    pub project: Arc<dyn ProjectContext>,
    pub notifier: Arc<dyn NotificationSink>,
}

/// Rejection raised before anything was applied optimistically.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("empty update for {0}")]
    EmptyUpdate(String),
}

/// Completion handle for a submitted mutation. Resolves after the backing
/// call finished (or the wait was abandoned) and any rollback has already
/// been applied to the snapshot.
pub struct MutationTicket {
    rx: oneshot::Receiver<OpOutcome>,
}

impl MutationTicket {
    pub async fn outcome(self) -> OpOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => OpOutcome::Failed("mutation dropped without a result".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PathStatus {
    status: WorktreeStatus,
    merge_conflict: bool,
}

/// Canonical task state for the dashboard. Owns the snapshot, both TTL
/// caches, the mutation log, and the per-resource serializer; everything
/// else sees immutable snapshot clones.
pub struct BoardStore {
    config: BoardConfig,
    tasks_source: Arc<dyn TaskSource>,
    sessions: Arc<dyn SessionSource>,
    metrics: Arc<dyn MetricsSource>,
    worktrees: Arc<dyn WorktreeStatusSource>,
    view_config: Arc<dyn ConfigSource>,
    project: Arc<dyn ProjectContext>,
    notifier: Arc<dyn NotificationSink>,
    mutations: MutationLog,
    serializer: Arc<CommandSerializer>,
    snapshot_tx: watch::Sender<Arc<BoardSnapshot>>,
    status_cache: TtlCache<String, PathStatus>,
    graph_cache: TtlCache<String, Vec<TaskDetail>>,
    is_loading: AtomicBool,
    pending_timer: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    last_project: Mutex<Option<String>>,
}

impl BoardStore {
    pub fn new(collaborators: Collaborators, config: BoardConfig) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(Arc::new(BoardSnapshot::empty()));
        let mutations = MutationLog::new(
            Arc::clone(&collaborators.executor),
            Arc::clone(&collaborators.notifier),
        );
        Arc::new(Self {
            status_cache: TtlCache::new(chrono::Duration::seconds(config.status_ttl_secs)),
            graph_cache: TtlCache::new(chrono::Duration::seconds(config.graph_ttl_secs)),
            config,
            tasks_source: collaborators.tasks,
            sessions: collaborators.sessions,
            metrics: collaborators.metrics,
            worktrees: collaborators.worktrees,
            view_config: collaborators.config,
            project: collaborators.project,
            notifier: collaborators.notifier,
            mutations,
            serializer: Arc::new(CommandSerializer::new()),
            snapshot_tx,
            is_loading: AtomicBool::new(false),
            pending_timer: Mutex::new(None),
            generation: AtomicU64::new(0),
            last_project: Mutex::new(None),
        })
    }

    pub fn snapshot(&self) -> Arc<BoardSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<BoardSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.snapshot().tasks.clone()
    }

    pub fn tasks_by_column(&self) -> BTreeMap<TaskStatus, Vec<Task>> {
        self.snapshot().columns.clone()
    }

    pub fn filtered_view(&self) -> FilteredView {
        self.snapshot().filtered.clone()
    }

    pub fn find_by_id(&self, id: &str) -> Option<Task> {
        self.snapshot().find_by_id(id).cloned()
    }

    pub fn find_position(&self, id: &str) -> Option<(TaskStatus, usize)> {
        self.snapshot().find_position(id)
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading.load(Ordering::SeqCst)
    }

    /// Serializer for non-mutation operations against the same resource
    /// keys (merge, cleanup, session control).
    pub fn serializer(&self) -> &Arc<CommandSerializer> {
        &self.serializer
    }

    /// Fetches ground truth, merges still-pending mutations and publishes
    /// a new snapshot. A fetch failure keeps the last good snapshot; a
    /// project switch mid-flight discards the result silently.
    pub async fn refresh(&self) {
        if self
            .is_loading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("refresh already in flight; skipping");
            return;
        }
        // Guard, not a trailing store: the flag must clear even when the
        // surrounding task is aborted mid-await.
        let _loading = LoadingGuard(&self.is_loading);
        if let Err(err) = self.refresh_inner().await {
            warn!("board refresh failed; keeping last snapshot: {err:#}");
        }
    }

    async fn refresh_inner(&self) -> anyhow::Result<()> {
        let Some(project) = self.project.current_path() else {
            debug!("no active project; skipping refresh");
            return Ok(());
        };
        {
            let mut last = self.last_project();
            if last.as_deref() != Some(project.as_str()) {
                self.status_cache.invalidate_all();
                self.graph_cache.invalidate_all();
                *last = Some(project.clone());
            }
        }

        let fetched_at = Utc::now();
        let mut tasks = self.tasks_source.list(&project).await?;

        let sessions = match self.sessions.list_active(&project).await {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!("session lookup failed: {err:#}");
                Vec::new()
            }
        };
        let metrics = self.metrics.snapshot().await;
        let session_states: HashMap<&str, SessionState> = sessions
            .iter()
            .map(|session| (session.task_id.as_str(), session.state))
            .collect();
        for task in &mut tasks {
            if let Some(state) = session_states.get(task.id.as_str()) {
                task.session_state = *state;
            }
            if task.session_state == SessionState::Busy {
                if let Some(last_activity) =
                    metrics.get(&task.id).and_then(|metric| metric.last_activity)
                {
                    let idle_for = fetched_at.signed_duration_since(last_activity);
                    if idle_for.num_seconds() > self.config.busy_inactivity_warn_secs {
                        task.session_state = SessionState::Warning;
                    }
                }
            }
        }

        for task in &mut tasks {
            let Some(path) = self.worktrees.path_for(&project, &task.id) else {
                continue;
            };
            let lookup = self
                .status_cache
                .get_or_fetch(path.clone(), fetched_at, || async {
                    let status = self.worktrees.status(&path, &self.config.base_ref).await?;
                    let merge_conflict = self.worktrees.has_conflict(&path).await?;
                    Ok(PathStatus {
                        status,
                        merge_conflict,
                    })
                })
                .await;
            match lookup {
                Ok(path_status) => {
                    task.commits_behind = Some(path_status.status.commits_behind);
                    task.dirty = Some(path_status.status.dirty);
                    task.additions = Some(path_status.status.additions);
                    task.deletions = Some(path_status.status.deletions);
                    task.merge_conflict = path_status.merge_conflict;
                }
                Err(err) => {
                    // Neutral fallback: the unknown fields stay unset.
                    debug!(task_id = %task.id, "worktree status unavailable: {err:#}");
                }
            }
        }

        let ids: Vec<String> = tasks.iter().map(|task| task.id.clone()).collect();
        let details = self
            .graph_cache
            .get_or_fetch(project.clone(), fetched_at, || async {
                self.tasks_source.show_with_dependencies(&ids).await
            })
            .await;
        match details {
            Ok(details) => {
                let by_id: HashMap<&str, &TaskDetail> = details
                    .iter()
                    .map(|detail| (detail.id.as_str(), detail))
                    .collect();
                for task in &mut tasks {
                    if task.parent_epic.is_none() {
                        if let Some(detail) = by_id.get(task.id.as_str()) {
                            task.parent_epic = detail.parent_epic.clone();
                        }
                    }
                }
            }
            Err(err) => {
                debug!("dependency lookup unavailable: {err:#}");
            }
        }

        // Benign race: the user switched projects while we were fetching.
        if self.project.current_path().as_deref() != Some(project.as_str()) {
            debug!("project context changed mid-refresh; discarding result");
            return Ok(());
        }

        self.publish_fetched(tasks, fetched_at);
        Ok(())
    }

    /// Debounced refresh trigger: cancels the previously scheduled unfired
    /// timer and arms a new one, collapsing bursts into one refresh. Only
    /// the sleeping timer is abortable; once it fires, the refresh runs in
    /// its own task and a later request cannot interrupt it.
    pub fn request_refresh(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let delay = Duration::from_millis(self.config.debounce_ms);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.pending_timer().take();
            let this = Arc::clone(&this);
            tokio::spawn(async move { this.refresh().await });
        });
        let mut slot = self.pending_timer();
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Applies a mutation to the visible snapshot right away, recording
    /// the prior value for rollback. Returns the mutation token, or `None`
    /// for an unknown task.
    pub fn apply_optimistic(&self, task_id: &str, kind: MutationKind) -> Option<u64> {
        let prior = self.snapshot().find_by_id(task_id).cloned()?;
        let token = self.mutations.add(task_id, kind.clone(), prior);
        self.mutate_tasks(|tasks| apply_kind(tasks, task_id, &kind));
        Some(token)
    }

    /// Optimistically applies the mutation and queues the backing call
    /// under the task's resource key. The returned ticket resolves once
    /// the write-back confirmed, failed (rolled back), timed out or was
    /// cancelled.
    pub fn submit_mutation(
        self: &Arc<Self>,
        task_id: &str,
        kind: MutationKind,
    ) -> Result<MutationTicket, MutationError> {
        if let MutationKind::Update(patch) = &kind {
            if patch.is_empty() {
                return Err(MutationError::EmptyUpdate(task_id.to_string()));
            }
        }
        let Some(token) = self.apply_optimistic(task_id, kind.clone()) else {
            return Err(MutationError::UnknownTask(task_id.to_string()));
        };
        if matches!(kind, MutationKind::Delete) {
            // Queued work against a task being deleted can only fail.
            self.serializer.cancel_all(task_id, "task deleted");
        }

        let op: BoxedOp = {
            let this = Arc::clone(self);
            let id = task_id.to_string();
            let kind = kind.clone();
            Box::pin(async move {
                match this.mutations.process(&id, token, &kind).await {
                    Processed::Confirmed | Processed::Skipped => Ok(()),
                    Processed::Failed { rollback, error } => {
                        if let Some(rollback) = rollback {
                            this.apply_rollback(rollback);
                        }
                        Err(anyhow::anyhow!(error))
                    }
                }
            })
        };
        let wait_limit = self.config.mutation_wait_limit_ms.map(Duration::from_millis);
        let handle = self
            .serializer
            .enqueue(task_id, kind.describe(), op, wait_limit);
        Ok(self.watch_mutation(task_id, token, handle))
    }

    fn watch_mutation(
        self: &Arc<Self>,
        task_id: &str,
        token: u64,
        handle: OpHandle,
    ) -> MutationTicket {
        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        let id = task_id.to_string();
        tokio::spawn(async move {
            let outcome = handle.outcome().await;
            match &outcome {
                OpOutcome::Succeeded => this.request_refresh(),
                OpOutcome::TimedOut => {
                    // The backing call never started; put the prior back.
                    if let Some(rollback) = this.mutations.rollback_token(&id, token) {
                        this.apply_rollback(rollback);
                    }
                    this.notifier.notify(
                        NotifyLevel::Warn,
                        &format!("change to {id} timed out waiting and was reverted"),
                    );
                }
                OpOutcome::Cancelled(_) => {
                    if let Some(rollback) = this.mutations.rollback_token(&id, token) {
                        this.apply_rollback(rollback);
                    }
                }
                OpOutcome::Failed(_) => {}
            }
            let _ = tx.send(outcome);
        });
        MutationTicket { rx }
    }

    /// Fallback poll so the board converges even without change signals.
    pub fn spawn_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let period = Duration::from_millis(self.config.poll_interval_ms);
        info!(period_ms = self.config.poll_interval_ms, "starting board poller");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.refresh().await;
            }
        })
    }

    /// Event-driven refresh on filter/sort/search edits.
    pub fn spawn_config_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut changes = self.view_config.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                this.request_refresh();
            }
        })
    }

    fn apply_rollback(&self, rollback: Rollback) {
        debug!(task_id = %rollback.task_id, "restoring pre-mutation value");
        self.mutate_tasks(move |tasks| {
            let Rollback { task_id, prior } = rollback;
            match tasks.iter_mut().find(|task| task.id == task_id) {
                Some(slot) => *slot = prior,
                None => tasks.push(prior),
            }
            true
        });
    }

    /// Rebuilds and publishes the snapshot from a modified task list. The
    /// closure runs under the watch lock, so concurrent writers compose.
    fn mutate_tasks<F>(&self, mutate: F)
    where
        F: FnOnce(&mut Vec<Task>) -> bool,
    {
        let config = self.view_config.current();
        let now = Utc::now();
        self.snapshot_tx.send_if_modified(|snapshot| {
            let mut tasks = snapshot.tasks.clone();
            if !mutate(&mut tasks) {
                return false;
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *snapshot = Arc::new(BoardSnapshot::build(
                generation,
                tasks,
                &config,
                snapshot.fetched_at,
                now,
            ));
            true
        });
    }

    fn publish_fetched(&self, fetched: Vec<Task>, fetched_at: DateTime<Utc>) {
        let config = self.view_config.current();
        let now = Utc::now();
        self.snapshot_tx.send_modify(move |snapshot| {
            // Merge under the watch lock so a mutation applied while we
            // were fetching is never visibly reverted.
            let tasks = merge_pending(fetched, &self.mutations.pending());
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *snapshot = Arc::new(BoardSnapshot::build(
                generation, tasks, &config, fetched_at, now,
            ));
        });
    }

    fn pending_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn last_project(&self) -> MutexGuard<'_, Option<String>> {
        self.last_project
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the loading flag when dropped, including on task abort.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn apply_kind(tasks: &mut Vec<Task>, task_id: &str, kind: &MutationKind) -> bool {
    match kind {
        MutationKind::Move(status) => {
            match tasks.iter_mut().find(|task| task.id == task_id) {
                Some(task) => {
                    task.status = *status;
                    true
                }
                None => false,
            }
        }
        MutationKind::Update(patch) => match tasks.iter_mut().find(|task| task.id == task_id) {
            Some(task) => {
                patch.apply(task);
                true
            }
            None => false,
        },
        MutationKind::Delete => {
            let before = tasks.len();
            tasks.retain(|task| task.id != task_id);
            tasks.len() != before
        }
    }
}

/// Overlays still-pending mutations on a freshly fetched task list so the
/// fetch never contradicts what the user already sees.
fn merge_pending(mut tasks: Vec<Task>, pending: &HashMap<String, PendingMutation>) -> Vec<Task> {
    for (task_id, mutation) in pending {
        apply_kind(&mut tasks, task_id, &mutation.kind);
    }
    tasks
}
