use crate::sources::{MutationExecutor, NotificationSink, NotifyLevel};
use chrono::Utc;
use crewdeck_core::{MutationKind, MutationStatus, PendingMutation, Task};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

/// Restore instruction handed back to the board when a mutation fails or
/// is explicitly abandoned. Carries the concrete prior value rather than a
/// closure, so applying it is a pure "put this back".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rollback {
    pub task_id: String,
    pub prior: Task,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// Backing store confirmed the mutation; the entry is gone.
    Confirmed,
    /// Nothing pending for this id (or it was already being processed).
    Skipped,
    /// Backing call failed. `rollback` is `None` when a newer mutation
    /// superseded this one, in which case the newer optimistic value
    /// stays on screen.
    Failed {
        rollback: Option<Rollback>,
        error: String,
    },
}

/// Tracks at most one in-flight optimistic change per task id. The board's
/// refresh merge consults [`MutationLog::pending`] so a fetch never
/// visibly reverts a change that is still being written back.
pub struct MutationLog {
    entries: Mutex<HashMap<String, PendingMutation>>,
    executor: Arc<dyn MutationExecutor>,
    notifier: Arc<dyn NotificationSink>,
    next_token: AtomicU64,
}

impl MutationLog {
    pub fn new(executor: Arc<dyn MutationExecutor>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            executor,
            notifier,
            next_token: AtomicU64::new(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingMutation>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a pending mutation, superseding any earlier live entry for
    /// the same task. A superseded entry's `prior` is retained: rollback
    /// always restores the original pre-mutation value, never an
    /// intermediate optimistic one. The returned token identifies this
    /// entry for [`MutationLog::rollback_token`].
    pub fn add(&self, task_id: &str, kind: MutationKind, prior: Task) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries();
        let prior = match entries.remove(task_id) {
            Some(superseded) => {
                debug!(
                    %task_id,
                    superseded = superseded.kind.describe(),
                    replacement = kind.describe(),
                    "superseding pending mutation"
                );
                superseded.prior
            }
            None => prior,
        };
        entries.insert(
            task_id.to_string(),
            PendingMutation {
                task_id: task_id.to_string(),
                kind,
                prior,
                status: MutationStatus::Pending,
                enqueued_at: Utc::now(),
                token,
            },
        );
        token
    }

    /// Runs the backing call for the mutation `token` was issued for,
    /// executing the `kind` captured at submission time. On success the
    /// entry is confirmed and removed; on failure the entry is removed,
    /// the user is notified once, and the prior value is returned for the
    /// caller to re-apply.
    ///
    /// When a newer mutation superseded this one, the write still reaches
    /// the backing store (the superseding one runs later, in queue order)
    /// but the log slot belongs to the newer entry: it is neither removed
    /// on success nor rolled back on failure.
    pub async fn process(&self, task_id: &str, token: u64, kind: &MutationKind) -> Processed {
        let superseded = {
            let mut entries = self.entries();
            match entries.get_mut(task_id) {
                Some(entry) if entry.token == token => {
                    if entry.status != MutationStatus::Pending {
                        return Processed::Skipped;
                    }
                    entry.status = MutationStatus::Processing;
                    false
                }
                Some(_) => true,
                None => return Processed::Skipped,
            }
        };

        match self.executor.execute(kind, task_id).await {
            Ok(()) => {
                if !superseded {
                    let mut entries = self.entries();
                    if entries
                        .get(task_id)
                        .is_some_and(|entry| entry.token == token)
                    {
                        entries.remove(task_id);
                    }
                }
                Processed::Confirmed
            }
            Err(err) => {
                let rollback = if superseded {
                    None
                } else {
                    let mut entries = self.entries();
                    if entries
                        .get(task_id)
                        .is_some_and(|entry| entry.token == token)
                    {
                        entries.remove(task_id).map(|entry| Rollback {
                            task_id: entry.task_id,
                            prior: entry.prior,
                        })
                    } else {
                        None
                    }
                };
                error!(
                    %task_id,
                    kind = kind.describe(),
                    "mutation failed against the backing store: {err:#}"
                );
                self.notifier.notify(
                    NotifyLevel::Error,
                    &format!("{} failed for {task_id}: {err}", kind.describe()),
                );
                Processed::Failed {
                    rollback,
                    error: err.to_string(),
                }
            }
        }
    }

    /// Abandons the entry without a backing call and returns the prior
    /// value to restore. Used when the resource disappeared underneath the
    /// mutation.
    pub fn rollback(&self, task_id: &str) -> Option<Rollback> {
        self.entries().remove(task_id).map(|entry| Rollback {
            task_id: entry.task_id,
            prior: entry.prior,
        })
    }

    /// Like [`MutationLog::rollback`], but only if the live entry is still
    /// the one `token` was issued for. A superseded entry belongs to the
    /// newer mutation and must not be reverted by the older one's caller.
    pub fn rollback_token(&self, task_id: &str, token: u64) -> Option<Rollback> {
        let mut entries = self.entries();
        if entries.get(task_id)?.token != token {
            return None;
        }
        entries.remove(task_id).map(|entry| Rollback {
            task_id: entry.task_id,
            prior: entry.prior,
        })
    }

    pub fn pending(&self) -> HashMap<String, PendingMutation> {
        self.entries().clone()
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        self.entries().contains_key(task_id)
    }
}
