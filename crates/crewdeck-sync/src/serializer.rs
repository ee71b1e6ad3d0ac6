use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::time::Duration;
use tracing::{debug, warn};

pub type BoxedOp = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Terminal state of one enqueued operation. Timeout (gave up waiting in
/// the queue) is reported distinctly from cancellation (explicitly
/// aborted) so callers can tell the two apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
    Cancelled(String),
}

impl OpOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OpOutcome::Succeeded)
    }
}

/// Completion handle returned by [`CommandSerializer::enqueue`].
pub struct OpHandle {
    rx: oneshot::Receiver<OpOutcome>,
}

impl OpHandle {
    pub async fn outcome(self) -> OpOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => OpOutcome::Failed("operation dropped without a result".to_string()),
        }
    }
}

struct QueuedOp {
    ticket: u64,
    label: String,
    op: BoxedOp,
    done: oneshot::Sender<OpOutcome>,
    enqueued_at: DateTime<Utc>,
}

struct RunningOp {
    label: String,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct Lane {
    running: Option<RunningOp>,
    queue: VecDeque<QueuedOp>,
}

/// Read-only view of one resource's lane, for "queued" indicators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub running_label: Option<String>,
    pub queued_labels: Vec<String>,
}

impl QueueInfo {
    pub fn queued_count(&self) -> usize {
        self.queued_labels.len()
    }
}

/// Per-resource-key FIFO executor: at most one operation runs per key at a
/// time, the rest wait in enqueue order. A queued (not yet started) entry
/// can time out or be cancelled; a running one always finishes, because it
/// may already have touched external state.
pub struct CommandSerializer {
    lanes: Mutex<HashMap<String, Lane>>,
    next_ticket: AtomicU64,
}

impl Default for CommandSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandSerializer {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<String, Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts `op` immediately when the resource is idle, otherwise appends
    /// it to the resource's queue. `timeout` bounds the time the entry may
    /// sit in the queue, not its execution.
    pub fn enqueue(
        self: &Arc<Self>,
        resource_id: &str,
        label: &str,
        op: BoxedOp,
        timeout: Option<Duration>,
    ) -> OpHandle {
        let (tx, rx) = oneshot::channel();
        let now = Utc::now();
        {
            let mut lanes = self.lanes();
            let lane = lanes.entry(resource_id.to_string()).or_default();
            if lane.running.is_some() {
                let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
                lane.queue.push_back(QueuedOp {
                    ticket,
                    label: label.to_string(),
                    op,
                    done: tx,
                    enqueued_at: now,
                });
                if let Some(wait_limit) = timeout {
                    self.spawn_queue_timer(resource_id.to_string(), ticket, wait_limit);
                }
                return OpHandle { rx };
            }
            lane.running = Some(RunningOp {
                label: label.to_string(),
                started_at: now,
            });
        }
        self.spawn_lane_worker(resource_id.to_string(), op, tx);
        OpHandle { rx }
    }

    pub fn is_busy(&self, resource_id: &str) -> bool {
        self.lanes()
            .get(resource_id)
            .map(|lane| lane.running.is_some())
            .unwrap_or(false)
    }

    pub fn queue_info(&self, resource_id: &str) -> QueueInfo {
        let lanes = self.lanes();
        let Some(lane) = lanes.get(resource_id) else {
            return QueueInfo::default();
        };
        QueueInfo {
            running_label: lane.running.as_ref().map(|running| running.label.clone()),
            queued_labels: lane.queue.iter().map(|entry| entry.label.clone()).collect(),
        }
    }

    /// Drops every queued (unstarted) entry for the resource, resolving each
    /// caller with `Cancelled(reason)`. The running operation, if any, is
    /// left to finish.
    pub fn cancel_all(&self, resource_id: &str, reason: &str) {
        let drained: Vec<QueuedOp> = {
            let mut lanes = self.lanes();
            match lanes.get_mut(resource_id) {
                Some(lane) => lane.queue.drain(..).collect(),
                None => return,
            }
        };
        if !drained.is_empty() {
            debug!(
                %resource_id,
                cancelled = drained.len(),
                reason, "cancelled queued operations"
            );
        }
        for entry in drained {
            let _ = entry.done.send(OpOutcome::Cancelled(reason.to_string()));
        }
    }

    fn spawn_queue_timer(self: &Arc<Self>, resource_id: String, ticket: u64, wait_limit: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(wait_limit).await;
            this.expire_queued(&resource_id, ticket);
        });
    }

    fn expire_queued(&self, resource_id: &str, ticket: u64) {
        let expired = {
            let mut lanes = self.lanes();
            let Some(lane) = lanes.get_mut(resource_id) else {
                return;
            };
            let Some(index) = lane.queue.iter().position(|entry| entry.ticket == ticket) else {
                // Already started, finished, or cancelled; never preempt.
                return;
            };
            lane.queue.remove(index)
        };
        if let Some(entry) = expired {
            let waited = Utc::now().signed_duration_since(entry.enqueued_at);
            debug!(
                %resource_id,
                label = %entry.label,
                waited_ms = waited.num_milliseconds(),
                "queued operation timed out"
            );
            let _ = entry.done.send(OpOutcome::TimedOut);
        }
    }

    fn spawn_lane_worker(
        self: &Arc<Self>,
        resource_id: String,
        op: BoxedOp,
        done: oneshot::Sender<OpOutcome>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut current = Some((op, done));
            while let Some((op, done)) = current.take() {
                let outcome = match op.await {
                    Ok(()) => OpOutcome::Succeeded,
                    Err(err) => {
                        warn!(%resource_id, "operation failed: {err:#}");
                        OpOutcome::Failed(err.to_string())
                    }
                };
                let _ = done.send(outcome);
                current = this.finish_and_pop(&resource_id);
            }
        });
    }

    /// Marks the running op finished and claims the next queued one, or
    /// removes the lane entirely when the queue is empty.
    fn finish_and_pop(&self, resource_id: &str) -> Option<(BoxedOp, oneshot::Sender<OpOutcome>)> {
        let mut lanes = self.lanes();
        let lane = lanes.get_mut(resource_id)?;
        match lane.queue.pop_front() {
            Some(next) => {
                lane.running = Some(RunningOp {
                    label: next.label,
                    started_at: Utc::now(),
                });
                Some((next.op, next.done))
            }
            None => {
                lanes.remove(resource_id);
                None
            }
        }
    }
}
