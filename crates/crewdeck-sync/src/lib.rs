//! Synchronization core for the crewdeck dashboard: a reactive board
//! store over slow external sources, a per-resource command serializer,
//! and an optimistic mutation log with rollback.

pub mod board;
pub mod cache;
pub mod mutations;
pub mod serializer;
pub mod sources;

pub use board::{BoardConfig, BoardStore, Collaborators, MutationError, MutationTicket};
pub use cache::TtlCache;
pub use mutations::{MutationLog, Processed, Rollback};
pub use serializer::{BoxedOp, CommandSerializer, OpHandle, OpOutcome, QueueInfo};
pub use sources::{
    ConfigSource, MetricsSource, MutationExecutor, NotificationSink, NotifyLevel, ProjectContext,
    SessionSource, TaskSource, WorktreeStatusSource,
};
