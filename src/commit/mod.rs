//! Async Commit Queue
//!
//! Persists write-back entries to the remote store off the caller's path.

pub mod queue;
pub mod retry;

pub use queue::{CommitQueue, CommitState, CommitTask, FailureHook, QueueStats, ShutdownReport};
pub use retry::{ExponentialBackoff, RetryPolicy};
