//! Async commit queue
//!
//! A fixed pool of tokio workers persists dirty cache entries to the remote
//! store. Outstanding commits are bounded by a semaphore; a task's permit
//! travels with it until it reaches a terminal state. Retries are re-queued
//! by a delayed task so a backing-off commit never occupies a worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::retry::RetryPolicy;
use crate::asset::{AssetId, AssetMeta, Payload};
use crate::cache::CacheTier;
use crate::error::{StoreError, StoreResult};
use crate::remote::{RemoteStore, UploadOptions};
use crate::settings::{QueueFullPolicy, StoreSettings};

/// Lifecycle of a commit task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    InFlight,
    Committed,
    Failed,
}

/// A dirty entry scheduled for commit
#[derive(Debug, Clone)]
pub struct CommitTask {
    pub meta: AssetMeta,
    pub payload: Payload,
    /// Attempts made so far
    pub attempts: u32,
    pub enqueued_at: Instant,
}

impl CommitTask {
    pub fn new(meta: AssetMeta, payload: Payload) -> Self {
        Self {
            meta,
            payload,
            attempts: 0,
            enqueued_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &AssetId {
        &self.meta.id
    }
}

/// Called once per task that ends in `Failed`
pub type FailureHook = Arc<dyn Fn(&AssetId, &StoreError) + Send + Sync>;

/// Counters for the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub attempts: u64,
    pub committed: u64,
    pub retried: u64,
    pub failed: u64,
    pub injected_timeouts: u64,
}

/// What shutdown left behind
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub drained: bool,
    /// Pending or in-flight at the end of the grace period
    pub outstanding: Vec<AssetId>,
    pub failed: Vec<AssetId>,
}

struct QueuedTask {
    task: CommitTask,
    _permit: OwnedSemaphorePermit,
}

struct Shared {
    cache: Arc<CacheTier>,
    remote: Arc<RemoteStore>,
    policy: Arc<dyn RetryPolicy>,
    upload: UploadOptions,
    sender: mpsc::UnboundedSender<QueuedTask>,
    states: Mutex<HashMap<AssetId, CommitState>>,
    /// Tasks not yet terminal, including ones waiting out a backoff
    depth: AtomicUsize,
    idle: Notify,
    /// Remaining forced timeouts; `u32::MAX` never runs out
    forced_timeouts: AtomicU32,
    failure_hook: Option<FailureHook>,
    attempts: AtomicU64,
    committed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    injected: AtomicU64,
}

/// Bounded worker pool committing dirty entries
pub struct CommitQueue {
    settings: Arc<StoreSettings>,
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
    accepting: AtomicBool,
}

impl CommitQueue {
    pub fn new(
        settings: Arc<StoreSettings>,
        cache: Arc<CacheTier>,
        remote: Arc<RemoteStore>,
        policy: Arc<dyn RetryPolicy>,
        failure_hook: Option<FailureHook>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            cache,
            remote,
            policy,
            upload: UploadOptions::from_settings(&settings),
            sender,
            states: Mutex::new(HashMap::new()),
            depth: AtomicUsize::new(0),
            idle: Notify::new(),
            forced_timeouts: AtomicU32::new(settings.fault_injection.forced_commit_timeouts),
            failure_hook,
            attempts: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            injected: AtomicU64::new(0),
        });

        Self {
            permits: Arc::new(Semaphore::new(settings.max_pending_commits())),
            settings,
            shared,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            workers: Mutex::new(Vec::new()),
            stop,
            accepting: AtomicBool::new(true),
        }
    }

    /// Spawn the workers. Calling it again is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock().expect("worker list poisoned");
        if !workers.is_empty() {
            return;
        }

        for worker_id in 0..self.settings.worker_count {
            let shared = self.shared.clone();
            let receiver = self.receiver.clone();
            let stop = self.stop.subscribe();
            workers.push(tokio::spawn(worker_loop(worker_id, shared, receiver, stop)));
        }

        info!(
            workers = self.settings.worker_count,
            backlog = self.settings.max_pending_commits(),
            policy = ?self.settings.queue_full_policy,
            "Commit queue started"
        );
    }

    /// Schedule a commit. Applies backpressure once the backlog is full:
    /// waits for a slot or fails with `QueueFull`, per settings.
    pub async fn enqueue(&self, task: CommitTask) -> StoreResult<()> {
        self.enqueue_with(task, self.settings.queue_full_policy).await
    }

    /// Schedule a commit, waiting for a slot regardless of the configured
    /// policy. Used for work that must not be dropped, such as recovery.
    pub async fn enqueue_wait(&self, task: CommitTask) -> StoreResult<()> {
        self.enqueue_with(task, QueueFullPolicy::Block).await
    }

    async fn enqueue_with(&self, task: CommitTask, policy: QueueFullPolicy) -> StoreResult<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(StoreError::ShuttingDown);
        }

        let permit = match policy {
            QueueFullPolicy::Block => self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| StoreError::ShuttingDown)?,
            QueueFullPolicy::Reject => match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    warn!(asset = %task.id(), depth = self.depth(), "Commit queue full, rejecting");
                    return Err(StoreError::QueueFull);
                }
                Err(TryAcquireError::Closed) => return Err(StoreError::ShuttingDown),
            },
        };

        let id = task.id().clone();
        self.shared.set_state(&id, CommitState::Pending);
        self.shared.depth.fetch_add(1, Ordering::AcqRel);

        self.shared
            .sender
            .send(QueuedTask { task, _permit: permit })
            .map_err(|_| StoreError::ShuttingDown)?;

        debug!(asset = %id, depth = self.depth(), "Commit enqueued");
        Ok(())
    }

    /// Outstanding commits (queued, in flight or backing off)
    pub fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::Acquire)
    }

    /// State of the latest task for `id`; committed tasks are forgotten
    pub fn state(&self, id: &AssetId) -> Option<CommitState> {
        self.shared.states.lock().expect("state table poisoned").get(id).copied()
    }

    /// Ids whose commit exhausted its attempts
    pub fn failed(&self) -> Vec<AssetId> {
        self.shared.ids_in(&[CommitState::Failed])
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.depth(),
            attempts: self.shared.attempts.load(Ordering::Relaxed),
            committed: self.shared.committed.load(Ordering::Relaxed),
            retried: self.shared.retried.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            injected_timeouts: self.shared.injected.load(Ordering::Relaxed),
        }
    }

    /// Wait until nothing is outstanding
    pub async fn drain(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.depth() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work, drain for the grace period, then stop the workers.
    /// Anything still outstanding is logged as a potential durability gap.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.accepting.store(false, Ordering::Release);
        let grace = self.settings.shutdown_grace();

        info!(depth = self.depth(), grace_ms = grace.as_millis() as u64, "Draining commit queue");
        let drained = tokio::time::timeout(grace, self.drain()).await.is_ok();

        let _ = self.stop.send(true);
        self.permits.close();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().expect("worker list poisoned").drain(..).collect();
        for handle in handles {
            if !drained {
                handle.abort();
            }
            let _ = handle.await;
        }

        let outstanding = self.shared.ids_in(&[CommitState::Pending, CommitState::InFlight]);
        for id in &outstanding {
            warn!(asset = %id, "Commit still outstanding at shutdown; potential durability gap");
        }
        let failed = self.failed();
        if !failed.is_empty() {
            warn!(count = failed.len(), "Failed commits left dirty at shutdown");
        }

        info!(drained = drained, outstanding = outstanding.len(), "Commit queue stopped");
        ShutdownReport {
            drained,
            outstanding,
            failed,
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedTask>>>,
    mut stop: watch::Receiver<bool>,
) {
    debug!(worker = worker_id, "Commit worker started");
    loop {
        let next = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                _ = stop.changed() => None,
                task = rx.recv() => task,
            }
        };

        match next {
            Some(queued) => shared.process(queued).await,
            None => break,
        }
    }
    debug!(worker = worker_id, "Commit worker stopped");
}

impl Shared {
    fn set_state(&self, id: &AssetId, state: CommitState) {
        let mut states = self.states.lock().expect("state table poisoned");
        if state == CommitState::Committed {
            states.remove(id);
        } else {
            states.insert(id.clone(), state);
        }
    }

    fn ids_in(&self, wanted: &[CommitState]) -> Vec<AssetId> {
        let states = self.states.lock().expect("state table poisoned");
        let mut ids: Vec<AssetId> = states
            .iter()
            .filter(|(_, s)| wanted.contains(s))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn take_forced_timeout(&self) -> bool {
        self.forced_timeouts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                0 => None,
                u32::MAX => Some(n),
                n => Some(n - 1),
            })
            .is_ok()
    }

    fn finish(&self) {
        if self.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn process(self: &Arc<Self>, mut queued: QueuedTask) {
        let id = queued.task.id().clone();
        self.set_state(&id, CommitState::InFlight);

        let attempt = queued.task.attempts + 1;
        queued.task.attempts = attempt;
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let result = if self.take_forced_timeout() {
            self.injected.fetch_add(1, Ordering::Relaxed);
            debug!(asset = %id, attempt = attempt, "Injected commit timeout");
            Err(StoreError::Timeout)
        } else {
            match self
                .remote
                .store(&queued.task.meta, &queued.task.payload, &self.upload)
                .await
            {
                Err(StoreError::AlreadyExists(_)) => self.remote.confirm_existing(&queued.task.meta).await,
                other => other,
            }
        };

        match result {
            Ok(()) => {
                self.cache.mark_clean(&id);
                self.set_state(&id, CommitState::Committed);
                self.committed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    asset = %id,
                    attempts = attempt,
                    queued_ms = queued.task.enqueued_at.elapsed().as_millis() as u64,
                    "Commit completed"
                );
                drop(queued);
                self.finish();
            }
            Err(e) if self.policy.should_retry(&e, attempt) => {
                let delay = self.policy.backoff(attempt);
                self.set_state(&id, CommitState::Pending);
                self.retried.fetch_add(1, Ordering::Relaxed);
                warn!(
                    asset = %id,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Commit failed, retrying"
                );
                let shared = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if shared.sender.send(queued).is_err() {
                        debug!(asset = %id, "Commit queue closed before retry");
                    }
                });
            }
            Err(e) => {
                self.set_state(&id, CommitState::Failed);
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    asset = %id,
                    attempts = attempt,
                    error = %e,
                    "Commit failed permanently; entry left dirty"
                );
                if matches!(e, StoreError::ImmutableViolation(_)) {
                    // The remote copy wins; the local bytes can never commit
                    self.cache.abandon(&id);
                }
                if let Some(hook) = &self.failure_hook {
                    hook(&id, &e);
                }
                drop(queued);
                self.finish();
            }
        }
    }
}
