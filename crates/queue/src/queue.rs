//! In-process job queue with named lanes.
//!
//! Each lane owns a priority heap of waiting jobs, a semaphore bounding how
//! many of them run at once, and a dispatcher task feeding the lane's
//! handler.  Failed attempts are retried after the job's backoff until its
//! attempt budget is spent.  Finished jobs stay visible to [`JobQueue::job`]
//! until `retain_finished` newer ones have finished.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::config::{LaneConfig, QueueConfig};
use crate::job::{
    JobContext, JobEvent, JobEventKind, JobHandle, JobOptions, JobPriority, JobSnapshot, JobState,
    ProgressReporter,
};
use crate::{Backoff, QueueError, Result};

/// Processes the jobs of one lane.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: JobContext) -> Result<Value>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, job: JobContext) -> Result<Value> {
        (self.0)(job).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Lanes
// ---------------------------------------------------------------------------

/// Heap entry: highest priority first, then FIFO.
#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: JobPriority,
    seq: u64,
    id: Uuid,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Lane {
    config: LaneConfig,
    slots: Arc<Semaphore>,
    waiting: Mutex<BinaryHeap<Queued>>,
    wakeup: Notify,
    has_processor: Mutex<bool>,
}

impl Lane {
    fn new(config: LaneConfig) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.concurrency)),
            config,
            waiting: Mutex::new(BinaryHeap::new()),
            wakeup: Notify::new(),
            has_processor: Mutex::new(false),
        }
    }

    fn push(&self, item: Queued) {
        lock(&self.waiting).push(item);
        self.wakeup.notify_one();
    }

    async fn next(&self) -> Uuid {
        loop {
            let next = lock(&self.waiting).pop();
            if let Some(item) = next {
                return item.id;
            }
            self.wakeup.notified().await;
        }
    }
}

struct JobEntry {
    state: watch::Sender<JobSnapshot>,
    backoff: Backoff,
    timeout: Option<Duration>,
    dedup_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct Inner {
    lanes: HashMap<String, Arc<Lane>>,
    jobs: Mutex<HashMap<Uuid, Arc<JobEntry>>>,
    dedup: Mutex<HashMap<String, Uuid>>,
    /// Finished job ids, oldest first.
    finished: Mutex<VecDeque<Uuid>>,
    retain_finished: usize,
    /// Attempts currently dispatched.
    active: watch::Sender<usize>,
    events: broadcast::Sender<JobEvent>,
    seq: AtomicU64,
    shutdown: CancellationToken,
}

/// Cheaply cloneable handle to the queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let lanes = config
            .lanes
            .into_iter()
            .map(|lane| (lane.name.clone(), Arc::new(Lane::new(lane))))
            .collect();

        Self {
            inner: Arc::new(Inner {
                lanes,
                jobs: Mutex::new(HashMap::new()),
                dedup: Mutex::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                retain_finished: config.retain_finished,
                active: watch::channel(0).0,
                events,
                seq: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Names of the configured lanes, sorted.
    pub fn queue_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.inner.lanes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Attach `handler` to the lane `queue` and start its dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn process(&self, queue: &str, handler: Arc<dyn JobHandler>) -> Result<()> {
        let lane = self.lane(queue)?;
        {
            let mut attached = lock(&lane.has_processor);
            if *attached {
                return Err(QueueError::ProcessorExists(queue.to_owned()));
            }
            *attached = true;
        }

        info!(queue, concurrency = lane.config.concurrency, "starting lane dispatcher");
        tokio::spawn(dispatch_loop(self.inner.clone(), lane, handler));
        Ok(())
    }

    /// Enqueue a job on `queue`.
    #[instrument(skip(self, payload, options), fields(priority = ?options.priority))]
    pub fn add(&self, queue: &str, payload: Value, options: JobOptions) -> Result<JobHandle> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }
        let lane = self.lane(queue)?;

        let mut dedup = lock(&self.inner.dedup);
        if let Some(key) = &options.dedup_key {
            if let Some(existing) = dedup.get(key).and_then(|id| self.inner.entry(*id)) {
                let snapshot = existing.state.borrow().clone();
                if !snapshot.state.is_terminal() {
                    debug!(job_id = %snapshot.id, dedup_key = %key, "duplicate job, reusing existing");
                    return Ok(JobHandle::new(snapshot.id, existing.state.subscribe()));
                }
            }
        }

        let id = Uuid::new_v4();
        let snapshot = JobSnapshot {
            id,
            queue: queue.to_owned(),
            payload,
            priority: options.priority,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: options.attempts.unwrap_or(lane.config.attempts).max(1),
            progress: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        let (tx, rx) = watch::channel(snapshot);
        let entry = Arc::new(JobEntry {
            state: tx,
            backoff: options.backoff.unwrap_or(lane.config.backoff),
            timeout: options.timeout.or(lane.config.timeout),
            dedup_key: options.dedup_key.clone(),
        });

        lock(&self.inner.jobs).insert(id, entry);
        if let Some(key) = options.dedup_key {
            dedup.insert(key, id);
        }
        drop(dedup);

        self.inner.enqueue(&lane, id, options.priority);
        debug!(job_id = %id, queue, "job added");
        Ok(JobHandle::new(id, rx))
    }

    /// Current snapshot of a job, if it is still retained.
    pub fn job(&self, id: Uuid) -> Option<JobSnapshot> {
        self.inner.entry(id).map(|entry| entry.state.borrow().clone())
    }

    /// Jobs currently retained, finished ones included.
    pub fn len(&self) -> usize {
        lock(&self.inner.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every lane dispatcher.  Attempts already running finish; nothing
    /// new is started and further `add` calls fail.  Use [`drain`](Self::drain)
    /// to wait for the running attempts.
    pub fn shutdown(&self) {
        info!("shutting down job queue");
        self.inner.shutdown.cancel();
    }

    /// Wait up to `grace` for every running attempt to finish.  Returns
    /// `false` if some were still running when the grace period ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        let mut active = self.inner.active.subscribe();
        let outcome = tokio::time::timeout(grace, active.wait_for(|n| *n == 0))
            .await
            .map(|result| result.is_ok());
        match outcome {
            Ok(done) => done,
            Err(_) => {
                warn!(running = *active.borrow(), "grace period over, attempts still running");
                false
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn lane(&self, queue: &str) -> Result<Arc<Lane>> {
        self.inner
            .lanes
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_owned()))
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("lanes", &self.queue_names())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Inner {
    fn entry(&self, id: Uuid) -> Option<Arc<JobEntry>> {
        lock(&self.jobs).get(&id).cloned()
    }

    /// Release the dedup key of a finished job and forget the oldest
    /// finished jobs beyond the retention limit.
    fn retire(&self, id: Uuid, entry: &JobEntry) {
        if let Some(key) = &entry.dedup_key {
            let mut dedup = lock(&self.dedup);
            if dedup.get(key) == Some(&id) {
                dedup.remove(key);
            }
        }

        let mut finished = lock(&self.finished);
        finished.push_back(id);
        let excess = finished.len().saturating_sub(self.retain_finished);
        if excess > 0 {
            let mut jobs = lock(&self.jobs);
            for old in finished.drain(..excess) {
                jobs.remove(&old);
            }
        }
    }

    fn enqueue(&self, lane: &Lane, id: Uuid, priority: JobPriority) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        lane.push(Queued { priority, seq, id });
    }

    fn emit(&self, job_id: Uuid, queue: &str, kind: JobEventKind) {
        // No subscribers is fine.
        let _ = self.events.send(JobEvent {
            job_id,
            queue: queue.to_owned(),
            kind,
        });
    }

    fn progress_reporter(&self, id: Uuid, queue: &str, entry: Arc<JobEntry>) -> ProgressReporter {
        let events = self.events.clone();
        let queue = queue.to_owned();
        ProgressReporter::new(move |progress: Value| {
            entry
                .state
                .send_modify(|s| s.progress = Some(progress.clone()));
            let _ = events.send(JobEvent {
                job_id: id,
                queue: queue.clone(),
                kind: JobEventKind::Progress(progress),
            });
        })
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Counts a dispatched attempt until dropped.
struct Busy(Arc<Inner>);

impl Busy {
    fn enter(inner: &Arc<Inner>) -> Self {
        inner.active.send_modify(|n| *n += 1);
        Self(inner.clone())
    }
}

impl Drop for Busy {
    fn drop(&mut self) {
        self.0.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

async fn dispatch_loop(inner: Arc<Inner>, lane: Arc<Lane>, handler: Arc<dyn JobHandler>) {
    loop {
        let permit = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            permit = lane.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let id = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            id = lane.next() => id,
        };
        tokio::spawn(run_attempt(
            inner.clone(),
            lane.clone(),
            handler.clone(),
            id,
            permit,
            Busy::enter(&inner),
        ));
    }
    debug!(queue = %lane.config.name, "lane dispatcher stopped");
}

async fn run_attempt(
    inner: Arc<Inner>,
    lane: Arc<Lane>,
    handler: Arc<dyn JobHandler>,
    id: Uuid,
    permit: OwnedSemaphorePermit,
    _busy: Busy,
) {
    let Some(entry) = inner.entry(id) else {
        warn!(job_id = %id, "dequeued unknown job");
        return;
    };
    let queue = lane.config.name.as_str();

    let mut started = None;
    entry.state.send_modify(|s| {
        s.state = JobState::Active;
        s.attempts_made += 1;
        started = Some((s.attempts_made, s.max_attempts, s.payload.clone(), s.priority));
    });
    let Some((attempt, max_attempts, payload, priority)) = started else {
        return;
    };
    inner.emit(id, queue, JobEventKind::Active { attempt });

    let ctx = JobContext {
        id,
        queue: queue.to_owned(),
        payload: payload.clone(),
        attempt,
        max_attempts,
        progress: inner.progress_reporter(id, queue, entry.clone()),
    };
    let timeout = entry.timeout;
    let span = info_span!("job", job_id = %id, queue, attempt);
    let task = tokio::spawn(
        async move {
            let work = handler.handle(ctx);
            match timeout {
                Some(limit) => tokio::time::timeout(limit, work)
                    .await
                    .unwrap_or(Err(QueueError::Timeout(limit))),
                None => work.await,
            }
        }
        .instrument(span),
    );

    let outcome = match task.await {
        Ok(result) => result,
        Err(join_err) => Err(join_failure(join_err)),
    };
    drop(permit);

    match outcome {
        Ok(result) => {
            entry.state.send_modify(|s| {
                s.state = JobState::Completed;
                s.result = Some(result.clone());
                s.error = None;
                s.finished_at = Some(Utc::now());
            });
            info!(job_id = %id, queue, attempt, "job completed");
            inner.retire(id, &entry);
            inner.emit(id, queue, JobEventKind::Completed(result));
        }
        Err(err) => {
            let error = err.to_string();
            let will_retry = attempt < max_attempts && !inner.shutdown.is_cancelled();

            if will_retry {
                let delay = entry.backoff.delay(attempt);
                entry.state.send_modify(|s| {
                    s.state = JobState::Delayed;
                    s.error = Some(error.clone());
                });
                warn!(
                    job_id = %id,
                    queue,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "job attempt failed, retrying"
                );
                inner.emit(
                    id,
                    queue,
                    JobEventKind::Failed {
                        error,
                        will_retry: true,
                        payload,
                    },
                );

                let inner = inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    entry.state.send_modify(|s| s.state = JobState::Waiting);
                    inner.enqueue(&lane, id, priority);
                });
            } else {
                entry.state.send_modify(|s| {
                    s.state = JobState::Failed;
                    s.error = Some(error.clone());
                    s.finished_at = Some(Utc::now());
                });
                error!(job_id = %id, queue, attempt, error = %error, "job failed");
                inner.retire(id, &entry);
                inner.emit(
                    id,
                    queue,
                    JobEventKind::Failed {
                        error,
                        will_retry: false,
                        payload,
                    },
                );
            }
        }
    }
}

fn join_failure(err: JoinError) -> QueueError {
    if !err.is_panic() {
        return QueueError::handler(err.to_string());
    }
    let panic = err.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    QueueError::Panicked(message)
}
