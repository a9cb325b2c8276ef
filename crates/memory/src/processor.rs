//! Priority task queue drained by a bounded pool of workers.
//!
//! Tasks run highest priority first and FIFO within a priority. Every
//! execution asks the [`CircuitBreaker`] for admission first; while the
//! circuit is open the head of the queue stays where it is and workers wait
//! out the cool-down. Backend failures are retried with exponential backoff
//! up to `max_attempts`, after which the task is marked failed and kept in a
//! bounded failure log.
//!
//! The breaker counts tasks, not attempts: each task reports its final
//! outcome once. The only exception is the half-open trial, whose first
//! failed attempt re-opens the circuit straight away.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mnemos_common::{MnemosError, Result, TaskStatus};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{Admission, CircuitBreaker};
use crate::config::ProcessorConfig;
use crate::monitor::{components, elapsed_ms, PerformanceMonitor};
use crate::task::{MemoryTask, TaskPayload};

/// What a successful task produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskOutcome {
    /// Memories inserted or merged into
    pub memory_ids: Vec<String>,
    /// Work to enqueue once this task succeeds
    #[serde(skip)]
    pub follow_ups: Vec<TaskPayload>,
}

/// Executes task payloads. Implemented by the memory pipeline.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: &MemoryTask) -> Result<TaskOutcome>;
}

#[derive(Debug, Clone)]
enum TaskResult {
    Succeeded(TaskOutcome),
    Failed { attempts: u32, error: String },
    Cancelled,
}

/// Awaitable outcome of an enqueued task. Dropping it does not affect the
/// task.
#[derive(Debug)]
pub struct TaskHandle {
    id: String,
    rx: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Result<TaskOutcome> {
        match self.rx.await {
            Ok(TaskResult::Succeeded(outcome)) => Ok(outcome),
            Ok(TaskResult::Failed { attempts, error }) => Err(MnemosError::TaskExhausted {
                task_id: self.id,
                attempts,
                last_error: error,
            }),
            Ok(TaskResult::Cancelled) | Err(_) => Err(MnemosError::Cancelled(self.id)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: u64,
    pub failed: u64,
    /// Admissions refused by the open circuit
    pub deferred: u64,
    pub retried: u64,
    pub cancelled: u64,
    /// Enqueues folded into an identical queued task
    pub coalesced: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    seq: u64,
    task_id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    /// Tasks not yet finished, keyed by id
    tasks: HashMap<String, MemoryTask>,
    /// Enqueue order of each unfinished task, kept across retries
    seqs: HashMap<String, u64>,
    /// Dedupe key to task id, for tasks that have not started yet
    pending_keys: HashMap<String, String>,
    waiters: HashMap<String, Vec<oneshot::Sender<TaskResult>>>,
    failed_log: VecDeque<MemoryTask>,
    next_seq: u64,
    stats: ProcessorStats,
}

impl QueueState {
    /// Queues a new task behind everything already waiting at its priority.
    fn insert(&mut self, task: MemoryTask) -> String {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = task.id.clone();
        self.heap.push(QueueEntry {
            priority: task.priority,
            seq,
            task_id: id.clone(),
        });
        self.seqs.insert(id.clone(), seq);
        self.tasks.insert(id.clone(), task);
        id
    }

    /// Puts a known task back at its original position. False once the
    /// task is gone.
    fn requeue(&mut self, task_id: &str) -> bool {
        let (Some(task), Some(&seq)) = (self.tasks.get(task_id), self.seqs.get(task_id)) else {
            return false;
        };
        let entry = QueueEntry {
            priority: task.priority,
            seq,
            task_id: task_id.to_string(),
        };
        self.heap.push(entry);
        true
    }

    fn remove(&mut self, task_id: &str) -> Option<MemoryTask> {
        self.seqs.remove(task_id);
        self.tasks.remove(task_id)
    }

    fn resolve(&mut self, task_id: &str, result: TaskResult) {
        for tx in self.waiters.remove(task_id).unwrap_or_default() {
            let _ = tx.send(result.clone());
        }
    }
}

/// What a worker should do next.
enum Next {
    Run(MemoryTask, Admission),
    /// The circuit refused the head of the queue
    Wait(Duration),
    Idle,
}

struct Shared {
    config: ProcessorConfig,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<PerformanceMonitor>,
    state: Mutex<QueueState>,
    notify: Notify,
    /// Wakes workers waiting out a cool-down
    stopped: Notify,
    shutdown: AtomicBool,
}

pub struct BackgroundProcessor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundProcessor {
    /// Creates a stopped processor. Background task outcomes feed `breaker`
    /// through `monitor`.
    pub fn new(
        config: ProcessorConfig,
        breaker: Arc<CircuitBreaker>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        monitor.attach_breaker(components::BACKGROUND_TASK, breaker.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                breaker,
                monitor,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                stopped: Notify::new(),
                shutdown: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.shared.breaker
    }

    /// Spawns the worker pool. Tasks enqueued earlier start running now.
    pub fn start(&self, handler: Arc<dyn TaskHandler>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!("Background processor already started");
            return;
        }
        let count = self.shared.config.workers.max(1);
        for worker_id in 0..count {
            let shared = self.shared.clone();
            let handler = handler.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(shared, handler, worker_id).await;
            }));
        }
        info!(workers = count, "Background processor started");
    }

    /// Queues `task` and returns at once. An identical payload that is still
    /// waiting to start absorbs the new task and its handle resolves with
    /// the queued task's outcome.
    pub fn enqueue(&self, mut task: MemoryTask) -> TaskHandle {
        let (tx, rx) = oneshot::channel();
        if self.shared.is_shutdown() {
            let _ = tx.send(TaskResult::Cancelled);
            return TaskHandle { id: task.id, rx };
        }

        let key = task.payload.dedupe_key();
        let mut state = self.shared.state.lock();

        if let Some(existing) = state.pending_keys.get(&key).cloned() {
            state.waiters.entry(existing.clone()).or_default().push(tx);
            state.stats.coalesced += 1;
            debug!(task_id = %existing, "Coalesced duplicate task");
            return TaskHandle { id: existing, rx };
        }

        task.set_status(TaskStatus::Queued);
        debug!(task_id = %task.id, kind = ?task.kind, priority = task.priority, "Task enqueued");
        let id = state.insert(task);
        state.pending_keys.insert(key, id.clone());
        state.waiters.entry(id.clone()).or_default().push(tx);
        drop(state);

        self.shared.notify.notify_one();
        TaskHandle { id, rx }
    }

    /// Snapshot of an unfinished task.
    pub fn task(&self, task_id: &str) -> Option<MemoryTask> {
        self.shared.state.lock().tasks.get(task_id).cloned()
    }

    /// Removes a task that has not started. Returns false when the task is
    /// unknown, running, or already retrying.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.shared.state.lock();
        let cancellable = state
            .tasks
            .get(task_id)
            .is_some_and(|t| t.status == TaskStatus::Queued && t.attempts == 0);
        if !cancellable {
            return false;
        }
        state.remove(task_id);
        state.pending_keys.retain(|_, id| id != task_id);
        state.resolve(task_id, TaskResult::Cancelled);
        state.stats.cancelled += 1;
        info!(task_id = %task_id, "Task cancelled");
        true
    }

    pub fn stats(&self) -> ProcessorStats {
        let state = self.shared.state.lock();
        let mut stats = state.stats.clone();
        stats.queued = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .count();
        stats.running = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .count();
        stats
    }

    /// Most recent exhausted tasks, oldest first.
    pub fn failed_tasks(&self) -> Vec<MemoryTask> {
        self.shared.state.lock().failed_log.iter().cloned().collect()
    }

    /// Stops the workers after their current task. Tasks that never ran are
    /// cancelled.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        self.shared.stopped.notify_waiters();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Background worker ended abnormally");
            }
        }

        let mut state = self.shared.state.lock();
        let remaining: Vec<String> = state.tasks.keys().cloned().collect();
        for id in &remaining {
            state.resolve(id, TaskResult::Cancelled);
        }
        state.tasks.clear();
        state.seqs.clear();
        state.heap.clear();
        state.pending_keys.clear();
        info!(dropped = remaining.len(), "Background processor stopped");
    }
}

async fn worker_loop(shared: Arc<Shared>, handler: Arc<dyn TaskHandler>, worker_id: usize) {
    debug!(worker_id, "Worker started");
    loop {
        let next = {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if shared.is_shutdown() {
                break;
            }
            match shared.next_task() {
                Next::Idle => {
                    notified.await;
                    continue;
                }
                next => next,
            }
        };
        match next {
            Next::Run(task, admission) => shared.run(task, admission, &handler).await,
            Next::Wait(retry_after) => {
                let stopped = shared.stopped.notified();
                tokio::pin!(stopped);
                stopped.as_mut().enable();
                if shared.is_shutdown() {
                    break;
                }
                // new work cannot run before the circuit allows it
                tokio::select! {
                    _ = tokio::time::sleep(retry_after) => {}
                    _ = stopped => {}
                }
            }
            Next::Idle => {}
        }
    }
    debug!(worker_id, "Worker stopped");
}

impl Shared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Pops the next admitted task and marks it running. A task refused by
    /// the breaker goes back into the heap unchanged.
    fn next_task(&self) -> Next {
        let mut state = self.state.lock();
        loop {
            let Some(entry) = state.heap.pop() else {
                return Next::Idle;
            };
            let queued = state
                .tasks
                .get(&entry.task_id)
                .is_some_and(|t| t.status == TaskStatus::Queued);
            if !queued {
                // cancelled after it was queued
                continue;
            }

            let admission = self.breaker.try_acquire();
            if let Admission::Rejected { retry_after } = admission {
                state.stats.deferred += 1;
                let reason = MnemosError::CircuitOpen {
                    retry_after_ms: retry_after.as_millis() as u64,
                };
                debug!(task_id = %entry.task_id, error = %reason, "Task deferred");
                if let Some(task) = state.tasks.get_mut(&entry.task_id) {
                    task.last_error = Some(reason.to_string());
                }
                state.heap.push(entry);
                return Next::Wait(retry_after);
            }

            let Some(task) = state.tasks.get_mut(&entry.task_id) else {
                continue;
            };
            task.attempts += 1;
            task.set_status(TaskStatus::Running);
            let task = task.clone();
            state.pending_keys.retain(|_, id| *id != task.id);
            return Next::Run(task, admission);
        }
    }

    fn requeue_after(self: &Arc<Self>, task_id: String, delay: Duration) {
        let shared = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = shared.state.lock();
            if shared.is_shutdown() {
                state.remove(&task_id);
                state.resolve(&task_id, TaskResult::Cancelled);
                return;
            }
            if state.requeue(&task_id) {
                drop(state);
                shared.notify.notify_one();
            }
        });
    }

    /// Reports a task-level outcome to the breaker.
    fn record_outcome(&self, start: Instant, success: bool) {
        self.monitor
            .record_sample(components::BACKGROUND_TASK, elapsed_ms(start), success);
    }

    async fn run(self: &Arc<Self>, task: MemoryTask, admission: Admission, handler: &Arc<dyn TaskHandler>) {
        let task_timeout = Duration::from_millis(self.config.task_timeout_ms);
        let start = Instant::now();

        let execution = {
            let handler = handler.clone();
            let task = task.clone();
            tokio::spawn(async move { handler.handle(&task).await })
        };
        let abort = execution.abort_handle();
        let result = match tokio::time::timeout(task_timeout, execution).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(MnemosError::Storage(format!(
                "task handler aborted: {join_error}"
            ))),
            Err(_) => {
                abort.abort();
                Err(MnemosError::Timeout(format!(
                    "task exceeded {}ms",
                    self.config.task_timeout_ms
                )))
            }
        };

        let backend_failure = matches!(&result, Err(e) if e.is_backend_failure());
        self.monitor
            .record_sample(components::TASK_ATTEMPT, elapsed_ms(start), !backend_failure);

        match result {
            Ok(outcome) => {
                self.record_outcome(start, true);
                self.succeed(&task, outcome);
            }
            Err(e) if backend_failure && task.attempts < self.config.max_attempts => {
                if admission == Admission::Trial {
                    // the trial answers for the backend, not for the task
                    self.record_outcome(start, false);
                }
                let delay = self.config.backoff(task.attempts);
                warn!(
                    task_id = %task.id,
                    attempt = task.attempts,
                    max_attempts = self.config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Task failed, retrying"
                );
                {
                    let mut state = self.state.lock();
                    state.stats.retried += 1;
                    if let Some(t) = state.tasks.get_mut(&task.id) {
                        t.last_error = Some(e.to_string());
                        t.set_status(TaskStatus::Queued);
                    }
                }
                self.requeue_after(task.id, delay);
            }
            Err(e) => {
                // only backend trouble counts against the circuit
                self.record_outcome(start, !backend_failure);
                self.fail(task, e);
            }
        }
    }

    fn succeed(&self, task: &MemoryTask, outcome: TaskOutcome) {
        info!(
            task_id = %task.id,
            kind = ?task.kind,
            attempts = task.attempts,
            memories = outcome.memory_ids.len(),
            "Task succeeded"
        );
        let follow_ups = outcome.follow_ups.clone();
        {
            let mut state = self.state.lock();
            state.remove(&task.id);
            state.stats.succeeded += 1;
            state.resolve(&task.id, TaskResult::Succeeded(outcome));
        }

        for payload in follow_ups {
            self.enqueue_follow_up(payload.into_task());
        }
    }

    fn enqueue_follow_up(&self, mut task: MemoryTask) {
        if self.is_shutdown() {
            return;
        }
        let key = task.payload.dedupe_key();
        let mut state = self.state.lock();
        if state.pending_keys.contains_key(&key) {
            state.stats.coalesced += 1;
            return;
        }
        task.set_status(TaskStatus::Queued);
        let id = state.insert(task);
        state.pending_keys.insert(key, id);
        drop(state);
        self.notify.notify_one();
    }

    fn fail(&self, mut task: MemoryTask, e: MnemosError) {
        error!(
            task_id = %task.id,
            kind = ?task.kind,
            attempts = task.attempts,
            error = %e,
            "Task failed permanently"
        );
        task.last_error = Some(e.to_string());
        task.set_status(TaskStatus::Failed);

        let mut state = self.state.lock();
        state.remove(&task.id);
        state.stats.failed += 1;
        state.resolve(
            &task.id,
            TaskResult::Failed {
                attempts: task.attempts,
                error: e.to_string(),
            },
        );
        if state.failed_log.len() >= self.config.failed_log_capacity.max(1) {
            state.failed_log.pop_front();
        }
        state.failed_log.push_back(task);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::config::CircuitBreakerConfig;
    use crate::detector::DetectionRequest;
    use std::sync::atomic::AtomicU32;

    struct FnHandler<F>(F);

    #[async_trait]
    impl<F> TaskHandler for FnHandler<F>
    where
        F: Fn(&MemoryTask) -> Result<TaskOutcome> + Send + Sync + 'static,
    {
        async fn handle(&self, task: &MemoryTask) -> Result<TaskOutcome> {
            (self.0)(task)
        }
    }

    fn handler<F>(f: F) -> Arc<dyn TaskHandler>
    where
        F: Fn(&MemoryTask) -> Result<TaskOutcome> + Send + Sync + 'static,
    {
        Arc::new(FnHandler(f))
    }

    fn config(workers: usize, max_attempts: u32) -> ProcessorConfig {
        ProcessorConfig {
            workers,
            max_attempts,
            base_backoff_ms: 1,
            max_backoff_ms: 5,
            task_timeout_ms: 1_000,
            failed_log_capacity: 10,
        }
    }

    fn processor(config: ProcessorConfig, threshold: u32, cooldown_ms: u64) -> BackgroundProcessor {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_ms,
        }));
        BackgroundProcessor::new(config, breaker, Arc::new(PerformanceMonitor::new(100)))
    }

    fn relate(label: &str) -> MemoryTask {
        TaskPayload::Relate {
            memory_id: label.to_string(),
        }
        .into_task()
    }

    fn label(task: &MemoryTask) -> String {
        match &task.payload {
            TaskPayload::Relate { memory_id } => memory_id.clone(),
            other => format!("{:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let processor = processor(config(1, 3), 5, 60_000);

        let handles = vec![
            processor.enqueue(relate("low").with_priority(0)),
            processor.enqueue(relate("normal-1").with_priority(10)),
            processor.enqueue(relate("high").with_priority(20)),
            processor.enqueue(relate("normal-2").with_priority(10)),
        ];
        processor.start(handler(move |task: &MemoryTask| {
            seen.lock().push(label(task));
            Ok(TaskOutcome::default())
        }));
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["high", "normal-1", "normal-2", "low"]);
        assert_eq!(processor.stats().succeeded, 4);
    }

    #[tokio::test]
    async fn test_identical_queued_payloads_run_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let processor = processor(config(2, 3), 5, 60_000);

        let payload = TaskPayload::Detect(DetectionRequest::new("alice", "I prefer morning workouts"));
        let first = processor.enqueue(payload.clone().into_task());
        let second = processor.enqueue(payload.into_task());
        assert_eq!(first.id(), second.id());

        processor.start(handler(move |_task: &MemoryTask| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(TaskOutcome::default())
        }));
        first.wait().await.unwrap();
        second.wait().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(processor.stats().coalesced, 1);
    }

    #[tokio::test]
    async fn test_backend_failures_retry_then_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let processor = processor(config(1, 3), 10, 60_000);
        processor.start(handler(move |_task: &MemoryTask| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(MnemosError::BackendUnavailable("503".into()))
            } else {
                Ok(TaskOutcome {
                    memory_ids: vec!["mem_1".into()],
                    follow_ups: Vec::new(),
                })
            }
        }));

        let outcome = processor.enqueue(relate("flaky")).wait().await.unwrap();
        assert_eq!(outcome.memory_ids, vec!["mem_1"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(processor.stats().retried, 2);
    }

    #[tokio::test]
    async fn test_exhausted_task_is_recorded() {
        let processor = processor(config(1, 3), 10, 60_000);
        processor.start(handler(|_task: &MemoryTask| {
            Err(MnemosError::BackendUnavailable("down".into()))
        }));

        let handle = processor.enqueue(relate("doomed"));
        let id = handle.id().to_string();
        match handle.wait().await {
            Err(MnemosError::TaskExhausted { task_id, attempts, .. }) => {
                assert_eq!(task_id, id);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        let failed = processor.failed_tasks();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, TaskStatus::Failed);
        assert!(failed[0].last_error.as_deref().unwrap().contains("down"));
        assert_eq!(processor.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_non_backend_error_is_not_retried() {
        let processor = processor(config(1, 3), 10, 60_000);
        processor.start(handler(|_task: &MemoryTask| {
            Err(MnemosError::validation("bad payload"))
        }));
        match processor.enqueue(relate("invalid")).wait().await {
            Err(MnemosError::TaskExhausted { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(processor.breaker().snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let processor = processor(config(1, 3), 5, 60_000);
        let handle = processor.enqueue(relate("never"));
        assert!(processor.cancel(handle.id()));
        assert!(!processor.cancel(handle.id()));
        assert!(!processor.cancel("task_missing"));
        assert!(matches!(handle.wait().await, Err(MnemosError::Cancelled(_))));
        assert_eq!(processor.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_open_circuit_defers_tasks() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let processor = processor(config(1, 1), 2, 60_000);
        processor.start(handler(move |_task: &MemoryTask| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(MnemosError::Timeout("classifier".into()))
        }));

        for i in 0..2 {
            assert!(processor.enqueue(relate(&format!("fail-{i}"))).wait().await.is_err());
        }
        assert_eq!(processor.breaker().state(), CircuitState::Open);

        let deferred = processor.enqueue(relate("deferred"));
        let id = deferred.id().to_string();
        let waited = tokio::time::timeout(Duration::from_millis(100), deferred.wait()).await;
        assert!(waited.is_err(), "task ran while the circuit was open");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(processor.stats().deferred >= 1);

        let queued = processor.task(&id).unwrap();
        assert_eq!(queued.status, TaskStatus::Queued);
        assert_eq!(queued.attempts, 0);
        assert!(queued.last_error.unwrap().contains("Circuit open"));
    }

    #[tokio::test]
    async fn test_breaker_counts_tasks_not_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let processor = processor(config(1, 3), 2, 60_000);
        processor.start(handler(move |_task: &MemoryTask| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(MnemosError::BackendUnavailable("down".into()))
        }));

        assert!(processor.enqueue(relate("first")).wait().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let snapshot = processor.breaker().snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 1);

        assert!(processor.enqueue(relate("second")).wait().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(processor.breaker().state(), CircuitState::Open);
        assert_eq!(processor.stats().retried, 4);
    }

    #[tokio::test]
    async fn test_failed_half_open_attempt_reopens_while_task_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let processor = processor(config(1, 3), 1, 50);
        processor.start(handler(move |_task: &MemoryTask| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(MnemosError::BackendUnavailable("down".into()))
        }));

        assert!(processor.enqueue(relate("first")).wait().await.is_err());
        assert_eq!(processor.breaker().state(), CircuitState::Open);

        // each retry waits for the next half-open window instead of stalling
        let second = processor.enqueue(relate("second"));
        match tokio::time::timeout(Duration::from_secs(5), second.wait()).await {
            Ok(Err(MnemosError::TaskExhausted { attempts, .. })) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(processor.breaker().state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_deferred_tasks_keep_their_queue_position() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let processor = processor(config(1, 1), 1, 100);
        processor.start(handler(move |task: &MemoryTask| {
            let label = label(task);
            if label == "bad" {
                return Err(MnemosError::BackendUnavailable("down".into()));
            }
            seen.lock().push(label);
            Ok(TaskOutcome::default())
        }));

        assert!(processor.enqueue(relate("bad")).wait().await.is_err());
        assert_eq!(processor.breaker().state(), CircuitState::Open);

        let handles = vec![
            processor.enqueue(relate("low-1").with_priority(0)),
            processor.enqueue(relate("normal-1").with_priority(10)),
            processor.enqueue(relate("low-2").with_priority(0)),
            processor.enqueue(relate("normal-2").with_priority(10)),
        ];
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle.wait())
                .await
                .expect("queued work should run once the circuit closes")
                .unwrap();
        }
        assert_eq!(*order.lock(), vec!["normal-1", "normal-2", "low-1", "low-2"]);
        assert!(processor.stats().deferred >= 1);
        assert_eq!(processor.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_success_closes_circuit() {
        let processor = processor(config(1, 1), 1, 50);
        processor.start(handler(|task: &MemoryTask| {
            if label(task) == "bad" {
                Err(MnemosError::BackendUnavailable("down".into()))
            } else {
                Ok(TaskOutcome::default())
            }
        }));

        assert!(processor.enqueue(relate("bad")).wait().await.is_err());
        assert_eq!(processor.breaker().state(), CircuitState::Open);

        let good = processor.enqueue(relate("good"));
        tokio::time::timeout(Duration::from_secs(2), good.wait())
            .await
            .expect("task should run after the cool-down")
            .unwrap();
        assert_eq!(processor.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_follow_ups_are_enqueued() {
        let relates = Arc::new(AtomicU32::new(0));
        let counter = relates.clone();
        let processor = processor(config(2, 3), 5, 60_000);
        processor.start(handler(move |task: &MemoryTask| match &task.payload {
            TaskPayload::Detect(_) => Ok(TaskOutcome {
                memory_ids: vec!["mem_a".into()],
                follow_ups: vec![TaskPayload::Relate {
                    memory_id: "mem_a".into(),
                }],
            }),
            _ => {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(TaskOutcome::default())
            }
        }));

        let detect = TaskPayload::Detect(DetectionRequest::new("alice", "I prefer tea")).into_task();
        processor.enqueue(detect).wait().await.unwrap();

        for _ in 0..100 {
            if relates.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(relates.load(Ordering::SeqCst), 1);
    }

    struct SleepyHandler;

    #[async_trait]
    impl TaskHandler for SleepyHandler {
        async fn handle(&self, _task: &MemoryTask) -> Result<TaskOutcome> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(TaskOutcome::default())
        }
    }

    #[tokio::test]
    async fn test_task_timeout_counts_as_backend_failure() {
        let processor = processor(
            ProcessorConfig {
                task_timeout_ms: 20,
                ..config(1, 1)
            },
            5,
            60_000,
        );
        processor.start(Arc::new(SleepyHandler));
        match processor.enqueue(relate("slow")).wait().await {
            Err(MnemosError::TaskExhausted { last_error, .. }) => assert!(last_error.contains("20ms")),
            other => panic!("expected timeout failure, got {other:?}"),
        }
        assert_eq!(processor.breaker().snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_tasks() {
        let processor = processor(config(1, 3), 5, 60_000);
        let handle = processor.enqueue(relate("queued"));
        processor.shutdown().await;
        assert!(matches!(handle.wait().await, Err(MnemosError::Cancelled(_))));

        let late = processor.enqueue(relate("late"));
        assert!(matches!(late.wait().await, Err(MnemosError::Cancelled(_))));
    }
}
