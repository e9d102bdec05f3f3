//! Time-priority scheduler with bounded concurrent ticks
//!
//! Recurring jobs sit in a min-priority queue keyed by their next fire time.
//! Each `tick` pushes one `do_tick` worker into a bounded queue of running
//! ticks; a full queue applies backpressure instead of piling up work. A
//! `do_tick` drains every due job, runs `pre_execute` inline, fans the
//! `execute` futures out, then awaits them and their `post_execute`
//! continuations. Job faults are logged and counted, never propagated.

pub mod stats;

use async_trait::async_trait;
use parking_lot::Mutex;
use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use stats::TaskStatistics;

/// Jobs report failures as boxed errors; the scheduler only logs and counts
/// them.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// `pre_execute` beyond this duration draws a warning.
const SLOW_PRE_EXECUTE: Duration = Duration::from_secs(1);

/// A recurring job driven by the scheduler.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;

    /// Runs inline on the tick before `execute` is launched. A failure
    /// reschedules the job without executing it.
    async fn pre_execute(&self, _cancel: &CancellationToken) -> Result<(), JobError> {
        Ok(())
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<(), JobError>;

    /// Runs after `execute` settles, with its error if it failed.
    async fn post_execute(&self, _error: Option<&JobError>, _cancel: &CancellationToken) {}
}

/// Opaque id of a registered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

/// Lets a job ask to be re-fired ahead of its period.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    reschedule_tx: mpsc::UnboundedSender<TaskId>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Queue this task for the next tick regardless of its period.
    pub fn request_reschedule(&self) {
        let _ = self.reschedule_tx.send(self.id);
    }
}

#[derive(Clone)]
struct TaskEntry {
    job: Arc<dyn ScheduledJob>,
    period: Duration,
    stats: Arc<TaskStatistics>,
}

/// Min-priority queue of recurring jobs with a bounded set of concurrent
/// ticks.
pub struct TaskScheduler {
    entries: Mutex<HashMap<TaskId, TaskEntry>>,
    queue: Mutex<PriorityQueue<TaskId, Reverse<Instant>>>,
    tick_queue: Mutex<VecDeque<JoinHandle<()>>>,
    tick_queue_bound: AtomicUsize,
    max_tick_queue: AtomicUsize,
    tick_gate: Semaphore,
    reschedule_tx: mpsc::UnboundedSender<TaskId>,
    reschedule_rx: Mutex<mpsc::UnboundedReceiver<TaskId>>,
    next_id: AtomicU64,
}

impl TaskScheduler {
    pub fn new(max_tick_queue: usize) -> Self {
        let (reschedule_tx, reschedule_rx) = mpsc::unbounded_channel();
        Self {
            entries: Mutex::new(HashMap::new()),
            queue: Mutex::new(PriorityQueue::new()),
            tick_queue: Mutex::new(VecDeque::with_capacity(max_tick_queue)),
            tick_queue_bound: AtomicUsize::new(max_tick_queue),
            max_tick_queue: AtomicUsize::new(max_tick_queue),
            tick_gate: Semaphore::new(1),
            reschedule_tx,
            reschedule_rx: Mutex::new(reschedule_rx),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a job firing first at `first_fire` and every `period` after.
    pub fn register(
        &self,
        job: Arc<dyn ScheduledJob>,
        period: Duration,
        first_fire: Instant,
    ) -> TaskHandle {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().insert(
            id,
            TaskEntry {
                job,
                period,
                stats: Arc::new(TaskStatistics::new()),
            },
        );
        self.queue.lock().push(id, Reverse(first_fire));
        TaskHandle {
            id,
            reschedule_tx: self.reschedule_tx.clone(),
        }
    }

    /// Drop a job; an in-flight execute still finishes.
    pub fn unregister(&self, id: TaskId) {
        self.entries.lock().remove(&id);
        self.queue.lock().remove(&id);
    }

    pub fn statistics(&self, id: TaskId) -> Option<Arc<TaskStatistics>> {
        self.entries.lock().get(&id).map(|e| Arc::clone(&e.stats))
    }

    /// Change the bound on concurrent ticks; the tick queue is rebuilt at the
    /// new size on the next full tick.
    pub fn set_max_tick_queue(&self, max: usize) {
        self.max_tick_queue.store(max.max(1), Ordering::Relaxed);
    }

    /// Try to launch one tick worker.
    ///
    /// Returns 1 when a `do_tick` was queued, 0 when the tick queue is full
    /// (backpressure) or the token is cancelled.
    pub async fn tick(self: &Arc<Self>, cancel: &CancellationToken) -> usize {
        let _permit = match self.tick_gate.acquire().await {
            Ok(permit) => permit,
            Err(_) => return 0,
        };
        if cancel.is_cancelled() {
            return 0;
        }

        let max = self.max_tick_queue.load(Ordering::Relaxed);
        let mut ticks = self.tick_queue.lock();
        if ticks.len() >= max {
            // Maintain: shed finished workers from both ends, then honor a
            // reconfigured bound by rebuilding the deque in order.
            while ticks.front().is_some_and(JoinHandle::is_finished) {
                ticks.pop_front();
            }
            while ticks.back().is_some_and(JoinHandle::is_finished) {
                ticks.pop_back();
            }
            if self.tick_queue_bound.swap(max, Ordering::Relaxed) != max {
                let mut rebuilt = VecDeque::with_capacity(max);
                rebuilt.extend(ticks.drain(..));
                *ticks = rebuilt;
            }
        }
        if ticks.len() >= max {
            debug!(running = ticks.len(), max, "Tick queue full, applying backpressure");
            return 0;
        }

        let scheduler = Arc::clone(self);
        let cancel = cancel.clone();
        ticks.push_back(tokio::spawn(async move { scheduler.do_tick(cancel).await }));
        1
    }

    async fn do_tick(self: Arc<Self>, cancel: CancellationToken) {
        let mut executes: JoinSet<(TaskId, Result<(), JobError>, Duration)> = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let now = Instant::now();
            let due = {
                let mut queue = self.queue.lock();
                match queue.peek() {
                    Some((_, Reverse(fire))) if *fire <= now => queue.pop().map(|(id, _)| id),
                    _ => None,
                }
            };
            let Some(id) = due else { break };
            let Some(entry) = self.entries.lock().get(&id).cloned() else {
                continue;
            };

            let started = Instant::now();
            let pre = entry.job.pre_execute(&cancel).await;
            let pre_took = started.elapsed();
            if pre_took > SLOW_PRE_EXECUTE {
                warn!(
                    task = entry.job.name(),
                    elapsed_ms = pre_took.as_millis() as u64,
                    "pre_execute ran long"
                );
            }
            if let Err(e) = pre {
                warn!(task = entry.job.name(), error = %e, "pre_execute failed, rescheduling");
                entry.stats.record_error(e.to_string());
                self.requeue(id, Instant::now() + entry.period);
                continue;
            }

            let job = Arc::clone(&entry.job);
            let task_cancel = cancel.clone();
            executes.spawn(async move {
                let started = Instant::now();
                let result = job.execute(&task_cancel).await;
                (id, result, started.elapsed())
            });
        }

        // First await every launched execute, then every post_execute; faults
        // stop at the scheduler boundary.
        let mut completed = Vec::new();
        while let Some(joined) = executes.join_next().await {
            match joined {
                Ok(outcome) => completed.push(outcome),
                Err(e) => warn!(error = %e, "Scheduled execute aborted"),
            }
        }

        let mut posts = JoinSet::new();
        for (id, result, took) in completed {
            let Some(entry) = self.entries.lock().get(&id).cloned() else {
                continue;
            };
            match &result {
                Ok(()) => entry.stats.record_success(took),
                Err(e) => {
                    warn!(task = entry.job.name(), error = %e, "Scheduled execute failed");
                    entry.stats.record_error(e.to_string());
                }
            }
            self.requeue(id, Instant::now() + entry.period);

            let job = Arc::clone(&entry.job);
            let post_cancel = cancel.clone();
            posts.spawn(async move {
                job.post_execute(result.as_ref().err(), &post_cancel).await;
            });
        }
        while let Some(joined) = posts.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "post_execute aborted");
            }
        }

        // Cleanup: self-requested reschedules win over the periodic requeue.
        let now = Instant::now();
        loop {
            let id = match self.reschedule_rx.lock().try_recv() {
                Ok(id) => id,
                Err(_) => break,
            };
            self.requeue(id, now);
        }
    }

    fn requeue(&self, id: TaskId, when: Instant) {
        if self.entries.lock().contains_key(&id) {
            // A keyed push replaces the priority of an already-queued task,
            // so concurrent reschedules collapse instead of duplicating.
            self.queue.lock().push(id, Reverse(when));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingJob {
        name: String,
        executions: AtomicUsize,
        fail: bool,
        release: CancellationToken,
    }

    impl CountingJob {
        fn new(name: &str) -> Self {
            let release = CancellationToken::new();
            release.cancel();
            Self {
                name: name.to_string(),
                executions: AtomicUsize::new(0),
                fail: false,
                release,
            }
        }

        /// A job that blocks in execute until `release` is cancelled.
        fn blocking(name: &str) -> Self {
            Self {
                name: name.to_string(),
                executions: AtomicUsize::new(0),
                fail: false,
                release: CancellationToken::new(),
            }
        }

        fn failing(name: &str) -> Self {
            let mut job = Self::new(name);
            job.fail = true;
            job
        }
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self, _cancel: &CancellationToken) -> Result<(), JobError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.release.cancelled().await;
            if self.fail {
                return Err("scripted failure".into());
            }
            Ok(())
        }
    }

    async fn settle() {
        // Let spawned do_ticks run to completion on the test runtime.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn due_task_executes_and_future_task_does_not() {
        let scheduler = Arc::new(TaskScheduler::new(4));
        let cancel = CancellationToken::new();

        let due = Arc::new(CountingJob::new("due"));
        let later = Arc::new(CountingJob::new("later"));
        scheduler.register(due.clone(), Duration::from_secs(3600), Instant::now());
        scheduler.register(
            later.clone(),
            Duration::from_secs(3600),
            Instant::now() + Duration::from_secs(3600),
        );

        assert_eq!(scheduler.tick(&cancel).await, 1);
        settle().await;

        assert_eq!(due.executions.load(Ordering::SeqCst), 1);
        assert_eq!(later.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_tick_queue_applies_backpressure() {
        let scheduler = Arc::new(TaskScheduler::new(2));
        let cancel = CancellationToken::new();

        let slow = Arc::new(CountingJob::blocking("slow"));
        scheduler.register(slow.clone(), Duration::from_secs(3600), Instant::now());

        assert_eq!(scheduler.tick(&cancel).await, 1);
        assert_eq!(scheduler.tick(&cancel).await, 1);
        // Two unfinished tick workers queued: the gate is full.
        assert_eq!(scheduler.tick(&cancel).await, 0);

        // Releasing the job lets the workers finish; maintenance frees slots.
        slow.release.cancel();
        settle().await;
        assert_eq!(scheduler.tick(&cancel).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn executed_task_is_requeued_at_period() {
        let scheduler = Arc::new(TaskScheduler::new(4));
        let cancel = CancellationToken::new();

        let job = Arc::new(CountingJob::new("periodic"));
        scheduler.register(job.clone(), Duration::from_secs(5), Instant::now());

        assert_eq!(scheduler.tick(&cancel).await, 1);
        settle().await;
        assert_eq!(job.executions.load(Ordering::SeqCst), 1);

        // Not due yet.
        scheduler.tick(&cancel).await;
        settle().await;
        assert_eq!(job.executions.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        scheduler.tick(&cancel).await;
        settle().await;
        assert_eq!(job.executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_counted_not_propagated() {
        let scheduler = Arc::new(TaskScheduler::new(4));
        let cancel = CancellationToken::new();

        let job = Arc::new(CountingJob::failing("flaky"));
        let handle = scheduler.register(job.clone(), Duration::from_secs(3600), Instant::now());

        scheduler.tick(&cancel).await;
        settle().await;

        let stats = scheduler.statistics(handle.id()).unwrap();
        assert_eq!(stats.error_count(), 1);
        assert_eq!(stats.success_count(), 0);
        assert_eq!(stats.recent_errors(), vec!["scripted failure".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_signal_fires_ahead_of_period() {
        let scheduler = Arc::new(TaskScheduler::new(4));
        let cancel = CancellationToken::new();

        let job = Arc::new(CountingJob::new("eager"));
        let handle = scheduler.register(job.clone(), Duration::from_secs(3600), Instant::now());

        scheduler.tick(&cancel).await;
        settle().await;
        assert_eq!(job.executions.load(Ordering::SeqCst), 1);

        handle.request_reschedule();
        // One tick drains the signal into the queue, the next executes it.
        scheduler.tick(&cancel).await;
        settle().await;
        scheduler.tick(&cancel).await;
        settle().await;

        assert_eq!(job.executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_task_never_fires_again() {
        let scheduler = Arc::new(TaskScheduler::new(4));
        let cancel = CancellationToken::new();

        let job = Arc::new(CountingJob::new("gone"));
        let handle = scheduler.register(job.clone(), Duration::from_secs(1), Instant::now());
        scheduler.unregister(handle.id());

        scheduler.tick(&cancel).await;
        settle().await;
        assert_eq!(job.executions.load(Ordering::SeqCst), 0);
    }
}
