//! Single-slot background work queue.
//!
//! At most one task runs at a time on a dedicated worker thread and at most one
//! waits behind it. Enqueueing while the slot is taken replaces the waiting task,
//! so the newest frame always wins.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use thiserror::Error;

const RETIRED_HISTORY_CAPACITY: usize = 16;

pub trait BackgroundTask: Send + 'static {
    type Output: Send + 'static;

    fn run(self) -> Self::Output;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Done,
    Disposed,
    /// Evicted from the queued slot by a newer task before it ever ran.
    Replaced,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<O> {
    Completed(O),
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinishedTask<O> {
    pub id: TaskId,
    pub outcome: TaskOutcome<O>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub id: TaskId,
    pub replaced: Option<TaskId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PumpReport {
    pub disposed: Option<TaskId>,
    pub finished: Option<TaskId>,
    pub started: Option<TaskId>,
}

impl PumpReport {
    pub fn is_noop(&self) -> bool {
        self.disposed.is_none() && self.finished.is_none() && self.started.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskQueueStats {
    pub enqueued: u64,
    pub replaced: u64,
    pub started: u64,
    pub completed: u64,
    pub panicked: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskQueueError {
    #[error("failed to spawn background worker: {0}")]
    WorkerSpawn(String),
}

struct Job<T> {
    id: TaskId,
    task: T,
}

pub struct BackgroundTaskQueue<T: BackgroundTask> {
    next_task_id: u64,
    queued: Option<Job<T>>,
    running: Option<TaskId>,
    done: Option<FinishedTask<T::Output>>,
    retired: VecDeque<(TaskId, TaskState)>,
    stats: TaskQueueStats,
    job_sender: Option<Sender<Job<T>>>,
    result_receiver: Receiver<FinishedTask<T::Output>>,
    join_handle: Option<JoinHandle<()>>,
}

impl<T: BackgroundTask> BackgroundTaskQueue<T> {
    pub fn new() -> Result<Self, TaskQueueError> {
        let (job_sender, job_receiver) = crossbeam_channel::bounded::<Job<T>>(1);
        let (result_sender, result_receiver) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name("background_task".to_owned())
            .spawn(move || background_worker_loop(job_receiver, result_sender))
            .map_err(|error| TaskQueueError::WorkerSpawn(error.to_string()))?;

        Ok(Self {
            next_task_id: 0,
            queued: None,
            running: None,
            done: None,
            retired: VecDeque::with_capacity(RETIRED_HISTORY_CAPACITY),
            stats: TaskQueueStats::default(),
            job_sender: Some(job_sender),
            result_receiver,
            join_handle: Some(join_handle),
        })
    }

    pub fn stats(&self) -> TaskQueueStats {
        self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn has_queued(&self) -> bool {
        self.queued.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.queued.is_none() && self.running.is_none() && self.done.is_none()
    }

    /// Places `task` in the queued slot, replacing any task already waiting there.
    pub fn enqueue(&mut self, task: T) -> EnqueueOutcome {
        let id = TaskId(self.next_task_id);
        self.next_task_id = self
            .next_task_id
            .checked_add(1)
            .expect("background task id overflow");
        self.stats.enqueued = self
            .stats
            .enqueued
            .checked_add(1)
            .expect("background task enqueue count overflow");

        let replaced = self.queued.replace(Job { id, task }).map(|job| job.id);
        if let Some(replaced_id) = replaced {
            self.stats.replaced = self
                .stats
                .replaced
                .checked_add(1)
                .expect("background task replace count overflow");
            self.retire(replaced_id, TaskState::Replaced);
            tracing::debug!(task = replaced_id.0, by = id.0, "queued background task replaced");
        }
        EnqueueOutcome { id, replaced }
    }

    /// Advances the queue by one step without blocking.
    ///
    /// Disposes the task that finished on an earlier pump, collects the running
    /// task's result if it has finished, then starts the queued task if the
    /// worker is free.
    pub fn pump(&mut self) -> PumpReport {
        let mut report = PumpReport::default();

        if let Some(done) = self.done.take() {
            self.retire(done.id, TaskState::Disposed);
            report.disposed = Some(done.id);
        }

        if let Some(running_id) = self.running {
            match self.result_receiver.try_recv() {
                Ok(finished) => {
                    match &finished.outcome {
                        TaskOutcome::Completed(_) => {
                            self.stats.completed = self
                                .stats
                                .completed
                                .checked_add(1)
                                .expect("background task completion count overflow");
                        }
                        TaskOutcome::Panicked(message) => {
                            self.stats.panicked = self
                                .stats
                                .panicked
                                .checked_add(1)
                                .expect("background task panic count overflow");
                            tracing::warn!(task = finished.id.0, %message, "background task panicked");
                        }
                    }
                    report.finished = Some(finished.id);
                    self.running = None;
                    self.done = Some(finished);
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    tracing::error!(task = running_id.0, "background worker exited while a task was running");
                    self.running = None;
                    self.retire(running_id, TaskState::Disposed);
                }
            }
        }

        if self.running.is_none()
            && let Some(job) = self.queued.take()
        {
            report.started = self.start(job);
        }
        report
    }

    /// Takes the result of the task finished on the most recent pump and disposes it.
    pub fn take_finished(&mut self) -> Option<FinishedTask<T::Output>> {
        let finished = self.done.take()?;
        self.retire(finished.id, TaskState::Disposed);
        Some(finished)
    }

    pub fn state_of(&self, id: TaskId) -> Option<TaskState> {
        if self.queued.as_ref().is_some_and(|job| job.id == id) {
            return Some(TaskState::Queued);
        }
        if self.running == Some(id) {
            return Some(TaskState::Running);
        }
        if self.done.as_ref().is_some_and(|done| done.id == id) {
            return Some(TaskState::Done);
        }
        self.retired
            .iter()
            .find(|(retired_id, _)| *retired_id == id)
            .map(|(_, state)| *state)
    }

    fn start(&mut self, job: Job<T>) -> Option<TaskId> {
        let id = job.id;
        let Some(job_sender) = self.job_sender.as_ref() else {
            self.retire(id, TaskState::Disposed);
            return None;
        };
        match job_sender.try_send(job) {
            Ok(()) => {
                self.running = Some(id);
                self.stats.started = self
                    .stats
                    .started
                    .checked_add(1)
                    .expect("background task start count overflow");
                tracing::trace!(task = id.0, "background task started");
                Some(id)
            }
            Err(TrySendError::Full(job)) => {
                // The worker has not picked up the previous job yet; retry next pump.
                self.queued = Some(job);
                None
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::error!(task = id.0, "background worker is gone, dropping task");
                self.retire(id, TaskState::Disposed);
                None
            }
        }
    }

    fn retire(&mut self, id: TaskId, state: TaskState) {
        if self.retired.len() == RETIRED_HISTORY_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back((id, state));
    }
}

impl<T: BackgroundTask> Drop for BackgroundTaskQueue<T> {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loop once the current task returns.
        self.job_sender.take();
        if let Some(join_handle) = self.join_handle.take()
            && join_handle.join().is_err()
        {
            tracing::error!("background worker thread panicked");
        }
    }
}

fn background_worker_loop<T: BackgroundTask>(
    job_receiver: Receiver<Job<T>>,
    result_sender: Sender<FinishedTask<T::Output>>,
) {
    for Job { id, task } in job_receiver {
        let started = Instant::now();
        let outcome = match catch_unwind(AssertUnwindSafe(move || task.run())) {
            Ok(output) => TaskOutcome::Completed(output),
            Err(payload) => TaskOutcome::Panicked(panic_message(payload.as_ref())),
        };
        let finished = FinishedTask {
            id,
            outcome,
            elapsed: started.elapsed(),
        };
        if result_sender.send(finished).is_err() {
            return;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_owned()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Blocks until the test releases it, then returns its value.
    struct GatedTask {
        value: u32,
        gate: Receiver<()>,
        running: Arc<AtomicUsize>,
        max_running: Arc<AtomicUsize>,
    }

    impl BackgroundTask for GatedTask {
        type Output = u32;

        fn run(self) -> u32 {
            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now_running, Ordering::SeqCst);
            let _ = self.gate.recv();
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.value
        }
    }

    struct ImmediateTask(u32);

    impl BackgroundTask for ImmediateTask {
        type Output = u32;

        fn run(self) -> u32 {
            if self.0 == 0 {
                panic!("task zero always fails");
            }
            self.0 * 2
        }
    }

    fn pump_until_finished<T: BackgroundTask>(queue: &mut BackgroundTaskQueue<T>) -> PumpReport {
        for _ in 0..5_000 {
            let report = queue.pump();
            if report.finished.is_some() {
                return report;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("background task never finished");
    }

    #[test]
    fn pump_on_idle_queue_is_noop() {
        let mut queue = BackgroundTaskQueue::<ImmediateTask>::new().expect("queue");
        let report = queue.pump();
        assert!(report.is_noop());
        assert!(queue.is_idle());
        assert_eq!(queue.stats(), TaskQueueStats::default());
    }

    #[test]
    fn task_moves_through_queued_running_done_disposed() {
        let mut queue = BackgroundTaskQueue::<ImmediateTask>::new().expect("queue");
        let EnqueueOutcome { id, replaced } = queue.enqueue(ImmediateTask(21));
        assert_eq!(replaced, None);
        assert_eq!(queue.state_of(id), Some(TaskState::Queued));

        let report = queue.pump();
        assert_eq!(report.started, Some(id));
        assert_eq!(queue.state_of(id), Some(TaskState::Running));

        let report = pump_until_finished(&mut queue);
        assert_eq!(report.finished, Some(id));
        assert_eq!(queue.state_of(id), Some(TaskState::Done));

        let finished = queue.take_finished().expect("finished task");
        assert_eq!(finished.outcome, TaskOutcome::Completed(42));
        assert_eq!(queue.state_of(id), Some(TaskState::Disposed));
        assert!(queue.is_idle());
    }

    #[test]
    fn done_task_is_disposed_on_next_pump() {
        let mut queue = BackgroundTaskQueue::<ImmediateTask>::new().expect("queue");
        let id = queue.enqueue(ImmediateTask(1)).id;
        queue.pump();
        pump_until_finished(&mut queue);

        let report = queue.pump();
        assert_eq!(report.disposed, Some(id));
        assert_eq!(queue.state_of(id), Some(TaskState::Disposed));
    }

    #[test]
    fn newer_task_replaces_queued_one_and_only_one_runs() {
        let mut queue = BackgroundTaskQueue::<GatedTask>::new().expect("queue");
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let (release, gate) = crossbeam_channel::unbounded();
        let task = |value| GatedTask {
            value,
            gate: gate.clone(),
            running: Arc::clone(&running),
            max_running: Arc::clone(&max_running),
        };

        let first = queue.enqueue(task(1)).id;
        assert_eq!(queue.pump().started, Some(first));

        let second = queue.enqueue(task(2)).id;
        let third = queue.enqueue(task(3));
        assert_eq!(third.replaced, Some(second));
        assert_eq!(queue.state_of(second), Some(TaskState::Replaced));
        assert_eq!(queue.stats().replaced, 1);

        // Still running: the queued task must wait.
        assert_eq!(queue.pump().started, None);
        assert!(queue.is_running());
        assert!(queue.has_queued());

        release.send(()).expect("release first");
        let report = pump_until_finished(&mut queue);
        assert_eq!(report.finished, Some(first));
        assert_eq!(report.started, Some(third.id));

        release.send(()).expect("release third");
        let report = pump_until_finished(&mut queue);
        assert_eq!(report.finished, Some(third.id));
        let finished = queue.take_finished().expect("third result");
        assert_eq!(finished.outcome, TaskOutcome::Completed(3));

        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().started, 2);
    }

    #[test]
    fn panicking_task_is_reported_not_propagated() {
        let mut queue = BackgroundTaskQueue::<ImmediateTask>::new().expect("queue");
        queue.enqueue(ImmediateTask(0));
        queue.pump();
        pump_until_finished(&mut queue);

        let finished = queue.take_finished().expect("panicked task");
        assert_eq!(
            finished.outcome,
            TaskOutcome::Panicked("task zero always fails".to_owned())
        );
        assert_eq!(queue.stats().panicked, 1);

        // The worker survives and keeps running tasks.
        queue.enqueue(ImmediateTask(4));
        queue.pump();
        pump_until_finished(&mut queue);
        assert_eq!(
            queue.take_finished().expect("next task").outcome,
            TaskOutcome::Completed(8)
        );
    }
}
