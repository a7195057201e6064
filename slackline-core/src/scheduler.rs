// ABOUTME: Single-threaded cooperative scheduler driving suspended computations over DeferredResults
// ABOUTME: Tracks waiters by future id, reruns woken tasks to exhaustion, reports orphaned failures once

use crate::deferred::{clear_last_suspension, take_last_suspension, DeferredResult, FutureId};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::traits::ErrorReporter;
use futures::future::LocalBoxFuture;
use futures::task::{waker, ArcWake};
use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

// =============================================================================
// Ready queue and wakers
// =============================================================================

/// Task ids that have been woken and wait to be driven, in wake order.
#[derive(Default)]
struct ReadyQueue {
    queue: Mutex<VecDeque<TaskId>>,
}

impl ReadyQueue {
    fn push(&self, id: TaskId) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if !queue.contains(&id) {
            queue.push_back(id);
        }
    }

    fn pop(&self) -> Option<TaskId> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn remove(&self, id: TaskId) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|queued| *queued != id);
    }

    fn clear(&self) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

struct TaskWaker {
    id: TaskId,
    ready: Arc<ReadyQueue>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.ready.push(arc_self.id);
    }
}

// =============================================================================
// Shared scheduler state
// =============================================================================

struct TaskSlot {
    name: String,
    /// `None` while the task is being polled.
    future: Option<LocalBoxFuture<'static, ()>>,
    waker: Waker,
    waiting_on: Option<FutureId>,
    cancelled: bool,
}

/// Type-erased view of a failed task's result, used for orphan detection.
trait UnobservedFailure {
    fn unobserved_error(&self) -> Option<SyncError>;
}

impl<T> UnobservedFailure for DeferredResult<T> {
    fn unobserved_error(&self) -> Option<SyncError> {
        if self.error_read() {
            None
        } else {
            self.peek_error()
        }
    }
}

struct FailedTask {
    id: TaskId,
    name: String,
    result: Box<dyn UnobservedFailure>,
}

struct Shared {
    next_id: Cell<u64>,
    tasks: RefCell<HashMap<TaskId, TaskSlot>>,
    waiting: RefCell<HashMap<FutureId, Vec<TaskId>>>,
    ready: Arc<ReadyQueue>,
    failed: RefCell<Vec<FailedTask>>,
    reporter: Rc<dyn ErrorReporter>,
    driving: Cell<usize>,
    draining: Cell<bool>,
}

impl Shared {
    fn forget_waiter(&self, future: FutureId, task: TaskId) {
        let mut waiting = self.waiting.borrow_mut();
        if let Some(tasks) = waiting.get_mut(&future) {
            tasks.retain(|t| *t != task);
            if tasks.is_empty() {
                waiting.remove(&future);
            }
        }
    }

    /// Drop a task's suspended computation and every index entry pointing at it.
    fn release(&self, id: TaskId) {
        let removed = {
            let mut tasks = self.tasks.borrow_mut();
            match tasks.get_mut(&id) {
                Some(slot) if slot.future.is_none() => {
                    // Currently being polled; drive() drops it once the poll returns.
                    slot.cancelled = true;
                    None
                }
                Some(_) => tasks.remove(&id),
                None => None,
            }
        };
        if let Some(slot) = removed {
            if let Some(future) = slot.waiting_on {
                self.forget_waiter(future, id);
            }
            self.ready.remove(id);
            tracing::debug!(task = %id, name = %slot.name, "Released cancelled task");
        }
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Drives every asynchronous computation of one process (or one test).
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Rc<Shared>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.task_count())
            .field("waiting_futures", &self.shared.waiting.borrow().len())
            .finish()
    }
}

impl Scheduler {
    pub fn new(reporter: Rc<dyn ErrorReporter>) -> Self {
        Self {
            shared: Rc::new(Shared {
                next_id: Cell::new(1),
                tasks: RefCell::new(HashMap::new()),
                waiting: RefCell::new(HashMap::new()),
                ready: Arc::new(ReadyQueue::default()),
                failed: RefCell::new(Vec::new()),
                reporter,
                driving: Cell::new(0),
                draining: Cell::new(false),
            }),
        }
    }

    /// Launch `computation` and drive it to its first suspension point (or to
    /// completion) before returning.
    pub fn spawn<T, F>(&self, name: impl Into<String>, computation: F) -> Task<T>
    where
        T: 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        let task = self.register(name.into(), computation);
        self.drive(task.id);
        self.run_until_stalled();
        task
    }

    /// Like `spawn`, but nobody is expected to await the result: a failure is
    /// handed to the error reporter as soon as the task finishes.
    pub fn run_detached<T, F>(&self, name: impl Into<String>, computation: F) -> Task<T>
    where
        T: 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        let task = self.register(name.into(), computation);
        let reporter = Rc::clone(&self.shared.reporter);
        let label = task.name.clone();
        // Attached before the first poll so a synchronous failure is reported
        // here and not also as orphaned.
        task.result.add_completion_callback(move |done| {
            if let Ok(Some(error)) = done.error() {
                tracing::warn!(task = %label, error = %error, "Detached task failed");
                reporter.report(&format!("{label} failed with: {error}"), None);
            }
        });
        self.drive(task.id);
        self.run_until_stalled();
        task
    }

    /// Insert a task slot without polling it.
    fn register<T, F>(&self, name: String, computation: F) -> Task<T>
    where
        T: 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        let id = TaskId(self.shared.next_id.get());
        self.shared.next_id.set(id.0 + 1);
        let result = DeferredResult::new();

        let completion = result.clone();
        let scheduler = Rc::downgrade(&self.shared);
        let task_name = name.clone();
        let wrapped = async move {
            let outcome = computation.await;
            if completion.is_done() {
                return;
            }
            let failure = match &outcome {
                Err(error) if !error.is_cancelled() => {
                    tracing::debug!(task = %id, name = %task_name, error = %error, "Task failed");
                    true
                }
                _ => false,
            };
            let _ = completion.set_result(outcome);
            if failure {
                if let Some(shared) = scheduler.upgrade() {
                    shared.failed.borrow_mut().push(FailedTask {
                        id,
                        name: task_name,
                        result: Box::new(completion),
                    });
                }
            }
        };

        let task_waker = waker(Arc::new(TaskWaker {
            id,
            ready: Arc::clone(&self.shared.ready),
        }));
        self.shared.tasks.borrow_mut().insert(
            id,
            TaskSlot {
                name: name.clone(),
                future: Some(wrapped.boxed_local()),
                waker: task_waker,
                waiting_on: None,
                cancelled: false,
            },
        );
        tracing::trace!(task = %id, name = %name, "Spawned task");

        Task {
            id,
            name,
            result,
            scheduler: Rc::downgrade(&self.shared),
        }
    }

    /// Spawn every computation and return their DeferredResults in input order.
    pub fn spawn_all<T, F, I>(&self, name: &str, computations: I) -> Vec<DeferredResult<T>>
    where
        T: 'static,
        F: Future<Output = Result<T>> + 'static,
        I: IntoIterator<Item = F>,
    {
        computations
            .into_iter()
            .enumerate()
            .map(|(index, computation)| {
                self.spawn(format!("{name}[{index}]"), computation)
                    .result()
            })
            .collect()
    }

    /// Drive every woken task until no task can make progress.
    ///
    /// The host calls this after delivering an external completion. Calls made
    /// while a task is being polled are no-ops; the outermost call drains.
    pub fn run_until_stalled(&self) {
        if self.shared.driving.get() > 0 || self.shared.draining.replace(true) {
            return;
        }
        while let Some(id) = self.shared.ready.pop() {
            self.drive(id);
        }
        self.shared.draining.set(false);
        self.report_orphans();
    }

    /// Complete an external operation and process everything it unblocks.
    pub fn deliver(&self, complete: impl FnOnce()) {
        complete();
        self.run_until_stalled();
    }

    pub fn task_count(&self) -> usize {
        self.shared.tasks.borrow().len()
    }

    pub fn is_idle(&self) -> bool {
        self.shared.tasks.borrow().is_empty()
    }

    /// Tasks currently suspended on `future`, in registration order.
    pub fn waiters(&self, future: FutureId) -> Vec<TaskId> {
        self.shared
            .waiting
            .borrow()
            .get(&future)
            .cloned()
            .unwrap_or_default()
    }

    /// Names of every live task, for diagnostics.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .tasks
            .borrow()
            .values()
            .map(|slot| slot.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Drop every suspended computation. Used on shutdown.
    pub fn shutdown(&self) {
        let slots: Vec<TaskSlot> = {
            let mut tasks = self.shared.tasks.borrow_mut();
            tasks.drain().map(|(_, slot)| slot).collect()
        };
        self.shared.waiting.borrow_mut().clear();
        self.shared.ready.clear();
        self.shared.failed.borrow_mut().clear();
        tracing::info!(tasks = slots.len(), "Scheduler shut down");
        drop(slots);
    }

    fn drive(&self, id: TaskId) {
        let taken = {
            let mut tasks = self.shared.tasks.borrow_mut();
            let Some(slot) = tasks.get_mut(&id) else {
                return;
            };
            if slot.cancelled {
                return;
            }
            match slot.future.take() {
                Some(future) => (future, slot.waker.clone(), slot.waiting_on.take()),
                None => return,
            }
        };
        let (mut future, task_waker, waited) = taken;
        if let Some(waited) = waited {
            self.shared.forget_waiter(waited, id);
        }

        self.shared.driving.set(self.shared.driving.get() + 1);
        clear_last_suspension();
        let mut cx = Context::from_waker(&task_waker);
        let poll = future.as_mut().poll(&mut cx);
        let suspended_on = take_last_suspension();
        self.shared.driving.set(self.shared.driving.get() - 1);

        let keep = matches!(poll, Poll::Pending)
            && self
                .shared
                .tasks
                .borrow()
                .get(&id)
                .is_some_and(|slot| !slot.cancelled);
        if !keep {
            let removed = self.shared.tasks.borrow_mut().remove(&id);
            drop(removed);
            drop(future);
            return;
        }

        if let Some(slot) = self.shared.tasks.borrow_mut().get_mut(&id) {
            slot.future = Some(future);
            slot.waiting_on = suspended_on;
        }
        if let Some(waited) = suspended_on {
            self.shared
                .waiting
                .borrow_mut()
                .entry(waited)
                .or_default()
                .push(id);
        }
    }

    fn report_orphans(&self) {
        if !self.shared.tasks.borrow().is_empty() {
            return;
        }
        let failed = std::mem::take(&mut *self.shared.failed.borrow_mut());
        for task in failed {
            let Some(source) = task.result.unobserved_error() else {
                continue;
            };
            let error = SyncError::Orphaned {
                task: task.name,
                source: Box::new(source),
            };
            tracing::error!(task = %task.id, error = %error, "Task failure was never observed");
            metrics::record_orphaned_failure();
            self.shared.reporter.report(&error.to_string(), None);
        }
    }
}

// =============================================================================
// Task handle
// =============================================================================

/// A launched computation. Awaiting it yields the computation's outcome.
pub struct Task<T> {
    id: TaskId,
    name: String,
    result: DeferredResult<T>,
    scheduler: Weak<Shared>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            result: self.result.clone(),
            scheduler: Weak::clone(&self.scheduler),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("result", &self.result)
            .finish()
    }
}

impl<T> Task<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The DeferredResult this task completes.
    pub fn result(&self) -> DeferredResult<T> {
        self.result.clone()
    }

    pub fn is_done(&self) -> bool {
        self.result.is_done()
    }

    /// Cancel the task and drop its suspended computation.
    pub fn cancel(&self, msg: Option<String>) -> Result<()> {
        self.result.cancel(msg)?;
        if let Some(shared) = self.scheduler.upgrade() {
            shared.release(self.id);
        }
        Ok(())
    }
}

impl<T: Clone> Future for Task<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result).poll(cx)
    }
}

// =============================================================================
// Combinators
// =============================================================================

/// All values in input order, or the first error as soon as any operation fails.
pub fn gather<T: Clone + 'static>(operations: Vec<DeferredResult<T>>) -> DeferredResult<Vec<T>> {
    let aggregate = DeferredResult::new();
    let total = operations.len();
    if total == 0 {
        let _ = aggregate.set_value(Vec::new());
        return aggregate;
    }
    let values: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new(vec![None; total]));
    let remaining = Rc::new(Cell::new(total));
    for (index, operation) in operations.into_iter().enumerate() {
        let aggregate = aggregate.clone();
        let values = Rc::clone(&values);
        let remaining = Rc::clone(&remaining);
        operation.add_completion_callback(move |done| {
            if aggregate.is_done() {
                return;
            }
            match done.result() {
                Ok(value) => {
                    values.borrow_mut()[index] = Some(value);
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        let collected = values.borrow_mut().drain(..).flatten().collect();
                        let _ = aggregate.set_value(collected);
                    }
                }
                Err(error) => {
                    let _ = aggregate.set_error(error);
                }
            }
        });
    }
    aggregate
}

/// Every outcome in input order, waiting for all operations to settle.
pub fn gather_all<T: Clone + 'static>(
    operations: Vec<DeferredResult<T>>,
) -> DeferredResult<Vec<Result<T>>> {
    let aggregate = DeferredResult::new();
    let total = operations.len();
    if total == 0 {
        let _ = aggregate.set_value(Vec::new());
        return aggregate;
    }
    let outcomes: Rc<RefCell<Vec<Option<Result<T>>>>> = Rc::new(RefCell::new(vec![None; total]));
    let remaining = Rc::new(Cell::new(total));
    for (index, operation) in operations.into_iter().enumerate() {
        let aggregate = aggregate.clone();
        let outcomes = Rc::clone(&outcomes);
        let remaining = Rc::clone(&remaining);
        operation.add_completion_callback(move |done| {
            outcomes.borrow_mut()[index] = Some(done.result());
            remaining.set(remaining.get() - 1);
            if remaining.get() == 0 {
                let collected = outcomes.borrow_mut().drain(..).flatten().collect();
                let _ = aggregate.set_value(collected);
            }
        });
    }
    aggregate
}
