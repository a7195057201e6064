// ABOUTME: Single-assignment result cell for one pending operation (value, error, or cancellation)
// ABOUTME: Awaitable from scheduler tasks; completion callbacks fire synchronously in registration order

use crate::error::{Result, SyncError};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use uuid::Uuid;

/// Opaque identity of a DeferredResult. Tasks are indexed by the id they wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FutureId(Uuid);

impl FutureId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FutureId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

thread_local! {
    // The id of the last DeferredResult that returned Pending on this thread.
    // The scheduler reads it right after polling a task to learn what the task waits on.
    static LAST_SUSPENSION: Cell<Option<FutureId>> = const { Cell::new(None) };
}

pub(crate) fn clear_last_suspension() {
    LAST_SUSPENSION.with(|s| s.set(None));
}

pub(crate) fn take_last_suspension() -> Option<FutureId> {
    LAST_SUSPENSION.with(|s| s.take())
}

type Callback<T> = Box<dyn FnOnce(&DeferredResult<T>)>;

enum State<T> {
    Pending,
    Cancelled(Option<String>),
    Finished(Result<T>),
}

impl<T> State<T> {
    fn name(&self) -> &'static str {
        match self {
            State::Pending => "PENDING",
            State::Cancelled(_) => "CANCELLED",
            State::Finished(_) => "FINISHED",
        }
    }
}

struct Inner<T> {
    id: FutureId,
    state: State<T>,
    callbacks: Vec<Callback<T>>,
    wakers: Vec<Waker>,
    error_read: bool,
}

/// The eventual outcome of one pending operation.
///
/// Cloning yields another handle to the same cell. Transitions are one-way:
/// `Pending -> Cancelled` or `Pending -> Finished(value | error)`.
pub struct DeferredResult<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for DeferredResult<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for DeferredResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("DeferredResult")
            .field("id", &inner.id)
            .field("state", &inner.state.name())
            .finish()
    }
}

impl<T> Default for DeferredResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeferredResult<T> {
    pub fn new() -> Self {
        Self::with_id(FutureId::new())
    }

    pub fn with_id(id: FutureId) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                id,
                state: State::Pending,
                callbacks: Vec::new(),
                wakers: Vec::new(),
                error_read: false,
            })),
        }
    }

    /// A DeferredResult that is already finished with `value`.
    pub fn resolved(value: T) -> Self {
        let deferred = Self::new();
        deferred.inner.borrow_mut().state = State::Finished(Ok(value));
        deferred
    }

    /// A DeferredResult that is already finished with `error`.
    pub fn failed(error: SyncError) -> Self {
        let deferred = Self::new();
        deferred.inner.borrow_mut().state = State::Finished(Err(error));
        deferred
    }

    pub fn id(&self) -> FutureId {
        self.inner.borrow().id
    }

    pub fn is_done(&self) -> bool {
        !matches!(self.inner.borrow().state, State::Pending)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.borrow().state, State::Cancelled(_))
    }

    /// Finished with a value (not an error, not cancelled).
    pub fn is_ok(&self) -> bool {
        matches!(self.inner.borrow().state, State::Finished(Ok(_)))
    }

    /// Whether anyone has read the error through `error()` or `result()`.
    pub fn error_read(&self) -> bool {
        self.inner.borrow().error_read
    }

    pub fn same_as(&self, other: &DeferredResult<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_value(&self, value: T) -> Result<()> {
        self.complete(State::Finished(Ok(value)))
    }

    pub fn set_error(&self, error: SyncError) -> Result<()> {
        self.complete(State::Finished(Err(error)))
    }

    pub fn set_result(&self, result: Result<T>) -> Result<()> {
        self.complete(State::Finished(result))
    }

    /// Cancel the pending operation. Fails with `InvalidState` if already done.
    pub fn cancel(&self, msg: Option<String>) -> Result<()> {
        self.complete(State::Cancelled(msg))
    }

    /// Register `callback` to run once on completion, or right now if already done.
    pub fn add_completion_callback(&self, callback: impl FnOnce(&DeferredResult<T>) + 'static) {
        if self.is_done() {
            callback(self);
        } else {
            self.inner.borrow_mut().callbacks.push(Box::new(callback));
        }
    }

    /// The stored error, if finished with one.
    ///
    /// Reading a cancelled instance yields the synthesized cancellation error;
    /// reading a pending one is an `InvalidState`.
    pub fn error(&self) -> Result<Option<SyncError>> {
        let mut inner = self.inner.borrow_mut();
        match &inner.state {
            State::Pending => Err(SyncError::invalid_state("error is not set")),
            State::Cancelled(msg) => Err(SyncError::Cancelled(msg.clone())),
            State::Finished(outcome) => {
                let error = outcome.as_ref().err().cloned();
                inner.error_read = true;
                Ok(error)
            }
        }
    }

    /// The stored error without marking it as read. `None` when cancelled or pending.
    pub(crate) fn peek_error(&self) -> Option<SyncError> {
        match &self.inner.borrow().state {
            State::Finished(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    fn complete(&self, next: State<T>) -> Result<()> {
        let (callbacks, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                return Err(SyncError::invalid_state(format!(
                    "{}: DeferredResult('{}')",
                    inner.state.name(),
                    inner.id
                )));
            }
            inner.state = next;
            (
                std::mem::take(&mut inner.callbacks),
                std::mem::take(&mut inner.wakers),
            )
        };
        for callback in callbacks {
            callback(self);
        }
        for waker in wakers {
            waker.wake();
        }
        Ok(())
    }
}

impl<T: Clone> DeferredResult<T> {
    /// The final outcome. Errors (including cancellation) are returned as `Err`.
    pub fn result(&self) -> Result<T> {
        if let Some(error) = self.error()? {
            return Err(error);
        }
        match &self.inner.borrow().state {
            State::Finished(Ok(value)) => Ok(value.clone()),
            _ => Err(SyncError::invalid_state("result is not set")),
        }
    }
}

impl<T: Clone> Future for DeferredResult<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.is_done() {
            return Poll::Ready(self.result());
        }
        let id = {
            let mut inner = self.inner.borrow_mut();
            if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                inner.wakers.push(cx.waker().clone());
            }
            inner.id
        };
        LAST_SUSPENSION.with(|s| s.set(Some(id)));
        Poll::Pending
    }
}
