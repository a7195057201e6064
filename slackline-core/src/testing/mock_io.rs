// ABOUTME: Recording mocks for the HTTP, stream transport and timer collaborators
// ABOUTME: Requests stay pending until the test responds, unless a response was scripted up front

use crate::deferred::DeferredResult;
use crate::error::{Result, SyncError};
use crate::traits::{HttpApi, Params, StreamHandle, StreamTransport, Timer};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

// =============================================================================
// HTTP
// =============================================================================

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub params: Params,
    pub timeout: Duration,
    pub result: DeferredResult<Value>,
}

impl RecordedRequest {
    pub fn is_pending(&self) -> bool {
        !self.result.is_done()
    }
}

/// Records every request. Scripted responses are returned already finished;
/// everything else stays pending until `respond` / `respond_error`.
#[derive(Default)]
pub struct MockHttp {
    requests: RefCell<Vec<RecordedRequest>>,
    scripted: RefCell<HashMap<String, VecDeque<Result<Value>>>>,
}

impl MockHttp {
    /// Queue a response for the next call of `method`.
    pub fn script(&self, method: &str, response: Value) {
        self.scripted
            .borrow_mut()
            .entry(method.to_string())
            .or_default()
            .push_back(Ok(response));
    }

    pub fn script_error(&self, method: &str, error: SyncError) {
        self.scripted
            .borrow_mut()
            .entry(method.to_string())
            .or_default()
            .push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.borrow().clone()
    }

    /// Every request for `method`, oldest first.
    pub fn requests_for(&self, method: &str) -> Vec<RecordedRequest> {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    pub fn calls(&self, method: &str) -> usize {
        self.requests.borrow().iter().filter(|r| r.method == method).count()
    }

    /// Unanswered requests for `method`, oldest first.
    pub fn pending(&self, method: &str) -> Vec<RecordedRequest> {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r.method == method && r.is_pending())
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.requests.borrow().iter().filter(|r| r.is_pending()).count()
    }

    /// Answer the oldest pending request for `method`. Returns false if there is none.
    pub fn respond(&self, method: &str, response: Value) -> bool {
        self.complete(method, Ok(response))
    }

    pub fn respond_error(&self, method: &str, error: SyncError) -> bool {
        self.complete(method, Err(error))
    }

    fn complete(&self, method: &str, outcome: Result<Value>) -> bool {
        let target = self
            .requests
            .borrow()
            .iter()
            .find(|r| r.method == method && r.is_pending())
            .map(|r| r.result.clone());
        match target {
            Some(result) => result.set_result(outcome).is_ok(),
            None => false,
        }
    }
}

impl HttpApi for MockHttp {
    fn request(&self, method: &str, params: &Params, timeout: Duration) -> DeferredResult<Value> {
        let scripted = self
            .scripted
            .borrow_mut()
            .get_mut(method)
            .and_then(VecDeque::pop_front);
        let result = match scripted {
            Some(Ok(value)) => DeferredResult::resolved(value),
            Some(Err(error)) => DeferredResult::failed(error),
            None => DeferredResult::new(),
        };
        self.requests.borrow_mut().push(RecordedRequest {
            method: method.to_string(),
            params: params.clone(),
            timeout,
            result: result.clone(),
        });
        result
    }
}

// =============================================================================
// Stream transport
// =============================================================================

#[derive(Default)]
pub struct MockTransport {
    next_handle: Cell<u64>,
    opens: RefCell<Vec<(String, DeferredResult<StreamHandle>)>>,
    sent: RefCell<Vec<(StreamHandle, String)>>,
    closed: RefCell<Vec<StreamHandle>>,
    fail_sends: Cell<bool>,
}

impl MockTransport {
    /// Every url passed to `open`, oldest first.
    pub fn opened_urls(&self) -> Vec<String> {
        self.opens.borrow().iter().map(|(url, _)| url.clone()).collect()
    }

    pub fn pending_opens(&self) -> usize {
        self.opens.borrow().iter().filter(|(_, d)| !d.is_done()).count()
    }

    /// Complete the oldest pending open with a fresh handle.
    pub fn accept_open(&self) -> Option<StreamHandle> {
        let pending = self.oldest_pending()?;
        let handle = StreamHandle(self.next_handle.get() + 1);
        self.next_handle.set(handle.0);
        pending.set_value(handle).ok()?;
        Some(handle)
    }

    /// Fail the oldest pending open.
    pub fn reject_open(&self, error: SyncError) -> bool {
        match self.oldest_pending() {
            Some(pending) => pending.set_error(error).is_ok(),
            None => false,
        }
    }

    pub fn sent(&self) -> Vec<(StreamHandle, String)> {
        self.sent.borrow().clone()
    }

    /// Sent payloads decoded as JSON; undecodable payloads are skipped.
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent
            .borrow()
            .iter()
            .filter_map(|(_, payload)| serde_json::from_str(payload).ok())
            .collect()
    }

    pub fn closed(&self) -> Vec<StreamHandle> {
        self.closed.borrow().clone()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.set(fail);
    }

    fn oldest_pending(&self) -> Option<DeferredResult<StreamHandle>> {
        self.opens
            .borrow()
            .iter()
            .find(|(_, d)| !d.is_done())
            .map(|(_, d)| d.clone())
    }
}

impl StreamTransport for MockTransport {
    fn open(&self, url: &str) -> DeferredResult<StreamHandle> {
        let result = DeferredResult::new();
        self.opens.borrow_mut().push((url.to_string(), result.clone()));
        result
    }

    fn send(&self, handle: StreamHandle, payload: &str) -> Result<()> {
        if self.fail_sends.get() {
            return Err(SyncError::Http {
                url: handle.to_string(),
                status: None,
                return_code: Some(-1),
                error: "send failed".to_string(),
            });
        }
        self.sent.borrow_mut().push((handle, payload.to_string()));
        Ok(())
    }

    fn close(&self, handle: StreamHandle) {
        self.closed.borrow_mut().push(handle);
    }
}

// =============================================================================
// Timer
// =============================================================================

/// A clock that only moves when the test advances it.
pub struct ManualTimer {
    now: Cell<Instant>,
    sleepers: RefCell<Vec<(Instant, DeferredResult<()>)>>,
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self {
            now: Cell::new(Instant::now()),
            sleepers: RefCell::new(Vec::new()),
        }
    }
}

impl ManualTimer {
    /// Move the clock forward and wake every sleeper whose deadline passed.
    pub fn advance(&self, by: Duration) {
        let now = self.now.get() + by;
        self.now.set(now);
        let due: Vec<DeferredResult<()>> = {
            let mut sleepers = self.sleepers.borrow_mut();
            let (due, waiting): (Vec<_>, Vec<_>) =
                sleepers.drain(..).partition(|(deadline, _)| *deadline <= now);
            *sleepers = waiting;
            due.into_iter().map(|(_, d)| d).collect()
        };
        for sleeper in due {
            let _ = sleeper.set_value(());
        }
    }

    pub fn pending_sleeps(&self) -> usize {
        self.sleepers.borrow().iter().filter(|(_, d)| !d.is_done()).count()
    }

    /// Requested durations of the sleeps still waiting, measured from now.
    pub fn remaining(&self) -> Vec<Duration> {
        let now = self.now.get();
        self.sleepers
            .borrow()
            .iter()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
            .collect()
    }
}

impl Timer for ManualTimer {
    fn sleep(&self, duration: Duration) -> DeferredResult<()> {
        if duration.is_zero() {
            return DeferredResult::resolved(());
        }
        let result = DeferredResult::new();
        self.sleepers
            .borrow_mut()
            .push((self.now.get() + duration, result.clone()));
        result
    }

    fn now(&self) -> Instant {
        self.now.get()
    }
}
