// ABOUTME: Collaborator seams the core calls into: HTTP, stream transport, timers, errors, rendering
// ABOUTME: Every I/O capability hands back a DeferredResult completed later by the host event loop

use crate::deferred::DeferredResult;
use crate::error::Result;
use crate::message::Message;
use crate::timestamp::ConversationTimestamp;
use serde_json::{Map, Value};
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Form parameters for one remote method call.
pub type Params = Map<String, Value>;

// =============================================================================
// I/O collaborators
// =============================================================================

/// Request/response access to the rate-limited remote API.
///
/// Retrying on transient failures and on HTTP 429 (honoring `Retry-After`)
/// is the implementor's job. The core only supplies the timeout and awaits
/// the returned DeferredResult, which carries the decoded JSON body or a
/// `SyncError::Http`.
pub trait HttpApi {
    fn request(&self, method: &str, params: &Params, timeout: Duration) -> DeferredResult<Value>;
}

/// Handle for one open stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub u64);

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Persistent streaming connection (framing and TLS live behind this).
///
/// Inbound frames and close notifications are not returned from here; the
/// host delivers them to `Workspace::receive_frame` / `Workspace::stream_closed`.
pub trait StreamTransport {
    fn open(&self, url: &str) -> DeferredResult<StreamHandle>;
    fn send(&self, handle: StreamHandle, payload: &str) -> Result<()>;
    fn close(&self, handle: StreamHandle);
}

/// Timers and the clock used for liveness checks.
pub trait Timer {
    /// A DeferredResult that finishes once `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> DeferredResult<()>;
    fn now(&self) -> Instant;
}

// =============================================================================
// Output collaborators
// =============================================================================

/// Sink for orphaned task failures and protocol errors.
pub trait ErrorReporter {
    fn report(&self, message: &str, data: Option<&Value>);
}

/// Turns a finalized message into display text.
pub trait Renderer {
    /// `thread_hash` is the parent's hash when `message` is a thread reply.
    fn render(&self, message: &Message, hash: &str, thread_hash: Option<&str>) -> String;
}

/// Where rendered lines and conversation lifecycle changes go.
pub trait MessageView {
    /// A message became visible for the first time.
    fn show(&self, conversation_id: &str, ts: &ConversationTimestamp, line: &str);

    /// An already visible message changed (edit, reaction, hash bump, delete).
    fn refresh(&self, conversation_id: &str, ts: &ConversationTimestamp, line: &str);

    fn conversation_opened(&self, _conversation_id: &str, _name: &str) {}

    fn conversation_closed(&self, _conversation_id: &str) {}

    fn hotlist_changed(&self, _conversation_id: &str, _unseen: usize) {}

    /// Short user-facing diagnostic about a workspace (connected, failed, ...).
    fn status(&self, _workspace: &str, _message: &str) {}
}

/// All collaborators one workspace needs, bundled for injection.
#[derive(Clone)]
pub struct Collaborators {
    pub http: Rc<dyn HttpApi>,
    pub transport: Rc<dyn StreamTransport>,
    pub timer: Rc<dyn Timer>,
    pub reporter: Rc<dyn ErrorReporter>,
    pub renderer: Rc<dyn Renderer>,
    pub view: Rc<dyn MessageView>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
