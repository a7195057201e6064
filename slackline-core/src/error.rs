// ABOUTME: Error taxonomy shared by the scheduler and the sync engine
// ABOUTME: Cloneable so a single failure can be stored in and re-read from a DeferredResult

use serde_json::Value;
use thiserror::Error;

/// Remote error codes that mean "the thing you asked about is gone".
const NOT_FOUND_CODES: &[&str] = &[
    "channel_not_found",
    "user_not_found",
    "bot_not_found",
    "item_not_found",
    "thread_not_found",
];

/// Every failure the core can produce or carry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// A DeferredResult was completed twice, or read before completion.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Cooperative cancellation. Never reported as a failure.
    #[error("cancelled{}", .0.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Cancelled(Option<String>),

    /// The remote API answered with `ok: false`.
    #[error("remote method {method} failed with '{error}'")]
    Remote {
        method: String,
        error: String,
        request: Option<Value>,
    },

    /// A referenced entity no longer exists on the remote side.
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// The HTTP collaborator gave up on a request.
    #[error("http request to {url} failed (status {status:?}, return code {return_code:?}): {error}")]
    Http {
        url: String,
        status: Option<u16>,
        return_code: Option<i32>,
        error: String,
    },

    /// An inbound stream event could not be handled.
    #[error("failed handling stream event '{event_type}': {reason}")]
    Protocol {
        event_type: String,
        reason: String,
        event: Option<Value>,
    },

    /// A workspace-level failure (bad response shape, unusable connection).
    #[error("workspace {workspace}: {error}")]
    Workspace { workspace: String, error: String },

    /// A task failed and nobody ever looked at the error.
    #[error("task '{task}' failed without being awaited: {source}")]
    Orphaned {
        task: String,
        source: Box<SyncError>,
    },
}

impl SyncError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn remote(method: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Remote {
            method: method.into(),
            error: error.into(),
            request: None,
        }
    }

    pub fn protocol(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            event_type: event_type.into(),
            reason: reason.into(),
            event: None,
        }
    }

    pub fn workspace(workspace: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Workspace {
            workspace: workspace.into(),
            error: error.into(),
        }
    }

    /// Attach the offending request parameters to a `Remote` error.
    pub fn with_request(self, params: Value) -> Self {
        match self {
            Self::Remote { method, error, .. } => Self::Remote {
                method,
                error,
                request: Some(params),
            },
            other => other,
        }
    }

    /// Attach the raw event to a `Protocol` error.
    pub fn with_event(self, raw: Value) -> Self {
        match self {
            Self::Protocol {
                event_type, reason, ..
            } => Self::Protocol {
                event_type,
                reason,
                event: Some(raw),
            },
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Soft misses: callers treat these as "absent", not as failures.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Remote { error, .. } => NOT_FOUND_CODES.contains(&error.as_str()),
            _ => false,
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidState(_) => "invalid_state",
            Self::Cancelled(_) => "cancelled",
            Self::Remote { .. } => "remote",
            Self::NotFound { .. } => "not_found",
            Self::Http { .. } => "http",
            Self::Protocol { .. } => "protocol",
            Self::Workspace { .. } => "workspace",
            Self::Orphaned { .. } => "orphaned",
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
