// ABOUTME: Cooperative single-threaded scheduler and chat workspace sync engine
// ABOUTME: All I/O goes through collaborator traits so hosts and tests drive completions

pub mod api;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod deferred;
pub mod error;
pub mod events;
pub mod hashes;
pub mod history;
pub mod message;
pub mod metrics;
pub mod paths;
pub mod scheduler;
pub mod testing;
pub mod timestamp;
pub mod traits;

pub use config::{Config, HistoryConfig, HttpConfig, WorkspaceConfig};
pub use connection::{ConnectionState, Identity, Workspace};
pub use conversation::{Conversation, ConversationInfo, ConversationKind};
pub use deferred::{DeferredResult, FutureId};
pub use error::{Result, SyncError};
pub use history::ConversationSync;
pub use message::{Message, MessagePayload};
pub use scheduler::{gather, gather_all, Scheduler, Task, TaskId};

// Re-export collaborator seams for hosts
pub use traits::{
    Collaborators, ErrorReporter, HttpApi, MessageView, Params, Renderer, StreamHandle,
    StreamTransport, Timer,
};
pub use timestamp::ConversationTimestamp;
