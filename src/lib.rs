// ABOUTME: Root library for the slackline terminal client
// ABOUTME: Tokio host, Slack adapters and terminal view around the slackline-core sync engine

pub mod host;
pub mod platform;
pub mod view;

// Re-export platform-agnostic modules from slackline-core
pub use slackline_core::config;
pub use slackline_core::metrics;
pub use slackline_core::paths;

pub use host::{Backoff, Host, HostEvent, HostSender, LogReporter, TokioTimer};
pub use view::{TerminalRenderer, TerminalView};
