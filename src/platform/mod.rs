// ABOUTME: Remote chat platforms the host can talk to
// ABOUTME: Each platform supplies the HTTP and stream collaborators for the sync core

pub mod slack;

pub use slack::{SlackHttp, SocketTransport};
