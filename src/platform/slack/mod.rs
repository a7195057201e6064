// ABOUTME: Slack Web API and RTM websocket adapters for the sync core
// ABOUTME: Both post their completions back to the host event channel

pub mod api;
pub mod socket;

pub use api::{SlackHttp, API_BASE_URL};
pub use socket::SocketTransport;
