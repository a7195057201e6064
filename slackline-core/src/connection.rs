// ABOUTME: Workspace connection state machine: connect, resume, handshake, dispatch, heartbeat, reconnect
// ABOUTME: Owns the workspace's conversations and routes each decoded stream event to exactly one handler

use crate::api::{parse_id_list, RtmConnect, SlackApi};
use crate::config::{HistoryConfig, WorkspaceConfig};
use crate::conversation::Conversation;
use crate::error::{Result, SyncError};
use crate::events::{decode_event, InboundEvent, MessageChange, StreamEvent};
use crate::history::ConversationSync;
use crate::metrics;
use crate::scheduler::{gather, Scheduler, Task};
use crate::timestamp::ConversationTimestamp;
use crate::traits::{Collaborators, StreamHandle};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

/// Conversation kinds listed on initialization.
const CONVERSATION_TYPES: &str = "public_channel,private_channel,mpim,im";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Who we are on this workspace, from `rtm.connect`.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: String,
    pub user_name: Option<String>,
    pub team_id: String,
    pub team_domain: Option<String>,
}

impl From<&RtmConnect> for Identity {
    fn from(rtm: &RtmConnect) -> Self {
        Self {
            user_id: rtm.self_user.id.clone(),
            user_name: rtm.self_user.name.clone(),
            team_id: rtm.team.id.clone(),
            team_domain: rtm.team.domain.clone(),
        }
    }
}

struct WorkspaceInner {
    config: WorkspaceConfig,
    history: HistoryConfig,
    api: SlackApi,
    scheduler: Scheduler,
    collaborators: Collaborators,
    state: Cell<ConnectionState>,
    /// No handshake has completed yet; the first one always fully initializes.
    initial_connect: Cell<bool>,
    stream: Cell<Option<StreamHandle>>,
    resume_url: RefCell<Option<String>>,
    connect_task: RefCell<Option<Task<()>>>,
    /// The hello handler, while it is still initializing or backfilling.
    handshake_task: RefCell<Option<Task<()>>>,
    identity: RefCell<Option<Identity>>,
    conversations: RefCell<HashMap<String, ConversationSync>>,
    muted: RefCell<HashSet<String>>,
    last_received: Cell<Instant>,
    next_ping_id: Cell<u64>,
}

/// One remote workspace and its streaming connection.
///
/// Cloning yields another handle to the same workspace.
#[derive(Clone)]
pub struct Workspace {
    inner: Rc<WorkspaceInner>,
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("conversations", &self.inner.conversations.borrow().len())
            .finish()
    }
}

impl Workspace {
    pub fn new(
        config: WorkspaceConfig,
        history: HistoryConfig,
        scheduler: Scheduler,
        collaborators: Collaborators,
    ) -> Self {
        let api = SlackApi::new(
            Rc::clone(&collaborators.http),
            config.name.clone(),
            config.network_timeout(),
            history.history_page_limit,
        );
        let now = collaborators.timer.now();
        Self {
            inner: Rc::new(WorkspaceInner {
                config,
                history,
                api,
                scheduler,
                collaborators,
                state: Cell::new(ConnectionState::Disconnected),
                initial_connect: Cell::new(true),
                stream: Cell::new(None),
                resume_url: RefCell::new(None),
                connect_task: RefCell::new(None),
                handshake_task: RefCell::new(None),
                identity: RefCell::new(None),
                conversations: RefCell::new(HashMap::new()),
                muted: RefCell::new(HashSet::new()),
                last_received: Cell::new(now),
                next_ping_id: Cell::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.identity.borrow().clone()
    }

    pub fn stream(&self) -> Option<StreamHandle> {
        self.inner.stream.get()
    }

    pub fn resume_url(&self) -> Option<String> {
        self.inner.resume_url.borrow().clone()
    }

    pub fn conversation(&self, id: &str) -> Option<ConversationSync> {
        self.inner.conversations.borrow().get(id).cloned()
    }

    /// Open conversations, sorted by id.
    pub fn open_conversations(&self) -> Vec<ConversationSync> {
        let mut open: Vec<ConversationSync> = self
            .inner
            .conversations
            .borrow()
            .values()
            .filter(|c| c.with(Conversation::is_open))
            .cloned()
            .collect();
        open.sort_by_key(ConversationSync::id);
        open
    }

    fn open_conversation(&self, id: &str) -> Option<ConversationSync> {
        self.conversation(id).filter(|c| c.with(Conversation::is_open))
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.inner.state.replace(next);
        if previous != next {
            tracing::info!(workspace = %self.name(), from = %previous, to = %next, "Connection state changed");
        }
    }

    fn status(&self, message: &str) {
        self.inner.collaborators.view.status(self.name(), message);
    }

    // =========================================================================
    // Connect / disconnect
    // =========================================================================

    /// Start connecting. A no-op while connected or already connecting.
    pub fn connect(&self) {
        match self.state() {
            ConnectionState::Connected => {
                tracing::debug!(workspace = %self.name(), "Already connected");
                self.status(&format!("Already connected to workspace {}", self.name()));
                return;
            }
            ConnectionState::Connecting => {
                tracing::debug!(workspace = %self.name(), "Connect already in progress");
                self.status(&format!("Already connecting to workspace {}", self.name()));
                return;
            }
            ConnectionState::Disconnected => {}
        }

        self.set_state(ConnectionState::Connecting);
        self.status(&format!("Connecting to workspace {}", self.name()));
        let this = self.clone();
        let task = self
            .inner
            .scheduler
            .run_detached(format!("connect {}", self.name()), async move { this.run_connect().await });
        *self.inner.connect_task.borrow_mut() = Some(task);
    }

    /// Tear down and connect again, through the resume URL when one is held.
    pub fn reconnect(&self) {
        metrics::record_reconnect(self.name());
        tracing::info!(workspace = %self.name(), "Reconnecting");
        self.disconnect();
        self.connect();
    }

    pub fn disconnect(&self) {
        let previous = self.state();
        self.set_state(ConnectionState::Disconnected);

        let pending = [
            self.inner.connect_task.borrow_mut().take(),
            self.inner.handshake_task.borrow_mut().take(),
        ];
        for task in pending.into_iter().flatten().filter(|t| !t.is_done()) {
            let _ = task.cancel(Some("disconnecting".to_string()));
        }
        if let Some(handle) = self.inner.stream.take() {
            self.inner.collaborators.transport.close(handle);
        }
        let conversations: Vec<ConversationSync> =
            self.inner.conversations.borrow().values().cloned().collect();
        for conversation in conversations {
            conversation.mark_disconnected();
        }

        if previous != ConnectionState::Disconnected {
            self.status(&format!("Disconnected from workspace {}", self.name()));
        }
    }

    /// The host saw the stream end.
    pub fn stream_closed(&self, handle: StreamHandle) {
        if self.inner.stream.get() != Some(handle) {
            tracing::debug!(workspace = %self.name(), stream = %handle, "Ignoring close of stale stream");
            return;
        }
        tracing::warn!(workspace = %self.name(), stream = %handle, "Stream closed by remote");
        self.inner.stream.set(None);
        self.reconnect();
    }

    async fn run_connect(&self) -> Result<()> {
        match self.connect_stream().await {
            Err(error) if !error.is_cancelled() => {
                tracing::error!(workspace = %self.name(), error = %error, "Failed to connect");
                self.set_state(ConnectionState::Disconnected);
                self.status(&format!("Failed connecting to workspace {}: {}", self.name(), error));
                Ok(())
            }
            other => other,
        }
    }

    async fn connect_stream(&self) -> Result<()> {
        let resume = self.inner.resume_url.borrow().clone();
        if let Some(url) = resume {
            match self.inner.collaborators.transport.open(&url).await {
                Ok(handle) => {
                    tracing::info!(workspace = %self.name(), stream = %handle, "Resumed stream");
                    self.attach(handle);
                    return Ok(());
                }
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    tracing::warn!(
                        workspace = %self.name(),
                        error = %error,
                        "Resume URL rejected, falling back to full connect"
                    );
                    metrics::record_resume_fallback(self.name());
                    self.inner.resume_url.borrow_mut().take();
                }
            }
        }

        let rtm = self.inner.api.rtm_connect().await?;
        tracing::debug!(workspace = %self.name(), user = %rtm.self_user.id, team = %rtm.team.id, "Resolved identity");
        *self.inner.identity.borrow_mut() = Some(Identity::from(&rtm));
        let handle = self.inner.collaborators.transport.open(&rtm.url).await?;
        self.attach(handle);
        Ok(())
    }

    fn attach(&self, handle: StreamHandle) {
        self.inner.stream.set(Some(handle));
        self.inner.last_received.set(self.inner.collaborators.timer.now());
        tracing::debug!(workspace = %self.name(), stream = %handle, "Stream open, waiting for hello");
    }

    // =========================================================================
    // Heartbeat
    // =========================================================================

    /// Send a ping, or reconnect if nothing arrived within the network timeout.
    ///
    /// Works on any attached stream, so a server that goes quiet before
    /// completing the handshake is caught as well.
    pub fn ping(&self) -> Result<()> {
        let handle = match (self.state(), self.inner.stream.get()) {
            (ConnectionState::Disconnected, _) | (_, None) => {
                return Err(SyncError::workspace(self.name(), "Can't ping when not connected"))
            }
            (_, Some(handle)) => handle,
        };

        let now = self.inner.collaborators.timer.now();
        let silent_for = now.saturating_duration_since(self.inner.last_received.get());
        if silent_for > self.inner.config.network_timeout() {
            tracing::warn!(
                workspace = %self.name(),
                silent_secs = silent_for.as_secs(),
                "No data received within network timeout"
            );
            self.reconnect();
            return Ok(());
        }

        let id = self.inner.next_ping_id.get();
        self.inner.next_ping_id.set(id + 1);
        let payload = json!({"type": "ping", "id": id}).to_string();
        self.inner.collaborators.transport.send(handle, &payload)
    }

    // =========================================================================
    // Inbound events
    // =========================================================================

    /// Decode one stream frame and handle it on the scheduler.
    pub fn receive_frame(&self, frame: &str) {
        self.inner.last_received.set(self.inner.collaborators.timer.now());
        let inbound = match decode_event(frame) {
            Ok(inbound) => inbound,
            Err(error) => {
                self.report_protocol_error(&error);
                return;
            }
        };
        metrics::record_event(if inbound.kind.is_empty() { "reply" } else { inbound.kind.as_str() });

        let is_hello = matches!(inbound.event, StreamEvent::Hello { .. });
        let this = self.clone();
        let label = format!("{} {}", self.name(), inbound.kind);
        let task = self.inner.scheduler.run_detached(label, async move {
            let kind = inbound.kind.clone();
            let raw = inbound.raw.clone();
            match this.handle_event(inbound).await {
                Err(error) if error.is_cancelled() => Err(error),
                Err(error) => {
                    let error = match error {
                        SyncError::Protocol { .. } => error,
                        other => SyncError::protocol(kind, other.to_string()),
                    };
                    this.report_protocol_error(&error.with_event(raw));
                    Ok(())
                }
                Ok(()) => Ok(()),
            }
        });
        if is_hello && !task.is_done() {
            *self.inner.handshake_task.borrow_mut() = Some(task);
        }
    }

    fn report_protocol_error(&self, error: &SyncError) {
        tracing::warn!(workspace = %self.name(), error = %error, "Failed handling stream event");
        let event = match error {
            SyncError::Protocol { event, .. } => event.clone(),
            _ => None,
        };
        self.inner
            .collaborators
            .reporter
            .report(&error.to_string(), event.as_ref());
    }

    async fn handle_event(&self, inbound: InboundEvent) -> Result<()> {
        let InboundEvent { kind, event, .. } = inbound;
        match event {
            StreamEvent::Hello { fast_reconnect } => return self.handle_hello(fast_reconnect).await,
            StreamEvent::Error { error } => {
                tracing::warn!(workspace = %self.name(), code = error.code, msg = %error.msg, "Stream reported an error");
                if error.is_expired_resume() {
                    self.inner.resume_url.borrow_mut().take();
                }
                return Ok(());
            }
            StreamEvent::ReconnectUrl { url } => {
                *self.inner.resume_url.borrow_mut() = Some(url);
                return Ok(());
            }
            StreamEvent::PrefChange { name, value } => {
                if name == "muted_channels" {
                    self.set_muted_channels(parse_id_list(value.as_str().unwrap_or_default()));
                }
                return Ok(());
            }
            StreamEvent::Pong { .. } => return Ok(()),
            StreamEvent::Unknown => {
                metrics::record_unknown_event();
                tracing::debug!(workspace = %self.name(), kind = %kind, "Ignoring unknown stream event");
                return Ok(());
            }
            ref ignored if ignored.is_ignored() => return Ok(()),
            _ => {}
        }

        let Some(channel_id) = event.channel_id().map(str::to_string) else {
            tracing::debug!(workspace = %self.name(), kind = %kind, "Stream event without conversation");
            return Ok(());
        };
        let conversation = match self.open_conversation(&channel_id) {
            Some(conversation) => conversation,
            None if event.may_open_conversation() => {
                return self.resolve_unopened(&channel_id, event.is_join()).await;
            }
            None => {
                tracing::debug!(
                    workspace = %self.name(),
                    conversation = %channel_id,
                    kind = %kind,
                    "received websocket message for not open conversation, discarding"
                );
                return Ok(());
            }
        };

        match event {
            StreamEvent::Message(message) => match message.change()? {
                MessageChange::New(payload) => conversation.add_new_message(payload).await?,
                MessageChange::Changed(payload) => {
                    let ts = payload.ts.clone();
                    conversation.change_message(&ts, payload);
                }
                MessageChange::Deleted(ts) => conversation.delete_message(&ts),
            },
            StreamEvent::ChannelMarked(marked)
            | StreamEvent::GroupMarked(marked)
            | StreamEvent::ImMarked(marked)
            | StreamEvent::MpimMarked(marked) => conversation.set_last_read(marked.ts),
            StreamEvent::ThreadMarked { subscription } => {
                if let Some(last_read) = subscription.last_read {
                    conversation.thread_marked(&subscription.thread_ts, last_read);
                }
            }
            StreamEvent::ThreadSubscribed { subscription } => {
                conversation.set_subscribed(&subscription.thread_ts, true);
            }
            StreamEvent::ThreadUnsubscribed { subscription } => {
                conversation.set_subscribed(&subscription.thread_ts, false);
            }
            StreamEvent::ReactionAdded(reaction) => {
                if let Some(ts) = reaction.item.ts.filter(|_| reaction.item.kind == "message") {
                    conversation.reaction_add(&ts, &reaction.reaction, &reaction.user);
                }
            }
            StreamEvent::ReactionRemoved(reaction) => {
                if let Some(ts) = reaction.item.ts.filter(|_| reaction.item.kind == "message") {
                    conversation.reaction_remove(&ts, &reaction.reaction, &reaction.user);
                }
            }
            StreamEvent::ImClose { .. }
            | StreamEvent::MpimClose { .. }
            | StreamEvent::GroupClose { .. }
            | StreamEvent::ChannelLeft { .. }
            | StreamEvent::GroupLeft { .. } => conversation.close(),
            StreamEvent::UserTyping { user, .. } => {
                tracing::trace!(workspace = %self.name(), conversation = %channel_id, user = %user, "User typing");
            }
            _ => {}
        }
        Ok(())
    }

    // =========================================================================
    // Handshake and initialization
    // =========================================================================

    async fn handle_hello(&self, fast_reconnect: bool) -> Result<()> {
        let full = self.inner.initial_connect.get() || !fast_reconnect;
        if full {
            if let Err(error) = self.initialize().await {
                if !error.is_cancelled() {
                    self.status(&format!("Failed initializing workspace {}: {}", self.name(), error));
                    self.disconnect();
                }
                return Err(error);
            }
        }
        self.inner.initial_connect.set(false);
        self.set_state(ConnectionState::Connected);
        tracing::info!(workspace = %self.name(), full_initialization = full, "Connected");
        self.status(&format!("Connected to workspace {}", self.name()));
        if full {
            self.load_unread_conversations().await
        } else {
            // The server replays missed events on a resumed stream.
            Ok(())
        }
    }

    async fn initialize(&self) -> Result<()> {
        let muted = self.inner.api.muted_channels().await?;
        self.set_muted_channels(muted);

        let ids = self.inner.api.users_conversations(CONVERSATION_TYPES).await?;
        tracing::debug!(workspace = %self.name(), conversations = ids.len(), "Listed conversations");
        let lookups = ids.into_iter().map(|id| {
            let this = self.clone();
            async move { this.conversation_if_should_open(id).await }
        });
        let resolved = gather(self.inner.scheduler.spawn_all("conversation_if_should_open", lookups)).await?;
        for conversation in resolved.into_iter().flatten() {
            conversation.open();
        }

        let hotlists = self
            .open_conversations()
            .into_iter()
            .map(|conversation| async move { conversation.set_hotlist().await });
        gather(self.inner.scheduler.spawn_all("set_hotlist", hotlists)).await?;
        Ok(())
    }

    /// The conversation if it should be open: the server says so, or it is
    /// a direct conversation with something after the read marker.
    async fn conversation_if_should_open(&self, id: String) -> Result<Option<ConversationSync>> {
        let conversation = match self.conversation_or_fetch(&id).await {
            Ok(conversation) => conversation,
            Err(error) if error.is_not_found() => {
                tracing::debug!(workspace = %self.name(), conversation = %id, "Listed conversation no longer exists");
                return Ok(None);
            }
            Err(error) => return Err(error),
        };
        let (should_open, direct, last_read) =
            conversation.with(|c| (c.should_open(), c.kind().is_direct(), c.last_read().clone()));
        if should_open {
            return Ok(Some(conversation));
        }
        if !direct {
            return Ok(None);
        }
        let history = if last_read == ConversationTimestamp::zero() {
            self.inner.api.conversations_history(&id).await?
        } else {
            self.inner.api.conversations_history_after(&id, &last_read).await?
        };
        Ok((!history.is_empty()).then_some(conversation))
    }

    async fn conversation_or_fetch(&self, id: &str) -> Result<ConversationSync> {
        if let Some(conversation) = self.conversation(id) {
            return Ok(conversation);
        }
        let info = self.inner.api.conversations_info(id).await?;
        let muted = self.inner.muted.borrow().contains(&info.id);
        let mut conversation = Conversation::new(info);
        conversation.set_muted(muted);
        let created = ConversationSync::new(
            conversation,
            self.inner.api.clone(),
            self.inner.scheduler.clone(),
            self.inner.collaborators.clone(),
            &self.inner.history,
        );
        // Another lookup may have finished first.
        let conversation = self
            .inner
            .conversations
            .borrow_mut()
            .entry(id.to_string())
            .or_insert(created)
            .clone();
        Ok(conversation)
    }

    /// A message or open/join for a conversation that is not open.
    async fn resolve_unopened(&self, id: &str, join: bool) -> Result<()> {
        let conversation = self.conversation_or_fetch(id).await?;
        let direct = conversation.with(|c| c.kind().is_direct());
        if direct || join {
            conversation.open();
            conversation.set_hotlist().await?;
        } else {
            tracing::debug!(workspace = %self.name(), conversation = %id, "Not opening conversation for event");
        }
        Ok(())
    }

    fn set_muted_channels(&self, muted: HashSet<String>) {
        let conversations: Vec<ConversationSync> =
            self.inner.conversations.borrow().values().cloned().collect();
        for conversation in conversations {
            let id = conversation.id();
            conversation.with_mut(|c| c.set_muted(muted.contains(&id)));
        }
        tracing::debug!(workspace = %self.name(), muted = muted.len(), "Updated muted conversations");
        *self.inner.muted.borrow_mut() = muted;
    }

    /// Backfill every open conversation with unseen activity, pausing between
    /// conversations.
    pub async fn load_unread_conversations(&self) -> Result<()> {
        let pacing = self.inner.history.unread_pacing();
        let unread: Vec<ConversationSync> = self
            .open_conversations()
            .into_iter()
            .filter(|c| c.with(|c| !c.hotlist().is_empty() && !c.is_muted()))
            .collect();
        tracing::debug!(workspace = %self.name(), conversations = unread.len(), "Loading unread conversations");

        for (index, conversation) in unread.into_iter().enumerate() {
            if index > 0 {
                self.inner.collaborators.timer.sleep(pacing).await?;
            }
            if !self.is_connected() {
                break;
            }
            match conversation.fill_history(false).await {
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    tracing::warn!(workspace = %self.name(), conversation = %conversation.id(), error = %error, "Unread backfill failed");
                    self.inner
                        .collaborators
                        .reporter
                        .report(&format!("Failed loading history for {}: {}", conversation.id(), error), None);
                }
                Ok(()) => {}
            }
        }
        Ok(())
    }

    // =========================================================================
    // User actions
    // =========================================================================

    /// Close a conversation locally and on the server. Direct conversations
    /// are closed, channels are left.
    pub async fn close_conversation(&self, id: &str) -> Result<()> {
        let conversation = self.conversation(id).ok_or_else(|| SyncError::NotFound {
            kind: "conversation".to_string(),
            id: id.to_string(),
        })?;
        conversation.close();
        if conversation.with(|c| c.kind().is_direct()) {
            self.inner.api.conversations_close(id).await
        } else {
            self.inner.api.conversations_leave(id).await
        }
    }
}
