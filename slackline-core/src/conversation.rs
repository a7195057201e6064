// ABOUTME: Per-conversation message index ordered by timestamp, with hash index and read markers
// ABOUTME: Pure state; the history engine and workspace drive it and push rendered lines to the view

use crate::hashes::{HashBump, MessageHashes};
use crate::message::{Message, MessagePayload};
use crate::timestamp::ConversationTimestamp;
use crate::traits::Renderer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// `conversations.info` channel object, reduced to what the core reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_im: bool,
    #[serde(default)]
    pub is_mpim: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_open: Option<bool>,
    #[serde(default)]
    pub is_member: Option<bool>,
    #[serde(default)]
    pub last_read: Option<ConversationTimestamp>,
    /// The other party of an im.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    Channel,
    Private,
    Mpim,
    Im,
}

impl ConversationKind {
    pub fn is_direct(self) -> bool {
        matches!(self, Self::Im | Self::Mpim)
    }
}

/// A display update produced while rendering.
pub type RenderedLine = (ConversationTimestamp, String);

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub line: String,
    /// Already visible messages whose hash was lengthened by this render.
    pub refreshed: Vec<RenderedLine>,
}

#[derive(Debug)]
pub struct Conversation {
    info: ConversationInfo,
    messages: BTreeMap<ConversationTimestamp, Message>,
    hashes: MessageHashes,
    last_read: ConversationTimestamp,
    /// Newest message shown in the view. Everything up to it is contiguous.
    last_printed: Option<ConversationTimestamp>,
    hotlist: BTreeSet<ConversationTimestamp>,
    is_open: bool,
    muted: bool,
    display_thread_replies: bool,
    pub(crate) loading: bool,
    /// A backfill was requested while one was running.
    pub(crate) needs_refresh: bool,
    /// Shown history may be out of date (e.g. after a reconnect).
    pub(crate) history_stale: bool,
}

impl Conversation {
    pub fn new(info: ConversationInfo) -> Self {
        Self::with_hashes(info, MessageHashes::new())
    }

    pub fn with_hashes(info: ConversationInfo, hashes: MessageHashes) -> Self {
        let last_read = info.last_read.clone().unwrap_or_else(ConversationTimestamp::zero);
        Self {
            info,
            messages: BTreeMap::new(),
            hashes,
            last_read,
            last_printed: None,
            hotlist: BTreeSet::new(),
            is_open: false,
            muted: false,
            display_thread_replies: true,
            loading: false,
            needs_refresh: false,
            history_stale: false,
        }
    }

    // =========================================================================
    // Identity and flags
    // =========================================================================

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &ConversationInfo {
        &self.info
    }

    pub fn kind(&self) -> ConversationKind {
        if self.info.is_im {
            ConversationKind::Im
        } else if self.info.is_mpim {
            ConversationKind::Mpim
        } else if self.info.is_private {
            ConversationKind::Private
        } else {
            ConversationKind::Channel
        }
    }

    pub fn name(&self) -> String {
        match (&self.info.name, &self.info.user) {
            (Some(name), _) => name.clone(),
            (None, Some(user)) => user.clone(),
            (None, None) => self.info.id.clone(),
        }
    }

    /// `is_open` if the server says, otherwise membership.
    pub fn should_open(&self) -> bool {
        match self.info.is_open {
            Some(open) => open,
            None => self.info.is_member.unwrap_or(false),
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn set_open(&mut self, open: bool) {
        self.is_open = open;
        if !open {
            self.last_printed = None;
            self.hotlist.clear();
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn display_thread_replies(&self) -> bool {
        self.display_thread_replies
    }

    pub fn set_display_thread_replies(&mut self, display: bool) {
        self.display_thread_replies = display;
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn last_read(&self) -> &ConversationTimestamp {
        &self.last_read
    }

    /// Moving the read marker clears the pending-notification set.
    pub fn set_last_read(&mut self, ts: ConversationTimestamp) {
        self.last_read = ts;
        self.hotlist.clear();
    }

    pub fn last_printed(&self) -> Option<&ConversationTimestamp> {
        self.last_printed.as_ref()
    }

    /// Volatile state is invalidated on disconnect; messages are kept.
    pub fn mark_disconnected(&mut self) {
        if self.last_printed.is_some() {
            self.history_stale = true;
        }
    }

    pub fn hotlist(&self) -> &BTreeSet<ConversationTimestamp> {
        &self.hotlist
    }

    pub fn hotlist_add(&mut self, ts: ConversationTimestamp) -> bool {
        self.hotlist.insert(ts)
    }

    // =========================================================================
    // Messages
    // =========================================================================

    pub fn messages(&self) -> &BTreeMap<ConversationTimestamp, Message> {
        &self.messages
    }

    pub fn message(&self, ts: &ConversationTimestamp) -> Option<&Message> {
        self.messages.get(ts)
    }

    pub fn message_mut(&mut self, ts: &ConversationTimestamp) -> Option<&mut Message> {
        self.messages.get_mut(ts)
    }

    pub fn first_ts(&self) -> Option<&ConversationTimestamp> {
        self.messages.keys().next()
    }

    pub fn hashes(&self) -> &MessageHashes {
        &self.hashes
    }

    /// Insert a new message or merge into the existing one. Returns its timestamp.
    pub fn add_or_update(&mut self, payload: MessagePayload) -> ConversationTimestamp {
        let ts = payload.ts.clone();
        match self.messages.get_mut(&ts) {
            Some(existing) => existing.update(payload),
            None => {
                self.messages.insert(ts.clone(), Message::new(payload));
            }
        }
        ts
    }

    /// Append `ts` to its parent's reply list when both are known.
    pub fn link_to_parent(&mut self, ts: &ConversationTimestamp) -> bool {
        let Some(parent_ts) = self
            .messages
            .get(ts)
            .filter(|m| m.is_reply())
            .and_then(|m| m.thread_ts().cloned())
        else {
            return false;
        };
        match self.messages.get_mut(&parent_ts) {
            Some(parent) => {
                parent.link_reply(ts.clone());
                true
            }
            None => false,
        }
    }

    pub fn parent_of(&self, ts: &ConversationTimestamp) -> Option<&Message> {
        let message = self.messages.get(ts).filter(|m| m.is_reply())?;
        self.messages.get(message.thread_ts()?)
    }

    pub fn should_display(&self, message: &Message) -> bool {
        !message.is_reply() || message.is_thread_broadcast() || self.display_thread_replies
    }

    /// Muted conversation and neither the message nor its thread is subscribed.
    pub fn is_message_muted(&self, ts: &ConversationTimestamp) -> bool {
        let Some(message) = self.messages.get(ts) else {
            return self.muted;
        };
        let parent_subscribed = self.parent_of(ts).is_some_and(Message::subscribed);
        self.muted && !message.subscribed() && !parent_subscribed
    }

    /// Whether `ts` currently has a line in the view.
    pub fn is_printed(&self, ts: &ConversationTimestamp) -> bool {
        self.is_open
            && self.last_printed.as_ref().is_some_and(|last| ts <= last)
            && self.messages.get(ts).is_some_and(|m| self.should_display(m))
    }

    /// Displayable messages newer than the last printed one, oldest first.
    pub fn unprinted(&self) -> Vec<ConversationTimestamp> {
        self.messages
            .values()
            .filter(|m| self.should_display(m))
            .filter(|m| self.last_printed.as_ref().map_or(true, |last| m.ts() > last))
            .map(|m| m.ts().clone())
            .collect()
    }

    /// Advance the contiguous marker after `ts` was shown.
    pub fn record_printed(&mut self, ts: &ConversationTimestamp) {
        if ts > &self.last_read {
            self.hotlist.insert(ts.clone());
        }
        self.last_printed = Some(ts.clone());
    }

    /// Replace a message's payload. Returns false for unknown messages.
    pub fn change_message(&mut self, ts: &ConversationTimestamp, payload: MessagePayload) -> bool {
        match self.messages.get_mut(ts) {
            Some(message) => {
                message.update(payload);
                true
            }
            None => false,
        }
    }

    /// Tombstone a message and drop its hash. The record itself stays.
    pub fn delete_message(&mut self, ts: &ConversationTimestamp) -> bool {
        self.hashes.remove(ts);
        match self.messages.get_mut(ts) {
            Some(message) => {
                message.mark_deleted();
                true
            }
            None => false,
        }
    }

    pub fn reaction_add(&mut self, ts: &ConversationTimestamp, name: &str, user_id: &str) -> bool {
        self.messages
            .get_mut(ts)
            .is_some_and(|m| m.reaction_add(name, user_id))
    }

    pub fn reaction_remove(&mut self, ts: &ConversationTimestamp, name: &str, user_id: &str) -> bool {
        self.messages
            .get_mut(ts)
            .is_some_and(|m| m.reaction_remove(name, user_id))
    }

    // =========================================================================
    // Message-id resolution
    // =========================================================================

    pub fn ts_from_hash(&self, hash: &str) -> Option<ConversationTimestamp> {
        self.hashes.ts_for(hash).cloned()
    }

    /// The `index`-th most recent shown message (1-based), optionally only
    /// counting plain messages sent by `own_user`.
    pub fn ts_from_index(&self, index: usize, own_user: Option<&str>) -> Option<ConversationTimestamp> {
        if index == 0 {
            return None;
        }
        self.messages
            .values()
            .rev()
            .filter(|m| self.is_printed(m.ts()))
            .filter(|m| match own_user {
                None => true,
                Some(user) => {
                    m.sender_user_id() == Some(user)
                        && matches!(m.subtype(), None | Some("me_message") | Some("thread_broadcast"))
                }
            })
            .nth(index - 1)
            .map(|m| m.ts().clone())
    }

    pub fn ts_from_hash_or_index(&self, key: &str, own_user: Option<&str>) -> Option<ConversationTimestamp> {
        if let Some(ts) = self.ts_from_hash(key) {
            return Some(ts);
        }
        if !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit()) {
            return key.parse().ok().and_then(|index| self.ts_from_index(index, own_user));
        }
        None
    }

    // =========================================================================
    // Rendering
    // =========================================================================

    /// Render `ts`, assigning its hash (and its thread parent's) on first use.
    pub fn render(&mut self, ts: &ConversationTimestamp, renderer: &dyn Renderer) -> Option<RenderedMessage> {
        let mut bumps = Vec::new();
        let line = self.render_line(ts, renderer, &mut bumps)?;
        let refreshed = self.refresh_bumped(bumps, renderer);
        Some(RenderedMessage { line, refreshed })
    }

    /// Fresh lines for `ts` if it is shown, plus anything its render bumped.
    pub fn rerender(&mut self, ts: &ConversationTimestamp, renderer: &dyn Renderer) -> Vec<RenderedLine> {
        if !self.is_printed(ts) {
            return Vec::new();
        }
        match self.render(ts, renderer) {
            Some(rendered) => {
                let mut lines = vec![(ts.clone(), rendered.line)];
                lines.extend(rendered.refreshed);
                lines
            }
            None => Vec::new(),
        }
    }

    /// Fresh lines for every shown message.
    pub fn rerender_all(&mut self, renderer: &dyn Renderer) -> Vec<RenderedLine> {
        let shown: Vec<ConversationTimestamp> = self
            .messages
            .keys()
            .filter(|ts| self.is_printed(ts))
            .cloned()
            .collect();
        shown
            .iter()
            .flat_map(|ts| self.rerender(ts, renderer))
            .collect()
    }

    fn assign_hash(&mut self, ts: &ConversationTimestamp, bumps: &mut Vec<HashBump>) -> String {
        let assigned = self.hashes.hash_for(ts);
        bumps.extend(assigned.bumped);
        assigned.hash
    }

    fn render_line(
        &mut self,
        ts: &ConversationTimestamp,
        renderer: &dyn Renderer,
        bumps: &mut Vec<HashBump>,
    ) -> Option<String> {
        let message = self.messages.get(ts)?;
        let parent = message.is_reply().then(|| message.thread_ts().cloned()).flatten();

        let hash = self.display_hash(ts, bumps);
        let thread_hash = parent.map(|parent| self.display_hash(&parent, bumps));

        let message = self.messages.get(ts)?;
        Some(renderer.render(message, &hash, thread_hash.as_deref()))
    }

    /// Tombstoned messages keep whatever hash they had and never get a new one.
    fn display_hash(&mut self, ts: &ConversationTimestamp, bumps: &mut Vec<HashBump>) -> String {
        if self.messages.get(ts).is_some_and(Message::is_deleted) {
            self.hashes.get(ts).unwrap_or_default().to_string()
        } else {
            self.assign_hash(ts, bumps)
        }
    }

    fn refresh_bumped(&mut self, bumps: Vec<HashBump>, renderer: &dyn Renderer) -> Vec<RenderedLine> {
        let mut lines = Vec::new();
        let mut queue: VecDeque<HashBump> = bumps.into();
        while let Some(bump) = queue.pop_front() {
            let mut affected = vec![bump.ts.clone()];
            if let Some(message) = self.messages.get(&bump.ts) {
                affected.extend(message.replies().iter().cloned());
            }
            for ts in affected {
                if !self.is_printed(&ts) {
                    continue;
                }
                let mut more = Vec::new();
                if let Some(line) = self.render_line(&ts, renderer, &mut more) {
                    lines.push((ts, line));
                }
                queue.extend(more);
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashes::sha1_hex;
    use serde_json::json;

    struct PlainRenderer;

    impl Renderer for PlainRenderer {
        fn render(&self, message: &Message, hash: &str, thread_hash: Option<&str>) -> String {
            match thread_hash {
                Some(parent) => format!("[{parent}] {hash} {}", message.text()),
                None => format!("{hash} {}", message.text()),
            }
        }
    }

    fn ts(raw: &str) -> ConversationTimestamp {
        raw.parse().unwrap()
    }

    fn info(raw: Value) -> ConversationInfo {
        serde_json::from_value(raw).unwrap()
    }

    fn payload(raw: Value) -> MessagePayload {
        MessagePayload::from_value(&raw).unwrap()
    }

    fn open_channel() -> Conversation {
        let mut c = Conversation::new(info(json!({"id": "C1", "name": "general", "last_read": "2.0"})));
        c.set_open(true);
        c
    }

    /// Makes "10.0" and "20.0" collide on their first three characters.
    fn colliding(ts: &ConversationTimestamp) -> String {
        match ts.as_str() {
            "10.0" => "fffa000".to_string(),
            "20.0" => "fffb000".to_string(),
            _ => sha1_hex(ts),
        }
    }

    #[test]
    fn test_kind_and_should_open() {
        let im = Conversation::new(info(json!({"id": "D1", "is_im": true, "is_open": false, "user": "U9"})));
        assert_eq!(im.kind(), ConversationKind::Im);
        assert!(!im.should_open());
        assert_eq!(im.name(), "U9");

        let member = Conversation::new(info(json!({"id": "C1", "name": "x", "is_member": true})));
        assert_eq!(member.kind(), ConversationKind::Channel);
        assert!(member.should_open());

        let private = Conversation::new(info(json!({"id": "G1", "is_private": true})));
        assert_eq!(private.kind(), ConversationKind::Private);
        assert!(!private.should_open());
    }

    #[test]
    fn test_messages_stay_ordered_regardless_of_arrival() {
        let mut c = open_channel();
        c.add_or_update(payload(json!({"ts": "4.0", "text": "live"})));
        c.add_or_update(payload(json!({"ts": "5.0", "text": "b"})));
        c.add_or_update(payload(json!({"ts": "3.0", "text": "a"})));
        let order: Vec<String> = c.messages().keys().map(|t| t.to_string()).collect();
        assert_eq!(order, vec!["3.0", "4.0", "5.0"]);
        assert_eq!(c.first_ts(), Some(&ts("3.0")));
    }

    #[test]
    fn test_record_printed_tracks_contiguity_and_hotlist() {
        let mut c = open_channel();
        for raw in ["1.0", "3.0"] {
            c.add_or_update(payload(json!({"ts": raw})));
        }
        assert_eq!(c.unprinted(), vec![ts("1.0"), ts("3.0")]);
        c.record_printed(&ts("1.0"));
        c.record_printed(&ts("3.0"));
        assert!(c.unprinted().is_empty());
        assert!(c.is_printed(&ts("1.0")));
        // Only 3.0 is newer than last_read 2.0.
        assert_eq!(c.hotlist().iter().cloned().collect::<Vec<_>>(), vec![ts("3.0")]);

        c.set_last_read(ts("3.0"));
        assert!(c.hotlist().is_empty());
    }

    #[test]
    fn test_replies_hidden_when_not_displayed_inline() {
        let mut c = open_channel();
        c.set_display_thread_replies(false);
        c.add_or_update(payload(json!({"ts": "1.0", "thread_ts": "1.0"})));
        c.add_or_update(payload(json!({"ts": "2.0", "thread_ts": "1.0"})));
        c.add_or_update(payload(json!({"ts": "3.0", "thread_ts": "1.0", "subtype": "thread_broadcast"})));
        assert_eq!(c.unprinted(), vec![ts("1.0"), ts("3.0")]);
    }

    #[test]
    fn test_link_to_parent_once() {
        let mut c = open_channel();
        c.add_or_update(payload(json!({"ts": "1.0", "thread_ts": "1.0"})));
        c.add_or_update(payload(json!({"ts": "2.0", "thread_ts": "1.0"})));
        assert!(c.link_to_parent(&ts("2.0")));
        assert!(c.link_to_parent(&ts("2.0")));
        assert_eq!(c.message(&ts("1.0")).unwrap().replies(), &[ts("2.0")]);
        assert!(!c.link_to_parent(&ts("1.0")));
    }

    #[test]
    fn test_delete_drops_hash_but_keeps_record() {
        let mut c = open_channel();
        c.add_or_update(payload(json!({"ts": "1.0", "text": "bye"})));
        let hash = c.render(&ts("1.0"), &PlainRenderer).unwrap().line;
        let short = hash.split(' ').next().unwrap().to_string();
        assert_eq!(c.ts_from_hash(&short), Some(ts("1.0")));

        assert!(c.delete_message(&ts("1.0")));
        assert!(c.ts_from_hash(&short).is_none());
        assert!(c.message(&ts("1.0")).unwrap().is_deleted());
        // Rendering a tombstone does not hand out a new hash.
        c.render(&ts("1.0"), &PlainRenderer);
        assert!(c.hashes().is_empty());
    }

    #[test]
    fn test_hash_bump_refreshes_shown_message() {
        let mut c = Conversation::with_hashes(
            info(json!({"id": "C1", "name": "general"})),
            MessageHashes::with_digest(colliding),
        );
        c.set_open(true);
        c.add_or_update(payload(json!({"ts": "10.0", "text": "first"})));
        c.add_or_update(payload(json!({"ts": "20.0", "text": "second"})));

        let first = c.render(&ts("10.0"), &PlainRenderer).unwrap();
        assert_eq!(first.line, "fff first");
        c.record_printed(&ts("10.0"));

        let second = c.render(&ts("20.0"), &PlainRenderer).unwrap();
        assert_eq!(second.line, "fffb second");
        assert_eq!(second.refreshed, vec![(ts("10.0"), "fffa first".to_string())]);
    }

    #[test]
    fn test_reply_renders_with_parent_hash() {
        let mut c = open_channel();
        c.add_or_update(payload(json!({"ts": "1.0", "thread_ts": "1.0", "text": "root"})));
        c.add_or_update(payload(json!({"ts": "2.0", "thread_ts": "1.0", "text": "re"})));
        let line = c.render(&ts("2.0"), &PlainRenderer).unwrap().line;
        let parent_hash = c.hashes().get(&ts("1.0")).unwrap().to_string();
        assert!(line.starts_with(&format!("[{parent_hash}]")));
    }

    #[test]
    fn test_ts_from_index_counts_shown_messages_from_newest() {
        let mut c = open_channel();
        c.add_or_update(payload(json!({"ts": "1.0", "user": "UME"})));
        c.add_or_update(payload(json!({"ts": "2.0", "user": "UOTHER"})));
        c.add_or_update(payload(json!({"ts": "3.0", "user": "UME", "subtype": "channel_join"})));
        c.add_or_update(payload(json!({"ts": "4.0", "user": "UOTHER"})));
        c.record_printed(&ts("3.0"));

        assert_eq!(c.ts_from_index(1, None), Some(ts("3.0")));
        assert_eq!(c.ts_from_index(3, None), Some(ts("1.0")));
        assert_eq!(c.ts_from_index(4, None), None);
        assert_eq!(c.ts_from_index(0, None), None);
        assert_eq!(c.ts_from_index(1, Some("UME")), Some(ts("1.0")));
        assert_eq!(c.ts_from_hash_or_index("2", None), Some(ts("2.0")));
        assert_eq!(c.ts_from_hash_or_index("zz", None), None);
    }

    #[test]
    fn test_muted_respects_subscriptions() {
        let mut c = open_channel();
        c.set_muted(true);
        c.add_or_update(payload(json!({"ts": "1.0", "thread_ts": "1.0", "subscribed": true})));
        c.add_or_update(payload(json!({"ts": "2.0", "thread_ts": "1.0"})));
        c.add_or_update(payload(json!({"ts": "3.0"})));
        assert!(!c.is_message_muted(&ts("1.0")));
        assert!(!c.is_message_muted(&ts("2.0")));
        assert!(c.is_message_muted(&ts("3.0")));
    }
}
