// ABOUTME: Message record keyed by timestamp: server payload, thread linkage, reactions, tombstones
// ABOUTME: Payload updates merge field by field so partial edits never drop known data

use crate::error::{Result, SyncError};
use crate::timestamp::ConversationTimestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub name: String,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub count: u32,
}

/// Server-provided message fields. Everything the core doesn't interpret
/// stays in `extra` for the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub ts: ConversationTimestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<ConversationTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_reply: Option<ConversationTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Vec<Reaction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read: Option<ConversationTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribed: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessagePayload {
    pub fn from_value(raw: &Value) -> Result<Self> {
        serde_json::from_value(raw.clone()).map_err(|e| {
            SyncError::protocol("message", format!("malformed message: {e}")).with_event(raw.clone())
        })
    }

    /// Overwrite every field present in `newer`, keep the rest.
    pub fn merge(&mut self, newer: MessagePayload) {
        macro_rules! take_some {
            ($($field:ident),*) => {
                $(if newer.$field.is_some() { self.$field = newer.$field; })*
            };
        }
        take_some!(
            thread_ts,
            subtype,
            user,
            bot_id,
            text,
            latest_reply,
            reply_count,
            reactions,
            last_read,
            subscribed
        );
        self.extra.extend(newer.extra);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    payload: MessagePayload,
    reply_tss: Vec<ConversationTimestamp>,
    replies_filled: bool,
    deleted: bool,
}

impl Message {
    pub fn new(payload: MessagePayload) -> Self {
        Self {
            payload,
            reply_tss: Vec::new(),
            replies_filled: false,
            deleted: false,
        }
    }

    pub fn payload(&self) -> &MessagePayload {
        &self.payload
    }

    pub fn ts(&self) -> &ConversationTimestamp {
        &self.payload.ts
    }

    pub fn thread_ts(&self) -> Option<&ConversationTimestamp> {
        self.payload.thread_ts.as_ref()
    }

    pub fn subtype(&self) -> Option<&str> {
        self.payload.subtype.as_deref()
    }

    pub fn text(&self) -> &str {
        self.payload.text.as_deref().unwrap_or_default()
    }

    pub fn sender_user_id(&self) -> Option<&str> {
        self.payload.user.as_deref()
    }

    pub fn sender_bot_id(&self) -> Option<&str> {
        self.payload.bot_id.as_deref()
    }

    pub fn latest_reply(&self) -> Option<&ConversationTimestamp> {
        self.payload.latest_reply.as_ref()
    }

    pub fn reactions(&self) -> &[Reaction] {
        self.payload.reactions.as_deref().unwrap_or_default()
    }

    pub fn subscribed(&self) -> bool {
        self.payload.subscribed.unwrap_or(false)
    }

    pub fn set_subscribed(&mut self, subscribed: bool) {
        self.payload.subscribed = Some(subscribed);
    }

    pub fn last_read(&self) -> Option<&ConversationTimestamp> {
        self.payload.last_read.as_ref()
    }

    pub fn set_last_read(&mut self, ts: ConversationTimestamp) {
        self.payload.last_read = Some(ts);
    }

    pub fn is_thread_parent(&self) -> bool {
        self.thread_ts() == Some(self.ts())
    }

    pub fn is_reply(&self) -> bool {
        self.thread_ts().is_some() && !self.is_thread_parent()
    }

    pub fn is_thread_broadcast(&self) -> bool {
        self.subtype() == Some("thread_broadcast")
    }

    pub fn is_bot_message(&self) -> bool {
        self.subtype() == Some("bot_message")
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted || self.subtype() == Some("tombstone")
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    /// Last write wins per field. Thread linkage and tombstones survive.
    pub fn update(&mut self, newer: MessagePayload) {
        self.payload.merge(newer);
    }

    pub fn replies(&self) -> &[ConversationTimestamp] {
        &self.reply_tss
    }

    /// Add `reply` to the reply list unless it is already there. Keeps ascending order.
    pub fn link_reply(&mut self, reply: ConversationTimestamp) -> bool {
        match self.reply_tss.binary_search(&reply) {
            Ok(_) => false,
            Err(position) => {
                self.reply_tss.insert(position, reply);
                true
            }
        }
    }

    pub fn replies_filled(&self) -> bool {
        self.replies_filled
    }

    pub fn set_replies_filled(&mut self) {
        self.replies_filled = true;
    }

    /// Returns whether anything changed.
    pub fn reaction_add(&mut self, name: &str, user_id: &str) -> bool {
        let reactions = self.payload.reactions.get_or_insert_with(Vec::new);
        match reactions.iter_mut().find(|r| r.name == name) {
            Some(reaction) if reaction.users.iter().any(|u| u == user_id) => false,
            Some(reaction) => {
                reaction.users.push(user_id.to_string());
                reaction.count += 1;
                true
            }
            None => {
                reactions.push(Reaction {
                    name: name.to_string(),
                    users: vec![user_id.to_string()],
                    count: 1,
                });
                true
            }
        }
    }

    /// Returns whether anything changed.
    pub fn reaction_remove(&mut self, name: &str, user_id: &str) -> bool {
        let Some(reaction) = self
            .payload
            .reactions
            .as_mut()
            .and_then(|reactions| reactions.iter_mut().find(|r| r.name == name))
        else {
            return false;
        };
        let Some(position) = reaction.users.iter().position(|u| u == user_id) else {
            return false;
        };
        reaction.users.remove(position);
        reaction.count = reaction.count.saturating_sub(1);
        true
    }

    pub fn has_reacted(&self, name: &str, user_id: &str) -> bool {
        self.reactions()
            .iter()
            .any(|r| r.name == name && r.users.iter().any(|u| u == user_id))
    }
}
