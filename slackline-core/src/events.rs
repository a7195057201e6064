// ABOUTME: Stream event decoding into a closed set of typed variants plus an Unknown fallback
// ABOUTME: Frames are decoded once at the stream boundary; handlers never look at raw type strings

use crate::error::{Result, SyncError};
use crate::message::MessagePayload;
use crate::timestamp::ConversationTimestamp;
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

impl StreamErrorBody {
    /// The held resume URL is no longer accepted.
    pub fn is_expired_resume(&self) -> bool {
        self.code == 1
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarkedEvent {
    pub channel: String,
    pub ts: ConversationTimestamp,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThreadSubscription {
    #[serde(rename = "type")]
    pub kind: String,
    pub channel: String,
    pub thread_ts: ConversationTimestamp,
    #[serde(default)]
    pub last_read: Option<ConversationTimestamp>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReactionItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub ts: Option<ConversationTimestamp>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReactionEvent {
    pub user: String,
    pub reaction: String,
    pub item: ReactionItem,
}

/// A `message` event. What it means depends on `subtype`; see [`MessageEvent::change`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageEvent {
    pub channel: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageChange {
    New(MessagePayload),
    /// Edits and thread updates. The payload carries the target's ts.
    Changed(MessagePayload),
    Deleted(ConversationTimestamp),
}

impl MessageEvent {
    pub fn change(&self) -> Result<MessageChange> {
        match self.subtype.as_deref() {
            Some("message_changed") | Some("message_replied") => {
                let inner = self
                    .fields
                    .get("message")
                    .ok_or_else(|| SyncError::protocol("message", "changed message has no 'message' field"))?;
                Ok(MessageChange::Changed(MessagePayload::from_value(inner)?))
            }
            Some("message_deleted") => {
                let deleted = self
                    .fields
                    .get("deleted_ts")
                    .and_then(Value::as_str)
                    .and_then(|ts| ts.parse().ok())
                    .ok_or_else(|| SyncError::protocol("message", "deleted message has no valid 'deleted_ts'"))?;
                Ok(MessageChange::Deleted(deleted))
            }
            _ => {
                let mut fields = self.fields.clone();
                if let Some(subtype) = &self.subtype {
                    fields.insert("subtype".to_string(), Value::String(subtype.clone()));
                }
                Ok(MessageChange::New(MessagePayload::from_value(&Value::Object(fields))?))
            }
        }
    }
}

/// Every stream event kind the engine understands.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Hello {
        #[serde(default)]
        fast_reconnect: bool,
    },
    Error {
        error: StreamErrorBody,
    },
    ReconnectUrl {
        url: String,
    },
    PrefChange {
        name: String,
        #[serde(default)]
        value: Value,
    },
    Message(MessageEvent),
    ChannelMarked(MarkedEvent),
    GroupMarked(MarkedEvent),
    ImMarked(MarkedEvent),
    MpimMarked(MarkedEvent),
    ThreadMarked {
        subscription: ThreadSubscription,
    },
    ThreadSubscribed {
        subscription: ThreadSubscription,
    },
    ThreadUnsubscribed {
        subscription: ThreadSubscription,
    },
    ReactionAdded(ReactionEvent),
    ReactionRemoved(ReactionEvent),
    ImOpen {
        channel: String,
    },
    MpimOpen {
        channel: String,
    },
    GroupOpen {
        channel: String,
    },
    ChannelJoined {
        channel: ChannelRef,
    },
    GroupJoined {
        channel: ChannelRef,
    },
    ImClose {
        channel: String,
    },
    MpimClose {
        channel: String,
    },
    GroupClose {
        channel: String,
    },
    ChannelLeft {
        channel: String,
    },
    GroupLeft {
        channel: String,
    },
    UserTyping {
        channel: String,
        user: String,
    },
    Pong {
        #[serde(default)]
        reply_to: Option<u64>,
    },
    FileShared {},
    FilePublic {},
    FileDeleted {},
    DndUpdatedUser {},
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    /// The conversation this event targets, if any.
    pub fn channel_id(&self) -> Option<&str> {
        use StreamEvent::*;
        match self {
            Message(message) => Some(message.channel.as_str()),
            ChannelMarked(marked) | GroupMarked(marked) | ImMarked(marked) | MpimMarked(marked) => {
                Some(marked.channel.as_str())
            }
            ThreadMarked { subscription }
            | ThreadSubscribed { subscription }
            | ThreadUnsubscribed { subscription } => {
                (subscription.kind == "thread").then_some(subscription.channel.as_str())
            }
            ReactionAdded(reaction) | ReactionRemoved(reaction) => reaction.item.channel.as_deref(),
            ChannelJoined { channel } | GroupJoined { channel } => Some(channel.id.as_str()),
            ImOpen { channel }
            | MpimOpen { channel }
            | GroupOpen { channel }
            | ImClose { channel }
            | MpimClose { channel }
            | GroupClose { channel }
            | ChannelLeft { channel }
            | GroupLeft { channel }
            | UserTyping { channel, .. } => Some(channel.as_str()),
            _ => None,
        }
    }

    /// Events that make an unopened conversation worth resolving.
    pub fn may_open_conversation(&self) -> bool {
        matches!(
            self,
            StreamEvent::Message(_)
                | StreamEvent::ImOpen { .. }
                | StreamEvent::MpimOpen { .. }
                | StreamEvent::GroupOpen { .. }
                | StreamEvent::ChannelJoined { .. }
                | StreamEvent::GroupJoined { .. }
        )
    }

    pub fn is_join(&self) -> bool {
        matches!(self, StreamEvent::ChannelJoined { .. } | StreamEvent::GroupJoined { .. })
    }

    /// Known kinds with nothing to do.
    pub fn is_ignored(&self) -> bool {
        matches!(
            self,
            StreamEvent::FileShared {}
                | StreamEvent::FilePublic {}
                | StreamEvent::FileDeleted {}
                | StreamEvent::DndUpdatedUser {}
        )
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// The raw `type` discriminator, `""` when absent.
    pub kind: String,
    pub event: StreamEvent,
    pub raw: Value,
}

pub fn decode_event(frame: &str) -> Result<InboundEvent> {
    let raw: Value = serde_json::from_str(frame)
        .map_err(|e| SyncError::protocol("", format!("frame is not JSON: {e}")))?;
    let kind = raw
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if kind.is_empty() {
        // Acks for sent payloads carry no type.
        return Ok(InboundEvent {
            kind,
            event: StreamEvent::Unknown,
            raw,
        });
    }
    let event = StreamEvent::deserialize(&raw)
        .map_err(|e| SyncError::protocol(kind.as_str(), e.to_string()).with_event(raw.clone()))?;
    Ok(InboundEvent { kind, event, raw })
}
