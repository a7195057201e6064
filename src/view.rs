// ABOUTME: Line-oriented terminal rendering of synced conversations
// ABOUTME: Renderer formats one message, TerminalView writes show/refresh/status lines to a sink

use chrono::{DateTime, Local, Utc};
use slackline_core::{ConversationTimestamp, Message, MessageView, Renderer};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;

// =============================================================================
// Renderer
// =============================================================================

/// Formats a message as `HH:MM [parent] $hash sender: text`.
#[derive(Debug, Clone, Default)]
pub struct TerminalRenderer {
    /// Render clock times in UTC instead of the local zone.
    pub utc: bool,
}

impl TerminalRenderer {
    pub fn utc() -> Self {
        Self { utc: true }
    }

    fn clock(&self, ts: &ConversationTimestamp) -> String {
        let Ok(secs) = i64::try_from(ts.major()) else {
            return "--:--".to_string();
        };
        match DateTime::<Utc>::from_timestamp(secs, 0) {
            Some(time) if self.utc => time.format("%H:%M").to_string(),
            Some(time) => time.with_timezone(&Local).format("%H:%M").to_string(),
            None => "--:--".to_string(),
        }
    }
}

fn sender(message: &Message) -> &str {
    message
        .sender_user_id()
        .or_else(|| message.sender_bot_id())
        .unwrap_or("unknown")
}

impl Renderer for TerminalRenderer {
    fn render(&self, message: &Message, hash: &str, thread_hash: Option<&str>) -> String {
        let mut line = self.clock(message.ts());
        if let Some(parent) = thread_hash {
            line.push_str(&format!(" [${parent}]"));
        }
        line.push_str(&format!(" ${hash} {}: ", sender(message)));

        if message.is_deleted() {
            line.push_str("(message deleted)");
            return line;
        }
        line.push_str(message.text());

        if !message.reactions().is_empty() {
            let reactions: Vec<String> = message
                .reactions()
                .iter()
                .map(|r| format!(":{}: {}", r.name, r.count))
                .collect();
            line.push_str(&format!(" [{}]", reactions.join(" ")));
        }
        if message.is_thread_parent() && !message.replies().is_empty() {
            let count = message.replies().len();
            let noun = if count == 1 { "reply" } else { "replies" };
            line.push_str(&format!(" ({count} {noun})"));
        }
        line
    }
}

// =============================================================================
// View
// =============================================================================

/// Writes every view update as a line to `out`.
pub struct TerminalView<W: Write> {
    out: RefCell<W>,
    names: RefCell<HashMap<String, String>>,
}

impl<W: Write> TerminalView<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: RefCell::new(out),
            names: RefCell::new(HashMap::new()),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn label(&self, conversation_id: &str) -> String {
        self.names
            .borrow()
            .get(conversation_id)
            .cloned()
            .unwrap_or_else(|| conversation_id.to_string())
    }

    fn write_line(&self, line: &str) {
        let mut out = self.out.borrow_mut();
        if let Err(e) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            tracing::warn!(error = %e, "Failed writing to terminal");
        }
    }
}

impl<W: Write> MessageView for TerminalView<W> {
    fn show(&self, conversation_id: &str, _ts: &ConversationTimestamp, line: &str) {
        self.write_line(&format!("#{} {line}", self.label(conversation_id)));
    }

    fn refresh(&self, conversation_id: &str, _ts: &ConversationTimestamp, line: &str) {
        self.write_line(&format!("#{} (edited) {line}", self.label(conversation_id)));
    }

    fn conversation_opened(&self, conversation_id: &str, name: &str) {
        self.names
            .borrow_mut()
            .insert(conversation_id.to_string(), name.to_string());
        self.write_line(&format!("-- opened #{name}"));
    }

    fn conversation_closed(&self, conversation_id: &str) {
        self.write_line(&format!("-- closed #{}", self.label(conversation_id)));
    }

    fn hotlist_changed(&self, conversation_id: &str, unseen: usize) {
        tracing::debug!(conversation = %conversation_id, unseen, "Hotlist changed");
    }

    fn status(&self, workspace: &str, message: &str) {
        self.write_line(&format!("-- [{workspace}] {message}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use slackline_core::MessagePayload;

    fn message(value: serde_json::Value) -> Message {
        Message::new(MessagePayload::from_value(&value).unwrap())
    }

    #[test]
    fn test_render_plain_message() {
        let msg = message(json!({"ts": "1700000000.000100", "user": "U1", "text": "hello"}));
        let line = TerminalRenderer::utc().render(&msg, "abc", None);
        assert_eq!(line, "22:13 $abc U1: hello");
    }

    #[test]
    fn test_render_reply_with_reactions() {
        let msg = message(json!({
            "ts": "1700000000.000100",
            "thread_ts": "1699999999.000001",
            "bot_id": "B1",
            "text": "done",
            "reactions": [{"name": "tada", "users": ["U1", "U2"], "count": 2}]
        }));
        let line = TerminalRenderer::utc().render(&msg, "abc", Some("f00"));
        assert_eq!(line, "22:13 [$f00] $abc B1: done [:tada: 2]");
    }

    #[test]
    fn test_render_deleted_message() {
        let mut msg = message(json!({"ts": "1700000000.000100", "user": "U1", "text": "oops"}));
        msg.mark_deleted();
        let line = TerminalRenderer::utc().render(&msg, "abc", None);
        assert_eq!(line, "22:13 $abc U1: (message deleted)");
    }

    #[test]
    fn test_view_labels_lines_with_conversation_name() {
        let view = TerminalView::new(Vec::new());
        let ts: ConversationTimestamp = "1.0".parse().unwrap();
        view.show("C1", &ts, "before open");
        view.conversation_opened("C1", "general");
        view.show("C1", &ts, "hello");
        view.refresh("C1", &ts, "hello!");
        view.status("acme", "Connected to workspace acme");
        view.conversation_closed("C1");

        let output = String::from_utf8(view.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(
            lines,
            vec![
                "#C1 before open",
                "-- opened #general",
                "#general hello",
                "#general (edited) hello!",
                "-- [acme] Connected to workspace acme",
                "-- closed #general",
            ]
        );
    }
}
