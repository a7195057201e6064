// ABOUTME: Output-side test doubles: an error reporter, a plain renderer and a view that keep everything
// ABOUTME: Lets tests assert on what the engine showed, refreshed and reported

use crate::message::Message;
use crate::timestamp::ConversationTimestamp;
use crate::traits::{ErrorReporter, MessageView, Renderer};
use serde_json::Value;
use std::cell::RefCell;

#[derive(Default)]
pub struct RecordingReporter {
    reports: RefCell<Vec<(String, Option<Value>)>>,
}

impl RecordingReporter {
    pub fn messages(&self) -> Vec<String> {
        self.reports.borrow().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn reports(&self) -> Vec<(String, Option<Value>)> {
        self.reports.borrow().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.borrow().is_empty()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, message: &str, data: Option<&Value>) {
        self.reports
            .borrow_mut()
            .push((message.to_string(), data.cloned()));
    }
}

/// `"{hash} {text}"`, prefixed with `"[{parent hash}] "` for thread replies.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainRenderer;

impl Renderer for PlainRenderer {
    fn render(&self, message: &Message, hash: &str, thread_hash: Option<&str>) -> String {
        let text = if message.is_deleted() {
            "(deleted)"
        } else {
            message.text()
        };
        match thread_hash {
            Some(parent) => format!("[{parent}] {hash} {text}"),
            None => format!("{hash} {text}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    Show {
        conversation: String,
        ts: ConversationTimestamp,
        line: String,
    },
    Refresh {
        conversation: String,
        ts: ConversationTimestamp,
        line: String,
    },
    Opened {
        conversation: String,
        name: String,
    },
    Closed {
        conversation: String,
    },
    Hotlist {
        conversation: String,
        unseen: usize,
    },
    Status {
        workspace: String,
        message: String,
    },
}

#[derive(Default)]
pub struct RecordingView {
    events: RefCell<Vec<ViewEvent>>,
}

impl RecordingView {
    pub fn events(&self) -> Vec<ViewEvent> {
        self.events.borrow().clone()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }

    /// Timestamps shown in `conversation`, in show order.
    pub fn shown(&self, conversation: &str) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ViewEvent::Show { conversation: c, ts, .. } if c == conversation => Some(ts.to_string()),
                _ => None,
            })
            .collect()
    }

    /// Lines shown in `conversation`, in show order.
    pub fn shown_lines(&self, conversation: &str) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ViewEvent::Show { conversation: c, line, .. } if c == conversation => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    /// `(ts, line)` of every refresh in `conversation`.
    pub fn refreshed(&self, conversation: &str) -> Vec<(String, String)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ViewEvent::Refresh { conversation: c, ts, line } if c == conversation => {
                    Some((ts.to_string(), line.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self, workspace: &str) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ViewEvent::Status { workspace: w, message } if w == workspace => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn opened(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ViewEvent::Opened { conversation, .. } => Some(conversation.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ViewEvent::Closed { conversation } => Some(conversation.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: ViewEvent) {
        self.events.borrow_mut().push(event);
    }
}

impl MessageView for RecordingView {
    fn show(&self, conversation_id: &str, ts: &ConversationTimestamp, line: &str) {
        self.push(ViewEvent::Show {
            conversation: conversation_id.to_string(),
            ts: ts.clone(),
            line: line.to_string(),
        });
    }

    fn refresh(&self, conversation_id: &str, ts: &ConversationTimestamp, line: &str) {
        self.push(ViewEvent::Refresh {
            conversation: conversation_id.to_string(),
            ts: ts.clone(),
            line: line.to_string(),
        });
    }

    fn conversation_opened(&self, conversation_id: &str, name: &str) {
        self.push(ViewEvent::Opened {
            conversation: conversation_id.to_string(),
            name: name.to_string(),
        });
    }

    fn conversation_closed(&self, conversation_id: &str) {
        self.push(ViewEvent::Closed {
            conversation: conversation_id.to_string(),
        });
    }

    fn hotlist_changed(&self, conversation_id: &str, unseen: usize) {
        self.push(ViewEvent::Hotlist {
            conversation: conversation_id.to_string(),
            unseen,
        });
    }

    fn status(&self, workspace: &str, message: &str) {
        self.push(ViewEvent::Status {
            workspace: workspace.to_string(),
            message: message.to_string(),
        });
    }
}
