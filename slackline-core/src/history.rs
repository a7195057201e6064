// ABOUTME: History synchronization for one conversation: backfill, thread replies, hotlist, live intake
// ABOUTME: Remote work suspends on the scheduler; conversation borrows never span an await

use crate::api::SlackApi;
use crate::config::HistoryConfig;
use crate::conversation::{Conversation, RenderedLine};
use crate::error::{Result, SyncError};
use crate::message::MessagePayload;
use crate::metrics;
use crate::scheduler::{gather, Scheduler};
use crate::timestamp::ConversationTimestamp;
use crate::traits::{Collaborators, Renderer};
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

const REPLIES_MISMATCH: &str = "First message in conversations.replies response did not match thread_ts";

enum ViewUpdate {
    Show(RenderedLine),
    Refresh(RenderedLine),
}

struct SyncInner {
    state: RefCell<Conversation>,
    api: SlackApi,
    scheduler: Scheduler,
    collaborators: Collaborators,
}

/// Clears the loading flag however the backfill ends, cancellation included.
struct LoadingGuard(Rc<SyncInner>);

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        if let Ok(mut conversation) = self.0.state.try_borrow_mut() {
            conversation.loading = false;
        }
    }
}

/// A conversation plus everything needed to keep it in sync with the server.
///
/// Cloning yields another handle to the same conversation.
#[derive(Clone)]
pub struct ConversationSync {
    inner: Rc<SyncInner>,
}

impl fmt::Debug for ConversationSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let conversation = self.inner.state.borrow();
        f.debug_struct("ConversationSync")
            .field("id", &conversation.id())
            .field("open", &conversation.is_open())
            .field("messages", &conversation.messages().len())
            .finish()
    }
}

impl ConversationSync {
    pub fn new(
        mut conversation: Conversation,
        api: SlackApi,
        scheduler: Scheduler,
        collaborators: Collaborators,
        history: &HistoryConfig,
    ) -> Self {
        conversation.set_display_thread_replies(history.display_thread_replies);
        Self {
            inner: Rc::new(SyncInner {
                state: RefCell::new(conversation),
                api,
                scheduler,
                collaborators,
            }),
        }
    }

    pub fn id(&self) -> String {
        self.inner.state.borrow().id().to_string()
    }

    /// Read access to the underlying conversation.
    pub fn with<R>(&self, f: impl FnOnce(&Conversation) -> R) -> R {
        f(&self.inner.state.borrow())
    }

    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut Conversation) -> R) -> R {
        f(&mut self.inner.state.borrow_mut())
    }

    fn renderer(&self) -> &dyn Renderer {
        &*self.inner.collaborators.renderer
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn open(&self) {
        let name = {
            let mut conversation = self.inner.state.borrow_mut();
            if conversation.is_open() {
                return;
            }
            conversation.set_open(true);
            conversation.name()
        };
        tracing::info!(conversation = %self.id(), name = %name, "Opened conversation");
        self.inner.collaborators.view.conversation_opened(&self.id(), &name);
    }

    pub fn close(&self) {
        let was_open = self.with_mut(|c| {
            let was_open = c.is_open();
            c.set_open(false);
            was_open
        });
        if was_open {
            tracing::info!(conversation = %self.id(), "Closed conversation");
            self.inner.collaborators.view.conversation_closed(&self.id());
        }
    }

    pub fn mark_disconnected(&self) {
        self.with_mut(Conversation::mark_disconnected);
    }

    // =========================================================================
    // Backfill
    // =========================================================================

    /// Bring the shown history up to date.
    ///
    /// Does nothing when history is already shown, unless `update` is set or
    /// the shown history went stale. A request made while a backfill runs is
    /// folded into exactly one extra pass.
    pub async fn fill_history(&self, update: bool) -> Result<()> {
        {
            let mut conversation = self.inner.state.borrow_mut();
            if conversation.loading {
                conversation.needs_refresh = true;
                return Ok(());
            }
            if conversation.last_printed().is_some() && !conversation.history_stale && !update {
                return Ok(());
            }
            conversation.loading = true;
        }
        let _guard = LoadingGuard(Rc::clone(&self.inner));

        loop {
            self.backfill_pass().await?;
            let again = self.with_mut(|c| std::mem::take(&mut c.needs_refresh));
            if !again {
                break;
            }
            tracing::debug!(conversation = %self.id(), "Running queued history refresh");
        }
        Ok(())
    }

    async fn backfill_pass(&self) -> Result<()> {
        metrics::record_backfill_pass();
        let (id, after, stale) = self.with(|c| {
            let after = if c.history_stale {
                c.first_ts().cloned()
            } else {
                c.last_printed().cloned()
            };
            (c.id().to_string(), after, c.history_stale)
        });
        tracing::debug!(
            conversation = %id,
            after = after.as_ref().map(|ts| ts.as_str()).unwrap_or("none"),
            stale,
            "Backfilling history"
        );

        let raw = match &after {
            Some(after) => self.inner.api.conversations_history_after(&id, after).await?,
            None => self.inner.api.conversations_history(&id).await?,
        };
        let added = self.merge_messages(&raw);

        let unfilled_threads: Vec<ConversationTimestamp> = self.with(|c| {
            if !c.display_thread_replies() {
                return Vec::new();
            }
            added
                .into_iter()
                .filter(|ts| {
                    c.message(ts)
                        .is_some_and(|m| m.is_thread_parent() && !m.replies_filled())
                })
                .collect()
        });
        if !unfilled_threads.is_empty() {
            let fetches = unfilled_threads.into_iter().map(|thread_ts| {
                let this = self.clone();
                async move { this.fetch_replies(thread_ts).await }
            });
            gather(self.inner.scheduler.spawn_all("fetch_replies", fetches)).await?;
        }

        let updates = {
            let mut conversation = self.inner.state.borrow_mut();
            let mut updates = Vec::new();
            if stale {
                conversation.history_stale = false;
                updates.extend(
                    conversation
                        .rerender_all(self.renderer())
                        .into_iter()
                        .map(ViewUpdate::Refresh),
                );
            }
            for ts in conversation.unprinted() {
                updates.extend(print_locked(&mut conversation, &ts, self.renderer()));
            }
            updates
        };
        self.emit(updates);
        Ok(())
    }

    /// Load a thread's parent and replies and link them.
    pub async fn fetch_replies(&self, thread_ts: ConversationTimestamp) -> Result<()> {
        let id = self.id();
        let raw = self.inner.api.conversations_replies(&id, &thread_ts).await?;
        let first = raw
            .first()
            .and_then(|m| m.get("ts"))
            .and_then(Value::as_str)
            .and_then(|ts| ts.parse::<ConversationTimestamp>().ok());
        if first.as_ref() != Some(&thread_ts) {
            return Err(SyncError::workspace(self.inner.api.workspace(), REPLIES_MISMATCH));
        }

        let added = self.merge_messages(&raw);
        self.with_mut(|c| {
            if let Some(parent) = c.message_mut(&thread_ts) {
                parent.set_replies_filled();
            }
        });
        tracing::debug!(conversation = %id, thread = %thread_ts, messages = added.len(), "Fetched thread replies");
        Ok(())
    }

    /// Add every well-formed message of a page, then link replies. One bad
    /// message is reported and skipped.
    fn merge_messages(&self, raw: &[Value]) -> Vec<ConversationTimestamp> {
        let mut errors = Vec::new();
        let added = self.with_mut(|c| {
            let mut added = Vec::with_capacity(raw.len());
            for value in raw {
                match MessagePayload::from_value(value) {
                    Ok(payload) => added.push(c.add_or_update(payload)),
                    Err(error) => errors.push(error),
                }
            }
            for ts in &added {
                c.link_to_parent(ts);
            }
            added
        });
        self.report_errors(errors);
        added
    }

    // =========================================================================
    // Hotlist
    // =========================================================================

    /// Recompute the pending-notification set from the server.
    pub async fn set_hotlist(&self) -> Result<()> {
        let (id, after, last_read, threads) = self.with_mut(|c| {
            if c.last_printed().is_some() {
                c.history_stale = true;
            }
            let after = if c.display_thread_replies() {
                c.first_ts().cloned()
            } else {
                c.last_printed().cloned()
            };
            let threads = c.display_thread_replies() && !c.is_muted();
            (c.id().to_string(), after, c.last_read().clone(), threads)
        });

        let raw = match &after {
            Some(after) => self.inner.api.conversations_history_after(&id, after).await?,
            None => self.inner.api.conversations_history(&id).await?,
        };

        let mut errors = Vec::new();
        let unseen = self.with_mut(|c| {
            for value in &raw {
                let payload = match MessagePayload::from_value(value) {
                    Ok(payload) => payload,
                    Err(error) => {
                        errors.push(error);
                        continue;
                    }
                };
                if payload.ts > last_read {
                    c.hotlist_add(payload.ts.clone());
                }
                if threads {
                    if let Some(latest) = payload.latest_reply.filter(|latest| *latest > last_read) {
                        c.hotlist_add(latest);
                    }
                }
            }
            c.hotlist().len()
        });
        self.report_errors(errors);
        tracing::debug!(conversation = %id, unseen, "Computed hotlist");
        self.inner.collaborators.view.hotlist_changed(&id, unseen);
        Ok(())
    }

    // =========================================================================
    // Live intake
    // =========================================================================

    /// A message arrived on the stream.
    pub async fn add_new_message(&self, payload: MessagePayload) -> Result<()> {
        let (ts, missing_parent) = self.with_mut(|c| {
            let ts = c.add_or_update(payload);
            let linked = c.link_to_parent(&ts);
            let missing_parent = c
                .message(&ts)
                .filter(|m| m.is_reply() && !linked)
                .and_then(|m| m.thread_ts().cloned());
            (ts, missing_parent)
        });
        if let Some(thread_ts) = missing_parent {
            self.fetch_replies(thread_ts).await?;
        }

        enum Next {
            Nothing,
            Print,
            Backfill,
        }
        let next = self.with_mut(|c| {
            let displayable = c.message(&ts).is_some_and(|m| c.should_display(m));
            if !displayable || c.is_loading() {
                // A running backfill prints it.
                Next::Nothing
            } else if c.last_printed().is_some() {
                Next::Print
            } else if c.is_open() {
                if &ts > c.last_read() {
                    c.hotlist_add(ts.clone());
                }
                if c.is_message_muted(&ts) {
                    Next::Nothing
                } else {
                    Next::Backfill
                }
            } else {
                Next::Nothing
            }
        });
        match next {
            Next::Nothing => {}
            Next::Print => self.print_message(&ts),
            Next::Backfill => self.fill_history(false).await?,
        }
        Ok(())
    }

    /// Show `ts`, or refresh it if it is at or before the last shown message.
    pub fn print_message(&self, ts: &ConversationTimestamp) {
        let updates = self.with_mut(|c| print_locked(c, ts, self.renderer()));
        self.emit(updates);
    }

    pub fn change_message(&self, ts: &ConversationTimestamp, payload: MessagePayload) {
        let updates = self.with_mut(|c| {
            if !c.change_message(ts, payload) {
                return None;
            }
            Some(refresh_locked(c, ts, self.renderer()))
        });
        match updates {
            Some(updates) => self.emit(updates),
            None => tracing::debug!(conversation = %self.id(), ts = %ts, "Edit for unknown message ignored"),
        }
    }

    pub fn delete_message(&self, ts: &ConversationTimestamp) {
        let updates = self.with_mut(|c| {
            if !c.delete_message(ts) {
                return None;
            }
            Some(refresh_locked(c, ts, self.renderer()))
        });
        match updates {
            Some(updates) => self.emit(updates),
            None => tracing::debug!(conversation = %self.id(), ts = %ts, "Delete for unknown message ignored"),
        }
    }

    pub fn reaction_add(&self, ts: &ConversationTimestamp, name: &str, user_id: &str) {
        let updates = self.with_mut(|c| {
            if c.reaction_add(ts, name, user_id) {
                refresh_locked(c, ts, self.renderer())
            } else {
                Vec::new()
            }
        });
        self.emit(updates);
    }

    pub fn reaction_remove(&self, ts: &ConversationTimestamp, name: &str, user_id: &str) {
        let updates = self.with_mut(|c| {
            if c.reaction_remove(ts, name, user_id) {
                refresh_locked(c, ts, self.renderer())
            } else {
                Vec::new()
            }
        });
        self.emit(updates);
    }

    // =========================================================================
    // Read markers and subscriptions
    // =========================================================================

    pub fn set_last_read(&self, ts: ConversationTimestamp) {
        self.with_mut(|c| c.set_last_read(ts));
        self.inner.collaborators.view.hotlist_changed(&self.id(), 0);
    }

    /// Mark everything received so far as read, on the server and locally.
    pub async fn mark_read(&self) -> Result<()> {
        let (id, newest) = self.with(|c| (c.id().to_string(), c.messages().keys().next_back().cloned()));
        let Some(newest) = newest else {
            return Ok(());
        };
        self.inner.api.conversations_mark(&id, &newest).await?;
        self.set_last_read(newest);
        Ok(())
    }

    pub fn thread_marked(&self, thread_ts: &ConversationTimestamp, last_read: ConversationTimestamp) {
        self.with_mut(|c| {
            if let Some(message) = c.message_mut(thread_ts) {
                message.set_last_read(last_read);
            }
        });
    }

    pub fn set_subscribed(&self, thread_ts: &ConversationTimestamp, subscribed: bool) {
        self.with_mut(|c| {
            if let Some(message) = c.message_mut(thread_ts) {
                message.set_subscribed(subscribed);
            }
        });
    }

    // =========================================================================
    // Output
    // =========================================================================

    fn emit(&self, updates: Vec<ViewUpdate>) {
        if updates.is_empty() {
            return;
        }
        let (id, unseen) = self.with(|c| (c.id().to_string(), c.hotlist().len()));
        let view = &self.inner.collaborators.view;
        let mut shown = false;
        for update in updates {
            match update {
                ViewUpdate::Show((ts, line)) => {
                    shown = true;
                    view.show(&id, &ts, &line);
                }
                ViewUpdate::Refresh((ts, line)) => view.refresh(&id, &ts, &line),
            }
        }
        if shown {
            view.hotlist_changed(&id, unseen);
        }
    }

    fn report_errors(&self, errors: Vec<SyncError>) {
        if errors.is_empty() {
            return;
        }
        let id = self.id();
        for error in errors {
            tracing::warn!(conversation = %id, error = %error, "Skipping malformed message");
            let data = match &error {
                SyncError::Protocol { event, .. } => event.clone(),
                _ => None,
            };
            self.inner.collaborators.reporter.report(&error.to_string(), data.as_ref());
        }
    }
}

fn print_locked(
    conversation: &mut Conversation,
    ts: &ConversationTimestamp,
    renderer: &dyn Renderer,
) -> Vec<ViewUpdate> {
    if conversation.last_printed().is_some_and(|last| ts <= last) {
        return refresh_locked(conversation, ts, renderer);
    }
    let Some(rendered) = conversation.render(ts, renderer) else {
        return Vec::new();
    };
    conversation.record_printed(ts);
    let mut updates = vec![ViewUpdate::Show((ts.clone(), rendered.line))];
    updates.extend(rendered.refreshed.into_iter().map(ViewUpdate::Refresh));
    updates
}

fn refresh_locked(
    conversation: &mut Conversation,
    ts: &ConversationTimestamp,
    renderer: &dyn Renderer,
) -> Vec<ViewUpdate> {
    conversation
        .rerender(ts, renderer)
        .into_iter()
        .map(ViewUpdate::Refresh)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationInfo;
    use crate::testing::TestHarness;
    use serde_json::json;
    use std::time::Duration;

    fn ts(raw: &str) -> ConversationTimestamp {
        raw.parse().unwrap()
    }

    fn payload(raw: Value) -> MessagePayload {
        MessagePayload::from_value(&raw).unwrap()
    }

    fn sync_with(h: &TestHarness, history: HistoryConfig) -> ConversationSync {
        let info: ConversationInfo =
            serde_json::from_value(json!({"id": "C1", "name": "general", "last_read": "1.0"})).unwrap();
        let api = SlackApi::new(h.http.clone(), "acme", Duration::from_secs(30), 1000);
        let sync = ConversationSync::new(Conversation::new(info), api, h.scheduler.clone(), h.collaborators(), &history);
        sync.open();
        sync
    }

    fn sync(h: &TestHarness) -> ConversationSync {
        sync_with(
            h,
            HistoryConfig {
                display_thread_replies: false,
                ..HistoryConfig::default()
            },
        )
    }

    fn spawn_fill(h: &TestHarness, sync: &ConversationSync, update: bool) -> crate::scheduler::Task<()> {
        let sync = sync.clone();
        h.scheduler.spawn("fill_history", async move { sync.fill_history(update).await })
    }

    #[test]
    fn test_backfill_merges_with_live_message_in_order() {
        let h = TestHarness::new();
        let sync = sync(&h);
        sync.with_mut(|c| c.add_or_update(payload(json!({"ts": "4.0", "text": "live"}))));

        let task = spawn_fill(&h, &sync, false);
        assert!(sync.with(Conversation::is_loading));
        h.deliver(|| {
            h.http.respond(
                "conversations.history",
                json!({"ok": true, "messages": [{"ts": "5.0", "text": "b"}, {"ts": "3.0", "text": "a"}]}),
            );
        });

        task.result().result().unwrap();
        assert!(!sync.with(Conversation::is_loading));
        assert_eq!(h.view.shown("C1"), vec!["3.0", "4.0", "5.0"]);
        assert_eq!(sync.with(|c| c.last_printed().cloned()), Some(ts("5.0")));
    }

    #[test]
    fn test_request_while_loading_runs_one_extra_pass() {
        let h = TestHarness::new();
        let sync = sync(&h);

        let first = spawn_fill(&h, &sync, false);
        let second = spawn_fill(&h, &sync, true);
        let third = spawn_fill(&h, &sync, true);
        assert!(second.is_done() && third.is_done());
        assert_eq!(h.http.calls("conversations.history"), 1);

        h.deliver(|| {
            h.http.respond("conversations.history", json!({"ok": true, "messages": [{"ts": "2.0"}]}));
        });
        let pending = h.http.pending("conversations.history");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].params["oldest"], "2.0");

        h.deliver(|| {
            h.http.respond("conversations.history", json!({"ok": true, "messages": [{"ts": "3.0"}]}));
        });
        first.result().result().unwrap();
        assert_eq!(h.http.calls("conversations.history"), 2);
        assert_eq!(h.view.shown("C1"), vec!["2.0", "3.0"]);
    }

    #[test]
    fn test_already_shown_history_is_not_refetched() {
        let h = TestHarness::new();
        let sync = sync(&h);
        h.http.script("conversations.history", json!({"ok": true, "messages": [{"ts": "2.0"}]}));
        spawn_fill(&h, &sync, false).result().result().unwrap();

        spawn_fill(&h, &sync, false).result().result().unwrap();
        assert_eq!(h.http.calls("conversations.history"), 1);
    }

    #[test]
    fn test_cancelled_backfill_clears_loading() {
        let h = TestHarness::new();
        let sync = sync(&h);
        let task = spawn_fill(&h, &sync, false);
        assert!(sync.with(Conversation::is_loading));
        task.cancel(Some("closing".to_string())).unwrap();
        assert!(!sync.with(Conversation::is_loading));
        assert!(h.scheduler.is_idle());
    }

    #[test]
    fn test_malformed_message_is_reported_and_skipped() {
        let h = TestHarness::new();
        let sync = sync(&h);
        h.http.script(
            "conversations.history",
            json!({"ok": true, "messages": [{"ts": "3.0"}, {"text": "no ts"}, {"ts": "2.0"}]}),
        );
        spawn_fill(&h, &sync, false).result().result().unwrap();
        assert_eq!(h.view.shown("C1"), vec!["2.0", "3.0"]);
        let reports = h.reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1.as_ref().unwrap()["text"], "no ts");
    }

    #[test]
    fn test_backfill_fetches_thread_replies_when_inline() {
        let h = TestHarness::new();
        let sync = sync_with(&h, HistoryConfig::default());
        let task = spawn_fill(&h, &sync, false);
        h.deliver(|| {
            h.http.respond(
                "conversations.history",
                json!({"ok": true, "messages": [{"ts": "2.0", "thread_ts": "2.0", "text": "root"}]}),
            );
        });
        assert!(!task.is_done());
        let replies = h.http.pending("conversations.replies");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].params["ts"], "2.0");

        h.deliver(|| {
            h.http.respond(
                "conversations.replies",
                json!({"ok": true, "messages": [
                    {"ts": "2.0", "thread_ts": "2.0", "text": "root"},
                    {"ts": "3.0", "thread_ts": "2.0", "text": "re"}
                ]}),
            );
        });
        task.result().result().unwrap();
        assert_eq!(h.view.shown("C1"), vec!["2.0", "3.0"]);
        sync.with(|c| {
            let parent = c.message(&ts("2.0")).unwrap();
            assert!(parent.replies_filled());
            assert_eq!(parent.replies(), &[ts("3.0")]);
        });
    }

    #[test]
    fn test_fetch_replies_rejects_mismatched_first_message() {
        let h = TestHarness::new();
        let sync = sync(&h);
        h.http.script(
            "conversations.replies",
            json!({"ok": true, "messages": [{"ts": "9.0", "thread_ts": "2.0"}]}),
        );
        let s = sync.clone();
        let task = h.scheduler.spawn("replies", async move { s.fetch_replies(ts("2.0")).await });
        let err = task.result().result().unwrap_err();
        assert_eq!(err, SyncError::workspace("acme", REPLIES_MISMATCH));
    }

    #[test]
    fn test_reply_seen_live_and_in_backfill_links_once() {
        let h = TestHarness::new();
        let sync = sync(&h);
        sync.with_mut(|c| c.add_or_update(payload(json!({"ts": "1.0", "thread_ts": "1.0"}))));

        let s = sync.clone();
        h.scheduler
            .spawn("live", async move {
                s.add_new_message(payload(json!({"ts": "2.0", "thread_ts": "1.0", "text": "live"})))
                    .await
            })
            .result()
            .result()
            .unwrap();

        h.http.script(
            "conversations.replies",
            json!({"ok": true, "messages": [
                {"ts": "1.0", "thread_ts": "1.0"},
                {"ts": "2.0", "thread_ts": "1.0", "text": "edited"}
            ]}),
        );
        let s = sync.clone();
        h.scheduler
            .spawn("replies", async move { s.fetch_replies(ts("1.0")).await })
            .result()
            .result()
            .unwrap();

        sync.with(|c| {
            assert_eq!(c.message(&ts("1.0")).unwrap().replies(), &[ts("2.0")]);
            assert_eq!(c.message(&ts("2.0")).unwrap().text(), "edited");
        });
    }

    #[test]
    fn test_live_reply_with_unknown_parent_fetches_thread() {
        let h = TestHarness::new();
        let sync = sync(&h);
        let s = sync.clone();
        let task = h.scheduler.spawn("live", async move {
            s.add_new_message(payload(json!({"ts": "6.0", "thread_ts": "5.0"}))).await
        });
        assert_eq!(h.http.pending("conversations.replies").len(), 1);
        h.deliver(|| {
            h.http.respond(
                "conversations.replies",
                json!({"ok": true, "messages": [{"ts": "5.0", "thread_ts": "5.0"}, {"ts": "6.0", "thread_ts": "5.0"}]}),
            );
        });
        task.result().result().unwrap();
        sync.with(|c| assert_eq!(c.message(&ts("5.0")).unwrap().replies(), &[ts("6.0")]));
    }

    #[test]
    fn test_live_message_prints_after_history_is_shown() {
        let h = TestHarness::new();
        let sync = sync(&h);
        h.http.script("conversations.history", json!({"ok": true, "messages": [{"ts": "2.0"}]}));
        spawn_fill(&h, &sync, false).result().result().unwrap();

        let s = sync.clone();
        h.scheduler
            .spawn("live", async move { s.add_new_message(payload(json!({"ts": "3.0", "text": "new"}))).await })
            .result()
            .result()
            .unwrap();
        assert_eq!(h.view.shown("C1"), vec!["2.0", "3.0"]);
        assert!(sync.with(|c| c.hotlist().contains(&ts("3.0"))));
        assert_eq!(h.http.calls("conversations.history"), 1);
    }

    #[test]
    fn test_live_message_in_unshown_conversation_triggers_backfill() {
        let h = TestHarness::new();
        let sync = sync(&h);
        let s = sync.clone();
        let task = h.scheduler.spawn("live", async move {
            s.add_new_message(payload(json!({"ts": "3.0", "text": "hi"}))).await
        });
        assert!(sync.with(|c| c.hotlist().contains(&ts("3.0"))));
        assert_eq!(h.http.pending("conversations.history").len(), 1);
        h.deliver(|| {
            h.http.respond("conversations.history", json!({"ok": true, "messages": [{"ts": "3.0", "text": "hi"}]}));
        });
        task.result().result().unwrap();
        assert_eq!(h.view.shown("C1"), vec!["3.0"]);
    }

    #[test]
    fn test_set_hotlist_counts_unread_and_thread_activity() {
        let h = TestHarness::new();
        let sync = sync_with(&h, HistoryConfig::default());
        h.http.script(
            "conversations.history",
            json!({"ok": true, "messages": [
                {"ts": "3.0"},
                {"ts": "0.5", "thread_ts": "0.5", "latest_reply": "4.0"},
                {"ts": "0.7"}
            ]}),
        );
        let s = sync.clone();
        h.scheduler.spawn("hotlist", async move { s.set_hotlist().await }).result().result().unwrap();

        let hotlist: Vec<String> = sync.with(|c| c.hotlist().iter().map(|t| t.to_string()).collect());
        assert_eq!(hotlist, vec!["3.0", "4.0"]);
        // Hotlist computation does not store messages.
        assert!(sync.with(|c| c.messages().is_empty()));
    }

    #[test]
    fn test_edit_delete_and_reaction_refresh_shown_line() {
        let h = TestHarness::new();
        let sync = sync(&h);
        h.http.script("conversations.history", json!({"ok": true, "messages": [{"ts": "2.0", "text": "hello"}]}));
        spawn_fill(&h, &sync, false).result().result().unwrap();

        sync.change_message(&ts("2.0"), payload(json!({"ts": "2.0", "text": "hello!"})));
        sync.reaction_add(&ts("2.0"), "wave", "U1");
        sync.reaction_add(&ts("2.0"), "wave", "U1");
        sync.delete_message(&ts("2.0"));
        sync.change_message(&ts("9.0"), payload(json!({"ts": "9.0"})));

        let refreshed = h.view.refreshed("C1");
        assert_eq!(refreshed.len(), 3);
        assert!(refreshed[0].1.ends_with("hello!"));
        assert_eq!(refreshed[2].1, " (deleted)");
    }

    #[test]
    fn test_mark_read_updates_server_and_clears_hotlist() {
        let h = TestHarness::new();
        let sync = sync(&h);
        h.http.script("conversations.history", json!({"ok": true, "messages": [{"ts": "3.0"}, {"ts": "2.0"}]}));
        spawn_fill(&h, &sync, false).result().result().unwrap();
        assert_eq!(sync.with(|c| c.hotlist().len()), 2);

        h.http.script("conversations.mark", json!({"ok": true}));
        let s = sync.clone();
        h.scheduler.spawn("mark", async move { s.mark_read().await }).result().result().unwrap();

        let mark = &h.http.requests_for("conversations.mark")[0];
        assert_eq!(mark.params["ts"], "3.0");
        assert!(sync.with(|c| c.hotlist().is_empty()));
        assert_eq!(sync.with(|c| c.last_read().clone()), ts("3.0"));
    }

    #[test]
    fn test_stale_history_refetches_from_oldest_and_rerenders() {
        let h = TestHarness::new();
        let sync = sync(&h);
        h.http.script("conversations.history", json!({"ok": true, "messages": [{"ts": "3.0", "text": "b"}, {"ts": "2.0", "text": "a"}]}));
        spawn_fill(&h, &sync, false).result().result().unwrap();

        sync.mark_disconnected();
        h.http.script(
            "conversations.history",
            json!({"ok": true, "messages": [{"ts": "4.0", "text": "c"}, {"ts": "3.0", "text": "b2"}]}),
        );
        spawn_fill(&h, &sync, false).result().result().unwrap();

        let second = &h.http.requests_for("conversations.history")[1];
        assert_eq!(second.params["oldest"], "2.0");
        assert_eq!(h.view.shown("C1"), vec!["2.0", "3.0", "4.0"]);
        let refreshed: Vec<String> = h.view.refreshed("C1").into_iter().map(|(ts, _)| ts).collect();
        assert_eq!(refreshed, vec!["2.0", "3.0"]);
        assert!(h.view.refreshed("C1")[1].1.ends_with("b2"));
    }
}
