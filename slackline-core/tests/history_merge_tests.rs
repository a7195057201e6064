// ABOUTME: Integration tests for merging backfilled history with live-streamed messages
// ABOUTME: Drives ConversationSync through mock collaborators and checks ordering and reply linkage

use serde_json::{json, Value};
use slackline_core::api::SlackApi;
use slackline_core::testing::TestHarness;
use slackline_core::{
    Conversation, ConversationInfo, ConversationSync, ConversationTimestamp, HistoryConfig,
    MessagePayload, SyncError,
};
use std::time::Duration;

fn ts(raw: &str) -> ConversationTimestamp {
    raw.parse().unwrap()
}

fn payload(value: Value) -> MessagePayload {
    MessagePayload::from_value(&value).unwrap()
}

fn open_channel(h: &TestHarness, display_thread_replies: bool) -> ConversationSync {
    let info: ConversationInfo = serde_json::from_value(json!({
        "id": "C1",
        "name": "general",
        "is_member": true,
        "last_read": "0.5"
    }))
    .unwrap();
    let api = SlackApi::new(h.http.clone(), "acme", Duration::from_secs(30), 1000);
    let history = HistoryConfig {
        display_thread_replies,
        ..HistoryConfig::default()
    };
    let sync = ConversationSync::new(
        Conversation::new(info),
        api,
        h.scheduler.clone(),
        h.collaborators(),
        &history,
    );
    sync.open();
    sync
}

#[test]
fn test_backfill_page_merges_around_live_message() {
    let h = TestHarness::new();
    let sync = open_channel(&h, false);

    let live = sync.clone();
    let task = h.scheduler.spawn("live", async move {
        live.add_new_message(payload(json!({"ts": "4.0", "text": "live"}))).await
    });
    // The live message kicked off a backfill that is now waiting on the server.
    assert!(!task.is_done());
    assert!(sync.with(Conversation::is_loading));
    assert_eq!(h.http.pending("conversations.history").len(), 1);

    h.deliver(|| {
        h.http.respond(
            "conversations.history",
            json!({"ok": true, "messages": [{"ts": "5.0", "text": "newest"}, {"ts": "3.0", "text": "oldest"}]}),
        );
    });

    assert_eq!(task.result().result(), Ok(()));
    let order: Vec<ConversationTimestamp> = sync.with(|c| c.messages().keys().cloned().collect());
    assert_eq!(order, vec![ts("3.0"), ts("4.0"), ts("5.0")]);
    assert_eq!(h.view.shown("C1"), vec!["3.0", "4.0", "5.0"]);
    assert!(!sync.with(Conversation::is_loading));
}

#[test]
fn test_live_message_during_backfill_is_printed_once() {
    let h = TestHarness::new();
    let sync = open_channel(&h, false);

    let filling = sync.clone();
    h.scheduler
        .spawn("fill", async move { filling.fill_history(false).await });
    let live = sync.clone();
    h.scheduler.spawn("live", async move {
        live.add_new_message(payload(json!({"ts": "2.0", "text": "during"}))).await
    });
    assert!(h.view.shown("C1").is_empty());

    h.deliver(|| {
        h.http.respond(
            "conversations.history",
            json!({"ok": true, "messages": [{"ts": "2.0", "text": "during"}, {"ts": "1.0"}]}),
        );
    });
    assert_eq!(h.view.shown("C1"), vec!["1.0", "2.0"]);

    let live = sync.clone();
    h.scheduler.spawn("live", async move {
        live.add_new_message(payload(json!({"ts": "2.0", "text": "during"}))).await
    });
    assert_eq!(h.view.shown("C1"), vec!["1.0", "2.0"]);
}

#[test]
fn test_reply_seen_live_and_in_backfill_is_linked_once() {
    let h = TestHarness::new();
    let sync = open_channel(&h, true);

    h.http.script(
        "conversations.history",
        json!({"ok": true, "messages": [{"ts": "1.0", "thread_ts": "1.0", "reply_count": 1, "latest_reply": "1.5"}]}),
    );
    h.http.script(
        "conversations.replies",
        json!({"ok": true, "messages": [
            {"ts": "1.0", "thread_ts": "1.0"},
            {"ts": "1.5", "thread_ts": "1.0", "text": "first"}
        ]}),
    );
    let filling = sync.clone();
    h.scheduler
        .spawn("fill", async move { filling.fill_history(false).await })
        .result()
        .result()
        .unwrap();

    let live = sync.clone();
    h.scheduler
        .spawn("live", async move {
            live.add_new_message(payload(json!({"ts": "1.5", "thread_ts": "1.0", "text": "edited live"})))
                .await
        })
        .result()
        .result()
        .unwrap();

    h.http.script(
        "conversations.replies",
        json!({"ok": true, "messages": [
            {"ts": "1.0", "thread_ts": "1.0"},
            {"ts": "1.5", "thread_ts": "1.0", "text": "from backfill"},
            {"ts": "1.7", "thread_ts": "1.0", "text": "second"}
        ]}),
    );
    let fetching = sync.clone();
    h.scheduler
        .spawn("replies", async move { fetching.fetch_replies(ts("1.0")).await })
        .result()
        .result()
        .unwrap();

    sync.with(|c| {
        let parent = c.message(&ts("1.0")).unwrap();
        assert_eq!(parent.replies(), &[ts("1.5"), ts("1.7")]);
        // Last write wins on content.
        assert_eq!(c.message(&ts("1.5")).unwrap().text(), "from backfill");
    });
}

#[test]
fn test_malformed_message_does_not_abort_page() {
    let h = TestHarness::new();
    let sync = open_channel(&h, false);
    h.http.script(
        "conversations.history",
        json!({"ok": true, "messages": [{"ts": "3.0"}, {"text": "no timestamp"}, {"ts": "2.0"}]}),
    );
    let filling = sync.clone();
    h.scheduler
        .spawn("fill", async move { filling.fill_history(false).await })
        .result()
        .result()
        .unwrap();

    assert_eq!(h.view.shown("C1"), vec!["2.0", "3.0"]);
    assert_eq!(h.reporter.messages().len(), 1);
}

#[test]
fn test_failed_backfill_clears_loading_and_surfaces_error() {
    let h = TestHarness::new();
    let sync = open_channel(&h, false);
    h.http.script("conversations.history", json!({"ok": false, "error": "ratelimited"}));

    let filling = sync.clone();
    let outcome = h
        .scheduler
        .spawn("fill", async move { filling.fill_history(false).await })
        .result()
        .result();
    assert!(matches!(outcome, Err(SyncError::Remote { ref error, .. }) if error == "ratelimited"));
    assert!(!sync.with(Conversation::is_loading));
}
