// ABOUTME: Integration tests for workspace reconnects: resume fallback and unread reconciliation
// ABOUTME: Scripts the remote API and stream transport through the shared test harness

use serde_json::json;
use slackline_core::testing::TestHarness;
use slackline_core::{ConnectionState, HistoryConfig, SyncError, Workspace, WorkspaceConfig};
use std::time::Duration;

fn workspace(h: &TestHarness) -> Workspace {
    let history = HistoryConfig {
        display_thread_replies: false,
        ..HistoryConfig::default()
    };
    Workspace::new(
        WorkspaceConfig::new("acme", "xoxp-test"),
        history,
        h.scheduler.clone(),
        h.collaborators(),
    )
}

fn script_rtm(h: &TestHarness, url: &str) {
    h.http.script(
        "rtm.connect",
        json!({"ok": true, "url": url, "self": {"id": "UME"}, "team": {"id": "T1"}}),
    );
}

fn script_listing(h: &TestHarness) {
    h.http.script("users.prefs.get", json!({"ok": true, "prefs": {"muted_channels": "C2"}}));
    h.http.script(
        "users.conversations",
        json!({"ok": true, "channels": [{"id": "C1"}, {"id": "C2"}]}),
    );
}

fn open_stream(h: &TestHarness) {
    h.deliver(|| {
        h.transport.accept_open().unwrap();
    });
}

fn hello(ws: &Workspace, fast_reconnect: bool) {
    ws.receive_frame(&json!({"type": "hello", "fast_reconnect": fast_reconnect}).to_string());
}

/// Connected with C1 (unread, shown) and C2 (muted).
fn connected(h: &TestHarness) -> Workspace {
    let ws = workspace(h);
    script_rtm(h, "wss://first");
    script_listing(h);
    for id in ["C1", "C2"] {
        h.http.script(
            "conversations.info",
            json!({"ok": true, "channel": {"id": id, "name": id, "is_member": true, "last_read": "1.0"}}),
        );
    }
    h.http.script("conversations.history", json!({"ok": true, "messages": [{"ts": "2.0"}]}));
    h.http.script("conversations.history", json!({"ok": true, "messages": [{"ts": "2.0"}]}));
    h.http.script("conversations.history", json!({"ok": true, "messages": [{"ts": "2.0"}]}));

    ws.connect();
    open_stream(h);
    hello(&ws, false);
    assert_eq!(ws.state(), ConnectionState::Connected);
    assert_eq!(h.view.shown("C1"), vec!["2.0"]);
    assert!(h.view.shown("C2").is_empty());
    ws
}

#[test]
fn test_stale_resume_token_is_tried_once_then_full_reconnect() {
    let h = TestHarness::new();
    let ws = connected(&h);
    ws.receive_frame(&json!({"type": "reconnect_url", "url": "wss://resume-1"}).to_string());

    script_rtm(&h, "wss://second");
    ws.reconnect();
    h.deliver(|| {
        h.transport.reject_open(SyncError::Http {
            url: "wss://resume-1".to_string(),
            status: Some(401),
            return_code: None,
            error: "resume token expired".to_string(),
        });
    });
    assert_eq!(
        h.transport.opened_urls(),
        vec!["wss://first", "wss://resume-1", "wss://second"]
    );
    assert_eq!(ws.resume_url(), None);
    assert_eq!(ws.state(), ConnectionState::Connecting);

    // A second drop goes straight to a full connect.
    open_stream(&h);
    script_rtm(&h, "wss://third");
    ws.reconnect();
    let urls = h.transport.opened_urls();
    assert_eq!(urls.iter().filter(|url| url.as_str() == "wss://resume-1").count(), 1);
    assert_eq!(urls.last().map(String::as_str), Some("wss://third"));
    assert_eq!(h.http.calls("rtm.connect"), 3);
}

#[test]
fn test_full_reconnect_backfills_unread_and_skips_muted() {
    let h = TestHarness::new();
    let ws = connected(&h);
    ws.disconnect();
    assert_eq!(ws.state(), ConnectionState::Disconnected);

    script_rtm(&h, "wss://second");
    ws.connect();
    open_stream(&h);

    script_listing(&h);
    // C1 hotlist after the shown point, C2 hotlist, then C1's catch-up backfill.
    h.http.script("conversations.history", json!({"ok": true, "messages": [{"ts": "3.0"}]}));
    h.http.script("conversations.history", json!({"ok": true, "messages": [{"ts": "2.0"}]}));
    h.http.script("conversations.history", json!({"ok": true, "messages": [{"ts": "3.0"}]}));
    hello(&ws, false);

    assert_eq!(ws.state(), ConnectionState::Connected);
    // Conversation info is cached across reconnects.
    assert_eq!(h.http.calls("conversations.info"), 2);
    assert_eq!(h.view.shown("C1"), vec!["2.0", "3.0"]);
    assert!(h.view.shown("C2").is_empty());
    assert!(h.view.refreshed("C1").iter().any(|(ts, _)| ts == "2.0"));

    let catch_up = h.http.requests_for("conversations.history").pop().unwrap();
    assert_eq!(catch_up.params["channel"], "C1");
    assert_eq!(catch_up.params["oldest"], "2.0");
    assert!(h.scheduler.is_idle());
}

#[test]
fn test_unread_backfills_wait_for_pacing_delay() {
    let h = TestHarness::new();
    let ws = workspace(&h);
    script_rtm(&h, "wss://first");
    h.http.script("users.prefs.get", json!({"ok": true, "prefs": {"muted_channels": ""}}));
    h.http.script(
        "users.conversations",
        json!({"ok": true, "channels": [{"id": "C1"}, {"id": "C2"}, {"id": "C3"}]}),
    );
    for id in ["C1", "C2", "C3"] {
        h.http.script(
            "conversations.info",
            json!({"ok": true, "channel": {"id": id, "name": id, "is_member": true, "last_read": "1.0"}}),
        );
    }
    for _ in 0..4 {
        h.http.script("conversations.history", json!({"ok": true, "messages": [{"ts": "2.0"}]}));
    }
    ws.connect();
    open_stream(&h);
    hello(&ws, false);
    assert_eq!(h.view.shown("C1"), vec!["2.0"]);
    assert!(h.view.shown("C2").is_empty());

    h.http.script("conversations.history", json!({"ok": true, "messages": [{"ts": "2.0"}]}));
    h.deliver(|| h.timer.advance(Duration::from_millis(999)));
    assert!(h.view.shown("C2").is_empty());
    h.deliver(|| h.timer.advance(Duration::from_millis(1)));
    assert_eq!(h.view.shown("C2"), vec!["2.0"]);

    // Disconnecting stops the remaining catch-up.
    ws.disconnect();
    assert!(h.scheduler.is_idle());
    h.deliver(|| h.timer.advance(Duration::from_millis(1000)));
    assert!(h.view.shown("C3").is_empty());
}

#[test]
fn test_failed_connect_stays_disconnected_and_can_be_retried() {
    let h = TestHarness::new();
    let ws = workspace(&h);
    h.http.script_error(
        "rtm.connect",
        SyncError::Http {
            url: "https://slack.com/api/rtm.connect".to_string(),
            status: None,
            return_code: Some(6),
            error: "could not resolve host".to_string(),
        },
    );
    ws.connect();
    assert_eq!(ws.state(), ConnectionState::Disconnected);
    assert!(h
        .view
        .statuses("acme")
        .iter()
        .any(|status| status.contains("could not resolve host")));

    script_rtm(&h, "wss://first");
    ws.connect();
    assert_eq!(ws.state(), ConnectionState::Connecting);
    assert_eq!(h.transport.opened_urls(), vec!["wss://first"]);
}
