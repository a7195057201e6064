// ABOUTME: Typed wrappers over the HTTP collaborator for the remote methods the sync engine calls
// ABOUTME: Turns `ok: false` responses into SyncError::Remote and follows cursor pagination

use crate::conversation::ConversationInfo;
use crate::error::{Result, SyncError};
use crate::timestamp::ConversationTimestamp;
use crate::traits::{HttpApi, Params};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// Largest page the remote API accepts for list methods.
const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TeamInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SelfInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// `rtm.connect` response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RtmConnect {
    pub url: String,
    #[serde(rename = "self")]
    pub self_user: SelfInfo,
    pub team: TeamInfo,
}

/// Remote API bound to one workspace.
#[derive(Clone)]
pub struct SlackApi {
    http: Rc<dyn HttpApi>,
    workspace: String,
    timeout: Duration,
    page_size: usize,
}

impl fmt::Debug for SlackApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlackApi")
            .field("workspace", &self.workspace)
            .field("timeout", &self.timeout)
            .field("page_size", &self.page_size)
            .finish()
    }
}

fn params(pairs: &[(&str, Value)]) -> Params {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

impl SlackApi {
    pub fn new(http: Rc<dyn HttpApi>, workspace: impl Into<String>, timeout: Duration, page_size: usize) -> Self {
        Self {
            http,
            workspace: workspace.into(),
            timeout,
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    async fn fetch(&self, method: &str, params: Params) -> Result<Value> {
        tracing::debug!(workspace = %self.workspace, method, "Calling remote method");
        let response = self.http.request(method, &params, self.timeout).await?;
        if response.get("ok").and_then(Value::as_bool) == Some(false) {
            let error = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            tracing::debug!(workspace = %self.workspace, method, error, "Remote method failed");
            return Err(SyncError::remote(method, error).with_request(Value::Object(params)));
        }
        Ok(response)
    }

    /// Fetch every page of `list_key`, up to `limit` items when given.
    async fn fetch_list(
        &self,
        method: &str,
        list_key: &str,
        base: Params,
        limit: Option<usize>,
    ) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut remaining = limit;
        loop {
            let page_size = remaining.map_or(self.page_size, |r| r.min(self.page_size));
            let mut request = base.clone();
            request.insert("limit".to_string(), json!(page_size));
            if let Some(cursor) = &cursor {
                request.insert("cursor".to_string(), json!(cursor));
            }

            let mut response = self.fetch(method, request).await?;
            if let Some(page) = response.get_mut(list_key).and_then(Value::as_array_mut) {
                items.append(page);
            }
            remaining = remaining.map(|r| r.saturating_sub(page_size));

            let next = response
                .pointer("/response_metadata/next_cursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            match next {
                Some(next) if remaining != Some(0) => cursor = Some(next),
                _ => break,
            }
        }
        Ok(items)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, method: &str, value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(|e| {
            SyncError::workspace(&self.workspace, format!("unexpected {method} response: {e}"))
        })
    }

    fn messages(&self, method: &str, mut response: Value) -> Result<Vec<Value>> {
        match response.get_mut("messages").map(Value::take) {
            Some(Value::Array(messages)) => Ok(messages),
            _ => Err(SyncError::workspace(
                &self.workspace,
                format!("{method} response has no messages"),
            )),
        }
    }

    // =========================================================================
    // Remote methods
    // =========================================================================

    pub async fn rtm_connect(&self) -> Result<RtmConnect> {
        let response = self.fetch("rtm.connect", Params::new()).await?;
        self.decode("rtm.connect", response)
    }

    /// Channel ids from the `muted_channels` preference.
    pub async fn muted_channels(&self) -> Result<HashSet<String>> {
        let response = self
            .fetch("users.prefs.get", params(&[("prefs", json!("muted_channels"))]))
            .await?;
        let muted = response
            .pointer("/prefs/muted_channels")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(parse_id_list(muted))
    }

    /// Ids of every conversation the user belongs to.
    pub async fn users_conversations(&self, types: &str) -> Result<Vec<String>> {
        let channels = self
            .fetch_list(
                "users.conversations",
                "channels",
                params(&[("types", json!(types)), ("exclude_archived", json!(true))]),
                None,
            )
            .await?;
        Ok(channels
            .iter()
            .filter_map(|c| c.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    pub async fn conversations_info(&self, conversation_id: &str) -> Result<ConversationInfo> {
        let mut response = self
            .fetch("conversations.info", params(&[("channel", json!(conversation_id))]))
            .await?;
        let channel = response.get_mut("channel").map(Value::take).unwrap_or_default();
        self.decode("conversations.info", channel)
    }

    /// The newest page of history.
    pub async fn conversations_history(&self, conversation_id: &str) -> Result<Vec<Value>> {
        let response = self
            .fetch(
                "conversations.history",
                params(&[("channel", json!(conversation_id)), ("limit", json!(self.page_size))]),
            )
            .await?;
        self.messages("conversations.history", response)
    }

    /// Every message strictly newer than `after`, across pages.
    pub async fn conversations_history_after(
        &self,
        conversation_id: &str,
        after: &ConversationTimestamp,
    ) -> Result<Vec<Value>> {
        self.fetch_list(
            "conversations.history",
            "messages",
            params(&[
                ("channel", json!(conversation_id)),
                ("oldest", json!(after.as_str())),
                ("inclusive", json!(false)),
            ]),
            None,
        )
        .await
    }

    /// The thread parent followed by its replies.
    pub async fn conversations_replies(
        &self,
        conversation_id: &str,
        thread_ts: &ConversationTimestamp,
    ) -> Result<Vec<Value>> {
        self.fetch_list(
            "conversations.replies",
            "messages",
            params(&[("channel", json!(conversation_id)), ("ts", json!(thread_ts.as_str()))]),
            None,
        )
        .await
    }

    pub async fn conversations_mark(&self, conversation_id: &str, ts: &ConversationTimestamp) -> Result<()> {
        self.fetch(
            "conversations.mark",
            params(&[("channel", json!(conversation_id)), ("ts", json!(ts.as_str()))]),
        )
        .await?;
        Ok(())
    }

    pub async fn conversations_close(&self, conversation_id: &str) -> Result<()> {
        self.fetch("conversations.close", params(&[("channel", json!(conversation_id))]))
            .await?;
        Ok(())
    }

    pub async fn conversations_leave(&self, conversation_id: &str) -> Result<()> {
        self.fetch("conversations.leave", params(&[("channel", json!(conversation_id))]))
            .await?;
        Ok(())
    }
}

/// Split a comma separated id list, dropping empty entries.
pub fn parse_id_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}
