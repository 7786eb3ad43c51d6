use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jervis_core::db::Db;
use jervis_core::error::looks_like_auth_error;
use jervis_core::poller::PollHandler;
use jervis_core::types::{Connection, ConnectionKind, ConnectionState, WorkItem, WorkItemKind, WorkItemState};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Thin REST client over a Slack/Teams-shaped chat API: history polling
/// plus the single outbound "post a message" call the `POST_CHAT_MESSAGE`
/// plan tool (C10) drives when a finalized answer needs delivering back
/// into the channel it came from.
pub struct ChatClient {
    http: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub channel: String,
    pub author: String,
    pub text: String,
    pub posted_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    messages: Vec<ChatMessage>,
}

impl Default for ChatClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    /// Fetches messages posted since `since` (default: last 24 hours),
    /// ordered oldest-first.
    pub async fn history(&self, conn: &Connection, since: Option<DateTime<Utc>>) -> Result<Vec<ChatMessage>> {
        let since = since.unwrap_or_else(|| Utc::now() - Duration::hours(24));
        Ok(self
            .http
            .get(format!("{}/api/messages.history", conn.base_url))
            .bearer_auth(&conn.credentials)
            .query(&[("oldest", since.timestamp().to_string().as_str())])
            .send()
            .await?
            .error_for_status()?
            .json::<HistoryResponse>()
            .await?
            .messages)
    }

    pub async fn post_message(&self, conn: &Connection, channel: &str, text: &str) -> Result<()> {
        self.http
            .post(format!("{}/api/messages.post", conn.base_url))
            .bearer_auth(&conn.credentials)
            .json(&serde_json::json!({"channel": channel, "text": text}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// C5 chat polling handler: one account per `Connection` of kind `Chat`.
pub struct ChatHandler {
    db: Arc<Db>,
    client: ChatClient,
}

impl ChatHandler {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db, client: ChatClient::new() }
    }
}

#[async_trait]
impl PollHandler<Connection> for ChatHandler {
    async fn accounts(&self) -> Result<Vec<Connection>> {
        Ok(self
            .db
            .list_connections_by_kind(ConnectionKind::Chat)?
            .into_iter()
            .filter(|c| c.state == ConnectionState::Valid)
            .collect())
    }

    async fn last_poll(&self, account: &Connection) -> Result<Option<DateTime<Utc>>> {
        Ok(self.db.get_polling_state(account.id, "chat")?.and_then(|s| s.last_polled_at))
    }

    async fn execute_poll(&self, account: &Connection) -> Result<()> {
        let since = self.db.get_polling_state(account.id, "chat")?.and_then(|s| s.last_seen_updated_at);

        let messages = match self.client.history(account, since).await {
            Ok(messages) => messages,
            Err(e) => {
                if looks_like_auth_error(&e.to_string()) {
                    self.db.set_connection_state(account.id, ConnectionState::Invalid)?;
                    warn!(connection_id = account.id, "chat auth failure, connection invalidated");
                }
                return Err(e);
            }
        };

        let mut max_seen = since;
        for message in &messages {
            if let Some(prior_max) = since {
                if message.posted_at <= prior_max {
                    continue;
                }
            }
            let urn = format!("chat:{}:{}", account.id, message.id);
            let item = WorkItem {
                task_id: 0,
                source_urn: urn,
                client_id: account.client_id,
                project_id: None,
                kind: WorkItemKind::ChatMessage,
                state: WorkItemState::New,
                attempts: 0,
                max_attempts: 5,
                priority: 0,
                created_at: Utc::now(),
                last_attempt_at: None,
                worker_id: None,
                error: None,
                payload: serde_json::to_string(message).unwrap_or_default(),
            };
            self.db.enqueue(&item)?;
            if max_seen.is_none_or(|m| message.posted_at > m) {
                max_seen = Some(message.posted_at);
            }
        }

        if let Some(max_seen) = max_seen {
            self.db.update_poll_cursor(account.id, "chat", max_seen)?;
        }
        Ok(())
    }

    async fn record_poll(&self, account: &Connection, at: DateTime<Utc>) -> Result<()> {
        self.db.touch_last_polled(account.id, "chat", at).map_err(|e| anyhow!(e))
    }

    fn label(&self, account: &Connection) -> String {
        format!("chat:{}", account.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jervis_core::types::AuthType;

    fn sample_connection(id: i64) -> Connection {
        Connection {
            id,
            client_id: 1,
            kind: ConnectionKind::Chat,
            base_url: "https://chat.example.com".into(),
            auth_type: AuthType::Bearer,
            credentials: "token".into(),
            state: ConnectionState::Valid,
        }
    }

    #[tokio::test]
    async fn accounts_excludes_invalid_connections() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let client_id = db.upsert_client("Acme", "acme").unwrap();
        let mut valid = sample_connection(0);
        valid.client_id = client_id;
        let id1 = db.insert_connection(&valid).unwrap();
        let mut invalid = sample_connection(0);
        invalid.client_id = client_id;
        invalid.state = ConnectionState::Invalid;
        db.insert_connection(&invalid).unwrap();

        let handler = ChatHandler::new(db);
        let accounts = handler.accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, id1);
    }
}
