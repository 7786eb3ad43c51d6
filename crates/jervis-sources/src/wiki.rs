use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jervis_core::db::Db;
use jervis_core::error::looks_like_auth_error;
use jervis_core::poller::PollHandler;
use jervis_core::types::{Connection, ConnectionKind, ConnectionState, WorkItem, WorkItemKind, WorkItemState};
use serde::Deserialize;
use tracing::warn;

/// Thin REST client over a Confluence-shaped wiki API.
pub struct WikiClient {
    http: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageHistory {
    #[serde(rename = "lastUpdated")]
    pub last_updated: PageLastUpdated,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageLastUpdated {
    pub when: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WikiPage {
    pub id: String,
    pub title: String,
    pub history: PageHistory,
}

#[derive(Debug, Deserialize)]
struct ContentSearchResponse {
    results: Vec<WikiPage>,
}

impl Default for WikiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WikiClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    /// Fetches wiki pages modified since `since` (default: last 7 days),
    /// ordered oldest-first by `history.lastUpdated.when`.
    pub async fn search_pages(&self, conn: &Connection, since: Option<DateTime<Utc>>) -> Result<Vec<WikiPage>> {
        let since = since.unwrap_or_else(|| Utc::now() - Duration::days(7));
        let cql = format!("lastModified >= \"{}\" order by lastmodified asc", since.format("%Y-%m-%d %H:%M"));
        Ok(self
            .http
            .get(format!("{}/rest/api/content/search", conn.base_url))
            .bearer_auth(&conn.credentials)
            .query(&[("cql", cql.as_str()), ("expand", "history.lastUpdated")])
            .send()
            .await?
            .error_for_status()?
            .json::<ContentSearchResponse>()
            .await?
            .results)
    }
}

/// C5 wiki polling handler: one account per `Connection` of kind `Wiki`.
pub struct WikiHandler {
    db: Arc<Db>,
    client: WikiClient,
}

impl WikiHandler {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db, client: WikiClient::new() }
    }
}

#[async_trait]
impl PollHandler<Connection> for WikiHandler {
    async fn accounts(&self) -> Result<Vec<Connection>> {
        Ok(self
            .db
            .list_connections_by_kind(ConnectionKind::Wiki)?
            .into_iter()
            .filter(|c| c.state == ConnectionState::Valid)
            .collect())
    }

    async fn last_poll(&self, account: &Connection) -> Result<Option<DateTime<Utc>>> {
        Ok(self.db.get_polling_state(account.id, "wiki")?.and_then(|s| s.last_polled_at))
    }

    async fn execute_poll(&self, account: &Connection) -> Result<()> {
        let since = self.db.get_polling_state(account.id, "wiki")?.and_then(|s| s.last_seen_updated_at);

        let pages = match self.client.search_pages(account, since).await {
            Ok(pages) => pages,
            Err(e) => {
                if looks_like_auth_error(&e.to_string()) {
                    self.db.set_connection_state(account.id, ConnectionState::Invalid)?;
                    warn!(connection_id = account.id, "wiki auth failure, connection invalidated");
                }
                return Err(e);
            }
        };

        let mut max_seen = since;
        for page in &pages {
            let updated = page.history.last_updated.when;
            if let Some(prior_max) = since {
                if updated <= prior_max {
                    continue;
                }
            }
            let urn = format!("wiki:{}:{}", account.id, page.id);
            let item = WorkItem {
                task_id: 0,
                source_urn: urn,
                client_id: account.client_id,
                project_id: None,
                kind: WorkItemKind::WikiPage,
                state: WorkItemState::New,
                attempts: 0,
                max_attempts: 5,
                priority: 0,
                created_at: Utc::now(),
                last_attempt_at: None,
                worker_id: None,
                error: None,
                payload: serde_json::to_string(page).unwrap_or_default(),
            };
            self.db.enqueue(&item)?;
            if max_seen.is_none_or(|m| updated > m) {
                max_seen = Some(updated);
            }
        }

        if let Some(max_seen) = max_seen {
            self.db.update_poll_cursor(account.id, "wiki", max_seen)?;
        }
        Ok(())
    }

    async fn record_poll(&self, account: &Connection, at: DateTime<Utc>) -> Result<()> {
        self.db.touch_last_polled(account.id, "wiki", at).map_err(|e| anyhow!(e))
    }

    fn label(&self, account: &Connection) -> String {
        format!("wiki:{}", account.id)
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
            kind: ConnectionKind::Wiki,
            base_url: "https://wiki.example.com".into(),
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

        let handler = WikiHandler::new(db);
        let accounts = handler.accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, id1);
    }
}
