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

/// Thin REST client over a Jira-shaped issue-tracker API.
pub struct IssueTrackerClient {
    http: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueFields {
    pub summary: String,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueRecord {
    pub key: String,
    pub fields: IssueFields,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    issues: Vec<IssueRecord>,
}

impl Default for IssueTrackerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl IssueTrackerClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    /// Builds a time-filtered query from `since` (or "last 7 days" on first
    /// run) and fetches whole issue records, ordered by `updated` ascending.
    pub async fn search_issues(&self, conn: &Connection, since: Option<DateTime<Utc>>) -> Result<Vec<IssueRecord>> {
        let since = since.unwrap_or_else(|| Utc::now() - Duration::days(7));
        let jql = format!("updated >= \"{}\" order by updated asc", since.format("%Y-%m-%d %H:%M"));
        Ok(self
            .http
            .get(format!("{}/rest/api/2/search", conn.base_url))
            .bearer_auth(&conn.credentials)
            .query(&[("jql", jql.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json::<SearchResponse>()
            .await?
            .issues)
    }
}

/// C5 issue-tracker polling handler: one account per `Connection` of kind
/// `IssueTracker`.
pub struct IssueTrackerHandler {
    db: Arc<Db>,
    client: IssueTrackerClient,
}

impl IssueTrackerHandler {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db, client: IssueTrackerClient::new() }
    }
}

#[async_trait]
impl PollHandler<Connection> for IssueTrackerHandler {
    async fn accounts(&self) -> Result<Vec<Connection>> {
        Ok(self
            .db
            .list_connections_by_kind(ConnectionKind::IssueTracker)?
            .into_iter()
            .filter(|c| c.state == ConnectionState::Valid)
            .collect())
    }

    async fn last_poll(&self, account: &Connection) -> Result<Option<DateTime<Utc>>> {
        Ok(self.db.get_polling_state(account.id, "issue_tracker")?.and_then(|s| s.last_polled_at))
    }

    async fn execute_poll(&self, account: &Connection) -> Result<()> {
        let since = self.db.get_polling_state(account.id, "issue_tracker")?.and_then(|s| s.last_seen_updated_at);

        let issues = match self.client.search_issues(account, since).await {
            Ok(issues) => issues,
            Err(e) => {
                if looks_like_auth_error(&e.to_string()) {
                    self.db.set_connection_state(account.id, ConnectionState::Invalid)?;
                    warn!(connection_id = account.id, "issue tracker auth failure, connection invalidated");
                }
                return Err(e);
            }
        };

        let mut max_seen = since;
        for issue in &issues {
            // If an existing record's updated-at is already ≥ fetched, skip.
            let urn = format!("issue_tracker:{}:{}", account.id, issue.key);
            if let Some(prior_max) = since {
                if issue.fields.updated <= prior_max {
                    continue;
                }
            }
            let item = WorkItem {
                task_id: 0,
                source_urn: urn,
                client_id: account.client_id,
                project_id: None,
                kind: WorkItemKind::Issue,
                state: WorkItemState::New,
                attempts: 0,
                max_attempts: 5,
                priority: 0,
                created_at: Utc::now(),
                last_attempt_at: None,
                worker_id: None,
                error: None,
                payload: serde_json::to_string(issue).unwrap_or_default(),
            };
            self.db.enqueue(&item)?;
            if max_seen.is_none_or(|m| issue.fields.updated > m) {
                max_seen = Some(issue.fields.updated);
            }
        }

        if let Some(max_seen) = max_seen {
            self.db.update_poll_cursor(account.id, "issue_tracker", max_seen)?;
        }
        Ok(())
    }

    async fn record_poll(&self, account: &Connection, at: DateTime<Utc>) -> Result<()> {
        self.db.touch_last_polled(account.id, "issue_tracker", at).map_err(|e| anyhow!(e))
    }

    fn label(&self, account: &Connection) -> String {
        format!("issue_tracker:{}", account.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_connection(id: i64) -> Connection {
        Connection {
            id,
            client_id: 1,
            kind: ConnectionKind::IssueTracker,
            base_url: "https://issues.example.com".into(),
            auth_type: jervis_core::types::AuthType::Bearer,
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

        let handler = IssueTrackerHandler::new(db);
        let accounts = handler.accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, id1);
    }
}
