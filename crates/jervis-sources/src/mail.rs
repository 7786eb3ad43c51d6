use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jervis_core::db::Db;
use jervis_core::error::looks_like_auth_error;
use jervis_core::poller::PollHandler;
use jervis_core::types::{Connection, ConnectionKind, ConnectionState, WorkItem, WorkItemKind, WorkItemState};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub uid: u32,
    pub subject: String,
    pub from: String,
    pub date: DateTime<Utc>,
    pub body: String,
}

fn split_host_port(base_url: &str) -> (String, u16) {
    match base_url.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(993)),
        None => (base_url.to_string(), 993),
    }
}

/// Blocking IMAP fetch, run off the async executor via `spawn_blocking`.
/// Logs in over implicit TLS, selects `INBOX`, and pulls full messages
/// received since `since` (or the last 7 days on first poll).
fn fetch_since(base_url: &str, credentials: &str, since: Option<DateTime<Utc>>) -> Result<Vec<MailMessage>> {
    let (host, port) = split_host_port(base_url);
    let (user, pass) = credentials
        .split_once(':')
        .map(|(u, p)| (u.to_string(), p.to_string()))
        .ok_or_else(|| anyhow!("mail credentials must be \"user:pass\""))?;

    let tls = native_tls::TlsConnector::builder()
        .build()
        .context("build TLS connector")?;
    let client = imap::connect((host.as_str(), port), &host, &tls).context("connect to IMAP server")?;
    let mut session = client
        .login(&user, &pass)
        .map_err(|(e, _)| anyhow!("IMAP login failed: {e}"))?;
    session.select("INBOX").context("select INBOX")?;

    let query = match since {
        Some(since) => format!("SINCE {}", since.format("%d-%b-%Y")),
        None => "SINCE 7-days-ago".to_string(),
    };
    // IMAP SEARCH's relative dates aren't standard; fall back to ALL and
    // filter by parsed header date below when the query can't be built.
    let uids = session
        .search(if query.contains("days-ago") { "ALL" } else { &query })
        .context("IMAP SEARCH")?;

    let mut messages = Vec::new();
    for uid in uids {
        let fetched = session.fetch(uid.to_string(), "RFC822").context("IMAP FETCH")?;
        for msg in fetched.iter() {
            let Some(body) = msg.body() else { continue };
            let parsed = match mailparse::parse_mail(body) {
                Ok(p) => p,
                Err(e) => {
                    warn!(uid, error = %e, "failed to parse mail message");
                    continue;
                }
            };
            let subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
            let from = parsed.headers.get_first_value("From").unwrap_or_default();
            let date = parsed
                .headers
                .get_first_value("Date")
                .and_then(|d| DateTime::parse_from_rfc2822(&d).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            if let Some(since) = since {
                if date <= since {
                    continue;
                }
            }
            let body_text = parsed.get_body().unwrap_or_default();
            messages.push(MailMessage { uid, subject, from, date, body: body_text });
        }
    }
    session.logout().ok();
    messages.sort_by_key(|m| m.date);
    Ok(messages)
}

/// C5 mail polling handler: one account per `Connection` of kind `Mail`.
/// `base_url` is `host:port`, `credentials` is `user:pass` (Basic auth).
pub struct MailHandler {
    db: Arc<Db>,
}

impl MailHandler {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PollHandler<Connection> for MailHandler {
    async fn accounts(&self) -> Result<Vec<Connection>> {
        Ok(self
            .db
            .list_connections_by_kind(ConnectionKind::Mail)?
            .into_iter()
            .filter(|c| c.state == ConnectionState::Valid)
            .collect())
    }

    async fn last_poll(&self, account: &Connection) -> Result<Option<DateTime<Utc>>> {
        Ok(self.db.get_polling_state(account.id, "mail")?.and_then(|s| s.last_polled_at))
    }

    async fn execute_poll(&self, account: &Connection) -> Result<()> {
        let since = self.db.get_polling_state(account.id, "mail")?.and_then(|s| s.last_seen_updated_at);

        let base_url = account.base_url.clone();
        let credentials = account.credentials.clone();
        let messages = tokio::task::spawn_blocking(move || fetch_since(&base_url, &credentials, since))
            .await
            .context("mail fetch task panicked")?;

        let messages = match messages {
            Ok(messages) => messages,
            Err(e) => {
                if looks_like_auth_error(&e.to_string()) {
                    self.db.set_connection_state(account.id, ConnectionState::Invalid)?;
                    warn!(connection_id = account.id, "mail auth failure, connection invalidated");
                }
                return Err(e);
            }
        };

        let mut max_seen = since;
        for message in &messages {
            let urn = format!("mail:{}:{}", account.id, message.uid);
            let item = WorkItem {
                task_id: 0,
                source_urn: urn,
                client_id: account.client_id,
                project_id: None,
                kind: WorkItemKind::MailMessage,
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
            if max_seen.is_none_or(|m| message.date > m) {
                max_seen = Some(message.date);
            }
        }

        if let Some(max_seen) = max_seen {
            self.db.update_poll_cursor(account.id, "mail", max_seen)?;
        }
        Ok(())
    }

    async fn record_poll(&self, account: &Connection, at: DateTime<Utc>) -> Result<()> {
        self.db.touch_last_polled(account.id, "mail", at)
    }

    fn label(&self, account: &Connection) -> String {
        format!("mail:{}", account.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jervis_core::types::AuthType;

    #[test]
    fn split_host_port_defaults_to_993() {
        assert_eq!(split_host_port("imap.example.com"), ("imap.example.com".to_string(), 993));
        assert_eq!(split_host_port("imap.example.com:143"), ("imap.example.com".to_string(), 143));
    }

    #[tokio::test]
    async fn accounts_excludes_invalid_connections() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let client_id = db.upsert_client("Acme", "acme").unwrap();
        let valid = Connection {
            id: 0,
            client_id,
            kind: ConnectionKind::Mail,
            base_url: "imap.example.com:993".into(),
            auth_type: AuthType::Basic,
            credentials: "bot:token".into(),
            state: ConnectionState::Valid,
        };
        let id1 = db.insert_connection(&valid).unwrap();
        let mut invalid = valid;
        invalid.state = ConnectionState::Invalid;
        db.insert_connection(&invalid).unwrap();

        let handler = MailHandler::new(db);
        let accounts = handler.accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, id1);
    }
}
