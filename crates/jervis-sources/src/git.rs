use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jervis_core::db::Db;
use jervis_core::error::looks_like_auth_error;
use jervis_core::git::Git;
use jervis_core::link_queue::LinkQueue;
use jervis_core::poller::PollHandler;
use jervis_core::types::{
    AuthType, Connection, ConnectionKind, ConnectionState, GitCommitRecord, GitCommitState,
    WorkItem, WorkItemKind, WorkItemState,
};
use tracing::warn;

/// Derives a project slug from a repo URL's final path segment
/// (`https://example.com/org/repo.git` -> `repo`).
fn slug_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let slug: String = last
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if slug.is_empty() {
        "repo".to_string()
    } else {
        slug
    }
}

/// Splits `credentials` into `(username, password)` for the git credential
/// helper. Basic auth carries both halves as `user:pass`; bearer/OAuth2
/// tokens ride as the password half of the conventional `x-access-token`
/// username used by GitHub/GitLab app tokens.
fn split_credentials(auth_type: AuthType, credentials: &str) -> (String, String) {
    match auth_type {
        AuthType::Basic => match credentials.split_once(':') {
            Some((user, pass)) => (user.to_string(), pass.to_string()),
            None => ("git".to_string(), credentials.to_string()),
        },
        AuthType::Bearer | AuthType::Oauth2 => ("x-access-token".to_string(), credentials.to_string()),
    }
}

/// Scans a commit subject for absolute URLs and hands them to C11 so an
/// issue-tracker or wiki reference dropped in a commit message gets picked
/// up by the indexer that actually owns it.
fn extract_urls(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|tok| tok.starts_with("http://") || tok.starts_with("https://"))
        .map(|tok| tok.trim_matches(|c: char| matches!(c, '.' | ',' | ')' | '(' | '"' | '\'')).to_string())
        .collect()
}

/// C5 Git polling handler: one account per `Connection` of kind `Git`.
/// Maintains a shallow working clone per project under
/// `{data_dir}/repos/{projectId}` (shared with the pipeline's discovery
/// stage, see `jervis_core::git::project_repo_dir`) and lists new commits
/// on the default branch since the last successful poll.
pub struct GitHandler {
    db: Arc<Db>,
    data_dir: String,
    link_queue: Arc<LinkQueue>,
}

impl GitHandler {
    pub fn new(db: Arc<Db>, data_dir: impl Into<String>, link_queue: Arc<LinkQueue>) -> Self {
        Self { db, data_dir: data_dir.into(), link_queue }
    }

    fn repo_dir(&self, project_id: i64) -> String {
        jervis_core::git::project_repo_dir(&self.data_dir, project_id)
    }

    fn project_for(&self, conn: &Connection) -> Result<i64> {
        let slug = slug_from_url(&conn.base_url);
        self.db.upsert_project(conn.client_id, &slug, &slug)
    }

    fn ensure_clone(&self, conn: &Connection, repo_dir: &str) -> Result<()> {
        let (username, password) = split_credentials(conn.auth_type, &conn.credentials);
        let helper = Git::write_credential_helper(repo_dir, &username, &password)
            .context("write git credential helper")?;
        let git = Git::new(repo_dir.to_string());
        git.clone_shallow(&conn.base_url, Some(&helper))
    }
}

#[async_trait]
impl PollHandler<Connection> for GitHandler {
    async fn accounts(&self) -> Result<Vec<Connection>> {
        Ok(self
            .db
            .list_connections_by_kind(ConnectionKind::Git)?
            .into_iter()
            .filter(|c| c.state == ConnectionState::Valid)
            .collect())
    }

    async fn last_poll(&self, account: &Connection) -> Result<Option<DateTime<Utc>>> {
        Ok(self.db.get_polling_state(account.id, "git")?.and_then(|s| s.last_polled_at))
    }

    async fn execute_poll(&self, account: &Connection) -> Result<()> {
        let project_id = self.project_for(account)?;
        let repo_dir = self.repo_dir(project_id);

        let poll_result = (|| -> Result<(String, Vec<jervis_core::git::CommitLine>)> {
            self.ensure_clone(account, &repo_dir)?;
            let git = Git::new(repo_dir.clone());
            git.fetch_all_prune()?;
            let branch = git.default_branch()?;
            let since = self.db.get_polling_state(account.id, "git")?.and_then(|s| s.last_seen_updated_at);
            let commits = git.commit_log(&branch, since)?;
            Ok((branch, commits))
        })();

        let (branch, commits) = match poll_result {
            Ok(pair) => pair,
            Err(e) => {
                if looks_like_auth_error(&e.to_string()) {
                    self.db.set_connection_state(account.id, ConnectionState::Invalid)?;
                    warn!(connection_id = account.id, "git auth failure, connection invalidated");
                }
                return Err(e);
            }
        };

        let mut max_seen = None;
        for commit in commits.iter().rev() {
            let record = GitCommitRecord {
                client_id: account.client_id,
                project_id,
                branch: branch.clone(),
                hash: commit.hash.clone(),
                author: commit.author.clone(),
                message: commit.subject.clone(),
                commit_date: commit.date,
                state: GitCommitState::New,
                attempts: 0,
            };
            let inserted = self.db.insert_git_commit_if_new(&record)?;
            if inserted {
                let urn = format!("git:{}:{}", account.id, commit.hash);
                let item = WorkItem {
                    task_id: 0,
                    source_urn: urn,
                    client_id: account.client_id,
                    project_id: Some(project_id),
                    kind: WorkItemKind::GitCommit,
                    state: WorkItemState::New,
                    attempts: 0,
                    max_attempts: 5,
                    priority: 0,
                    created_at: Utc::now(),
                    last_attempt_at: None,
                    worker_id: None,
                    error: None,
                    payload: serde_json::to_string(&record).unwrap_or_default(),
                };
                self.db.enqueue(&item)?;

                for url in extract_urls(&commit.subject) {
                    self.link_queue.submit(&url, account.client_id, Some(project_id), "git", &format!("commit:{}", commit.hash));
                }
            }
            if max_seen.is_none_or(|m| commit.date > m) {
                max_seen = Some(commit.date);
            }
        }

        if let Some(max_seen) = max_seen {
            self.db.update_poll_cursor(account.id, "git", max_seen)?;
        }
        Ok(())
    }

    async fn record_poll(&self, account: &Connection, at: DateTime<Utc>) -> Result<()> {
        self.db.touch_last_polled(account.id, "git", at)
    }

    fn label(&self, account: &Connection) -> String {
        format!("git:{}", account.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_from_url_strips_dot_git_and_lowercases() {
        assert_eq!(slug_from_url("https://example.com/Org/My-Repo.git"), "my-repo");
        assert_eq!(slug_from_url("https://example.com/org/repo/"), "repo");
    }

    #[test]
    fn split_credentials_basic_splits_on_colon() {
        let (user, pass) = split_credentials(AuthType::Basic, "alice:s3cret");
        assert_eq!(user, "alice");
        assert_eq!(pass, "s3cret");
    }

    #[test]
    fn split_credentials_bearer_uses_x_access_token() {
        let (user, pass) = split_credentials(AuthType::Bearer, "ghp_abc123");
        assert_eq!(user, "x-access-token");
        assert_eq!(pass, "ghp_abc123");
    }

    #[test]
    fn extract_urls_finds_bare_links_in_commit_subjects() {
        let urls = extract_urls("Fixes PROJ-42 see https://wiki.example.com/wiki/spaces/X/overview.");
        assert_eq!(urls, vec!["https://wiki.example.com/wiki/spaces/X/overview".to_string()]);
    }

    #[tokio::test]
    async fn accounts_excludes_invalid_connections() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let client_id = db.upsert_client("Acme", "acme").unwrap();
        let valid = Connection {
            id: 0,
            client_id,
            kind: ConnectionKind::Git,
            base_url: "https://example.com/acme/app.git".into(),
            auth_type: AuthType::Basic,
            credentials: "bot:token".into(),
            state: ConnectionState::Valid,
        };
        let id1 = db.insert_connection(&valid).unwrap();
        let mut invalid = valid;
        invalid.state = ConnectionState::Invalid;
        db.insert_connection(&invalid).unwrap();

        let link_queue = Arc::new(LinkQueue::new(3));
        let handler = GitHandler::new(db, "/tmp/jervis-test-data", link_queue);
        let accounts = handler.accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, id1);
    }
}
