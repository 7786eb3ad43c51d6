use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    AuthType, Connection as ConnectionRecord, ConnectionKind, ConnectionState, GitCommitRecord,
    GitCommitState, IndexingState, IndexingStatus, Plan, PlanStatus, PlanStep, PollingState,
    StepStatus, VectorContentEntry, WorkItem, WorkItemKind, WorkItemState,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_ts(&s))
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn fmt_ts_opt(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(fmt_ts)
}

fn now_str() -> String {
    fmt_ts(Utc::now())
}

// ── Enum <-> TEXT helpers ─────────────────────────────────────────────────

fn connection_kind_str(k: ConnectionKind) -> &'static str {
    match k {
        ConnectionKind::Git => "git",
        ConnectionKind::IssueTracker => "issue_tracker",
        ConnectionKind::Wiki => "wiki",
        ConnectionKind::Mail => "mail",
        ConnectionKind::Chat => "chat",
    }
}

fn parse_connection_kind(s: &str) -> ConnectionKind {
    match s {
        "issue_tracker" => ConnectionKind::IssueTracker,
        "wiki" => ConnectionKind::Wiki,
        "mail" => ConnectionKind::Mail,
        "chat" => ConnectionKind::Chat,
        _ => ConnectionKind::Git,
    }
}

fn auth_type_str(a: AuthType) -> &'static str {
    match a {
        AuthType::Basic => "basic",
        AuthType::Bearer => "bearer",
        AuthType::Oauth2 => "oauth2",
    }
}

fn parse_auth_type(s: &str) -> AuthType {
    match s {
        "bearer" => AuthType::Bearer,
        "oauth2" => AuthType::Oauth2,
        _ => AuthType::Basic,
    }
}

fn connection_state_str(s: ConnectionState) -> &'static str {
    match s {
        ConnectionState::Valid => "valid",
        ConnectionState::Invalid => "invalid",
    }
}

fn parse_connection_state(s: &str) -> ConnectionState {
    match s {
        "invalid" => ConnectionState::Invalid,
        _ => ConnectionState::Valid,
    }
}

fn work_item_kind_str(k: WorkItemKind) -> &'static str {
    match k {
        WorkItemKind::GitCommit => "git_commit",
        WorkItemKind::Issue => "issue",
        WorkItemKind::WikiPage => "wiki_page",
        WorkItemKind::MailMessage => "mail_message",
        WorkItemKind::ChatMessage => "chat_message",
        WorkItemKind::LinkedUrl => "linked_url",
    }
}

fn parse_work_item_kind(s: &str) -> WorkItemKind {
    match s {
        "issue" => WorkItemKind::Issue,
        "wiki_page" => WorkItemKind::WikiPage,
        "mail_message" => WorkItemKind::MailMessage,
        "chat_message" => WorkItemKind::ChatMessage,
        "linked_url" => WorkItemKind::LinkedUrl,
        _ => WorkItemKind::GitCommit,
    }
}

fn work_item_state_str(s: WorkItemState) -> &'static str {
    match s {
        WorkItemState::New => "new",
        WorkItemState::InProgress => "in_progress",
        WorkItemState::Indexed => "indexed",
        WorkItemState::Failed => "failed",
    }
}

fn parse_work_item_state(s: &str) -> WorkItemState {
    match s {
        "in_progress" => WorkItemState::InProgress,
        "indexed" => WorkItemState::Indexed,
        "failed" => WorkItemState::Failed,
        _ => WorkItemState::New,
    }
}

fn git_commit_state_str(s: GitCommitState) -> &'static str {
    match s {
        GitCommitState::New => "new",
        GitCommitState::Indexed => "indexed",
        GitCommitState::Failed => "failed",
    }
}

fn parse_git_commit_state(s: &str) -> GitCommitState {
    match s {
        "indexed" => GitCommitState::Indexed,
        "failed" => GitCommitState::Failed,
        _ => GitCommitState::New,
    }
}

fn indexing_state_str(s: IndexingState) -> &'static str {
    match s {
        IndexingState::Indexed => "indexed",
        IndexingState::Failed => "failed",
        IndexingState::InProgress => "in_progress",
    }
}

fn parse_indexing_state(s: &str) -> IndexingState {
    match s {
        "failed" => IndexingState::Failed,
        "in_progress" => IndexingState::InProgress,
        _ => IndexingState::Indexed,
    }
}

fn plan_status_str(s: PlanStatus) -> &'static str {
    match s {
        PlanStatus::Pending => "pending",
        PlanStatus::Running => "running",
        PlanStatus::Completed => "completed",
        PlanStatus::Failed => "failed",
        PlanStatus::Finalized => "finalized",
    }
}

fn parse_plan_status(s: &str) -> PlanStatus {
    match s {
        "running" => PlanStatus::Running,
        "completed" => PlanStatus::Completed,
        "failed" => PlanStatus::Failed,
        "finalized" => PlanStatus::Finalized,
        _ => PlanStatus::Pending,
    }
}

fn step_status_str(s: StepStatus) -> &'static str {
    match s {
        StepStatus::Pending => "pending",
        StepStatus::Done => "done",
        StepStatus::Failed => "failed",
    }
}

fn parse_step_status(s: &str) -> StepStatus {
    match s {
        "done" => StepStatus::Done,
        "failed" => StepStatus::Failed,
        _ => StepStatus::Pending,
    }
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_connection(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionRecord> {
    let kind: String = row.get(2)?;
    let auth_type: String = row.get(4)?;
    let state: String = row.get(6)?;
    Ok(ConnectionRecord {
        id: row.get(0)?,
        client_id: row.get(1)?,
        kind: parse_connection_kind(&kind),
        base_url: row.get(3)?,
        auth_type: parse_auth_type(&auth_type),
        credentials: row.get(5)?,
        state: parse_connection_state(&state),
    })
}

fn row_to_polling_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<PollingState> {
    let last_seen: Option<String> = row.get(2)?;
    let last_polled: Option<String> = row.get(3)?;
    Ok(PollingState {
        connection_id: row.get(0)?,
        tool: row.get(1)?,
        last_seen_updated_at: parse_ts_opt(last_seen),
        last_polled_at: parse_ts_opt(last_polled),
    })
}

fn row_to_work_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkItem> {
    let kind: String = row.get(4)?;
    let state: String = row.get(5)?;
    let created_at: String = row.get(9)?;
    let last_attempt_at: Option<String> = row.get(10)?;
    Ok(WorkItem {
        task_id: row.get(0)?,
        source_urn: row.get(1)?,
        client_id: row.get(2)?,
        project_id: row.get(3)?,
        kind: parse_work_item_kind(&kind),
        state: parse_work_item_state(&state),
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        priority: row.get(8)?,
        created_at: parse_ts(&created_at),
        last_attempt_at: parse_ts_opt(last_attempt_at),
        worker_id: row.get(11)?,
        error: row.get(12)?,
        payload: row.get(13)?,
    })
}

fn row_to_git_commit(row: &rusqlite::Row<'_>) -> rusqlite::Result<GitCommitRecord> {
    let commit_date: String = row.get(6)?;
    let state: String = row.get(7)?;
    Ok(GitCommitRecord {
        client_id: row.get(0)?,
        project_id: row.get(1)?,
        branch: row.get(2)?,
        hash: row.get(3)?,
        author: row.get(4)?,
        message: row.get(5)?,
        commit_date: parse_ts(&commit_date),
        state: parse_git_commit_state(&state),
        attempts: row.get(8)?,
    })
}

fn row_to_indexing_status(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexingStatus> {
    let contents_json: String = row.get(3)?;
    let state: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    let contents: Vec<VectorContentEntry> =
        serde_json::from_str(&contents_json).unwrap_or_default();
    Ok(IndexingStatus {
        project_id: row.get(0)?,
        file_path: row.get(1)?,
        git_commit_hash: row.get(2)?,
        contents,
        state: parse_indexing_state(&state),
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_plan_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanStep> {
    let status: String = row.get(4)?;
    Ok(PlanStep {
        id: row.get(0)?,
        order: row.get(1)?,
        tool_name: row.get(2)?,
        instruction: row.get(3)?,
        status: parse_step_status(&status),
        tool_result: row.get(5)?,
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory SQLite db")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        let mut db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn migrate(&mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        // Idempotent column additions for DBs created before these columns existed.
        // ALTER TABLE fails if the column already exists; ignore that error.
        let alters = ["ALTER TABLE work_items ADD COLUMN payload TEXT NOT NULL DEFAULT ''"];
        for sql in alters {
            let _ = conn.execute(sql, []);
        }
        Ok(())
    }

    // ── Clients / Projects ────────────────────────────────────────────────

    pub fn upsert_client(&self, name: &str, slug: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO clients (name, slug) VALUES (?1, ?2) \
             ON CONFLICT(slug) DO UPDATE SET name = excluded.name",
            params![name, slug],
        )
        .context("upsert_client")?;
        let id: i64 = conn
            .query_row("SELECT id FROM clients WHERE slug = ?1", params![slug], |r| r.get(0))
            .context("upsert_client get id")?;
        Ok(id)
    }

    pub fn upsert_project(&self, client_id: i64, name: &str, slug: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO projects (client_id, name, slug) VALUES (?1, ?2, ?3) \
             ON CONFLICT(client_id, slug) DO UPDATE SET name = excluded.name",
            params![client_id, name, slug],
        )
        .context("upsert_project")?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM projects WHERE client_id = ?1 AND slug = ?2",
                params![client_id, slug],
                |r| r.get(0),
            )
            .context("upsert_project get id")?;
        Ok(id)
    }

    /// All known `(project_id, client_id)` pairs, oldest first. Drives the
    /// composition root's tick-interval pipeline supervisor, which sweeps
    /// every project in turn rather than tracking per-project schedules.
    pub fn list_projects(&self) -> Result<Vec<(i64, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT id, client_id FROM projects ORDER BY id")
            .context("list_projects prepare")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .context("list_projects query")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("list_projects collect")
    }

    /// Looks up a project by its globally-scoped slug, returning
    /// `(project_id, client_id)`. Used by `/chat/completions`, where the
    /// request's `model` field names the target project.
    pub fn get_project_by_slug(&self, slug: &str) -> Result<Option<(i64, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, client_id FROM projects WHERE slug = ?1",
            params![slug],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .context("get_project_by_slug")
    }

    /// Looks up the owning client of a project, for call sites that only
    /// carry a `project_id` (e.g. `/index/reindex`) but need `client_id` to
    /// start a pipeline run.
    pub fn project_client_id(&self, project_id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT client_id FROM projects WHERE id = ?1",
            params![project_id],
            |r| r.get(0),
        )
        .optional()
        .context("project_client_id")
    }

    // ── Connections (C1) ──────────────────────────────────────────────────

    pub fn insert_connection(&self, conn_rec: &ConnectionRecord) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO connections (client_id, kind, base_url, auth_type, credentials, state) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conn_rec.client_id,
                connection_kind_str(conn_rec.kind),
                conn_rec.base_url,
                auth_type_str(conn_rec.auth_type),
                conn_rec.credentials,
                connection_state_str(conn_rec.state),
            ],
        )
        .context("insert_connection")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_connection(&self, id: i64) -> Result<Option<ConnectionRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, client_id, kind, base_url, auth_type, credentials, state \
             FROM connections WHERE id = ?1",
            params![id],
            row_to_connection,
        )
        .optional()
        .context("get_connection")
    }

    pub fn list_connections_by_kind(&self, kind: ConnectionKind) -> Result<Vec<ConnectionRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, client_id, kind, base_url, auth_type, credentials, state \
             FROM connections WHERE kind = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![connection_kind_str(kind)], row_to_connection)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_connections_by_kind")?;
        Ok(rows)
    }

    /// Sole writer of `state`: any auth failure observed by C2 invalidates
    /// the connection; subsequent polls skip it until restored out-of-band.
    pub fn set_connection_state(&self, id: i64, state: ConnectionState) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE connections SET state = ?1 WHERE id = ?2",
            params![connection_state_str(state), id],
        )
        .context("set_connection_state")?;
        Ok(())
    }

    // ── PollingState ──────────────────────────────────────────────────────

    pub fn get_polling_state(&self, connection_id: i64, tool: &str) -> Result<Option<PollingState>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT connection_id, tool, last_seen_updated_at, last_polled_at \
             FROM polling_states WHERE connection_id = ?1 AND tool = ?2",
            params![connection_id, tool],
            row_to_polling_state,
        )
        .optional()
        .context("get_polling_state")
    }

    /// Updated only after a successful poll (§4.1).
    pub fn record_poll(
        &self,
        connection_id: i64,
        tool: &str,
        last_seen_updated_at: Option<DateTime<Utc>>,
        last_polled_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO polling_states (connection_id, tool, last_seen_updated_at, last_polled_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(connection_id, tool) DO UPDATE SET \
               last_seen_updated_at = excluded.last_seen_updated_at, \
               last_polled_at = excluded.last_polled_at",
            params![
                connection_id,
                tool,
                fmt_ts_opt(last_seen_updated_at),
                fmt_ts(last_polled_at),
            ],
        )
        .context("record_poll")?;
        Ok(())
    }

    /// Advances only `last_seen_updated_at`, leaving `last_polled_at`
    /// untouched. Called by a polling handler as it discovers new items,
    /// independently of the framework's own `record_poll` bookkeeping.
    pub fn update_poll_cursor(&self, connection_id: i64, tool: &str, last_seen_updated_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO polling_states (connection_id, tool, last_seen_updated_at, last_polled_at) \
             VALUES (?1, ?2, ?3, NULL) \
             ON CONFLICT(connection_id, tool) DO UPDATE SET last_seen_updated_at = excluded.last_seen_updated_at",
            params![connection_id, tool, fmt_ts(last_seen_updated_at)],
        )
        .context("update_poll_cursor")?;
        Ok(())
    }

    /// Advances only `last_polled_at`, leaving `last_seen_updated_at`
    /// untouched. This is the generic poller framework's `recordPoll` hook.
    pub fn touch_last_polled(&self, connection_id: i64, tool: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO polling_states (connection_id, tool, last_seen_updated_at, last_polled_at) \
             VALUES (?1, ?2, NULL, ?3) \
             ON CONFLICT(connection_id, tool) DO UPDATE SET last_polled_at = excluded.last_polled_at",
            params![connection_id, tool, fmt_ts(at)],
        )
        .context("touch_last_polled")?;
        Ok(())
    }

    // ── Durable Work Queue (C3) ───────────────────────────────────────────

    /// Idempotent on `source_urn`: a duplicate enqueue is a no-op that
    /// returns the existing row's `task_id` (§8 property 2).
    pub fn enqueue(&self, item: &WorkItem) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO work_items \
             (source_urn, client_id, project_id, kind, state, attempts, max_attempts, \
              priority, created_at, last_attempt_at, worker_id, error, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
             ON CONFLICT(source_urn) DO NOTHING",
            params![
                item.source_urn,
                item.client_id,
                item.project_id,
                work_item_kind_str(item.kind),
                work_item_state_str(item.state),
                item.attempts,
                item.max_attempts,
                item.priority,
                fmt_ts(item.created_at),
                fmt_ts_opt(item.last_attempt_at),
                item.worker_id,
                item.error,
                item.payload,
            ],
        )
        .context("enqueue")?;
        let task_id: i64 = conn
            .query_row(
                "SELECT task_id FROM work_items WHERE source_urn = ?1",
                params![item.source_urn],
                |r| r.get(0),
            )
            .context("enqueue get task_id")?;
        Ok(task_id)
    }

    /// Atomic `NEW -> IN_PROGRESS` transition (or re-lease of a stale
    /// `IN_PROGRESS` row older than `lease_timeout`). One immediate
    /// transaction under the single-writer `Mutex` gives this for free.
    pub fn lease_next(&self, worker_id: &str, lease_timeout: chrono::Duration) -> Result<Option<WorkItem>> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("lease_next begin")?;
        let stale_before = fmt_ts(Utc::now() - lease_timeout);
        let candidate = tx
            .query_row(
                "SELECT task_id, source_urn, client_id, project_id, kind, state, attempts, \
                 max_attempts, priority, created_at, last_attempt_at, worker_id, error, payload \
                 FROM work_items \
                 WHERE state = 'new' OR (state = 'in_progress' AND last_attempt_at < ?1) \
                 ORDER BY priority DESC, created_at ASC LIMIT 1",
                params![stale_before],
                row_to_work_item,
            )
            .optional()
            .context("lease_next select")?;
        let Some(mut item) = candidate else {
            tx.commit().context("lease_next commit (empty)")?;
            return Ok(None);
        };
        let now = Utc::now();
        tx.execute(
            "UPDATE work_items SET state = 'in_progress', worker_id = ?1, last_attempt_at = ?2 \
             WHERE task_id = ?3",
            params![worker_id, fmt_ts(now), item.task_id],
        )
        .context("lease_next update")?;
        tx.commit().context("lease_next commit")?;
        item.state = WorkItemState::InProgress;
        item.worker_id = Some(worker_id.to_string());
        item.last_attempt_at = Some(now);
        Ok(Some(item))
    }

    pub fn complete_work_item(&self, task_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE work_items SET state = 'indexed' WHERE task_id = ?1",
            params![task_id],
        )
        .context("complete_work_item")?;
        Ok(())
    }

    /// `-> NEW` if `attempts < max_attempts` after incrementing, else a
    /// terminal `-> FAILED`. The `work_items` row is re-read inside the same
    /// transaction that writes `state`, so it is the sole authority on
    /// `attempts` (§9 open question, decided).
    pub fn fail_work_item(&self, task_id: i64, err: &str, retryable: bool) -> Result<WorkItemState> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("fail_work_item begin")?;
        let (attempts, max_attempts): (i64, i64) = tx
            .query_row(
                "SELECT attempts, max_attempts FROM work_items WHERE task_id = ?1",
                params![task_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .context("fail_work_item read")?;
        let attempts = attempts + 1;
        let next_state = if retryable && attempts < max_attempts {
            WorkItemState::New
        } else {
            WorkItemState::Failed
        };
        tx.execute(
            "UPDATE work_items SET state = ?1, attempts = ?2, error = ?3 WHERE task_id = ?4",
            params![work_item_state_str(next_state), attempts, err, task_id],
        )
        .context("fail_work_item update")?;
        tx.commit().context("fail_work_item commit")?;
        Ok(next_state)
    }

    pub fn queue_snapshot(&self, limit: i64) -> Result<Vec<WorkItem>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT task_id, source_urn, client_id, project_id, kind, state, attempts, \
             max_attempts, priority, created_at, last_attempt_at, worker_id, error, payload \
             FROM work_items ORDER BY created_at DESC LIMIT ?1",
        )?;
        let items = stmt
            .query_map(params![limit], row_to_work_item)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("queue_snapshot")?;
        Ok(items)
    }

    // ── Git commits ───────────────────────────────────────────────────────

    /// Returns `true` if a new row was inserted, `false` if this
    /// `(project_id, branch, hash)` was already known.
    pub fn insert_git_commit_if_new(&self, rec: &GitCommitRecord) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute(
                "INSERT INTO git_commits \
                 (client_id, project_id, branch, hash, author, message, commit_date, state, attempts) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(project_id, branch, hash) DO NOTHING",
                params![
                    rec.client_id,
                    rec.project_id,
                    rec.branch,
                    rec.hash,
                    rec.author,
                    rec.message,
                    fmt_ts(rec.commit_date),
                    git_commit_state_str(rec.state),
                    rec.attempts,
                ],
            )
            .context("insert_git_commit_if_new")?;
        Ok(changed > 0)
    }

    pub fn list_git_commits(&self, project_id: i64, branch: &str) -> Result<Vec<GitCommitRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT client_id, project_id, branch, hash, author, message, commit_date, state, attempts \
             FROM git_commits WHERE project_id = ?1 AND branch = ?2 ORDER BY commit_date DESC",
        )?;
        let rows = stmt
            .query_map(params![project_id, branch], row_to_git_commit)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_git_commits")?;
        Ok(rows)
    }

    /// All commits for a project regardless of branch, newest first — the
    /// `GIT_LOG_SEARCH` plan tool doesn't know which branch it's answering
    /// about ahead of time.
    pub fn list_git_commits_for_project(&self, project_id: i64) -> Result<Vec<GitCommitRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT client_id, project_id, branch, hash, author, message, commit_date, state, attempts \
             FROM git_commits WHERE project_id = ?1 ORDER BY commit_date DESC",
        )?;
        let rows = stmt
            .query_map(params![project_id], row_to_git_commit)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_git_commits_for_project")?;
        Ok(rows)
    }

    // ── Indexing-Status Ledger (C7) ───────────────────────────────────────

    pub fn get_indexing_status(&self, project_id: i64, file_path: &str) -> Result<Option<IndexingStatus>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT project_id, file_path, git_commit_hash, contents, state, updated_at \
             FROM indexing_status WHERE project_id = ?1 AND file_path = ?2",
            params![project_id, file_path],
            row_to_indexing_status,
        )
        .optional()
        .context("get_indexing_status")
    }

    /// Marks `(project_id, file_path)` as having a reindex in flight,
    /// before any vector is written for it. Leaves a prior row's
    /// `contents`/`git_commit_hash` untouched so a crash between this call
    /// and the matching `complete_indexing`/`fail_indexing` is visible as
    /// `in_progress` rather than silently reverting to the last good state
    /// or looking like a path that was never indexed (§4.5).
    pub fn start_indexing(&self, project_id: i64, file_path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO indexing_status (project_id, file_path, git_commit_hash, contents, state, updated_at) \
             VALUES (?1, ?2, '', '[]', 'in_progress', ?3) \
             ON CONFLICT(project_id, file_path) DO UPDATE SET state = 'in_progress', updated_at = excluded.updated_at",
            params![project_id, file_path, now_str()],
        )
        .context("start_indexing")?;
        Ok(())
    }

    /// Atomically replaces `contents[]` and `state`/`git_commit_hash` for
    /// `(project_id, file_path)` — the one record this path is guaranteed
    /// to have (§3 IndexingStatus invariant).
    pub fn complete_indexing(
        &self,
        project_id: i64,
        file_path: &str,
        commit_hash: &str,
        contents: &[VectorContentEntry],
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let contents_json = serde_json::to_string(contents).context("serialize contents")?;
        conn.execute(
            "INSERT INTO indexing_status (project_id, file_path, git_commit_hash, contents, state, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'indexed', ?5) \
             ON CONFLICT(project_id, file_path) DO UPDATE SET \
               git_commit_hash = excluded.git_commit_hash, \
               contents = excluded.contents, \
               state = 'indexed', \
               updated_at = excluded.updated_at",
            params![project_id, file_path, commit_hash, contents_json, now_str()],
        )
        .context("complete_indexing")?;
        Ok(())
    }

    pub fn fail_indexing(&self, project_id: i64, file_path: &str, _err: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO indexing_status (project_id, file_path, git_commit_hash, contents, state, updated_at) \
             VALUES (?1, ?2, '', '[]', 'failed', ?3) \
             ON CONFLICT(project_id, file_path) DO UPDATE SET state = 'failed', updated_at = excluded.updated_at",
            params![project_id, file_path, now_str()],
        )
        .context("fail_indexing")?;
        Ok(())
    }

    pub fn delete_indexing_status(&self, project_id: i64, file_path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "DELETE FROM indexing_status WHERE project_id = ?1 AND file_path = ?2",
            params![project_id, file_path],
        )
        .context("delete_indexing_status")?;
        Ok(())
    }

    // ── Plan Executor (C10) ───────────────────────────────────────────────

    pub fn insert_context(&self, client_id: i64, project_id: Option<i64>) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO contexts (client_id, project_id, created_at) VALUES (?1, ?2, ?3)",
            params![client_id, project_id, now_str()],
        )
        .context("insert_context")?;
        Ok(conn.last_insert_rowid())
    }

    /// `(clientId, projectId)` for a context, so a plan tool can recover the
    /// project it is scoped to from `plan.context_id` alone.
    pub fn get_context(&self, context_id: i64) -> Result<Option<(i64, Option<i64>)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT client_id, project_id FROM contexts WHERE id = ?1",
            params![context_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .context("get_context")
    }

    pub fn insert_plan(&self, context_id: i64, original_question: &str, english_question: &str, original_language: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        conn.execute(
            "INSERT INTO plans \
             (context_id, status, original_question, english_question, original_language, created_at, updated_at) \
             VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?5)",
            params![context_id, original_question, english_question, original_language, now],
        )
        .context("insert_plan")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_plan_step(&self, plan_id: i64, order: u32, tool_name: &str, instruction: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO plan_steps (plan_id, order_idx, tool_name, instruction, status) \
             VALUES (?1, ?2, ?3, ?4, 'pending')",
            params![plan_id, order, tool_name, instruction],
        )
        .context("insert_plan_step")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_plan(&self, plan_id: i64) -> Result<Option<Plan>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let plan_row = conn
            .query_row(
                "SELECT id, context_id, status, original_question, english_question, \
                 original_language, context_summary, final_answer, created_at, updated_at \
                 FROM plans WHERE id = ?1",
                params![plan_id],
                |row| {
                    let status: String = row.get(2)?;
                    let created_at: String = row.get(8)?;
                    let updated_at: String = row.get(9)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        status,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        created_at,
                        updated_at,
                    ))
                },
            )
            .optional()
            .context("get_plan")?;
        let Some((id, context_id, status, oq, eq, lang, summary, answer, created_at, updated_at)) = plan_row else {
            return Ok(None);
        };
        let mut stmt = conn.prepare(
            "SELECT id, order_idx, tool_name, instruction, status, tool_result \
             FROM plan_steps WHERE plan_id = ?1 ORDER BY order_idx ASC",
        )?;
        let steps = stmt
            .query_map(params![plan_id], row_to_plan_step)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_plan steps")?;
        Ok(Some(Plan {
            id,
            context_id,
            status: parse_plan_status(&status),
            original_question: oq,
            english_question: eq,
            original_language: lang,
            steps,
            context_summary: summary,
            final_answer: answer,
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        }))
    }

    pub fn list_pending_plans(&self, context_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id FROM plans WHERE context_id = ?1 \
             AND status NOT IN ('completed', 'failed', 'finalized') ORDER BY id ASC",
        )?;
        let ids = stmt
            .query_map(params![context_id], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_pending_plans")?;
        Ok(ids)
    }

    pub fn list_terminal_unfinalized_plans(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id FROM plans WHERE status IN ('completed', 'failed') ORDER BY id ASC",
        )?;
        let ids = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_terminal_unfinalized_plans")?;
        Ok(ids)
    }

    pub fn update_plan_status(&self, plan_id: i64, status: PlanStatus, final_answer: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE plans SET status = ?1, final_answer = COALESCE(?2, final_answer), updated_at = ?3 \
             WHERE id = ?4",
            params![plan_status_str(status), final_answer, now_str(), plan_id],
        )
        .context("update_plan_status")?;
        Ok(())
    }

    pub fn update_plan_context_summary(&self, plan_id: i64, summary: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE plans SET context_summary = ?1, updated_at = ?2 WHERE id = ?3",
            params![summary, now_str(), plan_id],
        )
        .context("update_plan_context_summary")?;
        Ok(())
    }

    pub fn update_plan_step(&self, step_id: i64, status: StepStatus, tool_result: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE plan_steps SET status = ?1, tool_result = ?2 WHERE id = ?3",
            params![step_status_str(status), tool_result, step_id],
        )
        .context("update_plan_step")?;
        Ok(())
    }

    // ── Config ────────────────────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row("SELECT value FROM config WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .context("get_config")
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_str()],
        )
        .context("set_config")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthType, ConnectionKind, ConnectionState, WorkItemKind, WorkItemState};

    fn test_db() -> Db {
        Db::open_in_memory().expect("open in-memory db")
    }

    fn sample_item(urn: &str) -> WorkItem {
        WorkItem {
            task_id: 0,
            source_urn: urn.to_string(),
            client_id: 1,
            project_id: Some(1),
            kind: WorkItemKind::GitCommit,
            state: WorkItemState::New,
            attempts: 0,
            max_attempts: 5,
            priority: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            worker_id: None,
            error: None,
            payload: "{}".to_string(),
        }
    }

    #[test]
    fn enqueue_is_idempotent_on_source_urn() {
        let db = test_db();
        db.upsert_client("Acme", "acme").unwrap();
        let id1 = db.enqueue(&sample_item("urn:1")).unwrap();
        let id2 = db.enqueue(&sample_item("urn:1")).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(db.queue_snapshot(10).unwrap().len(), 1);
    }

    #[test]
    fn lease_next_transitions_new_to_in_progress() {
        let db = test_db();
        db.upsert_client("Acme", "acme").unwrap();
        db.enqueue(&sample_item("urn:2")).unwrap();
        let leased = db.lease_next("worker-1", chrono::Duration::minutes(5)).unwrap().unwrap();
        assert_eq!(leased.state, WorkItemState::InProgress);
        assert_eq!(leased.worker_id.as_deref(), Some("worker-1"));
        assert!(db.lease_next("worker-2", chrono::Duration::minutes(5)).unwrap().is_none());
    }

    #[test]
    fn fail_work_item_retries_until_max_attempts() {
        let db = test_db();
        db.upsert_client("Acme", "acme").unwrap();
        let id = db.enqueue(&sample_item("urn:3")).unwrap();
        db.lease_next("w1", chrono::Duration::minutes(5)).unwrap();
        let mut item = sample_item("urn:3");
        item.max_attempts = 2;
        let _ = db.fail_work_item(id, "boom", true).unwrap();
        let state = db.fail_work_item(id, "boom again", true).unwrap();
        assert_eq!(state, WorkItemState::Failed);
    }

    #[test]
    fn complete_indexing_replaces_prior_contents() {
        let db = test_db();
        let first = vec![VectorContentEntry {
            vector_id: "v1".into(),
            content_hash: "h1".into(),
            len: 10,
            description: "d".into(),
        }];
        db.complete_indexing(1, "src/X.kt", "abc123", &first).unwrap();
        let second = vec![VectorContentEntry {
            vector_id: "v2".into(),
            content_hash: "h2".into(),
            len: 12,
            description: "d2".into(),
        }];
        db.complete_indexing(1, "src/X.kt", "def456", &second).unwrap();
        let status = db.get_indexing_status(1, "src/X.kt").unwrap().unwrap();
        assert_eq!(status.vector_ids(), vec!["v2"]);
        assert_eq!(status.git_commit_hash, "def456");
    }

    #[test]
    fn start_indexing_marks_in_progress_without_clearing_prior_contents() {
        let db = test_db();
        let first = vec![VectorContentEntry {
            vector_id: "v1".into(),
            content_hash: "h1".into(),
            len: 10,
            description: "d".into(),
        }];
        db.complete_indexing(1, "src/X.kt", "abc123", &first).unwrap();

        db.start_indexing(1, "src/X.kt").unwrap();
        let status = db.get_indexing_status(1, "src/X.kt").unwrap().unwrap();
        assert_eq!(status.state, IndexingState::InProgress);
        // A crash mid-reindex should still leave the prior vectors
        // discoverable, not an empty ledger row.
        assert_eq!(status.vector_ids(), vec!["v1"]);
    }

    #[test]
    fn start_indexing_on_a_fresh_path_has_no_prior_contents() {
        let db = test_db();
        db.start_indexing(1, "src/New.kt").unwrap();
        let status = db.get_indexing_status(1, "src/New.kt").unwrap().unwrap();
        assert_eq!(status.state, IndexingState::InProgress);
        assert!(status.contents.is_empty());
    }

    #[test]
    fn poll_cursor_and_last_polled_update_independently() {
        let db = test_db();
        let t1 = Utc::now();
        db.update_poll_cursor(1, "issue_tracker", t1).unwrap();
        let t2 = t1 + chrono::Duration::seconds(5);
        db.touch_last_polled(1, "issue_tracker", t2).unwrap();
        let state = db.get_polling_state(1, "issue_tracker").unwrap().unwrap();
        assert_eq!(state.last_seen_updated_at.unwrap().timestamp(), t1.timestamp());
        assert_eq!(state.last_polled_at.unwrap().timestamp(), t2.timestamp());
    }

    #[test]
    fn connection_state_transitions_to_invalid() {
        let db = test_db();
        let cid = db.upsert_client("Acme", "acme").unwrap();
        let conn_rec = ConnectionRecord {
            id: 0,
            client_id: cid,
            kind: ConnectionKind::Git,
            base_url: "https://git.example.com/repo".into(),
            auth_type: AuthType::Bearer,
            credentials: "token".into(),
            state: ConnectionState::Valid,
        };
        let id = db.insert_connection(&conn_rec).unwrap();
        db.set_connection_state(id, ConnectionState::Invalid).unwrap();
        let fetched = db.get_connection(id).unwrap().unwrap();
        assert_eq!(fetched.state, ConnectionState::Invalid);
    }

    #[test]
    fn get_context_round_trips_client_and_project() {
        let db = test_db();
        let client_id = db.upsert_client("Acme", "acme").unwrap();
        let project_id = db.upsert_project(client_id, "App", "app").unwrap();
        let context_id = db.insert_context(client_id, Some(project_id)).unwrap();
        let (got_client, got_project) = db.get_context(context_id).unwrap().unwrap();
        assert_eq!(got_client, client_id);
        assert_eq!(got_project, Some(project_id));
        assert!(db.get_context(999).unwrap().is_none());
    }

    #[test]
    fn list_git_commits_for_project_ignores_branch() {
        let db = test_db();
        let client_id = db.upsert_client("Acme", "acme").unwrap();
        let project_id = db.upsert_project(client_id, "App", "app").unwrap();
        let make = |branch: &str, hash: &str| GitCommitRecord {
            client_id,
            project_id,
            branch: branch.to_string(),
            hash: hash.to_string(),
            author: "dev".into(),
            message: "msg".into(),
            commit_date: Utc::now(),
            state: GitCommitState::New,
            attempts: 0,
        };
        db.insert_git_commit_if_new(&make("main", "aaa")).unwrap();
        db.insert_git_commit_if_new(&make("release", "bbb")).unwrap();
        let all = db.list_git_commits_for_project(project_id).unwrap();
        assert_eq!(all.len(), 2);
    }
}
