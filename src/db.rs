use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::models::*;

/// Async-safe handle to the database.
///
/// Wraps `BitkDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BitkDb>>,
}

impl DbHandle {
    pub fn new(db: BitkDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BitkDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup
    /// initialization and tests; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, BitkDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Parameters for inserting a log entry. Turn and entry indices are
/// assigned by the store inside the insert transaction.
#[derive(Debug, Clone, Default)]
pub struct NewLogEntry {
    pub entry_type: Option<LogEntryType>,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub tool_action: Option<ToolAction>,
    pub reply_to_message_id: Option<i64>,
    pub timestamp: Option<String>,
    pub visible: bool,
}

impl NewLogEntry {
    pub fn from_normalized(entry: &NormalizedEntry) -> Self {
        Self {
            entry_type: Some(entry.entry_type),
            content: entry.content.clone(),
            metadata: entry.metadata.clone(),
            tool_action: entry.tool_action.clone(),
            reply_to_message_id: None,
            timestamp: entry.timestamp.clone(),
            visible: true,
        }
    }
}

/// One page of the issue log, oldest-first.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub entries: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<i64>,
    pub has_more: bool,
}

/// Paging parameters for the log reader.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Return entries strictly after this log id (forward).
    pub cursor: Option<i64>,
    /// Return entries strictly before this log id (backward).
    pub before: Option<i64>,
    pub limit: usize,
    /// Dev mode shows hidden and system-tagged entries.
    pub dev_mode: bool,
}

pub struct BitkDb {
    conn: Connection,
}

impl BitkDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    alias TEXT NOT NULL UNIQUE,
                    description TEXT,
                    directory TEXT,
                    repository_url TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    is_deleted INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS issues (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id),
                    status_id TEXT NOT NULL DEFAULT 'todo'
                        CHECK (status_id IN ('todo','working','review','done')),
                    issue_number INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    priority TEXT NOT NULL DEFAULT 'medium',
                    sort_order INTEGER NOT NULL DEFAULT 0,
                    parent_issue_id TEXT REFERENCES issues(id),
                    use_worktree INTEGER NOT NULL DEFAULT 0,
                    engine_type TEXT,
                    session_status TEXT,
                    prompt TEXT,
                    external_session_id TEXT,
                    model TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    is_deleted INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS issue_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    issue_id TEXT NOT NULL REFERENCES issues(id),
                    turn_index INTEGER NOT NULL DEFAULT 0,
                    entry_index INTEGER NOT NULL,
                    entry_type TEXT NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    metadata TEXT,
                    tool_action TEXT,
                    reply_to_message_id INTEGER,
                    timestamp TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    visible INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS app_settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_issues_project ON issues(project_id);
                CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status_id);
                CREATE INDEX IF NOT EXISTS idx_issues_parent ON issues(parent_issue_id);
                CREATE INDEX IF NOT EXISTS idx_issue_logs_issue ON issue_logs(issue_id);
                CREATE INDEX IF NOT EXISTS idx_issue_logs_order
                    ON issue_logs(issue_id, turn_index, entry_index);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations (nullable columns, safe to re-run).
        // Only "duplicate column" errors are ignored; anything else propagates.
        match self
            .conn
            .execute("ALTER TABLE issues ADD COLUMN base_commit_hash TEXT", [])
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to add base_commit_hash column: {}",
                    e
                ))
            }
        }

        Ok(())
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    pub fn create_project(
        &self,
        name: &str,
        alias: Option<&str>,
        description: Option<&str>,
        directory: Option<&str>,
    ) -> Result<Project> {
        let id = new_id();
        let alias = match alias {
            Some(a) => a.to_string(),
            None => slugify(name, 40),
        };
        self.conn
            .execute(
                "INSERT INTO projects (id, name, alias, description, directory)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, name, alias, description, directory],
            )
            .context("Failed to insert project")?;
        self.get_project(&id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, alias, description, directory, repository_url,
                        created_at, updated_at, is_deleted
                 FROM projects WHERE id = ?1",
            )
            .context("Failed to prepare get_project")?;
        let mut rows = stmt
            .query_map(params![id], map_project)
            .context("Failed to query project")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read project row")?)),
            None => Ok(None),
        }
    }

    /// Resolve a project by opaque id or by its human alias.
    pub fn resolve_project(&self, id_or_alias: &str) -> Result<Option<Project>> {
        if let Some(project) = self.get_project(id_or_alias)? {
            return Ok(Some(project));
        }
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, alias, description, directory, repository_url,
                        created_at, updated_at, is_deleted
                 FROM projects WHERE alias = ?1 AND is_deleted = 0",
            )
            .context("Failed to prepare resolve_project")?;
        let mut rows = stmt
            .query_map(params![id_or_alias], map_project)
            .context("Failed to query project by alias")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read project row")?)),
            None => Ok(None),
        }
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, alias, description, directory, repository_url,
                        created_at, updated_at, is_deleted
                 FROM projects WHERE is_deleted = 0 ORDER BY created_at",
            )
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], map_project)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    // ── Issue CRUD ────────────────────────────────────────────────────

    pub fn create_issue(
        &self,
        project_id: &str,
        title: &str,
        prompt: Option<&str>,
        status: IssueStatus,
        parent_issue_id: Option<&str>,
    ) -> Result<Issue> {
        self.get_project(project_id)?
            .filter(|p| !p.is_deleted)
            .with_context(|| format!("Project {} not found", project_id))?;

        if let Some(parent_id) = parent_issue_id {
            let parent = self
                .get_issue(parent_id)?
                .filter(|i| !i.is_deleted)
                .with_context(|| format!("Parent issue {} not found", parent_id))?;
            if parent.parent_issue_id.is_some() {
                anyhow::bail!("Sub-issues cannot be nested more than one level");
            }
            if parent.project_id != project_id {
                anyhow::bail!("Parent issue belongs to a different project");
            }
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to start transaction")?;

        // Issue numbers count soft-deleted rows so a number is never reused.
        let issue_number: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(issue_number), 0) + 1 FROM issues WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to allocate issue number")?;
        let sort_order: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sort_order), 0) + 1 FROM issues
                 WHERE project_id = ?1 AND status_id = ?2 AND is_deleted = 0",
                params![project_id, status.as_str()],
                |row| row.get(0),
            )
            .context("Failed to allocate sort order")?;

        let id = new_id();
        tx.execute(
            "INSERT INTO issues (id, project_id, status_id, issue_number, title,
                                 sort_order, parent_issue_id, prompt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                project_id,
                status.as_str(),
                issue_number,
                title,
                sort_order,
                parent_issue_id,
                prompt
            ],
        )
        .context("Failed to insert issue")?;
        tx.commit().context("Failed to commit issue insert")?;

        self.get_issue(&id)?.context("Issue not found after insert")
    }

    pub fn get_issue(&self, id: &str) -> Result<Option<Issue>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM issues WHERE id = ?1",
                ISSUE_COLUMNS
            ))
            .context("Failed to prepare get_issue")?;
        let mut rows = stmt
            .query_map(params![id], map_issue_row)
            .context("Failed to query issue")?;
        match rows.next() {
            Some(row) => {
                let raw = row.context("Failed to read issue row")?;
                Ok(Some(raw.into_issue()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_issues(&self, project_id: &str) -> Result<Vec<Issue>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM issues
                 WHERE project_id = ?1 AND is_deleted = 0
                 ORDER BY status_id, sort_order",
                ISSUE_COLUMNS
            ))
            .context("Failed to prepare list_issues")?;
        let rows = stmt
            .query_map(params![project_id], map_issue_row)
            .context("Failed to query issues")?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row.context("Failed to read issue row")?.into_issue()?);
        }
        Ok(issues)
    }

    /// Move an issue to a new status column, appending it to the bottom.
    pub fn update_issue_status(&self, id: &str, status: IssueStatus) -> Result<Issue> {
        let issue = self
            .get_issue(id)?
            .with_context(|| format!("Issue {} not found", id))?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to start transaction")?;
        let sort_order: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sort_order), 0) + 1 FROM issues
                 WHERE project_id = ?1 AND status_id = ?2 AND is_deleted = 0",
                params![issue.project_id, status.as_str()],
                |row| row.get(0),
            )
            .context("Failed to allocate sort order")?;
        tx.execute(
            "UPDATE issues SET status_id = ?1, sort_order = ?2, updated_at = datetime('now')
             WHERE id = ?3",
            params![status.as_str(), sort_order, id],
        )
        .context("Failed to update issue status")?;
        tx.commit().context("Failed to commit status update")?;
        self.get_issue(id)?.context("Issue vanished after update")
    }

    /// Record the engine session an execution attaches to the issue.
    pub fn start_issue_session(
        &self,
        id: &str,
        engine_type: EngineType,
        prompt: &str,
        model: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE issues SET engine_type = ?1, session_status = ?2, prompt = ?3,
                        model = COALESCE(?4, model), updated_at = datetime('now')
                 WHERE id = ?5",
                params![
                    engine_type.as_str(),
                    SessionStatus::Running.as_str(),
                    prompt,
                    model,
                    id
                ],
            )
            .context("Failed to start issue session")?;
        Ok(())
    }

    pub fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE issues SET session_status = ?1, updated_at = datetime('now')
                 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update session status")?;
        Ok(())
    }

    pub fn set_external_session_id(&self, id: &str, session_id: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE issues SET external_session_id = ?1, updated_at = datetime('now')
                 WHERE id = ?2",
                params![session_id, id],
            )
            .context("Failed to set external session id")?;
        Ok(())
    }

    pub fn set_issue_title(&self, id: &str, title: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE issues SET title = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![title, id],
            )
            .context("Failed to set issue title")?;
        Ok(())
    }

    pub fn soft_delete_issue(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE issues SET is_deleted = 1, updated_at = datetime('now') WHERE id = ?1",
                params![id],
            )
            .context("Failed to delete issue")?;
        Ok(())
    }

    /// Issues whose session claims to be live. The engine filters out the
    /// ones that actually have an in-memory process before resetting.
    pub fn issues_with_live_sessions(&self) -> Result<Vec<Issue>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM issues
                 WHERE status_id = 'working'
                   AND session_status IN ('pending', 'running')
                   AND is_deleted = 0",
                ISSUE_COLUMNS
            ))
            .context("Failed to prepare issues_with_live_sessions")?;
        let rows = stmt
            .query_map([], map_issue_row)
            .context("Failed to query live sessions")?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row.context("Failed to read issue row")?.into_issue()?);
        }
        Ok(issues)
    }

    // ── Issue logs ────────────────────────────────────────────────────

    /// Append a log entry. The entry index is read and assigned inside the
    /// same transaction as the insert so (turn_index, entry_index) stays
    /// monotonic under concurrent writers.
    pub fn append_log(
        &self,
        issue_id: &str,
        turn_index: i64,
        entry: &NewLogEntry,
    ) -> Result<LogEntry> {
        let entry_type = entry
            .entry_type
            .context("Log entry requires an entry type")?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to start transaction")?;
        let entry_index: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(entry_index), -1) + 1 FROM issue_logs WHERE issue_id = ?1",
                params![issue_id],
                |row| row.get(0),
            )
            .context("Failed to allocate entry index")?;
        let metadata = entry
            .metadata
            .as_ref()
            .map(|m| serde_json::to_string(m))
            .transpose()
            .context("Failed to serialize metadata")?;
        let tool_action = entry
            .tool_action
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize tool action")?;
        tx.execute(
            "INSERT INTO issue_logs (issue_id, turn_index, entry_index, entry_type, content,
                                     metadata, tool_action, reply_to_message_id, timestamp, visible)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                issue_id,
                turn_index,
                entry_index,
                entry_type.as_str(),
                entry.content,
                metadata,
                tool_action,
                entry.reply_to_message_id,
                entry.timestamp,
                entry.visible as i64
            ],
        )
        .context("Failed to insert log entry")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("Failed to commit log insert")?;

        self.get_log(id)?.context("Log entry not found after insert")
    }

    pub fn get_log(&self, id: i64) -> Result<Option<LogEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM issue_logs WHERE id = ?1",
                LOG_COLUMNS
            ))
            .context("Failed to prepare get_log")?;
        let mut rows = stmt
            .query_map(params![id], map_log_row)
            .context("Failed to query log entry")?;
        match rows.next() {
            Some(row) => {
                let raw = row.context("Failed to read log row")?;
                Ok(Some(raw.into_entry()?))
            }
            None => Ok(None),
        }
    }

    /// Paginated log reader.
    ///
    /// Without a cursor: the newest `limit` entries in ascending order,
    /// `next_cursor` pointing at the oldest returned id (continue backwards
    /// with `before`). With `cursor`: entries strictly after it. With
    /// `before`: entries strictly before it. Outside dev mode the reader
    /// overfetches by a factor of two, then drops hidden and system-tagged
    /// entries before trimming to `limit`.
    pub fn get_logs(&self, issue_id: &str, query: &LogQuery) -> Result<LogPage> {
        let limit = query.limit.max(1);
        let fetch = if query.dev_mode {
            limit + 1
        } else {
            limit * 2 + 1
        };

        let forward = query.cursor.is_some();
        let (sql, bound) = if let Some(cursor) = query.cursor {
            (
                format!(
                    "SELECT {} FROM issue_logs WHERE issue_id = ?1 AND id > ?2
                     ORDER BY id ASC LIMIT ?3",
                    LOG_COLUMNS
                ),
                Some(cursor),
            )
        } else if let Some(before) = query.before {
            (
                format!(
                    "SELECT {} FROM issue_logs WHERE issue_id = ?1 AND id < ?2
                     ORDER BY id DESC LIMIT ?3",
                    LOG_COLUMNS
                ),
                Some(before),
            )
        } else {
            (
                format!(
                    "SELECT {} FROM issue_logs WHERE issue_id = ?1
                     ORDER BY id DESC LIMIT ?2",
                    LOG_COLUMNS
                ),
                None,
            )
        };

        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare get_logs")?;
        let mut raw = Vec::new();
        if let Some(bound) = bound {
            let rows = stmt
                .query_map(params![issue_id, bound, fetch as i64], map_log_row)
                .context("Failed to query logs")?;
            for row in rows {
                raw.push(row.context("Failed to read log row")?.into_entry()?);
            }
        } else {
            let rows = stmt
                .query_map(params![issue_id, fetch as i64], map_log_row)
                .context("Failed to query logs")?;
            for row in rows {
                raw.push(row.context("Failed to read log row")?.into_entry()?);
            }
        }

        let raw_len = raw.len();
        if !forward {
            raw.reverse();
        }
        let mut entries: Vec<LogEntry> = if query.dev_mode {
            raw
        } else {
            raw.into_iter()
                .filter(|e| e.visible && !e.is_system_tagged())
                .collect()
        };

        let has_more = entries.len() > limit || raw_len >= fetch;
        if entries.len() > limit {
            if forward {
                entries.truncate(limit);
            } else {
                let drop = entries.len() - limit;
                entries.drain(..drop);
            }
        }

        let next_cursor = if forward {
            entries.last().map(|e| e.id)
        } else {
            entries.first().map(|e| e.id)
        };

        Ok(LogPage {
            entries,
            next_cursor,
            has_more,
        })
    }

    /// Durably queued user messages not yet consumed by the engine.
    pub fn pending_messages(&self, issue_id: &str) -> Result<Vec<LogEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM issue_logs
                 WHERE issue_id = ?1 AND entry_type = 'user-message' AND visible = 1
                 ORDER BY id ASC",
                LOG_COLUMNS
            ))
            .context("Failed to prepare pending_messages")?;
        let rows = stmt
            .query_map(params![issue_id], map_log_row)
            .context("Failed to query pending messages")?;
        let mut pending = Vec::new();
        for row in rows {
            let entry = row.context("Failed to read log row")?.into_entry()?;
            if entry.is_pending() {
                pending.push(entry);
            }
        }
        Ok(pending)
    }

    /// Mark consumed pending messages. They are never deleted; the hidden
    /// rows remain for audit.
    pub fn mark_pending_dispatched(&self, ids: &[i64]) -> Result<()> {
        for id in ids {
            self.conn
                .execute(
                    "UPDATE issue_logs SET visible = 0 WHERE id = ?1",
                    params![id],
                )
                .context("Failed to mark pending message dispatched")?;
        }
        Ok(())
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM app_settings WHERE key = ?1")
            .context("Failed to prepare get_setting")?;
        let mut rows = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))
            .context("Failed to query setting")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read setting row")?)),
            None => Ok(None),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO app_settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
                params![key, value],
            )
            .context("Failed to set setting")?;
        Ok(())
    }
}

/// Derive a URL-safe alias from a project name, limited to `max_len`
/// characters.
pub fn slugify(name: &str, max_len: usize) -> String {
    let slug = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    slug.chars()
        .take(max_len)
        .collect::<String>()
        .trim_end_matches('-')
        .to_string()
}

// ── Row mapping ──────────────────────────────────────────────────────

const ISSUE_COLUMNS: &str = "id, project_id, status_id, issue_number, title, priority, \
     sort_order, parent_issue_id, use_worktree, engine_type, session_status, prompt, \
     external_session_id, model, base_commit_hash, created_at, updated_at, is_deleted";

const LOG_COLUMNS: &str = "id, issue_id, turn_index, entry_index, entry_type, content, \
     metadata, tool_action, reply_to_message_id, timestamp, visible";

fn map_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        alias: row.get(2)?,
        description: row.get(3)?,
        directory: row.get(4)?,
        repository_url: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        is_deleted: row.get::<_, i64>(8)? != 0,
    })
}

struct IssueRow {
    id: String,
    project_id: String,
    status_id: String,
    issue_number: i64,
    title: String,
    priority: String,
    sort_order: i64,
    parent_issue_id: Option<String>,
    use_worktree: i64,
    engine_type: Option<String>,
    session_status: Option<String>,
    prompt: Option<String>,
    external_session_id: Option<String>,
    model: Option<String>,
    base_commit_hash: Option<String>,
    created_at: String,
    updated_at: String,
    is_deleted: i64,
}

impl IssueRow {
    fn into_issue(self) -> Result<Issue> {
        Ok(Issue {
            id: self.id,
            project_id: self.project_id,
            status: IssueStatus::from_str(&self.status_id)
                .map_err(|e| anyhow::anyhow!(e))?,
            issue_number: self.issue_number,
            title: self.title,
            priority: Priority::from_str(&self.priority).map_err(|e| anyhow::anyhow!(e))?,
            sort_order: self.sort_order,
            parent_issue_id: self.parent_issue_id,
            use_worktree: self.use_worktree != 0,
            engine_type: self
                .engine_type
                .as_deref()
                .map(EngineType::from_str)
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?,
            session_status: self
                .session_status
                .as_deref()
                .map(SessionStatus::from_str)
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?,
            prompt: self.prompt,
            external_session_id: self.external_session_id,
            model: self.model,
            base_commit_hash: self.base_commit_hash,
            created_at: self.created_at,
            updated_at: self.updated_at,
            is_deleted: self.is_deleted != 0,
        })
    }
}

fn map_issue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IssueRow> {
    Ok(IssueRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        status_id: row.get(2)?,
        issue_number: row.get(3)?,
        title: row.get(4)?,
        priority: row.get(5)?,
        sort_order: row.get(6)?,
        parent_issue_id: row.get(7)?,
        use_worktree: row.get(8)?,
        engine_type: row.get(9)?,
        session_status: row.get(10)?,
        prompt: row.get(11)?,
        external_session_id: row.get(12)?,
        model: row.get(13)?,
        base_commit_hash: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
        is_deleted: row.get(17)?,
    })
}

struct LogRow {
    id: i64,
    issue_id: String,
    turn_index: i64,
    entry_index: i64,
    entry_type: String,
    content: String,
    metadata: Option<String>,
    tool_action: Option<String>,
    reply_to_message_id: Option<i64>,
    timestamp: Option<String>,
    visible: i64,
}

impl LogRow {
    fn into_entry(self) -> Result<LogEntry> {
        Ok(LogEntry {
            id: self.id,
            issue_id: self.issue_id,
            turn_index: self.turn_index,
            entry_index: self.entry_index,
            entry_type: LogEntryType::from_str(&self.entry_type)
                .map_err(|e| anyhow::anyhow!(e))?,
            content: self.content,
            metadata: self
                .metadata
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Failed to parse log metadata")?,
            tool_action: self
                .tool_action
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Failed to parse tool action")?,
            reply_to_message_id: self.reply_to_message_id,
            timestamp: self.timestamp,
            visible: self.visible != 0,
        })
    }
}

fn map_log_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRow> {
    Ok(LogRow {
        id: row.get(0)?,
        issue_id: row.get(1)?,
        turn_index: row.get(2)?,
        entry_index: row.get(3)?,
        entry_type: row.get(4)?,
        content: row.get(5)?,
        metadata: row.get(6)?,
        tool_action: row.get(7)?,
        reply_to_message_id: row.get(8)?,
        timestamp: row.get(9)?,
        visible: row.get(10)?,
    })
}
