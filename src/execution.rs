//! Per-issue execution engine.
//!
//! Owns every managed process, enforces at-most-one live execution per
//! issue plus a global concurrency cap, consumes engine output streams,
//! persists normalized log entries, and runs turn settlement: flushing
//! queued input, auto-moving issue status, and emitting terminal events.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::db::{DbHandle, LogPage, LogQuery, NewLogEntry};
use crate::engines::{
    ensure_within_workspace, safe_env, EngineAdapter, EngineRegistry, ProcessInput,
    SpawnOptions, SpawnedProcess,
};
use crate::errors::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::models::*;
use crate::process::{ManagedProcess, MergedInput, PendingInput, ProcessState};
use crate::stream::LineStream;

/// Grace between a cancel request and the hard kill.
pub const CANCEL_DEADLINE: Duration = Duration::from_secs(5);

/// How long to wait for late stream I/O after the process exits.
const EXIT_IO_GRACE: Duration = Duration::from_secs(2);

/// Cadence of the stale-session sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// System prompt for the auto-title meta turn.
const TITLE_PROMPT: &str = "[SYSTEM TASK] Generate a short title for this conversation.\n\
Summarize what the user asked for in at most eight words.\n\
Reply with the title wrapped exactly as <bitk><title>your title here</title></bitk> \
and output nothing else.";

/// Residual subprocess noise dropped after a user cancellation.
const CANCELLATION_NOISE: &[&str] = &[
    "request was aborted",
    "request interrupted by user",
    "rust analyzer lsp crashed",
    "rust-analyzer-lsp",
];

/// Pull the generated title out of an auto-title reply: trimmed and
/// capped at 200 characters, or nothing if the reply was empty.
pub fn extract_title(text: &str) -> Option<String> {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"(?s)<bitk><title>(.*?)</title></bitk>").expect("valid title regex")
    });
    let title = re.captures(text)?.get(1)?.as_str().trim().to_string();
    if title.is_empty() {
        None
    } else {
        Some(title.chars().take(200).collect())
    }
}

fn is_cancellation_noise(entry: &NormalizedEntry) -> bool {
    if entry.result_subtype() != Some("error_during_execution") {
        return false;
    }
    let mut haystack = entry.content.to_lowercase();
    if let Some(metadata) = &entry.metadata {
        if let Some(error) = metadata.get("error").and_then(|v| v.as_str()) {
            haystack.push('\n');
            haystack.push_str(&error.to_lowercase());
        }
    }
    CANCELLATION_NOISE
        .iter()
        .any(|needle| haystack.contains(needle))
}

// ── Requests and outcomes ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub engine_type: EngineType,
    pub prompt: String,
    pub working_dir: Option<PathBuf>,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
}

#[derive(Debug, Clone)]
pub struct FollowUpRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub busy_action: BusyAction,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionInfo {
    pub execution_id: String,
    pub issue_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum FollowUpOutcome {
    /// A new process was spawned for the follow-up.
    Started { execution_id: String },
    /// The prompt was queued behind the busy process.
    Queued { message_id: i64 },
    /// The prompt was handed to the idle running process as a new turn.
    Sent { execution_id: String },
}

// ── Process table ────────────────────────────────────────────────────

struct ExecutionHandle {
    execution_id: String,
    issue_id: String,
    pid: Option<u32>,
    state: tokio::sync::Mutex<ManagedProcess>,
    input: tokio::sync::Mutex<ProcessInput>,
    /// Signals the supervisor to hard-kill the child.
    kill: Notify,
    exited_rx: watch::Receiver<bool>,
}

impl ExecutionHandle {
    async fn wait_exited(&self) {
        let mut rx = self.exited_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Default)]
struct ProcessTable {
    by_execution: HashMap<String, Arc<ExecutionHandle>>,
    /// issue id → execution id, including not-yet-attached reservations.
    by_issue: HashMap<String, String>,
}

// ── Engine ───────────────────────────────────────────────────────────

pub struct IssueEngine {
    db: DbHandle,
    bus: EventBus,
    registry: Arc<EngineRegistry>,
    workspace_root: PathBuf,
    max_concurrent: usize,
    table: std::sync::Mutex<ProcessTable>,
}

impl IssueEngine {
    pub fn new(
        db: DbHandle,
        bus: EventBus,
        registry: Arc<EngineRegistry>,
        workspace_root: PathBuf,
        max_concurrent: usize,
    ) -> Self {
        Self {
            db,
            bus,
            registry,
            workspace_root,
            max_concurrent,
            table: std::sync::Mutex::new(ProcessTable::default()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Number of live executions (including spawns in progress).
    pub fn active_count(&self) -> usize {
        self.table.lock().map(|t| t.by_issue.len()).unwrap_or(0)
    }

    fn live_execution(&self, issue_id: &str) -> Option<Arc<ExecutionHandle>> {
        let table = self.table.lock().ok()?;
        let execution_id = table.by_issue.get(issue_id)?;
        table.by_execution.get(execution_id).cloned()
    }

    async fn load_issue(&self, issue_id: &str) -> Result<Issue, EngineError> {
        let id = issue_id.to_string();
        self.db
            .call(move |db| db.get_issue(&id))
            .await
            .map_err(EngineError::Internal)?
            .filter(|issue| !issue.is_deleted)
            .ok_or_else(|| EngineError::not_found(format!("issue {}", issue_id)))
    }

    async fn publish_issue_updated(&self, issue_id: &str) {
        let id = issue_id.to_string();
        match self.db.call(move |db| db.get_issue(&id)).await {
            Ok(Some(issue)) => self.bus.publish(EngineEvent::IssueUpdated { issue }),
            Ok(None) => {}
            Err(e) => warn!(issue_id = issue_id, error = %e, "failed to load issue for event"),
        }
    }

    /// Reserve the issue's execution slot, enforcing both per-issue
    /// exclusivity and the global cap.
    fn reserve(&self, issue_id: &str) -> Result<String, EngineError> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| EngineError::Internal(anyhow::anyhow!("process table poisoned")))?;
        if table.by_issue.contains_key(issue_id) {
            return Err(EngineError::Busy {
                issue_id: issue_id.to_string(),
            });
        }
        if table.by_issue.len() >= self.max_concurrent {
            return Err(EngineError::Busy {
                issue_id: issue_id.to_string(),
            });
        }
        let execution_id = new_id();
        table
            .by_issue
            .insert(issue_id.to_string(), execution_id.clone());
        Ok(execution_id)
    }

    fn release_reservation(&self, issue_id: &str, execution_id: &str) {
        if let Ok(mut table) = self.table.lock() {
            if table.by_issue.get(issue_id).map(String::as_str) == Some(execution_id) {
                table.by_issue.remove(issue_id);
            }
            table.by_execution.remove(execution_id);
        }
    }

    // ── Public operations ─────────────────────────────────────────────

    /// Start a fresh execution for an issue.
    pub async fn execute_issue(
        self: &Arc<Self>,
        issue_id: &str,
        request: ExecuteRequest,
    ) -> Result<ExecutionInfo, EngineError> {
        if request.prompt.trim().is_empty() {
            return Err(EngineError::validation("prompt must not be empty"));
        }
        let issue = self.load_issue(issue_id).await?;
        match issue.status {
            IssueStatus::Todo | IssueStatus::Done => {
                return Err(EngineError::validation(format!(
                    "issue in '{}' cannot be executed; move it to the board first",
                    issue.status
                )));
            }
            IssueStatus::Review => {
                let id = issue.id.clone();
                self.db
                    .call(move |db| db.update_issue_status(&id, IssueStatus::Working))
                    .await
                    .map_err(EngineError::Internal)?;
                self.publish_issue_updated(&issue.id).await;
            }
            IssueStatus::Working => {}
        }

        self.start_execution(&issue, request, false).await
    }

    /// Send a follow-up. Behavior depends on whether a process is live and
    /// whether its turn is in flight.
    pub async fn follow_up_issue(
        self: &Arc<Self>,
        issue_id: &str,
        request: FollowUpRequest,
    ) -> Result<FollowUpOutcome, EngineError> {
        if request.prompt.trim().is_empty() {
            return Err(EngineError::validation("prompt must not be empty"));
        }
        self.load_issue(issue_id).await?;

        if let Some(handle) = self.live_execution(issue_id) {
            let busy = {
                let state = handle.state.lock().await;
                state.turn_in_flight && state.is_live()
            };
            if busy {
                return match request.busy_action {
                    BusyAction::Queue => self.queue_pending(&handle, &request).await,
                    BusyAction::Cancel => {
                        self.cancel_issue(issue_id).await?;
                        handle.wait_exited().await;
                        self.start_follow_up_execution(issue_id, &request).await
                    }
                };
            }
            // Idle process: hand the prompt over as a fresh turn.
            return self.send_turn_to_process(&handle, &request).await;
        }

        self.start_follow_up_execution(issue_id, &request).await
    }

    /// Drop queued pending input without sending it, then spawn fresh.
    /// The escape hatch when a stored session id keeps failing.
    pub async fn restart_issue(self: &Arc<Self>, issue_id: &str) -> Result<ExecutionInfo, EngineError> {
        let issue = self.load_issue(issue_id).await?;
        let engine_type = issue.engine_type.ok_or_else(|| {
            EngineError::validation("issue has no engine session to restart")
        })?;
        let prompt = issue
            .prompt
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| EngineError::validation("issue has no stored prompt to restart"))?;

        let id = issue_id.to_string();
        self.db
            .call(move |db| {
                let pending = db.pending_messages(&id)?;
                let ids: Vec<i64> = pending.iter().map(|entry| entry.id).collect();
                db.mark_pending_dispatched(&ids)
            })
            .await
            .map_err(EngineError::Internal)?;

        if let Some(handle) = self.live_execution(issue_id) {
            self.cancel_execution(&handle).await;
            handle.wait_exited().await;
        }

        let request = ExecuteRequest {
            engine_type,
            prompt,
            working_dir: None,
            model: issue.model.clone(),
            permission_mode: PermissionMode::default(),
        };
        self.start_execution(&issue, request, false).await
    }

    /// Soft-cancel the live execution; resolves once the process is gone
    /// and returns the issue's terminal session status.
    pub async fn cancel_issue(self: &Arc<Self>, issue_id: &str) -> Result<SessionStatus, EngineError> {
        let handle = self
            .live_execution(issue_id)
            .ok_or_else(|| EngineError::not_found(format!("execution for issue {}", issue_id)))?;
        self.cancel_execution(&handle).await;
        handle.wait_exited().await;

        let issue = self.load_issue(issue_id).await?;
        Ok(issue.session_status.unwrap_or(SessionStatus::Failed))
    }

    /// Paginated log reader.
    pub async fn get_logs(
        &self,
        issue_id: &str,
        query: LogQuery,
    ) -> Result<LogPage, EngineError> {
        self.load_issue(issue_id).await?;
        let id = issue_id.to_string();
        self.db
            .call(move |db| db.get_logs(&id, &query))
            .await
            .map_err(EngineError::Internal)
    }

    // ── Spawning ──────────────────────────────────────────────────────

    async fn start_follow_up_execution(
        self: &Arc<Self>,
        issue_id: &str,
        request: &FollowUpRequest,
    ) -> Result<FollowUpOutcome, EngineError> {
        let issue = self.load_issue(issue_id).await?;
        let engine_type = issue
            .engine_type
            .ok_or_else(|| EngineError::validation("issue has no engine session to follow up"))?;
        let execute = ExecuteRequest {
            engine_type,
            prompt: request.prompt.clone(),
            working_dir: None,
            model: request.model.clone(),
            permission_mode: request.permission_mode,
        };
        let info = self.start_execution(&issue, execute, true).await?;
        Ok(FollowUpOutcome::Started {
            execution_id: info.execution_id,
        })
    }

    async fn start_execution(
        self: &Arc<Self>,
        issue: &Issue,
        request: ExecuteRequest,
        continuity: bool,
    ) -> Result<ExecutionInfo, EngineError> {
        let adapter = self.registry.get(request.engine_type)?;
        let working_dir = self.resolve_working_dir(issue, request.working_dir.as_deref()).await?;
        let execution_id = self.reserve(&issue.id)?;

        let result = self
            .spawn_and_attach(issue, &execution_id, adapter, &request, working_dir, continuity)
            .await;
        match result {
            Ok(info) => Ok(info),
            Err(e) => {
                self.release_reservation(&issue.id, &execution_id);
                let id = issue.id.clone();
                let _ = self
                    .db
                    .call(move |db| db.update_session_status(&id, SessionStatus::Failed))
                    .await;
                self.bus.publish(EngineEvent::State {
                    issue_id: issue.id.clone(),
                    execution_id,
                    state: SessionStatus::Failed,
                });
                Err(e)
            }
        }
    }

    async fn spawn_and_attach(
        self: &Arc<Self>,
        issue: &Issue,
        execution_id: &str,
        adapter: Arc<dyn EngineAdapter>,
        request: &ExecuteRequest,
        working_dir: Option<PathBuf>,
        continuity: bool,
    ) -> Result<ExecutionInfo, EngineError> {
        let opts = SpawnOptions {
            prompt: request.prompt.clone(),
            working_dir,
            model: request.model.clone(),
            permission_mode: request.permission_mode,
            external_session_id: if continuity {
                issue.external_session_id.clone()
            } else {
                None
            },
        };
        let env = safe_env();

        // The initial user message is durable before the process exists.
        let issue_id = issue.id.clone();
        let prompt = request.prompt.clone();
        let engine_type = request.engine_type;
        let model = request.model.clone();
        self.db
            .call(move |db| {
                db.append_log(
                    &issue_id,
                    0,
                    &NewLogEntry {
                        entry_type: Some(LogEntryType::UserMessage),
                        content: prompt.clone(),
                        timestamp: Some(now_iso()),
                        visible: true,
                        ..Default::default()
                    },
                )?;
                db.start_issue_session(&issue_id, engine_type, &prompt, model.as_deref())
            })
            .await
            .map_err(EngineError::Internal)?;

        let spawned = if continuity {
            adapter.spawn_follow_up(&opts, &env).await?
        } else {
            adapter.spawn(&opts, &env).await?
        };
        info!(
            issue_id = %issue.id,
            execution_id = execution_id,
            engine = %request.engine_type,
            "execution spawned"
        );

        // Running is published before the consumers start so no terminal
        // state can ever precede it on the bus.
        self.bus.publish(EngineEvent::State {
            issue_id: issue.id.clone(),
            execution_id: execution_id.to_string(),
            state: SessionStatus::Running,
        });
        self.attach(issue, execution_id, request.engine_type, adapter, spawned);
        self.publish_issue_updated(&issue.id).await;
        Ok(ExecutionInfo {
            execution_id: execution_id.to_string(),
            issue_id: issue.id.clone(),
        })
    }

    async fn resolve_working_dir(
        &self,
        issue: &Issue,
        requested: Option<&Path>,
    ) -> Result<Option<PathBuf>, EngineError> {
        let candidate = match requested {
            Some(dir) => Some(dir.to_path_buf()),
            None => {
                let project_id = issue.project_id.clone();
                self.db
                    .call(move |db| db.get_project(&project_id))
                    .await
                    .map_err(EngineError::Internal)?
                    .and_then(|project| project.directory)
                    .map(PathBuf::from)
            }
        };
        match candidate {
            Some(dir) => Ok(Some(ensure_within_workspace(&self.workspace_root, &dir)?)),
            None => Ok(None),
        }
    }

    fn attach(
        self: &Arc<Self>,
        issue: &Issue,
        execution_id: &str,
        engine_type: EngineType,
        adapter: Arc<dyn EngineAdapter>,
        spawned: SpawnedProcess,
    ) {
        let SpawnedProcess {
            mut child,
            pid,
            input,
            stdout,
            stderr,
        } = spawned;

        let mut managed = ManagedProcess::new(execution_id, &issue.id, engine_type);
        managed.state = ProcessState::Running;
        let (exited_tx, exited_rx) = watch::channel(false);
        let handle = Arc::new(ExecutionHandle {
            execution_id: execution_id.to_string(),
            issue_id: issue.id.clone(),
            pid,
            state: tokio::sync::Mutex::new(managed),
            input: tokio::sync::Mutex::new(input),
            kill: Notify::new(),
            exited_rx,
        });

        if let Ok(mut table) = self.table.lock() {
            table
                .by_execution
                .insert(execution_id.to_string(), handle.clone());
            table
                .by_issue
                .insert(issue.id.clone(), execution_id.to_string());
        }

        let stdout_task = tokio::spawn({
            let engine = self.clone();
            let handle = handle.clone();
            let adapter = adapter.clone();
            async move { engine.consume_stdout(handle, adapter, stdout).await }
        });
        let stderr_task = stderr.map(|stderr| {
            tokio::spawn({
                let engine = self.clone();
                let handle = handle.clone();
                async move { engine.consume_stderr(handle, stderr).await }
            })
        });

        // Exit supervisor: waits for the child (or a hard-kill request),
        // lets late stream I/O drain, then settles and cleans up.
        tokio::spawn({
            let engine = self.clone();
            let handle = handle.clone();
            async move {
                let status = tokio::select! {
                    status = child.wait() => status.ok(),
                    _ = handle.kill.notified() => {
                        let _ = child.start_kill();
                        child.wait().await.ok()
                    }
                };
                let _ = tokio::time::timeout(EXIT_IO_GRACE, stdout_task).await;
                if let Some(stderr_task) = stderr_task {
                    let _ = tokio::time::timeout(EXIT_IO_GRACE, stderr_task).await;
                }
                engine.handle_exit(&handle, status).await;
                let _ = exited_tx.send(true);
            }
        });
    }

    // ── Stream consumption ────────────────────────────────────────────

    async fn consume_stdout(
        self: Arc<Self>,
        handle: Arc<ExecutionHandle>,
        adapter: Arc<dyn EngineAdapter>,
        stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    ) {
        let mut lines = LineStream::new(stdout);
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(entry) = adapter.normalize_log_line(&line) {
                        if let Err(e) = self.ingest_entry(&handle, entry).await {
                            error!(
                                issue_id = %handle.issue_id,
                                error = %e,
                                "failed to ingest log entry"
                            );
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // A broken stream only terminates this consumer; exit
                    // handling still runs off the subprocess itself.
                    warn!(issue_id = %handle.issue_id, error = %e, "stdout stream error");
                    break;
                }
            }
        }
    }

    async fn consume_stderr(
        self: Arc<Self>,
        handle: Arc<ExecutionHandle>,
        stderr: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    ) {
        let mut lines = LineStream::new(stderr);
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let entry = NormalizedEntry::new(LogEntryType::ErrorMessage, line);
                    if let Err(e) = self.ingest_entry(&handle, entry).await {
                        error!(issue_id = %handle.issue_id, error = %e, "failed to ingest stderr line");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(issue_id = %handle.issue_id, error = %e, "stderr stream error");
                    break;
                }
            }
        }
    }

    /// Stamp, persist, publish, and react to one normalized entry.
    async fn ingest_entry(
        self: &Arc<Self>,
        handle: &Arc<ExecutionHandle>,
        mut entry: NormalizedEntry,
    ) -> Result<()> {
        let completes_turn = entry.signals_turn_completion();
        let turn_index;
        {
            let mut state = handle.state.lock().await;

            if state.cancelled_by_user && is_cancellation_noise(&entry) {
                debug!(issue_id = %handle.issue_id, "suppressing cancellation noise");
                if completes_turn {
                    drop(state);
                    self.complete_turn(handle).await?;
                }
                return Ok(());
            }

            if entry.timestamp.is_none() {
                entry.timestamp = Some(now_iso());
            }
            if state.meta_turn {
                let metadata = entry
                    .metadata
                    .get_or_insert_with(|| serde_json::json!({}));
                metadata["type"] = serde_json::json!("system");
            }
            if entry.entry_type == LogEntryType::AssistantMessage {
                state.saw_assistant_output = true;
            }
            if entry.is_error_result() {
                state.logical_failure = true;
                state.failure_reason = Some(if entry.content.is_empty() {
                    entry
                        .result_subtype()
                        .unwrap_or("engine reported an error")
                        .to_string()
                } else {
                    entry.content.clone()
                });
            }
            turn_index = state.turn_index;
        }

        if let Some(session_id) = entry.session_id().map(str::to_string) {
            let issue_id = handle.issue_id.clone();
            self.db
                .call(move |db| db.set_external_session_id(&issue_id, Some(&session_id)))
                .await?;
        }
        if let Some(commands) = entry.slash_commands() {
            let serialized = serde_json::to_string(&commands)?;
            {
                let mut state = handle.state.lock().await;
                state.slash_commands = commands;
            }
            self.db
                .call(move |db| db.set_setting("engine:slashCommands", &serialized))
                .await?;
        }

        let persisted = {
            let issue_id = handle.issue_id.clone();
            let new_entry = NewLogEntry::from_normalized(&entry);
            self.db
                .call(move |db| db.append_log(&issue_id, turn_index, &new_entry))
                .await?
        };
        {
            let mut state = handle.state.lock().await;
            state.push_log(persisted.clone());
        }
        self.bus.publish(EngineEvent::Log {
            issue_id: handle.issue_id.clone(),
            execution_id: handle.execution_id.clone(),
            entry: persisted,
        });

        if completes_turn {
            self.complete_turn(handle).await?;
        }
        Ok(())
    }

    // ── Turn completion and settlement ────────────────────────────────

    async fn complete_turn(self: &Arc<Self>, handle: &Arc<ExecutionHandle>) -> Result<()> {
        enum Next {
            Ignore,
            MetaFinished,
            Dispatch(MergedInput),
            Settle,
        }

        let next = {
            let mut state = handle.state.lock().await;
            if !state.turn_in_flight {
                Next::Ignore
            } else if state.meta_turn {
                state.meta_turn = false;
                state.turn_in_flight = false;
                Next::MetaFinished
            } else if let Some(merged) = state.drain_pending() {
                Next::Dispatch(merged)
            } else {
                state.turn_in_flight = false;
                Next::Settle
            }
        };

        match next {
            Next::Ignore => Ok(()),
            Next::MetaFinished => {
                self.finish_title_turn(handle).await;
                // Input that queued up behind the meta turn still goes out.
                let merged = {
                    let mut state = handle.state.lock().await;
                    state.drain_pending()
                };
                if let Some(merged) = merged {
                    self.dispatch_merged(handle, merged).await?;
                }
                Ok(())
            }
            Next::Dispatch(merged) => self.dispatch_merged(handle, merged).await,
            Next::Settle => self.settle(handle, None).await,
        }
    }

    /// Send a merged prompt to the running process as the next turn.
    async fn dispatch_merged(
        self: &Arc<Self>,
        handle: &Arc<ExecutionHandle>,
        merged: MergedInput,
    ) -> Result<()> {
        let send = {
            let mut input = handle.input.lock().await;
            input
                .send_user_message(&merged.prompt, merged.model.as_deref())
                .await
        };
        match send {
            Ok(()) => {
                {
                    let mut state = handle.state.lock().await;
                    state.turn_index += 1;
                    state.turn_in_flight = true;
                    state.logical_failure = false;
                    state.failure_reason = None;
                    state.settled = false;
                }
                let ids = merged.log_entry_ids.clone();
                self.db
                    .call(move |db| db.mark_pending_dispatched(&ids))
                    .await?;
                info!(issue_id = %handle.issue_id, "dispatched queued input as new turn");
                Ok(())
            }
            Err(e) => {
                // The input surface is broken, which means the process is
                // on its way out. Force the exit so its supervisor settles
                // and the still-queued rows flush from there.
                warn!(issue_id = %handle.issue_id, error = %e, "failed to dispatch queued input");
                handle.kill.notify_one();
                Ok(())
            }
        }
    }

    /// Deterministic post-turn cleanup. `forced_failure` carries the
    /// reason when the process died without completing its turn.
    async fn settle(
        self: &Arc<Self>,
        handle: &Arc<ExecutionHandle>,
        forced_failure: Option<String>,
    ) -> Result<()> {
        let (final_status, failure_reason, saw_output, cancelled) = {
            let mut state = handle.state.lock().await;
            if state.settled {
                return Ok(());
            }
            state.turn_in_flight = false;
            if let Some(reason) = &forced_failure {
                state.logical_failure = true;
                if state.failure_reason.is_none() {
                    state.failure_reason = Some(reason.clone());
                }
            }
            let final_status = if state.logical_failure {
                SessionStatus::Failed
            } else {
                SessionStatus::Completed
            };
            (
                final_status,
                state.failure_reason.clone(),
                state.saw_assistant_output,
                state.cancelled_by_user,
            )
        };

        let issue_id = handle.issue_id.clone();
        {
            let issue_id = issue_id.clone();
            self.db
                .call(move |db| db.update_session_status(&issue_id, final_status))
                .await?;
        }
        self.bus.publish(EngineEvent::State {
            issue_id: issue_id.clone(),
            execution_id: handle.execution_id.clone(),
            state: final_status,
        });

        // Session-error recovery: a failure with no assistant output and a
        // continuity-shaped reason clears the stored session id so the
        // next follow-up starts a fresh session.
        if final_status == SessionStatus::Failed && !saw_output {
            let reason = failure_reason.clone().unwrap_or_default().to_lowercase();
            if reason.contains("no conversation found") || reason.contains("session") {
                info!(issue_id = %issue_id, "clearing external session id after session error");
                let id = issue_id.clone();
                self.db
                    .call(move |db| db.set_external_session_id(&id, None))
                    .await?;
            }
        }

        // Durably queued messages that never made it into memory (crash,
        // restart) flush as a follow-up before the turn settles. A user
        // cancellation discards nothing but does not auto-resume either.
        if !cancelled {
            let pending = {
                let id = issue_id.clone();
                self.db.call(move |db| db.pending_messages(&id)).await?
            };
            if !pending.is_empty() {
                self.flush_durable_pending(handle, pending).await?;
            }
        }

        // A follow-up may have reactivated the session; if so this
        // settlement no longer applies.
        let issue = {
            let id = issue_id.clone();
            self.db.call(move |db| db.get_issue(&id)).await?
        };
        let issue = match issue {
            Some(issue) => issue,
            None => return Ok(()),
        };
        if issue.session_status != Some(final_status) {
            debug!(issue_id = %issue_id, "settlement skipped; session was reactivated");
            return Ok(());
        }

        if issue.status == IssueStatus::Working {
            let id = issue_id.clone();
            self.db
                .call(move |db| db.update_issue_status(&id, IssueStatus::Review))
                .await?;
            self.publish_issue_updated(&issue_id).await;
        }

        {
            let mut state = handle.state.lock().await;
            state.settled = true;
        }
        self.bus.publish(EngineEvent::Settled {
            issue_id: issue_id.clone(),
            execution_id: handle.execution_id.clone(),
            final_status,
        });
        info!(issue_id = %issue_id, status = %final_status, "execution settled");

        if final_status == SessionStatus::Completed {
            self.maybe_start_title_turn(handle, &issue).await;
        }
        Ok(())
    }

    /// Merge durable pending messages and hand them to the process (or a
    /// fresh follow-up process when this one is gone). Rows are hidden
    /// only after the engine accepted the prompt.
    async fn flush_durable_pending(
        self: &Arc<Self>,
        handle: &Arc<ExecutionHandle>,
        pending: Vec<LogEntry>,
    ) -> Result<()> {
        let merged = MergedInput {
            prompt: pending
                .iter()
                .map(|entry| entry.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
            model: pending.iter().rev().find_map(|entry| {
                entry
                    .metadata
                    .as_ref()?
                    .get("model")?
                    .as_str()
                    .map(str::to_string)
            }),
            log_entry_ids: pending.iter().map(|entry| entry.id).collect(),
        };

        let alive = {
            let state = handle.state.lock().await;
            state.is_live()
        };
        if alive {
            let issue_id = handle.issue_id.clone();
            {
                let issue_id = issue_id.clone();
                self.db
                    .call(move |db| db.update_session_status(&issue_id, SessionStatus::Running))
                    .await?;
            }
            self.bus.publish(EngineEvent::State {
                issue_id,
                execution_id: handle.execution_id.clone(),
                state: SessionStatus::Running,
            });
            self.dispatch_merged(handle, merged).await
        } else {
            // Process gone: flush by spawning a follow-up execution.
            let request = FollowUpRequest {
                prompt: merged.prompt.clone(),
                model: merged.model.clone(),
                permission_mode: PermissionMode::default(),
                busy_action: BusyAction::Queue,
            };
            match self
                .start_follow_up_execution(&handle.issue_id, &request)
                .await
            {
                Ok(_) => {
                    let ids = merged.log_entry_ids.clone();
                    self.db
                        .call(move |db| db.mark_pending_dispatched(&ids))
                        .await?;
                    Ok(())
                }
                Err(e) => {
                    warn!(
                        issue_id = %handle.issue_id,
                        error = %e,
                        "pending flush spawn failed; messages stay queued"
                    );
                    Ok(())
                }
            }
        }
    }

    // ── Auto-title ────────────────────────────────────────────────────

    /// Kick off a hidden title-generation turn when the issue still has a
    /// placeholder title and the process can take input.
    async fn maybe_start_title_turn(&self, handle: &Arc<ExecutionHandle>, issue: &Issue) {
        let needs_title = issue.title.trim().is_empty() || issue.title.trim() == "Untitled";
        if !needs_title {
            return;
        }
        let alive = {
            let state = handle.state.lock().await;
            state.is_live() && !state.turn_in_flight
        };
        if !alive {
            return;
        }
        let send = {
            let mut input = handle.input.lock().await;
            input.send_user_message(TITLE_PROMPT, None).await
        };
        match send {
            Ok(()) => {
                let mut state = handle.state.lock().await;
                state.turn_index += 1;
                state.turn_in_flight = true;
                state.meta_turn = true;
                debug!(issue_id = %handle.issue_id, "auto-title turn started");
            }
            Err(e) => {
                // Title generation is best-effort; failures never surface.
                debug!(issue_id = %handle.issue_id, error = %e, "auto-title dispatch failed");
            }
        }
    }

    async fn finish_title_turn(&self, handle: &Arc<ExecutionHandle>) {
        let reply = {
            let state = handle.state.lock().await;
            let turn = state.turn_index;
            state
                .logs
                .iter()
                .filter(|entry| {
                    entry.turn_index == turn
                        && entry.entry_type == LogEntryType::AssistantMessage
                })
                .map(|entry| entry.content.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        };
        match extract_title(&reply) {
            Some(title) => {
                let issue_id = handle.issue_id.clone();
                let stored = title.clone();
                if let Err(e) = self
                    .db
                    .call(move |db| db.set_issue_title(&issue_id, &stored))
                    .await
                {
                    warn!(issue_id = %handle.issue_id, error = %e, "failed to store generated title");
                    return;
                }
                info!(issue_id = %handle.issue_id, title = %title, "issue title generated");
                self.publish_issue_updated(&handle.issue_id).await;
            }
            None => {
                debug!(issue_id = %handle.issue_id, "auto-title reply had no usable title");
            }
        }
    }

    // ── Follow-up helpers ─────────────────────────────────────────────

    async fn queue_pending(
        &self,
        handle: &Arc<ExecutionHandle>,
        request: &FollowUpRequest,
    ) -> Result<FollowUpOutcome, EngineError> {
        // Durability first: the queued prompt must survive a crash before
        // the in-memory queue learns about it.
        let turn_index = {
            let state = handle.state.lock().await;
            state.turn_index
        };
        let entry = {
            let issue_id = handle.issue_id.clone();
            let prompt = request.prompt.clone();
            let mut metadata = serde_json::json!({"type": "pending"});
            if let Some(model) = &request.model {
                metadata["model"] = serde_json::json!(model);
            }
            self.db
                .call(move |db| {
                    db.append_log(
                        &issue_id,
                        turn_index,
                        &NewLogEntry {
                            entry_type: Some(LogEntryType::UserMessage),
                            content: prompt,
                            metadata: Some(metadata),
                            timestamp: Some(now_iso()),
                            visible: true,
                            ..Default::default()
                        },
                    )
                })
                .await
                .map_err(EngineError::Internal)?
        };

        {
            let mut state = handle.state.lock().await;
            state.pending_inputs.push_back(PendingInput {
                prompt: request.prompt.clone(),
                display_prompt: None,
                model: request.model.clone(),
                log_entry_id: Some(entry.id),
            });
        }
        self.bus.publish(EngineEvent::Log {
            issue_id: handle.issue_id.clone(),
            execution_id: handle.execution_id.clone(),
            entry: entry.clone(),
        });
        Ok(FollowUpOutcome::Queued {
            message_id: entry.id,
        })
    }

    async fn send_turn_to_process(
        &self,
        handle: &Arc<ExecutionHandle>,
        request: &FollowUpRequest,
    ) -> Result<FollowUpOutcome, EngineError> {
        let entry = {
            let issue_id = handle.issue_id.clone();
            let prompt = request.prompt.clone();
            let turn_index = {
                let state = handle.state.lock().await;
                state.turn_index + 1
            };
            self.db
                .call(move |db| {
                    db.append_log(
                        &issue_id,
                        turn_index,
                        &NewLogEntry {
                            entry_type: Some(LogEntryType::UserMessage),
                            content: prompt,
                            timestamp: Some(now_iso()),
                            visible: true,
                            ..Default::default()
                        },
                    )
                })
                .await
                .map_err(EngineError::Internal)?
        };

        // Advance the turn before sending so output racing back on the
        // consumer task is stamped with the new index.
        {
            let mut state = handle.state.lock().await;
            state.turn_index += 1;
            state.turn_in_flight = true;
            state.logical_failure = false;
            state.failure_reason = None;
            state.settled = false;
        }
        let send = {
            let mut input = handle.input.lock().await;
            input
                .send_user_message(&request.prompt, request.model.as_deref())
                .await
        };
        send?;

        {
            let issue_id = handle.issue_id.clone();
            self.db
                .call(move |db| db.update_session_status(&issue_id, SessionStatus::Running))
                .await
                .map_err(EngineError::Internal)?;
        }
        self.bus.publish(EngineEvent::Log {
            issue_id: handle.issue_id.clone(),
            execution_id: handle.execution_id.clone(),
            entry,
        });
        self.bus.publish(EngineEvent::State {
            issue_id: handle.issue_id.clone(),
            execution_id: handle.execution_id.clone(),
            state: SessionStatus::Running,
        });
        Ok(FollowUpOutcome::Sent {
            execution_id: handle.execution_id.clone(),
        })
    }

    // ── Cancellation and exit ─────────────────────────────────────────

    async fn cancel_execution(&self, handle: &Arc<ExecutionHandle>) {
        {
            let mut state = handle.state.lock().await;
            if !state.is_live() {
                return;
            }
            state.cancelled_by_user = true;
            state.state = ProcessState::Terminating;
        }
        info!(issue_id = %handle.issue_id, "cancel requested");
        {
            let mut input = handle.input.lock().await;
            input.request_cancel().await;
        }
        if let Some(pid) = handle.pid {
            send_interrupt(pid);
        }
        // Escalate to a hard kill if the process outlives the deadline.
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CANCEL_DEADLINE).await;
            handle.kill.notify_one();
        });
    }

    async fn handle_exit(
        self: &Arc<Self>,
        handle: &Arc<ExecutionHandle>,
        status: Option<std::process::ExitStatus>,
    ) {
        // Out of the table first, so settlement-triggered follow-ups see a
        // free slot.
        self.release_reservation(&handle.issue_id, &handle.execution_id);

        let (needs_settle, cancelled) = {
            let mut state = handle.state.lock().await;
            state.state = ProcessState::Exited;
            (!state.settled, state.cancelled_by_user)
        };
        {
            let mut input = handle.input.lock().await;
            *input = ProcessInput::Closed;
        }
        let code = status.and_then(|s| s.code());
        info!(
            issue_id = %handle.issue_id,
            execution_id = %handle.execution_id,
            code = ?code,
            "process exited"
        );

        if needs_settle {
            let reason = if cancelled {
                "execution cancelled by user".to_string()
            } else {
                format!(
                    "process exited with {} before completing its turn",
                    code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into())
                )
            };
            if let Err(e) = self.settle(handle, Some(reason)).await {
                error!(issue_id = %handle.issue_id, error = %e, "settlement after exit failed");
            }
        }
    }

    // ── Stale-session reconciliation ──────────────────────────────────

    /// Issues whose stored session claims to be live but have no backing
    /// process move back to review as failed. Runs at startup and on the
    /// periodic sweep.
    pub async fn reconcile_stale_sessions(&self) -> Result<usize> {
        let claimed = self.db.call(|db| db.issues_with_live_sessions()).await?;
        let live: HashSet<String> = self
            .table
            .lock()
            .map(|table| table.by_issue.keys().cloned().collect())
            .unwrap_or_default();

        let mut reconciled = 0;
        for issue in claimed {
            if live.contains(&issue.id) {
                continue;
            }
            warn!(issue_id = %issue.id, "stale session reconciled to review/failed");
            let id = issue.id.clone();
            self.db
                .call(move |db| {
                    db.update_issue_status(&id, IssueStatus::Review)?;
                    db.update_session_status(&id, SessionStatus::Failed)
                })
                .await?;
            self.publish_issue_updated(&issue.id).await;
            reconciled += 1;
        }
        Ok(reconciled)
    }

    /// Background task re-running the reconciliation sweep.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = engine.reconcile_stale_sessions().await {
                    warn!(error = %e, "stale-session sweep failed");
                }
            }
        })
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
}

#[cfg(not(unix))]
fn send_interrupt(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_extraction_trims_and_caps() {
        let text = "noise <bitk><title>  Fix the login flow  </title></bitk> trailing";
        assert_eq!(extract_title(text).as_deref(), Some("Fix the login flow"));

        let long = "x".repeat(500);
        let wrapped = format!("<bitk><title>{}</title></bitk>", long);
        assert_eq!(extract_title(&wrapped).unwrap().chars().count(), 200);

        assert_eq!(extract_title("<bitk><title>   </title></bitk>"), None);
        assert_eq!(extract_title("no tags at all"), None);
    }

    #[test]
    fn title_extraction_takes_first_match() {
        let text = "<bitk><title>one</title></bitk> <bitk><title>two</title></bitk>";
        assert_eq!(extract_title(text).as_deref(), Some("one"));
    }

    #[test]
    fn cancellation_noise_matches_fixed_list() {
        let noise = NormalizedEntry::new(
            LogEntryType::ErrorMessage,
            "The request was aborted mid-flight",
        )
        .with_metadata(serde_json::json!({"resultSubtype": "error_during_execution"}));
        assert!(is_cancellation_noise(&noise));

        let in_metadata = NormalizedEntry::new(LogEntryType::ErrorMessage, "").with_metadata(
            serde_json::json!({
                "resultSubtype": "error_during_execution",
                "error": "Request interrupted by user",
            }),
        );
        assert!(is_cancellation_noise(&in_metadata));

        // Same text without the subtype is a real error.
        let real = NormalizedEntry::new(LogEntryType::ErrorMessage, "request was aborted");
        assert!(!is_cancellation_noise(&real));

        let unrelated = NormalizedEntry::new(LogEntryType::ErrorMessage, "disk full")
            .with_metadata(serde_json::json!({"resultSubtype": "error_during_execution"}));
        assert!(!is_cancellation_noise(&unrelated));
    }
}
