//! Gemini CLI adapter.
//!
//! The Gemini CLI speaks JSON-RPC over stdio (ACP). A session task owns
//! the child's real streams, drives the handshake and prompt calls, and
//! forwards every update as a JSON line into an in-process pipe. The
//! execution engine consumes that pipe exactly like any other engine's
//! stdout, so normalization stays uniform.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::models::{EngineType, LogEntryType, NormalizedEntry, PermissionMode, ToolAction};

use super::rpc::{RpcCommand, RpcIncoming, RpcSession, CALL_TIMEOUT, KILL_GRACE};
use super::{
    Availability, AuthStatus, EngineAdapter, ModelInfo, ProcessInput, SpawnOptions,
    SpawnedProcess, VERSION_PROBE_TIMEOUT,
};

const FORWARD_PIPE_CAPACITY: usize = 64 * 1024;

pub struct GeminiAdapter {
    binary: String,
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self {
            binary: std::env::var("GEMINI_CMD").unwrap_or_else(|_| "gemini".to_string()),
        }
    }

    async fn spawn_inner(
        &self,
        opts: &SpawnOptions,
        env: &HashMap<String, String>,
    ) -> Result<SpawnedProcess, EngineError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--experimental-acp");
        if let Some(model) = &opts.model {
            cmd.args(["--model", model]);
        }
        if let Some(dir) = &opts.working_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::SpawnFailed)?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Stream("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Stream("child stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();

        let (entry_writer, entry_reader) = tokio::io::duplex(FORWARD_PIPE_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        tokio::spawn(run_session(SessionSetup {
            stdin,
            stdout,
            commands: cmd_rx,
            forward: entry_writer,
            prompt: opts.prompt.clone(),
            working_dir: opts
                .working_dir
                .as_ref()
                .map(|d| d.display().to_string()),
            resume_session_id: opts.external_session_id.clone(),
            permission_mode: opts.permission_mode,
            pid,
        }));

        Ok(SpawnedProcess {
            child,
            pid,
            input: ProcessInput::Rpc(cmd_tx),
            stdout: Box::new(entry_reader),
            stderr: stderr.map(|s| Box::new(s) as _),
        })
    }
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineAdapter for GeminiAdapter {
    fn engine_type(&self) -> EngineType {
        EngineType::Gemini
    }

    async fn availability(&self) -> Availability {
        let probe = Command::new(&self.binary)
            .arg("--version")
            .env_clear()
            .envs(super::safe_env())
            .stdin(Stdio::null())
            .output();
        match tokio::time::timeout(VERSION_PROBE_TIMEOUT, probe).await {
            Ok(Ok(output)) if output.status.success() => Availability {
                installed: true,
                executable: true,
                version: Some(String::from_utf8_lossy(&output.stdout).trim().to_string()),
                auth_status: if std::env::var("GEMINI_API_KEY").is_ok() {
                    AuthStatus::Authenticated
                } else {
                    AuthStatus::Unknown
                },
                error: None,
            },
            Ok(Ok(output)) => Availability {
                installed: true,
                executable: false,
                version: None,
                auth_status: AuthStatus::Unknown,
                error: Some(format!(
                    "version probe exited with {}",
                    output.status.code().unwrap_or(-1)
                )),
            },
            Ok(Err(e)) => Availability::missing(format!("{} not runnable: {}", self.binary, e)),
            Err(_) => Availability::timed_out(),
        }
    }

    async fn models(&self) -> Vec<ModelInfo> {
        vec![
            ModelInfo {
                id: "gemini-2.5-pro".to_string(),
                name: "Gemini 2.5 Pro".to_string(),
                is_default: Some(true),
            },
            ModelInfo {
                id: "gemini-2.5-flash".to_string(),
                name: "Gemini 2.5 Flash".to_string(),
                is_default: None,
            },
        ]
    }

    async fn spawn(
        &self,
        opts: &SpawnOptions,
        env: &HashMap<String, String>,
    ) -> Result<SpawnedProcess, EngineError> {
        self.spawn_inner(opts, env).await
    }

    async fn spawn_follow_up(
        &self,
        opts: &SpawnOptions,
        env: &HashMap<String, String>,
    ) -> Result<SpawnedProcess, EngineError> {
        self.spawn_inner(opts, env).await
    }

    fn normalize_log_line(&self, raw: &str) -> Option<NormalizedEntry> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(_) => return Some(NormalizedEntry::raw_system(trimmed)),
        };
        normalize_forwarded(&value).or_else(|| normalize_update(&value))
    }
}

// ── Session task ─────────────────────────────────────────────────────

struct SessionSetup {
    stdin: ChildStdin,
    stdout: ChildStdout,
    commands: mpsc::Receiver<RpcCommand>,
    forward: DuplexStream,
    prompt: String,
    working_dir: Option<String>,
    resume_session_id: Option<String>,
    permission_mode: PermissionMode,
    pid: Option<u32>,
}

/// Drive one ACP session: handshake, session create/load, then prompt
/// turns until the command channel closes. Dropping the forward pipe on
/// exit ends the execution engine's consumer with a clean EOF.
async fn run_session(mut setup: SessionSetup) {
    let mut session = RpcSession::new(setup.stdin, setup.stdout);
    let mut forward = setup.forward;

    let init = session
        .handshake(json!({
            "protocolVersion": 1,
            "clientCapabilities": {
                "fs": {"readTextFile": false, "writeTextFile": false},
            },
        }))
        .await;
    if let Err(e) = init {
        fail_session(&mut forward, setup.pid, &e).await;
        return;
    }

    let cwd = setup.working_dir.clone().unwrap_or_else(|| ".".to_string());
    let session_id = match open_session(&mut session, &cwd, setup.resume_session_id.as_deref())
        .await
    {
        Ok(session_id) => session_id,
        Err(e) => {
            fail_session(&mut forward, setup.pid, &e).await;
            return;
        }
    };
    forward_line(
        &mut forward,
        &json!({"type": "session_started", "sessionId": session_id}),
    )
    .await;

    let mut next_prompt = Some(setup.prompt.clone());
    while let Some(prompt) = next_prompt.take() {
        if let Err(e) = run_prompt(
            &mut session,
            &mut forward,
            &session_id,
            &prompt,
            setup.permission_mode,
        )
        .await
        {
            fail_session(&mut forward, setup.pid, &e).await;
            return;
        }

        // Idle until the engine sends another prompt or drops the channel.
        loop {
            match setup.commands.recv().await {
                Some(RpcCommand::Prompt { prompt, .. }) => {
                    next_prompt = Some(prompt);
                    break;
                }
                Some(RpcCommand::Cancel) => {
                    let _ = session
                        .send_notification("session/cancel", json!({"sessionId": session_id}))
                        .await;
                }
                None => return,
            }
        }
    }
}

async fn open_session<W, R>(
    session: &mut RpcSession<W, R>,
    cwd: &str,
    resume: Option<&str>,
) -> Result<String, EngineError>
where
    W: tokio::io::AsyncWrite + Unpin,
    R: tokio::io::AsyncRead + Unpin,
{
    if let Some(session_id) = resume {
        let result = session
            .call(
                "session/load",
                json!({"sessionId": session_id, "cwd": cwd, "mcpServers": []}),
                |_| {},
            )
            .await;
        match result {
            Ok(_) => return Ok(session_id.to_string()),
            Err(e) => {
                return Err(EngineError::Session(format!(
                    "no conversation found for session {}: {}",
                    session_id, e
                )))
            }
        }
    }
    let result = session
        .call("session/new", json!({"cwd": cwd, "mcpServers": []}), |_| {})
        .await?;
    result
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EngineError::Session("session/new returned no sessionId".to_string()))
}

/// One prompt turn. Updates stream out as forwarded lines; permission
/// requests are answered inline according to the permission mode. The
/// turn fails if the peer goes silent for the per-call timeout.
async fn run_prompt<W, R>(
    session: &mut RpcSession<W, R>,
    forward: &mut DuplexStream,
    session_id: &str,
    prompt: &str,
    permission_mode: PermissionMode,
) -> Result<(), EngineError>
where
    W: tokio::io::AsyncWrite + Unpin,
    R: tokio::io::AsyncRead + Unpin,
{
    let id = session
        .send_request(
            "session/prompt",
            json!({
                "sessionId": session_id,
                "prompt": [{"type": "text", "text": prompt}],
            }),
        )
        .await?;

    loop {
        let incoming = tokio::time::timeout(CALL_TIMEOUT, session.next_incoming())
            .await
            .map_err(|_| EngineError::EngineTimeout {
                call: "session/prompt".to_string(),
                seconds: CALL_TIMEOUT.as_secs(),
            })??;
        match incoming {
            Some(RpcIncoming::Response {
                id: response_id,
                result,
            }) if response_id == id => {
                let result = result.map_err(|e| EngineError::Session(e.to_string()))?;
                let stop_reason = result
                    .get("stopReason")
                    .and_then(Value::as_str)
                    .unwrap_or("end_turn");
                forward_line(
                    forward,
                    &json!({"type": "turn_completed", "stopReason": stop_reason}),
                )
                .await;
                return Ok(());
            }
            Some(RpcIncoming::Response { .. }) => {}
            Some(RpcIncoming::Notification { method, params }) => {
                if method == "session/update" {
                    forward_line(forward, &params).await;
                } else {
                    debug!(method = %method, "ignoring rpc notification");
                }
            }
            Some(RpcIncoming::Request { id, method, params }) => {
                if method == "session/request_permission" {
                    let response = permission_response(&params, permission_mode);
                    session.send_response(id, response).await?;
                } else {
                    session
                        .send_response(id, json!({"error": "unsupported"}))
                        .await?;
                }
            }
            None => {
                return Err(EngineError::Stream(
                    "rpc stream closed mid-turn".to_string(),
                ))
            }
        }
    }
}

/// Pick a permission option: supervised and plan sessions reject writes,
/// everything else takes the first allow option.
fn permission_response(params: &Value, mode: PermissionMode) -> Value {
    let options = params
        .get("options")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let allow = matches!(mode, PermissionMode::Auto | PermissionMode::Bypass);
    let pick = options.iter().find(|option| {
        let kind = option.get("kind").and_then(Value::as_str).unwrap_or("");
        if allow {
            kind.starts_with("allow")
        } else {
            kind.starts_with("reject")
        }
    });
    match pick.and_then(|option| option.get("optionId")).cloned() {
        Some(option_id) => json!({"outcome": {"outcome": "selected", "optionId": option_id}}),
        None => json!({"outcome": {"outcome": "cancelled"}}),
    }
}

async fn forward_line(forward: &mut DuplexStream, value: &Value) {
    let mut line = value.to_string();
    line.push('\n');
    if forward.write_all(line.as_bytes()).await.is_err() {
        debug!("forward pipe closed; dropping session update");
    }
}

/// Report a fatal session error through the pipe, then kill the child
/// after the grace period since it can no longer be driven.
async fn fail_session(forward: &mut DuplexStream, pid: Option<u32>, error: &EngineError) {
    warn!(error = %error, "gemini session failed");
    forward_line(
        forward,
        &json!({"type": "turn_failed", "error": error.to_string()}),
    )
    .await;
    if let Some(pid) = pid {
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            kill_pid(pid);
        });
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) {}

// ── Normalization ────────────────────────────────────────────────────

/// Lines the session task synthesized itself.
fn normalize_forwarded(value: &Value) -> Option<NormalizedEntry> {
    match value.get("type").and_then(Value::as_str)? {
        "session_started" => {
            let session_id = value.get("sessionId").and_then(Value::as_str)?;
            Some(
                NormalizedEntry::new(LogEntryType::SystemMessage, "Session started")
                    .with_metadata(json!({"sessionId": session_id})),
            )
        }
        "turn_completed" => {
            let stop_reason = value
                .get("stopReason")
                .and_then(Value::as_str)
                .unwrap_or("end_turn");
            Some(
                NormalizedEntry::new(LogEntryType::SystemMessage, "").with_metadata(json!({
                    "turnCompleted": true,
                    "resultSubtype": stop_reason,
                })),
            )
        }
        "turn_failed" => {
            let error = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("turn failed");
            Some(
                NormalizedEntry::new(LogEntryType::ErrorMessage, error).with_metadata(json!({
                    "turnCompleted": true,
                    "resultSubtype": "error_during_execution",
                    "isError": true,
                })),
            )
        }
        _ => None,
    }
}

/// `session/update` notification params forwarded verbatim.
fn normalize_update(value: &Value) -> Option<NormalizedEntry> {
    let update = match value.get("update") {
        Some(update) => update,
        None => return Some(NormalizedEntry::raw_system(&value.to_string())),
    };
    let kind = update
        .get("sessionUpdate")
        .and_then(Value::as_str)
        .unwrap_or("");
    let chunk_text = || {
        update
            .get("content")
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    match kind {
        "agent_message_chunk" => Some(NormalizedEntry::new(
            LogEntryType::AssistantMessage,
            chunk_text(),
        )),
        "agent_thought_chunk" => {
            Some(NormalizedEntry::new(LogEntryType::Thinking, chunk_text()))
        }
        "tool_call" => {
            let title = update
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("tool call");
            let tool_name = update
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or("tool");
            Some(
                NormalizedEntry::new(LogEntryType::ToolUse, title).with_tool_action(
                    ToolAction::Tool {
                        tool_name: tool_name.to_string(),
                        description: Some(title.to_string()),
                    },
                ),
            )
        }
        // Progress updates for an already-reported call add nothing.
        "tool_call_update" | "plan" => None,
        _ => Some(NormalizedEntry::raw_system(&value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> GeminiAdapter {
        GeminiAdapter::new()
    }

    #[test]
    fn session_started_line_carries_session_id() {
        let line = r#"{"type":"session_started","sessionId":"g-123"}"#;
        let entry = adapter().normalize_log_line(line).unwrap();
        assert_eq!(entry.session_id(), Some("g-123"));
    }

    #[test]
    fn message_chunks_become_assistant_output() {
        let line = r#"{"sessionId":"g","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"partial"}}}"#;
        let entry = adapter().normalize_log_line(line).unwrap();
        assert_eq!(entry.entry_type, LogEntryType::AssistantMessage);
        assert_eq!(entry.content, "partial");
    }

    #[test]
    fn thought_chunks_become_thinking() {
        let line = r#"{"sessionId":"g","update":{"sessionUpdate":"agent_thought_chunk","content":{"type":"text","text":"hmm"}}}"#;
        let entry = adapter().normalize_log_line(line).unwrap();
        assert_eq!(entry.entry_type, LogEntryType::Thinking);
    }

    #[test]
    fn turn_completed_signals_completion() {
        let line = r#"{"type":"turn_completed","stopReason":"end_turn"}"#;
        let entry = adapter().normalize_log_line(line).unwrap();
        assert!(entry.signals_turn_completion());
        assert!(!entry.is_error_result());
    }

    #[test]
    fn turn_failed_is_an_error_result() {
        let line = r#"{"type":"turn_failed","error":"rpc error -1: boom"}"#;
        let entry = adapter().normalize_log_line(line).unwrap();
        assert_eq!(entry.entry_type, LogEntryType::ErrorMessage);
        assert!(entry.is_error_result());
        assert!(entry.signals_turn_completion());
    }

    #[test]
    fn tool_call_updates_are_suppressed() {
        let line = r#"{"sessionId":"g","update":{"sessionUpdate":"tool_call_update","status":"completed"}}"#;
        assert!(adapter().normalize_log_line(line).is_none());
    }

    #[test]
    fn permission_response_honours_mode() {
        let params = json!({"options": [
            {"optionId": "a", "kind": "allow_once"},
            {"optionId": "r", "kind": "reject_once"},
        ]});
        let allow = permission_response(&params, PermissionMode::Auto);
        assert_eq!(allow["outcome"]["optionId"], "a");
        let reject = permission_response(&params, PermissionMode::Plan);
        assert_eq!(reject["outcome"]["optionId"], "r");
        let none = permission_response(&json!({}), PermissionMode::Auto);
        assert_eq!(none["outcome"]["outcome"], "cancelled");
    }
}
